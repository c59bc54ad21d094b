//! # beam-sender — adaptive screen-video sender
//!
//! Captures frames (a synthetic test pattern in this build), encodes
//! them under the predictive adapter's directives and streams them
//! over UDP with FEC protection and bounded retransmission, adapting
//! bitrate, GOP and parity overhead to measured link conditions.

pub mod config;
pub mod pattern;
