//! # beam-receiver — streaming receiver
//!
//! Receives FEC-protected datagrams, reassembles frames under their
//! presentation deadlines, requests retransmission when it pays off,
//! and guarantees a presentable frame even through loss. This build
//! has no display surface; it publishes decoded frames on a watch
//! channel and logs delivery statistics.

pub mod config;
