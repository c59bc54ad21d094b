//! Loss-resilient datagram transport.
//!
//! Three layers: [`wire`] defines the packet formats, [`send`] turns
//! encoded frames into FEC-protected datagrams and answers
//! retransmission requests, and [`recv`] reassembles frames and
//! schedules NACKs under the presentation deadline. Both endpoints are
//! sans-IO; the socket lives in [`crate::service`].

pub mod recv;
pub mod send;
pub mod wire;

pub use recv::{
    AssembledFrame, FrameReassembler, ReassemblyConfig, ReassemblyStats, ReceiverEvent,
};
pub use send::{PacketSender, SenderConfig, SenderEvent};
pub use wire::{ControlMessage, PacketFlags, PacketHeader};
