//! User-space TCP reassembly into paired HTTP request/response messages.
//! `reassembler::Reassembler` is the engine; `reassembler::Listener` is the
//! facade that owns it alongside a `capture` backend.

pub mod listener;
pub mod message;
pub mod packet;
pub mod reassembler;

pub use listener::{Config, Event, Listener, StatsSnapshot};
pub use message::Message;
pub use packet::{ConnId, Packet};
pub use reassembler::{Reassembler, Stats};
