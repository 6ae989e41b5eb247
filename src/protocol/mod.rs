//! Text wire protocol shared by the dispatcher, its nodes, and the controller.
//!
//! Every datagram carries exactly one [`Message`], encoded as comma-separated
//! fields: the instruction name followed by its arguments.

pub mod instruction;
pub mod message;

pub use instruction::{Inbound, Outbound};
pub use message::{Message, SEPARATOR};
