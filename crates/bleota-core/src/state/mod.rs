//! State machine module.

pub mod handlers;
pub mod machine;

pub use handlers::{HandleResult, HandlerContext, handle_event, handle_packets_ready};
pub use machine::{OtaState, SectorAckCounter, TransferContext};
