#![forbid(unsafe_code)]

//! Batched, retried delivery of opaque payloads.
//!
//! The batching policy lives in [`BatcherState`], a pure state machine. The
//! [`Batcher`] handle runs it on a tokio task, performs the sends it asks for,
//! and feeds outcomes and timer expirations back into it.

mod batcher;
mod sender;
mod state;

pub use batcher::Batcher;
pub use sender::{SendError, Sender};
pub use state::{
    BatchId, BatcherState, Effects, Items, Outcome, SendResult, StateError, StopSummary,
};
