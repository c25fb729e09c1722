//! Dispatch: correlation, cancellation, and multiplexed connections

pub mod connection;
pub mod correlation;
pub mod handle;

pub use connection::{AttemptCanceller, AttemptHandle, NodeConnection};
pub use correlation::{CorrelationTable, PendingState};
pub use handle::{CancelFlag, CompletionHandle};
