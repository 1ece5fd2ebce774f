//! Call correlation for Tether.
//!
//! - [`PendingTable`] holds every host-issued call that is still waiting
//!   for the peer's reply, keyed by correlation id, and guarantees each
//!   call settles exactly once.
//! - [`TimeoutSweeper`] is the background task that cancels calls whose
//!   reply never came.
//! - [`CallError`] is what a waiting caller sees when there is no result.

mod error;
mod sweeper;
mod table;

pub use error::{CallError, CancelReason};
pub use sweeper::{SweepConfig, TimeoutSweeper};
pub use table::{CallResult, PendingResponse, PendingTable, Sweep};
