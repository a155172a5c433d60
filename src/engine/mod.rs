//! Dispatch engine and the loop that drives it.

pub mod dispatch;
pub mod poller;

pub use dispatch::{CycleReport, DispatchEngine};
pub use poller::{Poller, PollerConfig};
