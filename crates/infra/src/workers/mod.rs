//! Background workers.

pub mod dispatch_worker;

pub use dispatch_worker::{DispatchError, DispatchHandle, DispatchSender, DispatchWorker, WorkerStats};
