//! Position workers and their supervisor.

mod position_worker;
mod supervisor;

pub use position_worker::PositionWorker;
pub use supervisor::{Supervisor, WorkerStatus};
