//! Worker subprocesses and the pool that manages them.

pub mod channel;
pub mod controller;
pub mod pool;
pub mod process;
pub mod state;

pub use channel::{MessageChannel, PipeChannel};
pub use controller::{
    AcceleratorId, ControllerOptions, LoadedModel, Session, WorkerController, WorkerFault,
    WorkerStatus, WorkerTimeouts,
};
pub use pool::{AllocationRequest, PoolStatus, SlotState, SlotStatus, WorkerLease, WorkerPoolManager};
pub use process::WorkerProcess;
pub use state::WorkerState;
