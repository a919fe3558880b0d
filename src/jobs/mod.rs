//! UWS job records: the data model, phase rules, and the operations on top.

pub mod events;
pub mod filter;
pub mod lifecycle;
pub mod model;
pub mod phase;
pub mod service;
pub mod sweeper;

pub use events::{EventOutcome, JobEvent, JobEvents, JobOperation};
pub use filter::{JobFilter, JobPage, PageToken};
pub use lifecycle::{Caller, LifecycleController};
pub use model::{ErrorSummary, ErrorType, Job, JobCreate, JobParameter, JobResult, JobSummary};
pub use phase::{ExecutionPhase, JobField};
pub use service::JobService;
pub use sweeper::{ExpirationSweeper, SweepReport, spawn_sweep_task};
