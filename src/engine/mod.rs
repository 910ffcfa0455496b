//! The orchestration core: handler dispatch and the scheduler loop.

pub mod dispatch;
pub mod scheduler;

pub use dispatch::{HandlerContext, HandlerSet, TaskHandler};
pub use scheduler::Scheduler;
