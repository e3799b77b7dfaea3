//! Collaboration between workspaces: approved follows, inline answers, and
//! queued tasks surfaced back to the requester by a poller.

mod engine;
mod poller;
mod worker;

pub use engine::{
    CollaborationAnswer, CollaborationEngine, FollowListing, ProcessedTask, SubmittedTask,
    TaskView,
};
pub use poller::{SurfacedOutcome, SurfacedResult, TaskPoller};
pub use worker::spawn_task_worker;
