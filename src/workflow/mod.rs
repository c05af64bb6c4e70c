//! Reply workflow: command parsing, lifecycle states, the transition
//! function, and the engine that drives records through it.

pub mod command;
pub mod engine;
pub mod machine;
pub mod model;
pub mod retry;
pub mod state;
pub mod sweeper;

pub use command::Command;
pub use engine::{ReplyTarget, WorkflowDeps, WorkflowEngine};
pub use model::{InboundItem, ThreadRefs, TransitionLogEntry, WorkflowRecord, WorkflowStats};
pub use state::WorkflowState;
pub use sweeper::spawn_timeout_sweeper;
