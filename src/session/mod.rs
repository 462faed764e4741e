pub mod events;
pub mod negotiator;
pub mod orchestrator;
pub mod peer;
pub mod retry;

pub use orchestrator::{Orchestrator, SessionStatus};
