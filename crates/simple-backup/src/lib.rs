pub mod config;
pub mod copy_engine;
pub mod error;
pub mod inputs;
pub mod report;
pub mod retention;
pub mod session;
pub mod snapshot;
pub mod ssh;
pub mod target;

pub use error::{Error, ErrorKind, Result};
pub use session::{Orchestrator, SessionOutcome, SessionStatus};
