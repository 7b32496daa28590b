pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod executor;
pub mod language;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod registry;
pub mod report;
pub mod request;
pub mod runtime;
pub mod session;

#[cfg(feature = "server")]
pub mod server;

pub use error::ExecError;
pub use manager::SessionManager;
pub use report::{ExecutionResult, TerminationReason};
pub use request::{ExecutionRequest, InputFile};
