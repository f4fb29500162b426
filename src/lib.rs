pub mod config;
pub mod deployer;
pub mod errors;
pub mod health;
pub mod locks;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod shell;
pub mod supervisor;
pub mod util;
pub mod webhook;

pub use errors::{ErrorKind, RegistryError, SupervisorError, SupervisorResult};
pub use orchestrator::{DeployOutcome, NewApp, Orchestrator, RemoveOptions, WeakOrchestrator};
