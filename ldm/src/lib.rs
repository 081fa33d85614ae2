pub mod api;
pub mod cli;
pub mod config;
pub mod controller;
pub mod lease;
pub mod logging;
pub mod manager;
pub mod metrics_publisher;
pub mod orchestrator;
pub mod resource;
pub mod shutdown;
pub mod signal;
pub mod tasks;

pub use orchestrator::{Collaborators, Orchestrator};
pub use shutdown::ExitStatus;
pub use signal::SignalGate;
