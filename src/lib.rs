//! ccfleet - fleet orchestration core for sandboxed AI agents
//!
//! Turns declarative fleet configuration into running agent workers:
//! routes chat messages and schedule fires to agents, drives streaming
//! turns through in-process or container runtimes, and keeps per-agent
//! and per-conversation session state isolated and durable.

pub mod chat;
pub mod config;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod job;
pub mod orchestrator;
pub mod processor;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod utils;

pub use config::{AgentConfig, FleetConfig};
pub use error::{ExitReason, FleetError};
pub use executor::{RunnerResult, TriggerOptions, TurnTrigger};
pub use job::{Job, JobStatus, TriggerType};
pub use orchestrator::Fleet;
