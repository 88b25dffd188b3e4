//! Job execution and scheduling engine.
//!
//! Jobs are services (one registered executable run against targets) or
//! workflows (member jobs joined by typed edges). `retry::try_run` is the one
//! way to execute a job; schedulers call it when an entry fires.

pub mod catalog;
pub mod command;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod inventory;
pub mod metrics;
pub mod migrations;
pub mod notifier;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod task;
pub mod workflow;

pub use context::Context;
pub use error::{EngineError, Result};
