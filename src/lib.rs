//! # setfarm
//!
//! Multi-agent workflow engine over a shared task queue backed by an
//! embedded SQLite store. A workflow is an ordered pipeline of steps, each
//! assigned to a role; external agent processes, woken by an external cron
//! scheduler, poll the engine over a text protocol, claim a unit of work,
//! and report the outcome. The engine keeps the persistent state of runs,
//! steps and stories, guarantees at-most-one-agent-per-unit claims, advances
//! the pipeline deterministically, and reconciles drift with a watchdog.
//!
//! ## Modules
//!
//! - `app` - state directory, settings, logging, fatal-error handling
//! - `cli` - argument structures and command routing (the agent protocol)
//! - `cron` - gateway to the external scheduler, with a recording mock
//! - `engine` - claim protocol, step advancement, loop fan-out
//! - `events` - JSON-per-run archive mirror
//! - `medic` - periodic reconciliation with bounded auto-remediation
//! - `storage` - SQLite store: schema and compound transactions
//! - `workflow` - YAML workflow specs

pub mod app;
pub mod cli;
pub mod cron;
pub mod engine;
pub mod error;
pub mod events;
pub mod medic;
pub mod storage;
pub mod workflow;

pub use error::{Error, Result};
