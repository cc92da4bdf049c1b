//! opsidecar — self-hosted operations and deployment sidecar.
//!
//! Runs inside a long-lived service process and exposes a REST surface to
//! operators:
//!
//! - **Lifecycle**: watchdog-supervised restarts and rolling
//!   build-from-git deployments with rollback ([`supervisor`], [`deploy`]).
//! - **Telemetry**: periodic host/process sampling into time-bucketed
//!   rollups ([`hoststat`], [`threadstat`], [`memstat`]).
//! - **Log mining**: per-endpoint latency statistics and error-signature
//!   aggregation from the service's own JSONL logs ([`apistat`],
//!   [`errstat`], [`logindex`]).
//! - **Persistence**: a schema-generic pager over SQLite ([`store`]).

pub mod api;
pub mod apistat;
pub mod auth;
pub mod command;
pub mod config;
pub mod ctx;
pub mod deploy;
pub mod errstat;
pub mod error;
pub mod gitenv;
pub mod heap;
pub mod hoststat;
pub mod logindex;
pub mod memstat;
pub mod pubsub;
pub mod server;
pub mod store;
pub mod supervisor;
pub mod threadstat;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::OmConfig;
pub use ctx::Ctx;
pub use error::{OmError, OmResult};
pub use heap::TrackingAlloc;
pub use server::{run_server, OmServices};
