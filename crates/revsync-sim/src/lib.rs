//! revsync-sim library.
//!
//! Seeded campaigns that push random UI workloads through the mutation
//! queue against a fault-injecting server and check the end state.
//!
//! # Conventions
//!
//! - **Errors**: Use `anyhow::Result` for return types.
//! - **Logging**: Use `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod server;
pub mod workload;

pub use campaign::{CampaignConfig, CampaignReport, SeedOutcome, replay_seed, run_campaign};
pub use oracle::{InvariantViolation, QueueOracle, RunRecord};
pub use rng::DeterministicRng;
pub use server::{FaultConfig, FaultyServer};
pub use workload::{ActionKind, Workload};
