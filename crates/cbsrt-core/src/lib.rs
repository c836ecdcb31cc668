//! cbsrt-core: measurement pipeline for the CBS real-time dashboard.
//!
//! Provides:
//! - `config`: per-run `SessionConfig`, rig paths, pipeline constants
//! - `model`: raw counter snapshots and derived per-interval metrics
//! - `collector`: counter-file parsing, interface statistics, the sampler
//! - `window`: fixed-capacity moving average
//! - `estimator`: per-class throughput and compliance verdicts
//! - `capture`: bounded ring of capture-tool output lines
//! - `launch`: command lines for the measurement binaries
//! - `setup`: one-shot board / VLAN / tuning collaborators

pub mod capture;
pub mod collector;
pub mod config;
pub mod estimator;
pub mod launch;
pub mod model;
pub mod setup;
pub mod window;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
