//! Readers for everything the measurement processes leave on disk.
//!
//! ```text
//!   receiver CSV ──┐
//!   tx_stats_tc*  ─┼──► CounterSampler::poll ──► Observation
//!   /sys/class/net ┘           │
//!                         FileSystem (trait)
//!                        ┌─────┴─────┐
//!                     RealFs       MockFs
//! ```

pub mod counters;
pub mod iface;
pub mod mock;
pub mod sampler;
pub mod traits;

pub use counters::{ParseError, parse_counter_csv, parse_tx_report, read_tx_sample};
pub use iface::{IfaceTracker, read_iface_mac, read_iface_stats};
pub use mock::MockFs;
pub use sampler::{CounterSampler, Observation};
pub use traits::{FileSystem, RealFs};
