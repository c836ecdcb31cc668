//! Poll-driven counter sampler.
//!
//! One [`CounterSampler::poll`] call corresponds to one tick of the sampling
//! cadence. The sampler keeps the last successfully parsed receiver row and,
//! once a second row arrives, pairs them into an [`Observation`] together
//! with the transmitter reports and interface counter deltas for the same
//! interval.

use std::io;

use tracing::{debug, warn};

use crate::config::RigPaths;
use crate::model::{IfaceStats, RawSnapshot, TxClassSample};

use super::counters::{parse_counter_csv, read_tx_sample};
use super::iface::IfaceTracker;
use super::traits::FileSystem;

/// Two consecutive receiver snapshots plus the side readings of the interval.
#[derive(Debug, Clone)]
pub struct Observation {
    pub prev: RawSnapshot,
    pub curr: RawSnapshot,
    pub tx: TxClassSample,
    pub egress_delta: IfaceStats,
    pub ingress_delta: IfaceStats,
}

/// Sampler state for one run.
pub struct CounterSampler {
    paths: RigPaths,
    last: Option<RawSnapshot>,
    egress: IfaceTracker,
    ingress: IfaceTracker,
}

impl CounterSampler {
    /// Creates a sampler and takes the interface counter baselines.
    pub fn new<F: FileSystem>(
        fs: &F,
        paths: RigPaths,
        egress_iface: &str,
        ingress_iface: &str,
    ) -> Self {
        Self {
            paths,
            last: None,
            egress: IfaceTracker::new(fs, egress_iface),
            ingress: IfaceTracker::new(fs, ingress_iface),
        }
    }

    /// Last successfully parsed receiver snapshot.
    pub fn last(&self) -> Option<&RawSnapshot> {
        self.last.as_ref()
    }

    /// Reads the counter file once.
    ///
    /// Missing files, header-only files and malformed rows leave the
    /// retained snapshot untouched and yield `None`.
    pub fn poll<F: FileSystem>(&mut self, fs: &F) -> Option<Observation> {
        let content = match fs.read_to_string(&self.paths.rx_csv) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                debug!(path = %self.paths.rx_csv.display(), error = %e, "counter file unreadable");
                return None;
            }
        };

        let curr = match parse_counter_csv(&content) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "skipping malformed counter row");
                return None;
            }
        };

        let prev = self.last.replace(curr.clone())?;

        Some(Observation {
            prev,
            curr,
            tx: read_tx_sample(fs, &self.paths),
            egress_delta: self.egress.advance(fs),
            ingress_delta: self.ingress.advance(fs),
        })
    }
}
