//! Network interface counters and addresses from `/sys/class/net`.

use std::path::{Path, PathBuf};

use crate::model::IfaceStats;

use super::traits::FileSystem;

pub const SYS_CLASS_NET: &str = "/sys/class/net";

fn iface_dir(iface: &str) -> PathBuf {
    Path::new(SYS_CLASS_NET).join(iface)
}

fn read_u64<F: FileSystem>(fs: &F, path: &Path) -> u64 {
    fs.read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Reads the statistics of `iface`. Unreadable counters are 0.
pub fn read_iface_stats<F: FileSystem>(fs: &F, iface: &str) -> IfaceStats {
    let dir = iface_dir(iface).join("statistics");
    let read = |name: &str| read_u64(fs, &dir.join(name));
    IfaceStats {
        rx_packets: read("rx_packets"),
        rx_bytes: read("rx_bytes"),
        rx_dropped: read("rx_dropped"),
        rx_errors: read("rx_errors"),
        tx_packets: read("tx_packets"),
        tx_bytes: read("tx_bytes"),
        tx_dropped: read("tx_dropped"),
        tx_errors: read("tx_errors"),
    }
}

/// Lower-cased MAC address of `iface`, if readable and non-empty.
pub fn read_iface_mac<F: FileSystem>(fs: &F, iface: &str) -> Option<String> {
    fs.read_to_string(&iface_dir(iface).join("address"))
        .ok()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
}

/// Tracks one interface and yields counter deltas between calls.
#[derive(Debug, Clone)]
pub struct IfaceTracker {
    iface: String,
    last: IfaceStats,
}

impl IfaceTracker {
    /// Takes the baseline reading.
    pub fn new<F: FileSystem>(fs: &F, iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            last: read_iface_stats(fs, iface),
        }
    }

    /// Delta since the previous call (or since the baseline).
    pub fn advance<F: FileSystem>(&mut self, fs: &F) -> IfaceStats {
        let now = read_iface_stats(fs, &self.iface);
        let delta = now.delta_since(&self.last);
        self.last = now;
        delta
    }
}
