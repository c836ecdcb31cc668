//! Run configuration, rig layout, and pipeline constants.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of traffic classes (PCP values) on the shaped port.
pub const TC_COUNT: usize = 8;

/// Sampler cadence.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Records produced before this offset are never reported as fresh.
pub const MIN_RUN_SECS: f64 = 2.0;

/// Receive rate (packets/s) below which an interval counts as low-traffic.
pub const PPS_FLOOR: f64 = 1000.0;

/// Lower bound on the per-interval packet count needed to refresh the
/// packet-count priority ratio.
pub const MIN_FREEZE_PKTS: u64 = 100;

/// Capture lines retained for display.
pub const CAPTURE_LINES_MAX: usize = 40;

/// Idle time after which an observer receives a keep-alive frame.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Configuration of a single test run, as submitted by the control surface.
///
/// Every field is optional on the wire; missing fields take the defaults of
/// the reference rig.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ingress_iface: String,
    pub egress_iface: String,
    pub dst_mac: String,
    pub vlan_id: u16,
    /// Run duration in seconds, passed through to every measurement process.
    pub duration: u64,
    /// Nominal frame size in bytes.
    pub packet_size: u32,
    pub rate_per_tc_mbps: i64,
    pub idle_slope_kbps: Vec<f64>,
    /// Allowed relative deviation for a class to pass.
    pub tolerance: f64,
    /// Smoothing window length in samples.
    pub smooth_window: usize,
    pub rx_batch: u32,
    pub tx_batch: i64,
    pub rx_cpu: u32,
    pub tx_cpu: u32,
    pub egress_port: String,
    pub ingress_port: String,
    pub dst_ip: String,
    pub apply_first: bool,
    pub use_board: bool,
    pub capture_filter: String,
    pub rx_seq_only: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ingress_iface: "enx00e04c6812d1".to_string(),
            egress_iface: "enxc84d44263ba6".to_string(),
            dst_mac: "c8:4d:44:26:3b:a6".to_string(),
            vlan_id: 100,
            duration: 20,
            packet_size: 512,
            rate_per_tc_mbps: 60,
            idle_slope_kbps: vec![5000.0; TC_COUNT],
            tolerance: 0.1,
            smooth_window: 5,
            rx_batch: 512,
            tx_batch: 1024,
            rx_cpu: 2,
            tx_cpu: 3,
            egress_port: "1".to_string(),
            ingress_port: "2".to_string(),
            dst_ip: "10.0.100.2".to_string(),
            apply_first: false,
            use_board: true,
            capture_filter: "dst".to_string(),
            rx_seq_only: true,
        }
    }
}

impl SessionConfig {
    /// Clamps out-of-range values to what the measurement binaries accept.
    pub fn normalize(&mut self) {
        if self.rate_per_tc_mbps <= 0 {
            self.rate_per_tc_mbps = 10;
        }
        if self.tx_batch < 1 {
            self.tx_batch = 1;
        }
        if self.smooth_window < 1 {
            self.smooth_window = 1;
        }
        self.idle_slope_kbps.resize(TC_COUNT, 0.0);
    }

    /// Configured idle slope of `tc` in Mbit/s (0 for unconfigured classes).
    pub fn predicted_mbps(&self, tc: usize) -> f64 {
        self.idle_slope_kbps.get(tc).copied().unwrap_or(0.0) / 1000.0
    }

    /// Whether the capture process should only see frames addressed to `dst_mac`.
    pub fn filters_by_destination(&self) -> bool {
        self.capture_filter == "dst"
    }
}

/// Filesystem layout of the rig: binaries, output files, and the board device.
#[derive(Debug, Clone)]
pub struct RigPaths {
    /// Receiver counter CSV.
    pub rx_csv: PathBuf,
    /// Directory holding one stats CSV per transmitter.
    pub tx_stats_dir: PathBuf,
    /// Scratch directory for rendered board patches.
    pub patch_dir: PathBuf,
    pub rxcap_bin: PathBuf,
    pub txgen_bin: PathBuf,
    /// Board configuration CLI.
    pub board_cli: PathBuf,
    /// Serial device of the bridge board.
    pub device: PathBuf,
}

impl RigPaths {
    /// Layout with every output file under `root`.
    pub fn rooted(root: &Path) -> Self {
        Self {
            rx_csv: root.join("cbs_rx.csv"),
            tx_stats_dir: root.join("tx_stats"),
            patch_dir: root.join("patches"),
            rxcap_bin: root.join("rxcap"),
            txgen_bin: root.join("txgen"),
            board_cli: root.join("keti-tsn"),
            device: root.join("ttyACM0"),
        }
    }

    /// Stats file the transmitter for `tc` is told to write.
    pub fn tx_stats_path(&self, tc: usize) -> PathBuf {
        self.tx_stats_dir.join(format!("tx_stats_tc{tc}.csv"))
    }

    /// Name some transmitter builds derive from the stats-file argument.
    pub fn tx_stats_alt_path(&self, tc: usize) -> PathBuf {
        self.tx_stats_dir.join(format!("tx_stats.csv.tc{tc}"))
    }
}

/// Rig-wide switches that do not change per run.
#[derive(Debug, Clone, Copy)]
pub struct RigOptions {
    /// Prefix privileged commands with `sudo`.
    pub use_sudo: bool,
    /// Pin measurement processes with `taskset`.
    pub pin_cpus: bool,
    /// Run a packet capture alongside the receiver when a tool is installed.
    pub capture: bool,
    /// Apply CPU governor / USB autosuspend tuning before each run.
    pub tune_system: bool,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            use_sudo: true,
            pin_cpus: true,
            capture: true,
            tune_system: true,
        }
    }
}
