//! Data model of the measurement pipeline.
//!
//! `RawSnapshot` is one parsed row of the receiver's counter file.
//! `DerivedMetrics` is what observers see: one record per poll interval.

use serde::Serialize;

use crate::capture::CaptureMode;
use crate::config::TC_COUNT;

/// Cumulative receiver counters at one point of the run.
///
/// Counters are monotonic within a run. A value lower than the previous
/// snapshot's means the receiver restarted its counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawSnapshot {
    /// Seconds since the receiver started.
    pub time_s: f64,
    pub total_pkts: u64,
    pub pcp_pkts: [u64; TC_COUNT],
    pub vlan_pkts: u64,
    pub non_vlan_pkts: u64,
    pub seq_pkts: u64,
    pub embedded_pcp_pkts: u64,
    pub drops: u64,
    /// Receiver's own packets/s figure, when the row carries one.
    pub total_pps: Option<f64>,
    /// Receiver's own Mbit/s figure, when the row carries one.
    pub total_mbps: Option<f64>,
}

/// Transmit-side Mbit/s per class as reported by each transmitter.
/// Classes without a readable report are 0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TxClassSample {
    pub mbps: [f64; TC_COUNT],
}

/// Counters from `/sys/class/net/<iface>/statistics`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IfaceStats {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub rx_errors: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_dropped: u64,
    pub tx_errors: u64,
}

impl IfaceStats {
    /// Per-field increase since `prev`, floored at zero.
    pub fn delta_since(&self, prev: &IfaceStats) -> IfaceStats {
        IfaceStats {
            rx_packets: self.rx_packets.saturating_sub(prev.rx_packets),
            rx_bytes: self.rx_bytes.saturating_sub(prev.rx_bytes),
            rx_dropped: self.rx_dropped.saturating_sub(prev.rx_dropped),
            rx_errors: self.rx_errors.saturating_sub(prev.rx_errors),
            tx_packets: self.tx_packets.saturating_sub(prev.tx_packets),
            tx_bytes: self.tx_bytes.saturating_sub(prev.tx_bytes),
            tx_dropped: self.tx_dropped.saturating_sub(prev.tx_dropped),
            tx_errors: self.tx_errors.saturating_sub(prev.tx_errors),
        }
    }
}

/// One interval's worth of derived figures, pushed to every observer.
///
/// Throughputs are Mbit/s. Per-class arrays are indexed by traffic class.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedMetrics {
    pub time_s: f64,
    /// Receiver-reported total.
    pub total_mbps: f64,
    /// Receiver-reported total, or the total derived from packet deltas.
    pub total_mbps_calc: f64,
    /// Sum of smoothed per-class throughput.
    pub total_mbps_pcp: f64,
    /// Throughput not attributable to any class.
    pub unknown_mbps: f64,
    pub pkt_size_eff: f64,
    pub pps_floor: f64,
    pub total_pps: f64,
    pub drops: u64,
    pub total_pkts: u64,
    pub pcp_pkts: [u64; TC_COUNT],
    pub vlan_pkts: u64,
    pub non_vlan_pkts: u64,
    pub seq_pkts: u64,
    pub embedded_pcp_pkts: u64,
    pub per_tc_mbps: [f64; TC_COUNT],
    pub per_tc_mbps_scaled: [f64; TC_COUNT],
    pub pred_mbps: [f64; TC_COUNT],
    pub tx_tc_mbps: [f64; TC_COUNT],
    pub exp_mbps: [f64; TC_COUNT],
    pub pass: [bool; TC_COUNT],
    pub cap_mode: CaptureMode,
    pub cap_lines: Vec<String>,
    pub iface_delta: IfaceStats,
    pub ingress_delta: IfaceStats,
    /// Classified receive rate over predicted rate; `unknown_mbps` is excluded.
    pub rx_ratio: f64,
    pub pcp_ratio: f64,
    pub pcp_ratio_count: f64,
    pub scale: f64,
    pub total_pred: f64,
    pub total_tx: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iface_delta_floors_at_zero() {
        let prev = IfaceStats {
            rx_packets: 100,
            tx_bytes: 5000,
            ..Default::default()
        };
        let now = IfaceStats {
            rx_packets: 40,
            tx_bytes: 7500,
            rx_errors: 2,
            ..Default::default()
        };
        let d = now.delta_since(&prev);
        assert_eq!(d.rx_packets, 0);
        assert_eq!(d.tx_bytes, 2500);
        assert_eq!(d.rx_errors, 2);
    }

    #[test]
    fn test_metrics_serialize_field_names() {
        let m = DerivedMetrics {
            time_s: 3.5,
            pass: [true; TC_COUNT],
            ..Default::default()
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["time_s"], 3.5);
        assert_eq!(v["pass"].as_array().unwrap().len(), TC_COUNT);
        assert_eq!(v["cap_mode"], "none");
        assert!(v["iface_delta"]["rx_packets"].is_u64());
        assert!(v.get("pcp_ratio_count").is_some());
    }
}
