//! Per-interval throughput estimation and compliance verdicts.
//!
//! Turns an [`Observation`] (two consecutive receiver snapshots plus side
//! readings) into a [`DerivedMetrics`] record. Rates are smoothed per class
//! over the configured window, compared against the configured idle slope
//! (or the transmit-side rate when that is lower), and folded into global
//! ratios.
//!
//! Numeric guards: counter regressions give a zero delta, divisions by a
//! non-positive denominator give 0, and a non-positive interval is taken
//! as one second.

use std::sync::Arc;

use crate::capture::CaptureMode;
use crate::collector::Observation;
use crate::config::{MIN_FREEZE_PKTS, MIN_RUN_SECS, PPS_FLOOR, SessionConfig, TC_COUNT};
use crate::model::{DerivedMetrics, RawSnapshot};
use crate::window::SmoothingWindow;

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

/// Increase of a cumulative counter; 0 when the counter was reset.
pub fn counter_delta(curr: u64, prev: u64) -> u64 {
    curr.saturating_sub(prev)
}

/// `num / den`, or 0 when `den` is not positive.
pub fn ratio(num: f64, den: f64) -> f64 {
    if den > 0.0 { num / den } else { 0.0 }
}

/// Seconds between two snapshots; non-positive intervals become 1 s.
pub fn interval_secs(prev: &RawSnapshot, curr: &RawSnapshot) -> f64 {
    let dt = curr.time_s - prev.time_s;
    if dt > 0.0 { dt } else { 1.0 }
}

/// Mbit/s carried by `packets` frames of `packet_size` bytes over `dt` seconds.
pub fn mbps_from_packets(packets: u64, packet_size: f64, dt: f64) -> f64 {
    ratio(packets as f64 * packet_size * 8.0, dt * 1_000_000.0)
}

/// Bytes per packet implied by the receiver's own Mbit/s figure.
///
/// Accounts for framing the nominal size leaves out. Falls back to
/// `nominal` when the receiver reports no rate or no packets arrived.
pub fn effective_packet_size(
    reported_mbps: Option<f64>,
    delta_total: u64,
    dt: f64,
    nominal: f64,
) -> f64 {
    match reported_mbps {
        Some(mbps) if mbps > 0.0 && delta_total > 0 && dt > 0.0 => {
            (mbps * 1_000_000.0 * dt / 8.0) / delta_total as f64
        }
        _ => nominal,
    }
}

/// Rate a class is held to: the idle slope, or what was actually offered
/// when the transmitter reports less.
pub fn expected_mbps(predicted: f64, tx_smoothed: f64) -> f64 {
    if tx_smoothed > 0.0 {
        predicted.min(tx_smoothed)
    } else {
        predicted
    }
}

/// Whether `smoothed` lies within `tolerance` (relative) of `expected`.
/// A class with nothing expected always passes.
pub fn class_passes(smoothed: f64, expected: f64, tolerance: f64) -> bool {
    if expected <= 0.0 {
        return true;
    }
    (smoothed - expected).abs() / expected <= tolerance
}

/// Packets an interval of `dt` seconds needs before the packet-count ratio
/// is refreshed.
pub fn freeze_floor(dt: f64) -> u64 {
    ((PPS_FLOOR * dt) as u64).max(MIN_FREEZE_PKTS)
}

// ---------------------------------------------------------------------------
// Estimator
// ---------------------------------------------------------------------------

/// What the estimator hands to the broadcaster for one interval.
#[derive(Debug, Clone)]
pub enum Emission {
    /// Computed this interval.
    Fresh(Arc<DerivedMetrics>),
    /// Interval below the reporting floor; last valid record replayed.
    Stale(Arc<DerivedMetrics>),
    /// Below the floor and nothing valid yet.
    Suppressed,
}

impl Emission {
    pub fn record(&self) -> Option<&Arc<DerivedMetrics>> {
        match self {
            Emission::Fresh(m) | Emission::Stale(m) => Some(m),
            Emission::Suppressed => None,
        }
    }
}

/// Estimator state for one run. Owns the smoothing windows.
pub struct ComplianceEstimator {
    pred_mbps: [f64; TC_COUNT],
    packet_size: f64,
    tolerance: f64,
    rx_windows: [SmoothingWindow; TC_COUNT],
    tx_windows: [SmoothingWindow; TC_COUNT],
    last_valid: Option<Arc<DerivedMetrics>>,
    last_time_s: f64,
}

impl ComplianceEstimator {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            pred_mbps: std::array::from_fn(|tc| cfg.predicted_mbps(tc)),
            packet_size: f64::from(cfg.packet_size),
            tolerance: cfg.tolerance,
            rx_windows: std::array::from_fn(|_| SmoothingWindow::new(cfg.smooth_window)),
            tx_windows: std::array::from_fn(|_| SmoothingWindow::new(cfg.smooth_window)),
            last_valid: None,
            last_time_s: 0.0,
        }
    }

    /// Most recent record that passed the reporting floor.
    pub fn last_valid(&self) -> Option<&Arc<DerivedMetrics>> {
        self.last_valid.as_ref()
    }

    /// Computes the interval's record and decides what to emit.
    ///
    /// A record is fresh once the run is [`MIN_RUN_SECS`] old and the
    /// packet rate reaches [`PPS_FLOOR`]; otherwise the last fresh record
    /// is replayed unchanged.
    pub fn estimate(
        &mut self,
        obs: &Observation,
        cap_mode: CaptureMode,
        cap_lines: Vec<String>,
    ) -> Emission {
        let metrics = self.compute(obs, cap_mode, cap_lines);
        if obs.curr.time_s >= MIN_RUN_SECS && metrics.total_pps >= PPS_FLOOR {
            let metrics = Arc::new(metrics);
            self.last_valid = Some(metrics.clone());
            Emission::Fresh(metrics)
        } else {
            match &self.last_valid {
                Some(last) => Emission::Stale(last.clone()),
                None => Emission::Suppressed,
            }
        }
    }

    /// Builds the record for one interval, advancing every smoothing window.
    pub fn compute(
        &mut self,
        obs: &Observation,
        cap_mode: CaptureMode,
        cap_lines: Vec<String>,
    ) -> DerivedMetrics {
        let (prev, curr) = (&obs.prev, &obs.curr);
        let dt = interval_secs(prev, curr);
        let delta_total = counter_delta(curr.total_pkts, prev.total_pkts);
        let delta_emb = counter_delta(curr.embedded_pcp_pkts, prev.embedded_pcp_pkts);
        let reported_mbps = curr.total_mbps.unwrap_or(0.0);

        let mut tx_tc_mbps = [0.0; TC_COUNT];
        for (tc, slot) in tx_tc_mbps.iter_mut().enumerate() {
            *slot = self.tx_windows[tc].push(obs.tx.mbps[tc]);
        }

        let pkt_size_eff =
            effective_packet_size(curr.total_mbps, delta_total, dt, self.packet_size);

        let mut per_tc_mbps = [0.0; TC_COUNT];
        let mut exp_mbps = [0.0; TC_COUNT];
        let mut pass = [true; TC_COUNT];
        let mut sum_pcp_delta = 0u64;
        for tc in 0..TC_COUNT {
            let dp = counter_delta(curr.pcp_pkts[tc], prev.pcp_pkts[tc]);
            sum_pcp_delta += dp;
            let smoothed = self.rx_windows[tc].push(mbps_from_packets(dp, pkt_size_eff, dt));
            per_tc_mbps[tc] = smoothed;
            exp_mbps[tc] = expected_mbps(self.pred_mbps[tc], tx_tc_mbps[tc]);
            pass[tc] = class_passes(smoothed, exp_mbps[tc], self.tolerance);
        }

        let total_mbps_pcp: f64 = per_tc_mbps.iter().sum();
        let total_mbps_calc = if reported_mbps > 0.0 {
            reported_mbps
        } else {
            mbps_from_packets(delta_total, pkt_size_eff, dt)
        };
        let total_pred: f64 = self.pred_mbps.iter().sum();
        let total_tx: f64 = tx_tc_mbps.iter().sum();

        let mut pcp_ratio_count = if delta_total > 0 && delta_emb > 0 {
            delta_emb as f64 / delta_total as f64
        } else if delta_total > 0 {
            sum_pcp_delta as f64 / delta_total as f64
        } else {
            0.0
        };
        if delta_total < freeze_floor(dt)
            && let Some(last) = &self.last_valid
        {
            pcp_ratio_count = last.pcp_ratio_count;
        }

        let scale = ratio(total_mbps_calc, total_mbps_pcp);
        let time_s = curr.time_s.max(self.last_time_s);
        self.last_time_s = time_s;

        DerivedMetrics {
            time_s,
            total_mbps: reported_mbps,
            total_mbps_calc,
            total_mbps_pcp,
            unknown_mbps: (total_mbps_calc - total_mbps_pcp).max(0.0),
            pkt_size_eff,
            pps_floor: PPS_FLOOR,
            total_pps: curr
                .total_pps
                .unwrap_or_else(|| delta_total as f64 / dt),
            drops: curr.drops,
            total_pkts: curr.total_pkts,
            pcp_pkts: curr.pcp_pkts,
            vlan_pkts: curr.vlan_pkts,
            non_vlan_pkts: curr.non_vlan_pkts,
            seq_pkts: curr.seq_pkts,
            embedded_pcp_pkts: curr.embedded_pcp_pkts,
            per_tc_mbps,
            per_tc_mbps_scaled: per_tc_mbps.map(|v| v * scale),
            pred_mbps: self.pred_mbps,
            tx_tc_mbps,
            exp_mbps,
            pass,
            cap_mode,
            cap_lines,
            iface_delta: obs.egress_delta,
            ingress_delta: obs.ingress_delta,
            rx_ratio: ratio(total_mbps_pcp, total_pred),
            pcp_ratio: ratio(total_mbps_pcp, total_mbps_calc),
            pcp_ratio_count,
            scale,
            total_pred,
            total_tx,
        }
    }
}
