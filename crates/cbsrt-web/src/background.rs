//! Per-run background tasks: the sampling tick loop and the capture reader.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cbsrt_core::capture::{CaptureBuffer, CaptureMode};
use cbsrt_core::collector::{CounterSampler, FileSystem};
use cbsrt_core::config::{RigPaths, SessionConfig};
use cbsrt_core::estimator::{ComplianceEstimator, Emission};
use cbsrt_core::model::DerivedMetrics;

use crate::broadcast::Broadcaster;

/// Most recent record that passed the reporting floor, shared with `/status`.
pub(crate) type LastRecord = Arc<Mutex<Option<Arc<DerivedMetrics>>>>;

/// Everything the tick loop needs for one run.
pub(crate) struct SamplerTask<F> {
    pub(crate) fs: Arc<F>,
    pub(crate) cfg: SessionConfig,
    pub(crate) paths: RigPaths,
    pub(crate) cap_mode: CaptureMode,
    pub(crate) capture: CaptureBuffer,
    pub(crate) broadcaster: Broadcaster,
    pub(crate) last: LastRecord,
    pub(crate) interval: Duration,
}

struct Pipeline {
    sampler: CounterSampler,
    estimator: ComplianceEstimator,
}

// ============================================================
// Tick loop
// ============================================================

/// Polls the receiver's counters on a fixed cadence and publishes one
/// record per interval until `cancel` fires.
pub(crate) async fn sampler_loop<F: FileSystem + 'static>(
    task: SamplerTask<F>,
    cancel: CancellationToken,
) {
    let SamplerTask {
        fs,
        cfg,
        paths,
        cap_mode,
        capture,
        broadcaster,
        last,
        interval,
    } = task;

    let pipeline = Arc::new(Mutex::new(Pipeline {
        sampler: CounterSampler::new(fs.as_ref(), paths, &cfg.egress_iface, &cfg.ingress_iface),
        estimator: ComplianceEstimator::new(&cfg),
    }));

    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut fresh_count: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        // File reads and parsing run off the async runtime.
        let pipeline_clone = pipeline.clone();
        let fs_clone = fs.clone();
        let capture_clone = capture.clone();
        let t0 = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut p = pipeline_clone.lock().unwrap_or_else(PoisonError::into_inner);
            let obs = p.sampler.poll(fs_clone.as_ref())?;
            Some(p.estimator.estimate(&obs, cap_mode, capture_clone.snapshot()))
        })
        .await;
        let elapsed = t0.elapsed();

        let emission = match result {
            Ok(Some(emission)) => emission,
            Ok(None) => continue,
            Err(e) => {
                error!(error = %e, "tick panicked in spawn_blocking");
                continue;
            }
        };

        if elapsed > interval / 2 {
            warn!(
                duration_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "tick exceeded 50% of interval"
            );
        }

        match emission {
            Emission::Fresh(record) => {
                fresh_count += 1;
                if fresh_count == 1 {
                    info!(time_s = record.time_s, total_pps = record.total_pps, "first valid record");
                } else {
                    debug!(time_s = record.time_s, fresh_count, "tick completed");
                }
                *last.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
                broadcaster.publish(record);
            }
            Emission::Stale(record) => broadcaster.publish(record),
            Emission::Suppressed => {}
        }
    }
    debug!(fresh_count, "sampler stopped");
}

// ============================================================
// Capture reader
// ============================================================

/// Copies capture output line by line into `buffer` until EOF or `cancel`.
pub(crate) async fn capture_reader<R: AsyncRead + Unpin>(
    out: R,
    buffer: CaptureBuffer,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(out).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => buffer.push(&line),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "capture output closed");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Frame;
    use cbsrt_core::collector::RealFs;

    const HEADER: &str = "time_s,total_pkts,total_pps,total_mbps,\
        pcp0_pkts,pcp1_pkts,pcp2_pkts,pcp3_pkts,pcp4_pkts,pcp5_pkts,pcp6_pkts,pcp7_pkts";

    fn row(t: f64, per_class: u64) -> String {
        let pcp = vec![per_class.to_string(); 8].join(",");
        format!("{t},{},9760,40.0,{pcp}\n", per_class * 8)
    }

    fn task(dir: &std::path::Path, broadcaster: Broadcaster, last: LastRecord) -> SamplerTask<RealFs> {
        SamplerTask {
            fs: Arc::new(RealFs::new()),
            cfg: SessionConfig::default(),
            paths: RigPaths::rooted(dir),
            cap_mode: CaptureMode::Tcpdump,
            capture: CaptureBuffer::default(),
            broadcaster,
            last,
            interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_publishes_records_from_counter_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = RigPaths::rooted(dir.path());
        std::fs::write(&paths.rx_csv, format!("{HEADER}\n{}{}", row(2.5, 6100), row(3.0, 6710)))
            .unwrap();

        let broadcaster = Broadcaster::spawn();
        let mut sub = broadcaster.subscribe();
        let last = LastRecord::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler_loop(
            task(dir.path(), broadcaster.clone(), last.clone()),
            cancel.clone(),
        ));

        let record = match sub.recv_timeout(Duration::from_secs(5)).await {
            Some(Frame::Record(r)) => r,
            other => panic!("expected a record, got {other:?}"),
        };
        assert_eq!(record.time_s, 3.0);
        assert_eq!(record.total_pps, 9760.0);
        assert_eq!(record.cap_mode, CaptureMode::Tcpdump);
        assert!(last.lock().unwrap().is_some());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sampler should stop on cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_counter_file_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let broadcaster = Broadcaster::spawn();
        let mut sub = broadcaster.subscribe();
        let last = LastRecord::default();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler_loop(
            task(dir.path(), broadcaster.clone(), last.clone()),
            cancel.clone(),
        ));

        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(200)).await,
            Some(Frame::KeepAlive)
        ));
        cancel.cancel();
        handle.await.unwrap();
        assert!(last.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capture_reader_fills_buffer() {
        let buffer = CaptureBuffer::new(2);
        let input: &[u8] = b"1.0,60,aa\n\n1.1,60,bb\n1.2,60,cc\n";
        capture_reader(input, buffer.clone(), CancellationToken::new()).await;
        assert_eq!(buffer.snapshot(), vec!["1.1,60,bb", "1.2,60,cc"]);
    }
}
