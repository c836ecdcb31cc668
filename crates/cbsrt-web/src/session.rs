//! Session controller: owns the run flag and drives one run at a time.
//!
//! A run goes through setup (board, VLANs, tuning, output cleanup, capture
//! tool choice) on a blocking thread, then launches the measurement
//! processes and the per-run tasks. The run ends when the receiver and all
//! transmitters have exited or when it is stopped, whichever comes first.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cbsrt_core::capture::{CaptureBuffer, CaptureMode, select_capture_tool};
use cbsrt_core::collector::{RealFs, read_iface_mac};
use cbsrt_core::config::{POLL_INTERVAL, RigOptions, RigPaths, SessionConfig};
use cbsrt_core::launch::{LaunchPlan, clear_previous_outputs};
use cbsrt_core::model::DerivedMetrics;
use cbsrt_core::setup::{BoardConfigurator, CommandRunner, SetupError};

use crate::background::{LastRecord, SamplerTask, capture_reader, sampler_loop};
use crate::broadcast::Broadcaster;
use crate::state::release_memory_to_os;
use crate::supervisor::Supervisor;

/// Rejections surfaced to the control surface.
#[derive(Debug)]
pub(crate) enum SessionError {
    AlreadyRunning,
    DeviceMissing(PathBuf),
    Setup(SetupError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AlreadyRunning => write!(f, "a run is already active"),
            SessionError::DeviceMissing(path) => {
                write!(f, "board device not found: {}", path.display())
            }
            SessionError::Setup(e) => write!(f, "setup failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SetupError> for SessionError {
    fn from(e: SetupError) -> Self {
        match e {
            SetupError::DeviceMissing(path) => SessionError::DeviceMissing(path),
            other => SessionError::Setup(other),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Serialize)]
pub(crate) struct SessionStatus {
    pub(crate) running: bool,
    pub(crate) applied: bool,
    pub(crate) cap_mode: CaptureMode,
    pub(crate) config: SessionConfig,
    pub(crate) last: Option<DerivedMetrics>,
}

struct SessionInner {
    // Run flag reported to observers; cleared as soon as a stop is requested.
    running: bool,
    // Held from start until the run's processes and tasks are gone.
    active: bool,
    // Bumped on every start; a finishing run only clears state it still owns.
    generation: u64,
    applied: bool,
    cap_mode: CaptureMode,
    config: SessionConfig,
    cancel: Option<CancellationToken>,
    supervisor: Option<Arc<Supervisor>>,
}

pub(crate) struct Session {
    paths: RigPaths,
    opts: RigOptions,
    board: BoardConfigurator,
    fs: Arc<RealFs>,
    path_var: String,
    broadcaster: Broadcaster,
    capture: CaptureBuffer,
    last: LastRecord,
    poll_interval: Duration,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        paths: RigPaths,
        opts: RigOptions,
        runner: Arc<dyn CommandRunner>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            board: BoardConfigurator::new(paths.clone(), opts, runner),
            paths,
            opts,
            fs: Arc::new(RealFs::new()),
            path_var: std::env::var("PATH").unwrap_or_default(),
            broadcaster,
            capture: CaptureBuffer::default(),
            last: LastRecord::default(),
            poll_interval: POLL_INTERVAL,
            inner: Mutex::new(SessionInner {
                running: false,
                active: false,
                generation: 0,
                applied: false,
                cap_mode: CaptureMode::None,
                config: SessionConfig::default(),
                cancel: None,
                supervisor: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub(crate) fn status(&self) -> SessionStatus {
        let inner = self.lock();
        SessionStatus {
            running: inner.running,
            applied: inner.applied,
            cap_mode: inner.cap_mode,
            config: inner.config.clone(),
            last: self
                .last
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_deref()
                .cloned(),
        }
    }

    /// Begins a run and returns as soon as it is registered.
    ///
    /// Rejected while a previous run is still winding down, since its
    /// processes may yet write into the output files.
    pub(crate) fn start(self: &Arc<Self>, mut cfg: SessionConfig) -> Result<(), SessionError> {
        cfg.normalize();
        let (generation, cancel) = {
            let mut inner = self.lock();
            if inner.running || inner.active {
                return Err(SessionError::AlreadyRunning);
            }
            inner.running = true;
            inner.active = true;
            inner.generation += 1;
            inner.config = cfg.clone();
            inner.supervisor = None;
            let cancel = CancellationToken::new();
            inner.cancel = Some(cancel.clone());
            (inner.generation, cancel)
        };
        self.capture.clear();
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = None;

        info!(
            generation,
            duration = cfg.duration,
            vlan = cfg.vlan_id,
            packet_size = cfg.packet_size,
            "run requested"
        );
        tokio::spawn(self.clone().run(cfg, generation, cancel));
        Ok(())
    }

    /// Interrupts the current run, if any. Safe to call at any time.
    pub(crate) fn stop(&self) {
        let (cancel, supervisor) = {
            let mut inner = self.lock();
            inner.running = false;
            (inner.cancel.take(), inner.supervisor.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
            info!("run stopped");
        }
        if let Some(supervisor) = supervisor {
            info!(running = ?supervisor.running(), "interrupting measurement processes");
            supervisor.stop();
        }
    }

    /// Configures the board and host VLANs without starting a run.
    /// Blocking; call from a blocking context.
    pub(crate) fn apply(&self, mut cfg: SessionConfig) -> Result<(), SessionError> {
        cfg.normalize();
        if !self.board.device_present() {
            return Err(SessionError::DeviceMissing(self.paths.device.clone()));
        }
        let result = self.board.apply(&cfg);
        let mut inner = self.lock();
        inner.applied = result.is_ok();
        inner.config = cfg;
        result.map_err(SessionError::from)
    }

    async fn run(self: Arc<Self>, cfg: SessionConfig, generation: u64, cancel: CancellationToken) {
        let session = self.clone();
        let prepared = tokio::task::spawn_blocking(move || session.prepare(cfg)).await;
        let (cfg, cap_mode) = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                error!(error = %e, "run setup failed");
                self.finish(generation);
                return;
            }
            Err(e) => {
                error!(error = %e, "run setup panicked in spawn_blocking");
                self.finish(generation);
                return;
            }
        };
        if cancel.is_cancelled() {
            self.finish(generation);
            return;
        }

        let plan = LaunchPlan::build(&cfg, &self.paths, &self.opts, cap_mode);
        let (supervisor, capture_out) = Supervisor::launch(&plan);
        let supervisor = Arc::new(supervisor);
        {
            let mut inner = self.lock();
            if inner.generation == generation {
                inner.supervisor = Some(supervisor.clone());
                inner.cap_mode = cap_mode;
                inner.config = cfg.clone();
            }
        }
        // A stop that landed while launching found no supervisor to signal.
        if cancel.is_cancelled() {
            supervisor.stop();
        }

        if let Some(out) = capture_out {
            tokio::spawn(capture_reader(out, self.capture.clone(), cancel.clone()));
        }
        let sampler = tokio::spawn(sampler_loop(
            SamplerTask {
                fs: self.fs.clone(),
                cfg,
                paths: self.paths.clone(),
                cap_mode,
                capture: self.capture.clone(),
                broadcaster: self.broadcaster.clone(),
                last: self.last.clone(),
                interval: self.poll_interval,
            },
            cancel.clone(),
        ));

        supervisor.wait().await;
        info!(generation, "measurement processes finished");
        cancel.cancel();
        supervisor.stop();
        if let Err(e) = sampler.await {
            error!(error = %e, "sampler task failed");
        }
        self.finish(generation);
    }

    /// Setup steps that touch the filesystem or run commands.
    fn prepare(&self, mut cfg: SessionConfig) -> Result<(SessionConfig, CaptureMode), SessionError> {
        if cfg.use_board && !self.board.device_present() {
            warn!(device = %self.paths.device.display(), "board device absent, running without board");
            cfg.use_board = false;
        }
        if !cfg.use_board
            && let Some(mac) = read_iface_mac(self.fs.as_ref(), &cfg.egress_iface)
        {
            info!(iface = %cfg.egress_iface, %mac, "using interface MAC as destination");
            cfg.dst_mac = mac;
        }

        if cfg.use_board && (cfg.apply_first || !self.lock().applied) {
            let result = self.board.apply(&cfg);
            if let Err(e) = &result {
                warn!(error = %e, "board setup failed, continuing with unconfigured hardware");
            }
            self.lock().applied = result.is_ok();
        }
        self.board.tune_system();

        clear_previous_outputs(&self.paths).map_err(|e| SessionError::Setup(e.into()))?;

        let cap_mode = if self.opts.capture {
            select_capture_tool(self.fs.as_ref(), &self.path_var)
        } else {
            CaptureMode::None
        };
        info!(cap_mode = ?cap_mode, dst_mac = %cfg.dst_mac, "run prepared");
        Ok((cfg, cap_mode))
    }

    fn finish(&self, generation: u64) {
        {
            let mut inner = self.lock();
            if inner.generation == generation {
                inner.running = false;
                inner.active = false;
                inner.cancel = None;
                inner.supervisor = None;
            }
        }
        release_memory_to_os();
        info!(generation, "run finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    struct NoopRunner {
        fail: bool,
    }

    impl CommandRunner for NoopRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<(), SetupError> {
            if self.fail {
                Err(SetupError::CommandFailed {
                    command: format!("{} {}", program, args.join(" ")),
                    status: Some(2),
                })
            } else {
                Ok(())
            }
        }
    }

    fn script(path: &Path, body: &str) {
        std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn session(dir: &Path, body: &str, fail: bool) -> Arc<Session> {
        session_with(dir, body, body, fail)
    }

    fn session_with(dir: &Path, rx_body: &str, tx_body: &str, fail: bool) -> Arc<Session> {
        let paths = RigPaths::rooted(dir);
        script(&paths.rxcap_bin, rx_body);
        script(&paths.txgen_bin, tx_body);
        let opts = RigOptions {
            use_sudo: false,
            pin_cpus: false,
            capture: false,
            tune_system: false,
        };
        let mut session = Session::new(
            paths,
            opts,
            Arc::new(NoopRunner { fail }),
            Broadcaster::spawn(),
        );
        session.poll_interval = Duration::from_millis(20);
        Arc::new(session)
    }

    async fn wait_until_idle(session: &Session) {
        for _ in 0..250 {
            if !session.status().running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run did not finish");
    }

    async fn wait_until_finished(session: &Session) {
        for _ in 0..250 {
            if !session.lock().active {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run did not wind down");
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path(), "exec sleep 30", false);

        s.start(SessionConfig::default()).unwrap();
        assert!(s.status().running);
        assert!(matches!(
            s.start(SessionConfig::default()),
            Err(SessionError::AlreadyRunning)
        ));

        s.stop();
        s.stop();
        assert!(!s.status().running);
        wait_until_finished(&s).await;
        s.start(SessionConfig::default()).unwrap();
        s.stop();
        wait_until_finished(&s).await;
    }

    #[tokio::test]
    async fn test_restart_waits_for_previous_processes_to_flush() {
        let dir = tempfile::tempdir().unwrap();
        let csv = RigPaths::rooted(dir.path()).rx_csv;
        let body = format!(
            "trap 'sleep 1; echo old-run-row >> {}; exit 0' INT\nwhile :; do sleep 0.05; done",
            csv.display()
        );
        let s = session(dir.path(), &body, false);

        s.start(SessionConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        s.stop();
        assert!(!s.status().running);
        assert!(matches!(
            s.start(SessionConfig::default()),
            Err(SessionError::AlreadyRunning)
        ));

        wait_until_finished(&s).await;
        // Receiver and all eight transmitters flushed before the run let go.
        let rows = std::fs::read_to_string(&csv).unwrap();
        assert_eq!(rows.lines().filter(|l| *l == "old-run-row").count(), 9);

        s.start(SessionConfig::default()).unwrap();
        for _ in 0..250 {
            if !csv.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!csv.exists(), "previous run wrote into the new run's counter file");

        s.stop();
        wait_until_finished(&s).await;
    }

    #[tokio::test]
    async fn test_stop_with_receiver_already_exited() {
        let dir = tempfile::tempdir().unwrap();
        let s = session_with(dir.path(), "exit 0", "exec sleep 30", false);

        s.start(SessionConfig::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        s.stop();
        assert!(!s.status().running);
        wait_until_finished(&s).await;
        assert!(!s.status().running);
        s.start(SessionConfig::default()).unwrap();
        s.stop();
        wait_until_finished(&s).await;
    }

    #[tokio::test]
    async fn test_run_ends_when_processes_exit() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path(), "exit 0", false);
        let paths = RigPaths::rooted(dir.path());
        std::fs::create_dir_all(&paths.tx_stats_dir).unwrap();
        std::fs::write(paths.tx_stats_alt_path(3), "stale").unwrap();

        s.start(SessionConfig::default()).unwrap();
        wait_until_idle(&s).await;

        assert!(!paths.tx_stats_alt_path(3).exists());
        let status = s.status();
        assert!(!status.applied);
        assert_eq!(status.cap_mode, CaptureMode::None);
        assert!(!status.config.use_board);
        s.start(SessionConfig::default()).unwrap();
        s.stop();
    }

    #[tokio::test]
    async fn test_start_normalizes_config() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path(), "exec sleep 30", false);
        s.start(SessionConfig {
            idle_slope_kbps: vec![1000.0],
            rate_per_tc_mbps: -1,
            ..Default::default()
        })
        .unwrap();
        let cfg = s.status().config;
        assert_eq!(cfg.idle_slope_kbps.len(), 8);
        assert_eq!(cfg.rate_per_tc_mbps, 10);
        s.stop();
    }

    #[tokio::test]
    async fn test_apply_requires_device() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path(), "exit 0", false);
        assert!(matches!(
            s.apply(SessionConfig::default()),
            Err(SessionError::DeviceMissing(_))
        ));
        assert!(!s.status().applied);
    }

    #[tokio::test]
    async fn test_apply_sets_applied_flag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(RigPaths::rooted(dir.path()).device, "").unwrap();

        let ok = session(dir.path(), "exit 0", false);
        ok.apply(SessionConfig::default()).unwrap();
        assert!(ok.status().applied);

        let failing = session(dir.path(), "exit 0", true);
        assert!(matches!(
            failing.apply(SessionConfig::default()),
            Err(SessionError::Setup(SetupError::CommandFailed { .. }))
        ));
        assert!(!failing.status().applied);
    }

    #[test]
    fn test_device_missing_setup_error_maps_through() {
        let err: SessionError = SetupError::DeviceMissing(PathBuf::from("/dev/ttyACM0")).into();
        assert!(matches!(err, SessionError::DeviceMissing(_)));
    }
}
