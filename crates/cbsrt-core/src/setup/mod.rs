//! One-shot setup collaborators invoked before a run.
//!
//! None of these keep state between calls. Board configuration is only
//! attempted when the board's serial device exists; a failure downgrades
//! the run to unconfigured-hardware mode rather than aborting it.

pub mod host;
pub mod patch;

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{RigOptions, RigPaths, SessionConfig};

pub use host::CommandLine;

/// Error type for setup failures.
#[derive(Debug)]
pub enum SetupError {
    /// Board serial device not present.
    DeviceMissing(PathBuf),
    /// Writing a patch file or spawning a command failed.
    Io(io::Error),
    /// A command exited unsuccessfully.
    CommandFailed { command: String, status: Option<i32> },
}

impl std::fmt::Display for SetupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SetupError::DeviceMissing(path) => write!(f, "Device not found: {}", path.display()),
            SetupError::Io(e) => write!(f, "I/O error: {}", e),
            SetupError::CommandFailed { command, status } => match status {
                Some(code) => write!(f, "Command failed ({}): {}", code, command),
                None => write!(f, "Command killed by signal: {}", command),
            },
        }
    }
}

impl std::error::Error for SetupError {}

impl From<io::Error> for SetupError {
    fn from(e: io::Error) -> Self {
        SetupError::Io(e)
    }
}

/// Executes external commands. Substituted in tests.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<(), SetupError>;
}

/// Runs commands with `std::process`, discarding their output.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<(), SetupError> {
        let status = Command::new(program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(SetupError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                status: status.code(),
            })
        }
    }
}

/// Applies board patches, host VLANs, and tuning through a [`CommandRunner`].
#[derive(Clone)]
pub struct BoardConfigurator {
    paths: RigPaths,
    opts: RigOptions,
    runner: Arc<dyn CommandRunner>,
}

impl BoardConfigurator {
    pub fn new(paths: RigPaths, opts: RigOptions, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            paths,
            opts,
            runner,
        }
    }

    pub fn device_present(&self) -> bool {
        self.paths.device.exists()
    }

    fn run(&self, (program, args): &CommandLine) -> Result<(), SetupError> {
        if self.opts.use_sudo {
            let mut argv = Vec::with_capacity(args.len() + 1);
            argv.push(program.clone());
            argv.extend(args.iter().cloned());
            self.runner.run("sudo", &argv)
        } else {
            self.runner.run(program, args)
        }
    }

    /// Renders the three board patches into the patch directory and
    /// applies them in order.
    pub fn apply_board(&self, cfg: &SessionConfig) -> Result<(), SetupError> {
        if !self.device_present() {
            return Err(SetupError::DeviceMissing(self.paths.device.clone()));
        }
        fs::create_dir_all(&self.paths.patch_dir)?;
        let patches = [
            ("cbs_vlan_patch.yaml", patch::render_vlan_patch(cfg)),
            ("cbs_pcp_patch.yaml", patch::render_pcp_patch(cfg)),
            ("cbs_idle_patch.yaml", patch::render_cbs_patch(cfg)),
        ];
        let mut files = Vec::with_capacity(patches.len());
        for (name, content) in &patches {
            let path = self.paths.patch_dir.join(name);
            fs::write(&path, content)?;
            files.push(path);
        }
        for file in &files {
            debug!(patch = %file.display(), "applying board patch");
            self.run(&(
                self.paths.board_cli.display().to_string(),
                vec![
                    "patch".to_string(),
                    file.display().to_string(),
                    "-d".to_string(),
                    self.paths.device.display().to_string(),
                ],
            ))?;
        }
        info!(vlan = cfg.vlan_id, port = %cfg.egress_port, "board configured");
        Ok(())
    }

    /// Recreates the host VLAN sub-interfaces.
    pub fn setup_host_vlan(&self, cfg: &SessionConfig) -> Result<(), SetupError> {
        for cmd in host::vlan_teardown_commands(cfg) {
            let _ = self.run(&cmd);
        }
        for cmd in host::vlan_setup_commands(cfg) {
            self.run(&cmd)?;
        }
        info!(vlan = cfg.vlan_id, "host VLAN interfaces ready");
        Ok(())
    }

    /// Board patches followed by host VLANs.
    pub fn apply(&self, cfg: &SessionConfig) -> Result<(), SetupError> {
        self.apply_board(cfg)?;
        self.setup_host_vlan(cfg)
    }

    /// Best-effort performance tuning; failures are logged and ignored.
    pub fn tune_system(&self) {
        if !self.opts.tune_system {
            return;
        }
        for cmd in host::tuning_commands() {
            if let Err(e) = self.run(&cmd) {
                warn!(error = %e, "system tuning step failed");
            }
        }
    }
}
