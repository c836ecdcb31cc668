//! Launches and tracks the measurement processes of one run.
//!
//! Each child is owned by a waiter task that reaps it and flips a `watch`
//! flag, so liveness can be read without owning the `Child`. Interrupts are
//! forwarded to the waiter, which signals the pid only while the child is
//! still unreaped. Stopping sends SIGINT only; the processes are expected
//! to flush their reports and exit.

use std::process::Stdio;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use cbsrt_core::launch::{LaunchPlan, LaunchSpec, ProcessRole};

struct Tracked {
    name: String,
    role: ProcessRole,
    interrupt: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

impl Tracked {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }
}

pub(crate) struct Supervisor {
    children: Vec<Tracked>,
}

impl Supervisor {
    /// Spawns every process of `plan`. A process that fails to start is
    /// logged and left out; the rest of the run goes ahead without it.
    /// Returns the capture process's stdout when one was started.
    pub(crate) fn launch(plan: &LaunchPlan) -> (Self, Option<ChildStdout>) {
        let mut children = Vec::new();
        let mut capture_out = None;
        for spec in plan.specs() {
            match spawn(spec) {
                Ok((tracked, stdout)) => {
                    if spec.pipe_stdout {
                        capture_out = stdout;
                    }
                    children.push(tracked);
                }
                Err(e) => {
                    warn!(process = %spec.name, program = %spec.program, error = %e,
                        "failed to launch process");
                }
            }
        }
        info!(launched = children.len(), "measurement processes started");
        (Self { children }, capture_out)
    }

    /// Names of the processes still running.
    pub(crate) fn running(&self) -> Vec<&str> {
        self.children
            .iter()
            .filter(|c| !c.has_exited())
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Sends SIGINT to every child that has not exited. Safe to repeat.
    pub(crate) fn stop(&self) {
        for child in self.children.iter().filter(|c| !c.has_exited()) {
            let _ = child.interrupt.send(());
        }
    }

    /// Resolves once the receiver and every transmitter have exited.
    /// The capture process is not waited for.
    pub(crate) async fn wait(&self) {
        for child in &self.children {
            if child.role == ProcessRole::Capture {
                continue;
            }
            let mut exited = child.exited.clone();
            let _ = exited.wait_for(|done| *done).await;
        }
    }
}

fn spawn(spec: &LaunchSpec) -> std::io::Result<(Tracked, Option<ChildStdout>)> {
    let stdout = if spec.pipe_stdout {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(Stdio::null())
        .spawn()?;
    let out = child.stdout.take();
    let (tx, exited) = watch::channel(false);
    let (interrupt, mut interrupts) = mpsc::unbounded_channel();
    let name = spec.name.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                status = child.wait() => {
                    match status {
                        Ok(status) => debug!(process = %name, %status, "process exited"),
                        Err(e) => warn!(process = %name, error = %e, "failed to wait for process"),
                    }
                    break;
                }
                Some(()) = interrupts.recv() => send_sigint(&child, &name),
            }
        }
        let _ = tx.send(true);
    });
    Ok((
        Tracked {
            name: spec.name.clone(),
            role: spec.role,
            interrupt,
            exited,
        },
        out,
    ))
}

// `Child::id` is `None` once the child has been reaped, so the pid cannot
// belong to another process here.
fn send_sigint(child: &Child, name: &str) {
    let Some(pid) = child.id() else { return };
    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
        Ok(()) => debug!(process = %name, pid, "sent SIGINT"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(process = %name, pid, error = %e, "failed to signal process"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec(name: &str, role: ProcessRole, script: &str) -> LaunchSpec {
        LaunchSpec {
            name: name.to_string(),
            role,
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            pipe_stdout: role == ProcessRole::Capture,
        }
    }

    fn plan(rx: &str, tx: &str, capture: Option<&str>) -> LaunchPlan {
        LaunchPlan {
            receiver: spec("rx", ProcessRole::Receiver, rx),
            transmitters: (0..2)
                .map(|tc| spec(&format!("tx{tc}"), ProcessRole::Transmitter(tc), tx))
                .collect(),
            capture: capture.map(|c| spec("cap", ProcessRole::Capture, c)),
        }
    }

    #[tokio::test]
    async fn test_wait_returns_when_processes_exit() {
        let (sup, _) = Supervisor::launch(&plan("exit 0", "exit 0", None));
        tokio::time::timeout(Duration::from_secs(5), sup.wait())
            .await
            .expect("processes should have exited");
        assert!(sup.running().is_empty());
    }

    #[tokio::test]
    async fn test_stop_interrupts_and_is_idempotent() {
        let (sup, _) = Supervisor::launch(&plan("exec sleep 30", "exec sleep 30", None));
        assert_eq!(sup.running().len(), 3);
        sup.stop();
        sup.stop();
        tokio::time::timeout(Duration::from_secs(5), sup.wait())
            .await
            .expect("SIGINT should end the processes");
        sup.stop();
    }

    #[tokio::test]
    async fn test_failed_launch_is_skipped() {
        let mut p = plan("exit 0", "exit 0", None);
        p.transmitters[1].program = "/nonexistent/txgen".to_string();
        let (sup, _) = Supervisor::launch(&p);
        assert_eq!(sup.children.len(), 2);
        tokio::time::timeout(Duration::from_secs(5), sup.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_capture_stdout_is_handed_out() {
        let (sup, out) = Supervisor::launch(&plan("exit 0", "exit 0", Some("echo frame")));
        assert!(out.is_some());
        sup.wait().await;
    }

    #[tokio::test]
    async fn test_stop_after_some_processes_exited() {
        let (sup, _) = Supervisor::launch(&plan("exit 0", "exec sleep 30", None));
        tokio::time::timeout(Duration::from_secs(5), async {
            while sup.running().contains(&"rx") {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("receiver should exit on its own");
        assert_eq!(sup.running(), vec!["tx0", "tx1"]);

        sup.stop();
        tokio::time::timeout(Duration::from_secs(5), sup.wait())
            .await
            .expect("remaining processes should stop");
        assert!(sup.running().is_empty());
        sup.stop();
    }

    #[tokio::test]
    async fn test_interrupt_reaches_process_handler() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("interrupted");
        let script = format!(
            "trap 'echo int > {}; exit 0' INT; while :; do sleep 0.05; done",
            marker.display()
        );
        let (sup, _) = Supervisor::launch(&plan(&script, "exit 0", None));
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.stop();
        tokio::time::timeout(Duration::from_secs(5), sup.wait())
            .await
            .expect("receiver should exit from its INT handler");
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "int\n");
    }
}
