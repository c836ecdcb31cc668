//! Command lines for the measurement processes of one run.
//!
//! Only argv construction lives here; spawning and signalling is the
//! supervisor's job.

use std::fs;
use std::io;
use std::path::Path;

use crate::capture::CaptureMode;
use crate::config::{RigOptions, RigPaths, SessionConfig, TC_COUNT};

/// Fields captured by tshark, one CSV line per frame.
const TSHARK_FIELDS: &[&str] = &[
    "frame.time_relative",
    "frame.len",
    "eth.src",
    "eth.dst",
    "vlan.id",
    "vlan.prio",
    "ip.src",
    "ip.dst",
    "udp.srcport",
    "udp.dstport",
];

/// Extra seconds the receiver keeps running after the transmitters stop,
/// so that trailing frames are still counted.
const RX_GRACE_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    Receiver,
    Transmitter(usize),
    Capture,
}

/// One process to launch.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub name: String,
    pub role: ProcessRole,
    pub program: String,
    pub args: Vec<String>,
    /// Whether stdout is consumed by the capture reader.
    pub pipe_stdout: bool,
}

/// Every process of a run.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub receiver: LaunchSpec,
    pub transmitters: Vec<LaunchSpec>,
    pub capture: Option<LaunchSpec>,
}

fn wrap(opts: &RigOptions, cpu: Option<u32>, binary: &Path, args: Vec<String>) -> (String, Vec<String>) {
    let mut argv = Vec::with_capacity(args.len() + 4);
    if let (true, Some(cpu)) = (opts.pin_cpus, cpu) {
        argv.push("taskset".to_string());
        argv.push("-c".to_string());
        argv.push(cpu.to_string());
    }
    argv.push(binary.display().to_string());
    argv.extend(args);
    if opts.use_sudo {
        ("sudo".to_string(), argv)
    } else {
        let program = argv.remove(0);
        (program, argv)
    }
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl LaunchPlan {
    pub fn build(
        cfg: &SessionConfig,
        paths: &RigPaths,
        opts: &RigOptions,
        capture: CaptureMode,
    ) -> Self {
        let mut rx_args = vec![cfg.egress_iface.clone()];
        rx_args.extend(strings(["--seq", "--pcp-stats"]));
        if cfg.rx_seq_only {
            rx_args.push("--seq-only".to_string());
        }
        rx_args.extend([
            "--dst-mac".to_string(),
            cfg.dst_mac.clone(),
            "--duration".to_string(),
            (cfg.duration + RX_GRACE_SECS).to_string(),
            "--batch".to_string(),
            cfg.rx_batch.to_string(),
            "--csv".to_string(),
            paths.rx_csv.display().to_string(),
        ]);
        let (program, args) = wrap(opts, Some(cfg.rx_cpu), &paths.rxcap_bin, rx_args);
        let receiver = LaunchSpec {
            name: "rxcap".to_string(),
            role: ProcessRole::Receiver,
            program,
            args,
            pipe_stdout: false,
        };

        let transmitters = (0..TC_COUNT)
            .map(|tc| {
                let tx_args = vec![
                    cfg.ingress_iface.clone(),
                    "-B".to_string(),
                    cfg.dst_ip.clone(),
                    "-b".to_string(),
                    cfg.dst_mac.clone(),
                    "-Q".to_string(),
                    format!("{tc}:{}", cfg.vlan_id),
                    "--seq".to_string(),
                    "-r".to_string(),
                    cfg.rate_per_tc_mbps.to_string(),
                    "--duration".to_string(),
                    cfg.duration.to_string(),
                    "-l".to_string(),
                    cfg.packet_size.to_string(),
                    "--batch".to_string(),
                    cfg.tx_batch.to_string(),
                    "--stats-file".to_string(),
                    paths.tx_stats_path(tc).display().to_string(),
                ];
                let (program, args) = wrap(opts, Some(cfg.tx_cpu), &paths.txgen_bin, tx_args);
                LaunchSpec {
                    name: format!("txgen-tc{tc}"),
                    role: ProcessRole::Transmitter(tc),
                    program,
                    args,
                    pipe_stdout: false,
                }
            })
            .collect();

        Self {
            receiver,
            transmitters,
            capture: capture_spec(cfg, opts, capture),
        }
    }

    pub fn specs(&self) -> impl Iterator<Item = &LaunchSpec> {
        std::iter::once(&self.receiver)
            .chain(self.capture.iter())
            .chain(self.transmitters.iter())
    }
}

fn capture_spec(cfg: &SessionConfig, opts: &RigOptions, mode: CaptureMode) -> Option<LaunchSpec> {
    let binary = mode.binary()?;
    let dst_mac = cfg.dst_mac.to_lowercase();
    let args = match mode {
        CaptureMode::Tshark => {
            let mut args = strings(["-l", "-i"]);
            args.push(cfg.egress_iface.clone());
            if cfg.filters_by_destination() {
                args.push("-f".to_string());
                args.push(format!("ether dst {dst_mac}"));
            }
            args.extend(strings(["-T", "fields", "-E", "separator=,", "-E", "quote=d"]));
            for field in TSHARK_FIELDS {
                args.push("-e".to_string());
                args.push(field.to_string());
            }
            args
        }
        CaptureMode::Tcpdump => {
            let mut args = strings(["-l", "-n", "-e", "-tt", "-i"]);
            args.push(cfg.egress_iface.clone());
            if cfg.filters_by_destination() {
                args.extend(["ether".to_string(), "dst".to_string(), dst_mac]);
            }
            args
        }
        CaptureMode::None => return None,
    };
    let (program, args) = wrap(opts, None, Path::new(binary), args);
    Some(LaunchSpec {
        name: binary.to_string(),
        role: ProcessRole::Capture,
        program,
        args,
        pipe_stdout: true,
    })
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Deletes the previous run's output files so the sampler never reads
/// stale rows. Creates the output directories as needed.
pub fn clear_previous_outputs(paths: &RigPaths) -> io::Result<()> {
    if let Some(parent) = paths.rx_csv.parent() {
        fs::create_dir_all(parent)?;
    }
    remove_if_present(&paths.rx_csv)?;
    fs::create_dir_all(&paths.tx_stats_dir)?;
    for tc in 0..TC_COUNT {
        remove_if_present(&paths.tx_stats_path(tc))?;
        remove_if_present(&paths.tx_stats_alt_path(tc))?;
    }
    Ok(())
}
