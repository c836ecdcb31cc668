//! Packet-capture tool selection and the line ring fed by its output.
//!
//! The capture process is optional. Its stdout is carried through to
//! observers verbatim; nothing here parses it.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::collector::FileSystem;
use crate::config::CAPTURE_LINES_MAX;

/// Which capture tool a run uses. Fixed for the duration of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Tshark,
    Tcpdump,
    #[default]
    None,
}

impl CaptureMode {
    pub fn binary(self) -> Option<&'static str> {
        match self {
            CaptureMode::Tshark => Some("tshark"),
            CaptureMode::Tcpdump => Some("tcpdump"),
            CaptureMode::None => None,
        }
    }
}

/// Looks `name` up in a `PATH`-style list of directories.
pub fn find_in_path<F: FileSystem>(fs: &F, name: &str, path_var: &str) -> Option<PathBuf> {
    path_var
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| fs.exists(candidate))
}

/// Prefers tshark, falls back to tcpdump, else runs without capture.
pub fn select_capture_tool<F: FileSystem>(fs: &F, path_var: &str) -> CaptureMode {
    [CaptureMode::Tshark, CaptureMode::Tcpdump]
        .into_iter()
        .find(|mode| {
            mode.binary()
                .is_some_and(|bin| find_in_path(fs, bin, path_var).is_some())
        })
        .unwrap_or(CaptureMode::None)
}

/// Bounded ring of the most recent capture lines.
///
/// Cloning shares the ring. Written by the capture reader, snapshotted
/// whenever a metrics record is assembled.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for CaptureBuffer {
    fn default() -> Self {
        Self::new(CAPTURE_LINES_MAX)
    }
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Appends one line (trimmed); blank lines are dropped.
    pub fn push(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
