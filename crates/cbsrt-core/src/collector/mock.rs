//! In-memory filesystem for exercising the sampler without a rig.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use crate::collector::traits::FileSystem;
use crate::model::IfaceStats;

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    files: HashMap<PathBuf, String>,
}

impl MockFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a file with the given content.
    pub fn add_file(&mut self, path: impl AsRef<Path>, content: impl Into<String>) {
        self.files.insert(path.as_ref().to_path_buf(), content.into());
    }

    /// Adds the `/sys/class/net/<iface>` entries for one interface.
    pub fn add_iface(&mut self, iface: &str, mac: &str, stats: &IfaceStats) {
        let base = PathBuf::from(super::iface::SYS_CLASS_NET).join(iface);
        self.add_file(base.join("address"), format!("{mac}\n"));
        let stat = base.join("statistics");
        for (name, value) in [
            ("rx_packets", stats.rx_packets),
            ("rx_bytes", stats.rx_bytes),
            ("rx_dropped", stats.rx_dropped),
            ("rx_errors", stats.rx_errors),
            ("tx_packets", stats.tx_packets),
            ("tx_bytes", stats.tx_bytes),
            ("tx_dropped", stats.tx_dropped),
            ("tx_errors", stats.tx_errors),
        ] {
            self.add_file(stat.join(name), format!("{value}\n"));
        }
    }
}

impl FileSystem for MockFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.files.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )
        })
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_fs_add_file() {
        let mut fs = MockFs::new();
        fs.add_file("/results/cbs_rx.csv", "time_s\n1.0\n");
        assert!(fs.exists(Path::new("/results/cbs_rx.csv")));
        assert_eq!(
            fs.read_to_string(Path::new("/results/cbs_rx.csv")).unwrap(),
            "time_s\n1.0\n"
        );
    }

    #[test]
    fn test_mock_fs_add_iface() {
        let mut fs = MockFs::new();
        let stats = IfaceStats {
            rx_packets: 42,
            ..Default::default()
        };
        fs.add_iface("eth1", "AA:BB:CC:DD:EE:FF", &stats);
        let rx = fs
            .read_to_string(Path::new("/sys/class/net/eth1/statistics/rx_packets"))
            .unwrap();
        assert_eq!(rx.trim(), "42");
    }

    #[test]
    fn test_mock_fs_not_found() {
        let fs = MockFs::new();
        let err = fs.read_to_string(Path::new("/missing")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!fs.exists(Path::new("/missing")));
    }
}
