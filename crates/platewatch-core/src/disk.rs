//! Filesystem capacity probing.
//!
//! Retention decisions read disk usage through [`DiskProbe`] so tests can
//! script a sequence of free-space readings. Production uses [`FsDiskProbe`]
//! (statvfs via `fs2`).

use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::plate::{Tier, TierRoots};

/// Capacity of the filesystem hosting a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    #[must_use]
    pub const fn new(total_bytes: u64, available_bytes: u64) -> Self {
        Self {
            total_bytes,
            available_bytes,
        }
    }

    #[must_use]
    pub const fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Available over total, in `[0, 1]`. An empty filesystem reports 1.0.
    #[must_use]
    pub fn free_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.available_bytes as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
    }
}

/// Source of disk-usage readings.
pub trait DiskProbe: Send + Sync {
    /// Read usage of the filesystem hosting `path`. Never cached.
    fn usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// statvfs-backed probe.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDiskProbe;

impl DiskProbe for FsDiskProbe {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
        Ok(DiskUsage {
            total_bytes: fs2::total_space(path)?,
            available_bytes: fs2::available_space(path)?,
        })
    }
}

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Log usage of each tier root at info level.
pub fn log_disk_usage(probe: &dyn DiskProbe, roots: &TierRoots) {
    for tier in Tier::ALL {
        let root = roots.root(tier);
        match probe.usage(root) {
            Ok(usage) => info!(
                tier = %tier,
                path = %root.display(),
                total_gib = %format!("{:.1}", usage.total_bytes as f64 / GIB),
                used_gib = %format!("{:.1}", usage.used_bytes() as f64 / GIB),
                free_fraction = %format!("{:.3}", usage.free_fraction()),
                "Disk usage"
            ),
            Err(err) => warn!(
                tier = %tier,
                path = %root.display(),
                error = %err,
                "Failed to read disk usage"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_fraction_bounds() {
        assert!((DiskUsage::new(100, 25).free_fraction() - 0.25).abs() < f64::EPSILON);
        assert!((DiskUsage::new(0, 0).free_fraction() - 1.0).abs() < f64::EPSILON);
        assert!((DiskUsage::new(10, 20).free_fraction() - 1.0).abs() < f64::EPSILON);
        assert_eq!(DiskUsage::new(10, 20).used_bytes(), 0);
        assert_eq!(DiskUsage::new(100, 25).used_bytes(), 75);
    }

    #[test]
    fn fs_probe_reads_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let usage = FsDiskProbe.usage(dir.path()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.available_bytes <= usage.total_bytes);
    }

    #[test]
    fn fs_probe_missing_path_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FsDiskProbe.usage(&dir.path().join("missing")).is_err());
    }
}
