//! Disk space reservations
//!
//! Replication transfers can be hundreds of gigabytes, and several run at
//! once. Before a copy starts, the worker reserves the bag's size against
//! the staging volume; the reservation is released when the staged file is
//! stored or deleted. Free space comes from statvfs, minus whatever other
//! transfers have already claimed.

use anyhow::{anyhow, Context, Result};
use nix::sys::statvfs::statvfs;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Tracks reservations against one mounted volume.
pub struct Volume {
    path: PathBuf,
    reservations: HashMap<PathBuf, u64>,
}

impl Volume {
    /// `path` must exist; it anchors the statvfs lookup.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(anyhow!("Volume path {} does not exist", path.display()));
        }
        Ok(Self {
            path,
            reservations: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes currently promised to pending transfers.
    pub fn claimed_space(&self) -> u64 {
        self.reservations.values().sum()
    }

    /// Free bytes on the volume after subtracting outstanding reservations.
    pub fn available_space(&self) -> Result<u64> {
        let stats = statvfs(&self.path)
            .with_context(|| format!("statvfs failed for {}", self.path.display()))?;
        let free = (stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64);
        Ok(free.saturating_sub(self.claimed_space()))
    }

    /// Reserve `bytes` for the file that will land at `file_path`. Fails
    /// when the volume cannot hold it on top of existing reservations.
    pub fn reserve(&mut self, file_path: impl Into<PathBuf>, bytes: u64) -> Result<()> {
        let available = self.available_space()?;
        if bytes > available {
            return Err(anyhow!(
                "Cannot reserve {} bytes on {}: only {} available",
                bytes,
                self.path.display(),
                available
            ));
        }
        let file_path = file_path.into();
        debug!(path = %file_path.display(), bytes, "reserved space");
        self.reservations.insert(file_path, bytes);
        Ok(())
    }

    /// Release the reservation for `file_path`. Releasing something that
    /// was never reserved is a no-op.
    pub fn release(&mut self, file_path: impl AsRef<Path>) {
        self.reservations.remove(file_path.as_ref());
    }

    /// Snapshot of current reservations.
    pub fn reservations(&self) -> HashMap<PathBuf, u64> {
        self.reservations.clone()
    }
}

/// Shared handle to a volume; clones refer to the same reservation map.
#[derive(Clone)]
pub struct VolumeService {
    volume: Arc<Mutex<Volume>>,
}

impl VolumeService {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            volume: Arc::new(Mutex::new(Volume::new(path)?)),
        })
    }

    pub fn reserve(&self, file_path: impl Into<PathBuf>, bytes: u64) -> Result<()> {
        self.volume
            .lock()
            .map_err(|_| anyhow!("volume lock poisoned"))?
            .reserve(file_path, bytes)
    }

    pub fn release(&self, file_path: impl AsRef<Path>) -> Result<()> {
        self.volume
            .lock()
            .map_err(|_| anyhow!("volume lock poisoned"))?
            .release(file_path);
        Ok(())
    }

    pub fn available_space(&self) -> Result<u64> {
        self.volume
            .lock()
            .map_err(|_| anyhow!("volume lock poisoned"))?
            .available_space()
    }

    pub fn claimed_space(&self) -> Result<u64> {
        Ok(self
            .volume
            .lock()
            .map_err(|_| anyhow!("volume lock poisoned"))?
            .claimed_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_volume() -> Volume {
        Volume::new(std::env::temp_dir()).unwrap()
    }

    #[test]
    fn test_missing_path_rejected() {
        assert!(Volume::new("/no/such/volume/path").is_err());
    }

    #[test]
    fn test_reserve_and_release() {
        let mut volume = test_volume();
        assert_eq!(volume.claimed_space(), 0);

        volume.reserve("/path/to/file_0", 1000).unwrap();
        assert_eq!(volume.claimed_space(), 1000);

        volume.release("/this/file/was/never/reserved");
        assert_eq!(volume.claimed_space(), 1000);

        volume.release("/path/to/file_0");
        assert_eq!(volume.claimed_space(), 0);
    }

    #[test]
    fn test_reservations_track_available_space() {
        let mut volume = test_volume();
        let initial = volume.available_space().unwrap();
        let chunk = initial / 3;

        volume.reserve("/path/to/file_1", chunk).unwrap();
        volume.reserve("/path/to/file_2", chunk).unwrap();

        let available = volume.available_space().unwrap();
        // Other processes may eat a little disk between calls; the bound
        // only needs to reflect both reservations.
        assert!(available <= initial - 2 * chunk);

        // A request bigger than what's left is rejected.
        assert!(volume.reserve("/path/to/file_3", chunk * 2).is_err());

        volume.release("/path/to/file_1");
        volume.release("/path/to/file_2");
        volume.reserve("/path/to/file_4", chunk * 2).unwrap();
    }

    #[test]
    fn test_reservation_snapshot() {
        let mut volume = test_volume();
        let paths = ["p1", "p2", "p3", "p4", "p5"];
        for (i, path) in paths.iter().enumerate() {
            volume.reserve(path, 1000 + i as u64).unwrap();
        }
        let reservations = volume.reservations();
        assert_eq!(reservations.len(), paths.len());
        for (i, path) in paths.iter().enumerate() {
            assert_eq!(reservations[&PathBuf::from(path)], 1000 + i as u64);
            volume.release(path);
        }
        assert!(volume.reservations().is_empty());
    }

    #[test]
    fn test_shared_handle() {
        let service = VolumeService::new(std::env::temp_dir()).unwrap();
        let clone = service.clone();
        service.reserve("/shared/file", 500).unwrap();
        assert_eq!(clone.claimed_space().unwrap(), 500);
        clone.release("/shared/file").unwrap();
        assert_eq!(service.claimed_space().unwrap(), 0);
    }
}
