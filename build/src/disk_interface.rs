use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Mtime lookups go through this seam so the staleness oracle can be
/// exercised in tests without touching the filesystem.
pub trait DiskInterface {
    fn modified(&self, path: &Path) -> io::Result<SystemTime>;
}

pub struct SystemDiskInterface;

impl DiskInterface for SystemDiskInterface {
    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        std::fs::metadata(path)?.modified()
    }
}
