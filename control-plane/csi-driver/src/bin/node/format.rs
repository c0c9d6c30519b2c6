//! Utility function for formatting a device with filesystem
use crate::filesystem_ops::FileSystem;

use tracing::debug;

/// Create the filesystem on the device unless it already carries one.
pub(crate) async fn prepare_device(fstype: &FileSystem, device: &str) -> Result<(), String> {
    let fs_ops = fstype.fs_ops()?;

    debug!("Probing device {}", device);
    if let Some(fs) = FileSystem::probe(device).await? {
        debug!("Found existing filesystem ({}) on device {}", fs, device);
        return Ok(());
    }
    debug!("Creating new filesystem ({}) on device {}", fstype, device);
    fs_ops.create(device).await
}
