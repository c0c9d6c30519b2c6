//! This module consists of the filesystem specific operations: probing a device for an existing
//! filesystem, creating a new filesystem and the default mount options of each filesystem.

use csi_driver::filesystem::FileSystem as Fs;
use std::process::Output;
use tokio::process::Command;
use tonic::async_trait;
use tracing::{debug, trace};

/// `nouuid` mount flag, to allow duplicate fs uuid.
const XFS_NO_UUID_FLAG: &str = "nouuid";

/// Error type filesystem operations.
type Error = String;

/// The ext family of filesystems, created with their `mkfs.<fs>` utility.
pub(crate) struct ExtFs {
    binary: &'static str,
}
/// XFS filesystem type.
pub(crate) struct XFs;

/// Filesystem type for csi node ops, wrapper over the parent Filesystem enum.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct FileSystem(Fs);

impl From<Fs> for FileSystem {
    fn from(value: Fs) -> Self {
        Self(value)
    }
}

impl AsRef<str> for FileSystem {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.as_ref())
    }
}

impl FileSystem {
    /// Convert the top level enumeration to specific filesystem types to access the supported
    /// operations by them.
    pub(crate) fn fs_ops(&self) -> Result<&dyn FileSystemOps, Error> {
        static EXT2FS: ExtFs = ExtFs {
            binary: "mkfs.ext2",
        };
        static EXT3FS: ExtFs = ExtFs {
            binary: "mkfs.ext3",
        };
        static EXT4FS: ExtFs = ExtFs {
            binary: "mkfs.ext4",
        };
        static XFS: XFs = XFs {};
        match self.0 {
            Fs::Ext2 => Ok(&EXT2FS),
            Fs::Ext3 => Ok(&EXT3FS),
            Fs::Ext4 => Ok(&EXT4FS),
            Fs::Xfs => Ok(&XFS),
            Fs::Unsupported(_) => Err(format!("Unsupported filesystem {self}")),
        }
    }
    /// Probe the device for the type of its filesystem, if it has one.
    pub(crate) async fn probe(device: &str) -> Result<Option<String>, Error> {
        let binary = "blkid";
        let output = Command::new(binary)
            .args(["-o", "value", "-s", "TYPE"])
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        // blkid exits with 2 when the requested token is not found on the device
        if output.status.code() == Some(2) {
            return Ok(None);
        }
        let stdout = ack_command_output(output, binary)?;
        let fs_type = stdout.trim();
        Ok((!fs_type.is_empty()).then(|| fs_type.to_string()))
    }
}

#[async_trait]
pub(crate) trait FileSystemOps: Send + Sync {
    /// Create the filesystem using its fs util.
    async fn create(&self, device: &str) -> Result<(), Error>;
    /// Get the default mount options along with the user passed options for specific filesystems.
    fn mount_flags(&self, mount_flags: Vec<String>) -> Vec<String>;
}

#[async_trait]
impl FileSystemOps for ExtFs {
    async fn create(&self, device: &str) -> Result<(), Error> {
        let binary = self.binary;
        let output = Command::new(binary)
            .arg("-F")
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }

    fn mount_flags(&self, mount_flags: Vec<String>) -> Vec<String> {
        mount_flags
    }
}

#[async_trait]
impl FileSystemOps for XFs {
    async fn create(&self, device: &str) -> Result<(), Error> {
        let binary = "mkfs.xfs";
        let args = match std::env::var("MKFS_XFS_ARGS") {
            Ok(args) => args
                .split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>(),
            _ => vec![],
        };
        let output = Command::new(binary)
            .args(args)
            .arg(device)
            .output()
            .await
            .map_err(|error| format!("failed to execute {binary}: {error}"))?;
        ack_command_output(output, binary).map(|_| ())
    }

    fn mount_flags(&self, mount_flags: Vec<String>) -> Vec<String> {
        let mut mount_flags = mount_flags;
        if !mount_flags.contains(&XFS_NO_UUID_FLAG.to_string()) {
            mount_flags.push(XFS_NO_UUID_FLAG.to_string())
        }
        mount_flags
    }
}

/// Check the command output and return its stdout on success.
fn ack_command_output(output: Output, binary: &str) -> Result<String, Error> {
    trace!(
        "Output from {} command: {}, status code: {:?}",
        binary,
        String::from_utf8_lossy(&output.stdout),
        output.status.code()
    );

    if output.status.success() {
        debug!("{} command succeeded", binary);
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    Err(format!(
        "{} command failed: {}",
        binary,
        String::from_utf8_lossy(&output.stderr)
    ))
}
