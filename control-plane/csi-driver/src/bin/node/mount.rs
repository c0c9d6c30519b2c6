//! Utility functions for mounting and unmounting filesystems, and for inspecting the mount table.
use crate::{filesystem_ops::FileSystem, format::prepare_device};
use csi_driver::csi::{volume_usage::Unit, VolumeUsage};
use nix::sys::statfs;
use snafu::{ResultExt, Snafu};
use std::{
    collections::BTreeSet,
    io::ErrorKind,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};
use sys_mount::{unmount, Mount, MountFlags, UnmountFlags};
use tracing::{debug, info};

/// The kernel's view of the mounts of this process.
const MOUNT_TABLE: &str = "/proc/self/mounts";

/// Mount error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum MountError {
    #[snafu(display("Failed to read the mount table {}: {}", table, source))]
    ListMounts {
        table: String,
        source: std::io::Error,
    },
    #[snafu(display(
        "Volume {} is already mounted at more than one place: {:?}",
        volume_id,
        paths
    ))]
    MultiMount {
        volume_id: String,
        paths: BTreeSet<String>,
    },
    #[snafu(display("Failed to format {} with {}: {}", device, fs, reason))]
    Format {
        device: String,
        fs: String,
        reason: String,
    },
    #[snafu(display("Failed to mount {} onto {}: {}", device, target, source))]
    MountFailed {
        device: String,
        target: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to unmount {}: {}", target, source))]
    UnmountFailed {
        target: String,
        source: std::io::Error,
    },
    #[snafu(display("Failed to get the filesystem usage of {}: {}", path, source))]
    Usage {
        path: String,
        source: nix::errno::Errno,
    },
}

impl From<MountError> for tonic::Status {
    fn from(error: MountError) -> Self {
        match error {
            MountError::MultiMount { .. } => tonic::Status::failed_precondition(error.to_string()),
            _ => tonic::Status::internal(error.to_string()),
        }
    }
}

/// A single entry of the mount table.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct MountEntry {
    /// The mounted device, or the source of a bind mount.
    pub(crate) source: String,
    /// Where the source is mounted.
    pub(crate) path: String,
    pub(crate) fs_type: String,
    pub(crate) options: Vec<String>,
}

/// Parse the contents of a mount table, in the `/proc/mounts` format.
pub(crate) fn parse_mounts(table: &str) -> Vec<MountEntry> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let path = fields.next()?;
            let fs_type = fields.next()?;
            let options = fields.next().unwrap_or_default();
            Some(MountEntry {
                source: unescape(source),
                path: unescape(path),
                fs_type: fs_type.to_string(),
                options: options.split(',').map(ToString::to_string).collect(),
            })
        })
        .collect()
}

/// Decode the octal escapes (eg: `\040` for a space) used in the mount table.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        let octal = bytes.get(index + 1..index + 4).filter(|digits| {
            bytes[index] == b'\\' && digits.iter().all(|digit| (b'0'..=b'7').contains(digit))
        });
        match octal.and_then(|digits| {
            u8::from_str_radix(std::str::from_utf8(digits).ok()?, 8).ok()
        }) {
            Some(byte) => {
                decoded.push(byte);
                index += 4;
            }
            None => {
                decoded.push(bytes[index]);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Find the device mounted at the given path, and the number of mount entries referencing it.
/// A path which is not mounted has no device and zero references.
pub(crate) fn device_references(mounts: &[MountEntry], path: &str) -> (Option<String>, usize) {
    let path = path.trim_end_matches('/');
    let Some(entry) = mounts
        .iter()
        .rev()
        .find(|entry| entry.path.trim_end_matches('/') == path)
    else {
        return (None, 0);
    };
    let references = mounts
        .iter()
        .filter(|other| other.source == entry.source)
        .count();
    (Some(entry.source.clone()), references)
}

/// Check that the volume is not mounted at unrelated places.
/// A volume mounted at more than one path which contains its id is only accepted when the
/// requested path is one of them.
pub(crate) fn check_multi_mount(
    mounts: &[MountEntry],
    volume_id: &str,
    path: &str,
) -> Result<(), MountError> {
    let paths = mounts
        .iter()
        .filter(|entry| entry.path.contains(volume_id))
        .map(|entry| entry.path.clone())
        .collect::<BTreeSet<_>>();

    if paths.len() > 1 && !paths.contains(path) {
        return Err(MountError::MultiMount {
            volume_id: volume_id.to_string(),
            paths,
        });
    }
    Ok(())
}

/// Mount options split into the kernel mount flags and the filesystem specific data.
pub(crate) struct MountOptions {
    pub(crate) flags: MountFlags,
    pub(crate) data: Vec<String>,
}

impl MountOptions {
    /// Parse the mount options, as would be given to `mount -o`.
    pub(crate) fn parse(options: &[String]) -> Self {
        let mut parsed = Self {
            flags: MountFlags::empty(),
            data: vec![],
        };
        for option in options.iter().map(|option| option.trim()) {
            match option {
                "" | "defaults" | "rw" | "async" => {}
                "ro" => parsed.flags |= MountFlags::RDONLY,
                "bind" => parsed.flags |= MountFlags::BIND,
                "rbind" => parsed.flags |= MountFlags::BIND | MountFlags::REC,
                "remount" => parsed.flags |= MountFlags::REMOUNT,
                "nosuid" => parsed.flags |= MountFlags::NOSUID,
                "nodev" => parsed.flags |= MountFlags::NODEV,
                "noexec" => parsed.flags |= MountFlags::NOEXEC,
                "noatime" => parsed.flags |= MountFlags::NOATIME,
                "nodiratime" => parsed.flags |= MountFlags::NODIRATIME,
                "relatime" => parsed.flags |= MountFlags::RELATIME,
                "dirsync" => parsed.flags |= MountFlags::DIRSYNC,
                "sync" => parsed.flags |= MountFlags::SYNCHRONOUS,
                data => parsed.data.push(data.to_string()),
            }
        }
        parsed
    }
    /// The filesystem data, as a comma separated list.
    pub(crate) fn data(&self) -> String {
        self.data.join(",")
    }
    /// A bind mount ignores every flag but `MS_REC`, the others must be applied by a remount.
    fn needs_remount(&self) -> bool {
        self.flags.contains(MountFlags::BIND)
            && !self.flags.contains(MountFlags::REMOUNT)
            && !self
                .flags
                .difference(MountFlags::BIND | MountFlags::REC)
                .is_empty()
    }
    /// Flags of the remount which completes a bind mount.
    fn remount_flags(&self) -> MountFlags {
        self.flags.difference(MountFlags::REC) | MountFlags::REMOUNT
    }
}

/// Filesystem usage of a mounted volume.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub(crate) struct FsUsage {
    pub(crate) bytes_total: i64,
    pub(crate) bytes_available: i64,
    pub(crate) bytes_used: i64,
    pub(crate) inodes_total: i64,
    pub(crate) inodes_available: i64,
    pub(crate) inodes_used: i64,
}

impl From<FsUsage> for Vec<VolumeUsage> {
    fn from(usage: FsUsage) -> Self {
        vec![
            VolumeUsage {
                total: usage.bytes_total,
                unit: Unit::Bytes as i32,
                available: usage.bytes_available,
                used: usage.bytes_used,
            },
            VolumeUsage {
                total: usage.inodes_total,
                unit: Unit::Inodes as i32,
                available: usage.inodes_available,
                used: usage.inodes_used,
            },
        ]
    }
}

/// Mount table queries and mount operations.
#[tonic::async_trait]
pub(crate) trait Mounter: Send + Sync {
    /// List the current mounts.
    async fn list(&self) -> Result<Vec<MountEntry>, MountError>;
    /// Whether the path is a mount point.
    /// A path which does not exist fails with `ErrorKind::NotFound`.
    async fn is_mount_point(&self, path: &str) -> std::io::Result<bool>;
    /// Create the filesystem on the device if it has none, and mount it onto the target.
    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs: &FileSystem,
        options: &[String],
    ) -> Result<(), MountError>;
    /// Mount the source onto the target.
    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs: &FileSystem,
        options: &[String],
    ) -> Result<(), MountError>;
    /// Unmount the target.
    async fn unmount(&self, target: &str) -> Result<(), MountError>;
    /// Filesystem usage of the mounted path.
    async fn usage(&self, path: &str) -> Result<FsUsage, MountError>;
}

/// Mounter driving the mount syscalls of this host.
#[derive(Debug, Clone, Default)]
pub(crate) struct SysMounter {}

impl SysMounter {
    fn mount_with(
        &self,
        source: &str,
        target: &str,
        fs: &FileSystem,
        options: &MountOptions,
    ) -> std::io::Result<()> {
        let data = options.data();
        Mount::builder()
            .fstype(fs.as_ref())
            .flags(options.flags)
            .data(&data)
            .mount(source, target)?;

        if options.needs_remount() {
            debug!(target, flags = options.flags.bits(), "Remounting bind mount");
            if let Err(error) = Mount::builder()
                .flags(options.remount_flags())
                .mount("none", target)
            {
                let _ = unmount(target, UnmountFlags::empty());
                return Err(error);
            }
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Mounter for SysMounter {
    async fn list(&self) -> Result<Vec<MountEntry>, MountError> {
        let table = tokio::fs::read_to_string(MOUNT_TABLE)
            .await
            .context(ListMounts { table: MOUNT_TABLE })?;
        Ok(parse_mounts(&table))
    }

    async fn is_mount_point(&self, path: &str) -> std::io::Result<bool> {
        let path_buf = PathBuf::from(path);
        let metadata = tokio::fs::metadata(&path_buf).await?;
        if let Some(parent) = path_buf.parent() {
            match tokio::fs::metadata(parent).await {
                Ok(parent) if parent.dev() != metadata.dev() => return Ok(true),
                Ok(_) => {}
                Err(error) if error.kind() == ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
        // bind mounts from the same device are only visible in the mount table
        let table = tokio::fs::read_to_string(MOUNT_TABLE).await?;
        let path = Path::new(path);
        Ok(parse_mounts(&table)
            .iter()
            .any(|entry| Path::new(&entry.path) == path))
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs: &FileSystem,
        options: &[String],
    ) -> Result<(), MountError> {
        prepare_device(fs, device)
            .await
            .map_err(|reason| MountError::Format {
                device: device.to_string(),
                fs: fs.to_string(),
                reason,
            })?;
        self.mount(device, target, fs, options).await
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs: &FileSystem,
        options: &[String],
    ) -> Result<(), MountError> {
        let options = match fs.fs_ops() {
            Ok(ops) => ops.mount_flags(options.to_vec()),
            Err(_) => options.to_vec(),
        };
        let parsed = MountOptions::parse(&options);
        debug!(source, target, %fs, ?options, "Mounting");

        self.mount_with(source, target, fs, &parsed)
            .context(MountFailed {
                device: source,
                target,
            })?;

        info!(source, target, %fs, "Mounted");
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), MountError> {
        unmount(target, UnmountFlags::empty()).context(UnmountFailed { target })?;
        info!(target, "Unmounted");
        Ok(())
    }

    async fn usage(&self, path: &str) -> Result<FsUsage, MountError> {
        let info = statfs::statfs(path).context(Usage { path })?;
        let block_size = info.block_size() as i64;
        Ok(FsUsage {
            bytes_total: info.blocks() as i64 * block_size,
            bytes_available: info.blocks_available() as i64 * block_size,
            bytes_used: (info.blocks() - info.blocks_free()) as i64 * block_size,
            inodes_total: info.files() as i64,
            inodes_available: info.files_free() as i64,
            inodes_used: (info.files() - info.files_free()) as i64,
        })
    }
}
