//! This module consists of the filesystem type definition used when staging and publishing.
use strum_macros::EnumString;

/// A type to enumerate used filesystems.
#[derive(EnumString, Clone, Debug, Eq, PartialEq)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FileSystem {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    #[strum(default)]
    Unsupported(String),
}

impl FileSystem {
    /// Resolve the filesystem requested by a volume capability, falling back to `default`
    /// when none was requested.
    pub fn resolve(fs_type: &str, default: &FileSystem) -> FileSystem {
        match fs_type.trim() {
            "" => default.clone(),
            fs_type => fs_type.parse().unwrap_or_else(|_| Self::Unsupported(fs_type.into())),
        }
    }
    /// Whether volumes can be formatted and mounted with this filesystem.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

// Implement as ref for the FileSystem.
impl AsRef<str> for FileSystem {
    fn as_ref(&self) -> &str {
        match self {
            FileSystem::Ext2 => "ext2",
            FileSystem::Ext3 => "ext3",
            FileSystem::Ext4 => "ext4",
            FileSystem::Xfs => "xfs",
            FileSystem::Unsupported(inner) => inner,
        }
    }
}

// Implement Display for the filesystem
impl std::fmt::Display for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
