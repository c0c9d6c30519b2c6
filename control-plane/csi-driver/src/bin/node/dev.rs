//! Definition of the trait required for attaching and detaching the iSCSI disk of a volume.
//!
//! Attaching a device is performed as follows:
//! ```ignore
//!     let connector = Connector::from(&volume);
//!     let device_path = attacher.connect(&connector).await?;
//! ```
//!
//! Detaching is keyed by the target only, as the device may already be gone:
//! ```ignore
//!     attacher.disconnect(volume.iqn(), &[volume.target_portal()]).await?;
//! ```

use csi_driver::volume::JivaVolume;
use kube::ResourceExt;

mod iscsi;

pub(crate) use crate::error::DeviceError;
pub(crate) use iscsi::IscsiAdm;

pub(crate) type DeviceName = String;

/// The logical unit exposed by the jiva target.
const DEFAULT_LUN: u32 = 0;
/// The iscsiadm interface used for the sessions.
const DEFAULT_INTERFACE: &str = "default";

/// Everything needed to connect to the iSCSI target of a volume.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct Connector {
    pub(crate) volume_name: String,
    pub(crate) target_iqn: String,
    pub(crate) lun: u32,
    pub(crate) interface: String,
    pub(crate) target_portals: Vec<String>,
    pub(crate) do_discovery: bool,
}

impl From<&JivaVolume> for Connector {
    fn from(volume: &JivaVolume) -> Self {
        Self {
            volume_name: volume.name_any(),
            target_iqn: volume.iqn().to_string(),
            lun: DEFAULT_LUN,
            interface: DEFAULT_INTERFACE.to_string(),
            target_portals: vec![volume.target_portal()],
            do_discovery: true,
        }
    }
}

#[tonic::async_trait]
pub(crate) trait Attach: Sync + Send {
    /// Log into the target and return the path of the block device which shows up.
    async fn connect(&self, connector: &Connector) -> Result<DeviceName, DeviceError>;
    /// Log out of the target on all the given portals.
    async fn disconnect(&self, iqn: &str, portals: &[String]) -> Result<(), DeviceError>;
}
