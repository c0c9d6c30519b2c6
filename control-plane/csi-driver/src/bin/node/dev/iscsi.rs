use super::{Attach, Connector, DeviceError, DeviceName};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::process::Command;
use tracing::{debug, info, warn};

const ISCSIADM: &str = "iscsiadm";

/// iscsiadm exit status when a session for the node already exists.
const ISCSI_ERR_SESS_EXISTS: i32 = 15;
/// iscsiadm exit status when no matching records or sessions are found.
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

/// Attacher driving the open-iscsi initiator through `iscsiadm`.
#[derive(Debug, Clone)]
pub(crate) struct IscsiAdm {
    /// Delay between checks for the device to show up.
    device_wait: Duration,
    /// Number of rechecks before giving up on the device.
    device_retries: u32,
}

impl Default for IscsiAdm {
    fn default() -> Self {
        Self {
            device_wait: Duration::from_secs(1),
            device_retries: 10,
        }
    }
}

impl IscsiAdm {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output, DeviceError> {
        debug!("{} {}", ISCSIADM, args.join(" "));
        let output = Command::new(ISCSIADM).args(args).output().await?;
        Ok(output)
    }

    async fn run_checked(&self, args: &[&str], tolerated: &[i32]) -> Result<(), DeviceError> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(());
        }
        match output.status.code() {
            Some(code) if tolerated.contains(&code) => {
                debug!(code, "{} {} tolerated", ISCSIADM, args.join(" "));
                Ok(())
            }
            code => Err(DeviceError::from(format!(
                "{} {} failed ({:?}): {}",
                ISCSIADM,
                args.join(" "),
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    async fn login(&self, connector: &Connector, portal: &str) -> Result<DeviceName, DeviceError> {
        let iface = connector.interface.as_str();
        if connector.do_discovery {
            self.run_checked(
                &["-m", "discovery", "-t", "sendtargets", "-p", portal, "-I", iface],
                &[],
            )
            .await?;
        }
        self.run_checked(
            &[
                "-m",
                "node",
                "-T",
                connector.target_iqn.as_str(),
                "-p",
                portal,
                "-I",
                iface,
                "--login",
            ],
            &[ISCSI_ERR_SESS_EXISTS],
        )
        .await?;

        let path = device_path(portal, &connector.target_iqn, connector.lun);
        self.wait_for_device(&path).await
    }

    /// Wait for the device link to show up, and resolve it to the device node.
    async fn wait_for_device(&self, path: &Path) -> Result<DeviceName, DeviceError> {
        for _ in 0..=self.device_retries {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                let device = tokio::fs::canonicalize(path).await?;
                return Ok(device.to_string_lossy().into_owned());
            }
            tokio::time::sleep(self.device_wait).await;
        }
        Err(DeviceError::from(format!(
            "device attach timeout, {} did not show up",
            path.display()
        )))
    }
}

/// The udev by-path link of the iSCSI logical unit.
fn device_path(portal: &str, iqn: &str, lun: u32) -> PathBuf {
    PathBuf::from(format!("/dev/disk/by-path/ip-{portal}-iscsi-{iqn}-lun-{lun}"))
}

#[tonic::async_trait]
impl Attach for IscsiAdm {
    async fn connect(&self, connector: &Connector) -> Result<DeviceName, DeviceError> {
        let mut errors = Vec::with_capacity(connector.target_portals.len());
        for portal in &connector.target_portals {
            match self.login(connector, portal).await {
                Ok(device) => {
                    info!(
                        volume.id = connector.volume_name,
                        portal, device, "Attached iSCSI disk"
                    );
                    return Ok(device);
                }
                Err(error) => {
                    warn!(volume.id = connector.volume_name, portal, %error, "Failed to attach");
                    errors.push(error.to_string());
                }
            }
        }
        Err(DeviceError::from(format!(
            "failed to connect to {} on portals {:?}: {}",
            connector.target_iqn,
            connector.target_portals,
            errors.join("; ")
        )))
    }

    async fn disconnect(&self, iqn: &str, portals: &[String]) -> Result<(), DeviceError> {
        for portal in portals {
            self.run_checked(
                &["-m", "node", "-T", iqn, "-p", portal, "--logout"],
                &[ISCSI_ERR_NO_OBJS_FOUND],
            )
            .await?;
            self.run_checked(
                &["-m", "node", "-T", iqn, "-p", portal, "-o", "delete"],
                &[ISCSI_ERR_NO_OBJS_FOUND],
            )
            .await?;
            info!(iqn, portal, "Detached iSCSI disk");
        }
        Ok(())
    }
}
