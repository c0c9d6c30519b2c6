//! Various common constants used by the jiva node plugin.

/// The product name.
pub const PRODUCT_NAME: &str = "jiva";

/// The domain name under which the product's resources live.
pub const PRODUCT_DOMAIN_NAME: &str = "openebs.io";

/// The name of the CSI plugin, as registered with the container orchestrator.
pub fn csi_plugin_name() -> String {
    format!("{PRODUCT_NAME}.csi.{PRODUCT_DOMAIN_NAME}")
}

/// The namespace where the volume custom resources live, unless overridden.
pub const DEFAULT_NAMESPACE: &str = "openebs";

/// The default CSI gRPC listen socket.
pub const CSI_SOCKET: &str = "/var/tmp/csi.sock";

/// The filesystem used when a volume capability does not specify one.
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// How many times a not-yet-usable volume is re-checked before giving up.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// The delay between volume readiness checks.
pub const VOLUME_READY_INTERVAL: &str = "5s";

/// The delay between iSCSI portal reachability probes.
pub const PORTAL_REACHABLE_INTERVAL: &str = "2s";

/// The timeout of a single iSCSI portal reachability probe.
pub const PORTAL_DIAL_TIMEOUT: &str = "1s";

/// The default iSCSI port, used when a portal does not carry one.
pub const ISCSI_DEFAULT_PORT: u16 = 3260;

/// Kubernetes object names are limited to this many characters.
pub const K8S_NAME_MAX_LEN: usize = 63;

/// Default env filter, used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info";
