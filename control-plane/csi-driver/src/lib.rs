/// The CSI plugin's name.
pub use utils::csi_plugin_name;

/// The csi driver components.
pub use rpc::csi;

/// Filesystem types.
pub mod filesystem;
/// Volume concurrency limiter.
pub mod limiter;
/// Contains tools to advertise the same set of capabilities across different
/// CSI microservices.
pub mod plugin_capabilities;
/// The jiva volume custom resource and its store.
pub mod volume;
