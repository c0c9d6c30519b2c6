use crate::poller::PollConfig;
use clap::ArgMatches;
use csi_driver::filesystem::FileSystem;
use std::time::Duration;

/// Command line arg names.
pub(crate) mod args {
    pub(crate) const NODE_NAME: &str = "node-name";
    pub(crate) const CSI_SOCKET: &str = "csi-socket";
    pub(crate) const NAMESPACE: &str = "namespace";
    pub(crate) const RETRY_COUNT: &str = "retry-count";
    pub(crate) const READY_INTERVAL: &str = "ready-interval";
    pub(crate) const REACHABLE_INTERVAL: &str = "reachable-interval";
    pub(crate) const DIAL_TIMEOUT: &str = "dial-timeout";
    pub(crate) const DEFAULT_FSTYPE: &str = "default-fstype";
    pub(crate) const FMT_STYLE: &str = "fmt-style";
    pub(crate) const ANSI_COLOURS: &str = "ansi-colours";
}

/// Node plugin configuration, fixed once the plugin starts.
#[derive(Debug, Clone)]
pub(crate) struct NodeConfig {
    node_name: String,
    namespace: String,
    default_fs: FileSystem,
    poll: PollConfig,
}

impl NodeConfig {
    /// Create a new `Self`.
    pub(crate) fn new(
        node_name: impl Into<String>,
        namespace: impl Into<String>,
        default_fs: FileSystem,
        poll: PollConfig,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            namespace: namespace.into(),
            default_fs,
            poll,
        }
    }
    /// Name of the node this plugin runs on, reported as the CSI node id.
    pub(crate) fn node_name(&self) -> &str {
        &self.node_name
    }
    /// Namespace of the volume records.
    pub(crate) fn namespace(&self) -> &str {
        &self.namespace
    }
    /// Filesystem used when a volume capability does not request one.
    pub(crate) fn default_fs(&self) -> &FileSystem {
        &self.default_fs
    }
    /// Readiness and reachability polling configuration.
    pub(crate) fn poll(&self) -> &PollConfig {
        &self.poll
    }
}

fn duration(matches: &ArgMatches, name: &str) -> anyhow::Result<Duration> {
    let value = matches
        .get_one::<String>(name)
        .ok_or_else(|| anyhow::anyhow!("Missing value for {}", name))?;
    humantime::parse_duration(value)
        .map_err(|error| anyhow::anyhow!("Invalid value for {}: {}, error = {}", name, value, error))
}

/// The timeout of a single reachability dial.
pub(crate) fn dial_timeout(matches: &ArgMatches) -> anyhow::Result<Duration> {
    duration(matches, args::DIAL_TIMEOUT)
}

impl TryFrom<&ArgMatches> for NodeConfig {
    type Error = anyhow::Error;
    fn try_from(matches: &ArgMatches) -> Result<Self, Self::Error> {
        let node_name = matches
            .get_one::<String>(args::NODE_NAME)
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", args::NODE_NAME))?;
        let namespace = matches
            .get_one::<String>(args::NAMESPACE)
            .map(String::as_str)
            .unwrap_or(utils::DEFAULT_NAMESPACE);
        let retry_count = matches
            .get_one::<u32>(args::RETRY_COUNT)
            .copied()
            .unwrap_or(utils::DEFAULT_RETRY_COUNT);

        let default_fs = FileSystem::resolve(
            matches
                .get_one::<String>(args::DEFAULT_FSTYPE)
                .map(String::as_str)
                .unwrap_or_default(),
            &FileSystem::Ext4,
        );
        if !default_fs.is_supported() {
            anyhow::bail!("Unsupported default filesystem: {}", default_fs);
        }

        let poll = PollConfig::new(
            retry_count,
            duration(matches, args::READY_INTERVAL)?,
            duration(matches, args::REACHABLE_INTERVAL)?,
        );
        Ok(Self::new(node_name.as_str(), namespace, default_fs, poll))
    }
}
