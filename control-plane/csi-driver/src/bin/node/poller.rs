//! Bounded polling of the volume readiness and of the target portal reachability.
//! Both are bounded by a retry count only; a poll in progress cannot be cancelled.
use csi_driver::volume::{JivaVolume, Readiness, StoreError, VolumeStore};
use snafu::{ResultExt, Snafu};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

/// Polling configuration, supplied when the node service is created.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct PollConfig {
    retry_count: u32,
    ready_interval: Duration,
    reachable_interval: Duration,
}

impl PollConfig {
    /// Create a new `Self` with the given retry count and intervals.
    pub(crate) fn new(
        retry_count: u32,
        ready_interval: Duration,
        reachable_interval: Duration,
    ) -> Self {
        Self {
            retry_count,
            ready_interval,
            reachable_interval,
        }
    }
    /// Number of retries after the first check.
    pub(crate) fn retry_count(&self) -> u32 {
        self.retry_count
    }
    /// Delay between the readiness checks.
    pub(crate) fn ready_interval(&self) -> Duration {
        self.ready_interval
    }
    /// Delay between the reachability probes.
    pub(crate) fn reachable_interval(&self) -> Duration {
        self.reachable_interval
    }
}

/// Poll error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub(crate) enum PollError {
    #[snafu(display(
        "Max retry count {} exceeded, volume {} is not ready",
        retries,
        volume_id
    ))]
    VolumeNotReady { volume_id: String, retries: u32 },
    #[snafu(display(
        "iSCSI target portal {} not reachable after {} attempts: {}",
        portal,
        attempts,
        source
    ))]
    PortalUnreachable {
        portal: String,
        attempts: u32,
        source: std::io::Error,
    },
    #[snafu(display("{}", source))]
    Store { source: StoreError },
}

impl From<PollError> for tonic::Status {
    fn from(error: PollError) -> Self {
        match error {
            PollError::VolumeNotReady { .. } | PollError::PortalUnreachable { .. } => {
                tonic::Status::failed_precondition(error.to_string())
            }
            PollError::Store { source } => source.into(),
        }
    }
}

/// Wait for the volume to be ready to serve IO, ie: its phase is ready and
/// its status is read-write.
/// The volume is checked once straight away and then up to `retry_count` times more.
pub(crate) async fn wait_for_volume_ready(
    store: &dyn VolumeStore,
    volume_id: &str,
    config: &PollConfig,
) -> Result<JivaVolume, PollError> {
    for attempt in 0..=config.retry_count() {
        if attempt > 0 {
            tokio::time::sleep(config.ready_interval()).await;
        }
        let volume = store.get(volume_id).await.context(Store)?;
        match volume.readiness() {
            Readiness::Ready => {
                debug!(volume.id = volume_id, attempt, "Volume is ready");
                return Ok(volume);
            }
            Readiness::ReadOnly { replicas } => {
                warn!(volume.id = volume_id, ?replicas, "Volume is in RO mode");
            }
            Readiness::ReplicasDisconnected => {
                warn!(
                    volume.id = volume_id,
                    "Volume is not ready: replicas may not be connected"
                );
            }
            Readiness::NotReady { phase, status } => {
                warn!(volume.id = volume_id, ?phase, ?status, "Volume is not ready");
            }
        }
    }
    error!(
        volume.id = volume_id,
        retries = config.retry_count(),
        "Volume did not become ready"
    );
    Err(PollError::VolumeNotReady {
        volume_id: volume_id.to_string(),
        retries: config.retry_count(),
    })
}

/// Network reachability probe of a target portal.
#[tonic::async_trait]
pub(crate) trait Probe: Send + Sync {
    /// Check that a connection can be established to the `host:port` portal.
    async fn probe(&self, portal: &str) -> std::io::Result<()>;
}

/// Probes a portal by opening and dropping a TCP connection.
#[derive(Debug, Clone)]
pub(crate) struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// Create a new `Self` which gives up dialing after the given timeout.
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[tonic::async_trait]
impl Probe for TcpProbe {
    async fn probe(&self, portal: &str) -> std::io::Result<()> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(portal)).await {
            Ok(stream) => stream.map(|_| ()),
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("timed out after {:?}", self.timeout),
            )),
        }
    }
}

/// Wait for the target portal to accept TCP connections, dialing at most `retry_count` times.
pub(crate) async fn wait_for_portal_reachable(
    probe: &dyn Probe,
    portal: &str,
    config: &PollConfig,
) -> Result<(), PollError> {
    let attempts = config.retry_count().max(1);
    let mut attempt = 1;
    loop {
        match probe.probe(portal).await {
            Ok(()) => {
                debug!(portal, attempt, "Target portal is reachable");
                return Ok(());
            }
            Err(error) if attempt >= attempts => {
                error!(portal, attempts, %error, "Target portal is not reachable");
                return Err(error).context(PortalUnreachable { portal, attempts });
            }
            Err(error) => {
                debug!(portal, attempt, %error, "Target portal is not reachable yet");
            }
        }
        tokio::time::sleep(config.reachable_interval()).await;
        attempt += 1;
    }
}
