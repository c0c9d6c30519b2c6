//! Jiva CSI node plugin.
//!
//! Serves the CSI node and identity services. This includes staging and publishing
//! of jiva volumes, attached over iSCSI, on the node.

use crate::{
    config::{args, dial_timeout, NodeConfig},
    dev::IscsiAdm,
    identity::Identity,
    mount::SysMounter,
    node::Node,
    poller::TcpProbe,
    shutdown_event::Shutdown,
};
use clap::Arg;
use csi_driver::{
    csi::{identity_server::IdentityServer, node_server::NodeServer},
    volume::K8sVolumeStore,
};
use futures::TryFutureExt;
use std::{
    fs,
    future::Future,
    io::ErrorKind,
    path::Path,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UnixListener,
};
use tonic::transport::{server::Connected, Server};
use tracing::{debug, error, info, trace};
use utils::tracing_telemetry::{FmtLayer, FmtStyle, TracingTelemetry};

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        let info = UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        };
        trace!(peer.addr = ?info.peer_addr, peer.cred = ?info.peer_cred, "CSI connection");
        info
    }
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// The command line of the node plugin.
pub(crate) fn command() -> clap::Command {
    clap::Command::new(utils::package_description!())
        .about("k8s sidecar for Jiva implementing the CSI node service")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new(args::CSI_SOCKET)
                .short('c')
                .long(args::CSI_SOCKET)
                .env("CSI_SOCKET")
                .value_name("PATH")
                .default_value(utils::CSI_SOCKET)
                .help("CSI gRPC listen socket"),
        )
        .arg(
            Arg::new(args::NODE_NAME)
                .short('n')
                .long(args::NODE_NAME)
                .env("NODE_NAME")
                .value_name("NAME")
                .help("Unique node name where this instance runs")
                .required(true),
        )
        .arg(
            Arg::new(args::NAMESPACE)
                .long(args::NAMESPACE)
                .env("OPENEBS_NAMESPACE")
                .value_name("NAMESPACE")
                .default_value(utils::DEFAULT_NAMESPACE)
                .help("Namespace of the JivaVolume custom resources"),
        )
        .arg(
            Arg::new(args::RETRY_COUNT)
                .long(args::RETRY_COUNT)
                .value_name("NUMBER")
                .value_parser(clap::value_parser!(u32))
                .default_value(utils::DEFAULT_RETRY_COUNT.to_string())
                .help("Number of rechecks of the volume readiness and target reachability"),
        )
        .arg(
            Arg::new(args::READY_INTERVAL)
                .long(args::READY_INTERVAL)
                .value_name("DURATION")
                .default_value(utils::VOLUME_READY_INTERVAL)
                .help("Delay between volume readiness checks"),
        )
        .arg(
            Arg::new(args::REACHABLE_INTERVAL)
                .long(args::REACHABLE_INTERVAL)
                .value_name("DURATION")
                .default_value(utils::PORTAL_REACHABLE_INTERVAL)
                .help("Delay between iSCSI target reachability probes"),
        )
        .arg(
            Arg::new(args::DIAL_TIMEOUT)
                .long(args::DIAL_TIMEOUT)
                .value_name("DURATION")
                .default_value(utils::PORTAL_DIAL_TIMEOUT)
                .help("Timeout of a single iSCSI target reachability probe"),
        )
        .arg(
            Arg::new(args::DEFAULT_FSTYPE)
                .long(args::DEFAULT_FSTYPE)
                .value_name("FSTYPE")
                .default_value(utils::DEFAULT_FS_TYPE)
                .help("Filesystem used when the volume capability does not specify one"),
        )
        .arg(
            Arg::new(args::FMT_STYLE)
                .long(args::FMT_STYLE)
                .value_name("STYLE")
                .value_parser(["compact", "pretty", "json"])
                .default_value(FmtStyle::Pretty.as_ref())
                .help("Formatting style to be used while logging"),
        )
        .arg(
            Arg::new(args::ANSI_COLOURS)
                .long(args::ANSI_COLOURS)
                .value_name("BOOL")
                .value_parser(clap::value_parser!(bool))
                .default_value("true")
                .help("Enable ansi colours for logs"),
        )
}

pub(super) async fn main() -> anyhow::Result<()> {
    let matches = command().get_matches();

    utils::print_package_info!();

    let fmt_style = matches
        .get_one::<String>(args::FMT_STYLE)
        .map(|style| style.parse::<FmtStyle>())
        .transpose()?
        .unwrap_or(FmtStyle::Pretty);
    let ansi_colours = matches
        .get_one::<bool>(args::ANSI_COLOURS)
        .copied()
        .unwrap_or(true);
    TracingTelemetry::builder()
        .with_writer(FmtLayer::Stdout)
        .with_style(fmt_style)
        .with_colours(ansi_colours)
        .init("csi-node");

    let csi_socket = matches
        .get_one::<String>(args::CSI_SOCKET)
        .map(|s| s.as_str())
        .unwrap_or(utils::CSI_SOCKET);

    let config = NodeConfig::try_from(&matches)?;
    let probe = TcpProbe::new(dial_timeout(&matches)?);
    let client = kube::Client::try_default()
        .await
        .map_err(|error| anyhow::anyhow!("Failed to create the kubernetes client: {}", error))?;
    let store = K8sVolumeStore::new(client, config.namespace());
    info!(namespace = config.namespace(), "Using JivaVolumes");

    let node = Node::new(
        config,
        Arc::new(store),
        Arc::new(IscsiAdm::default()),
        Arc::new(SysMounter::default()),
        Arc::new(probe),
    );

    // Remove stale CSI socket from previous instance if there is any
    match fs::remove_file(csi_socket) {
        Ok(_) => info!("Removed stale CSI socket {}", csi_socket),
        Err(err) => {
            if err.kind() != ErrorKind::NotFound {
                anyhow::bail!("Error removing stale CSI socket {}: {}", csi_socket, err);
            }
        }
    }

    let shutdown = Shutdown::new()
        .map_err(|error| anyhow::anyhow!("Failed to register the signal handlers: {}", error))?;
    CsiServer::run(csi_socket, node, shutdown)?.await
}

struct CsiServer {}

impl CsiServer {
    fn run(
        csi_socket: &str,
        node: Node,
        shutdown: Shutdown,
    ) -> anyhow::Result<impl Future<Output = anyhow::Result<()>>> {
        let incoming = {
            if let Some(parent) = Path::new(csi_socket).parent() {
                fs::create_dir_all(parent)?;
            }
            let uds = UnixListener::bind(csi_socket).map_err(|error| {
                anyhow::anyhow!("Failed to bind CSI socket {}: {}", csi_socket, error)
            })?;
            info!("CSI plugin bound to {}", csi_socket);

            // Change permissions on CSI socket to allow non-privileged clients to access it
            // to simplify testing.
            if let Err(e) = fs::set_permissions(
                csi_socket,
                std::os::unix::fs::PermissionsExt::from_mode(0o777),
            ) {
                error!("Failed to change permissions for CSI socket: {:?}", e);
            } else {
                debug!("Successfully changed file permissions for CSI socket");
            }

            async_stream::stream! {
                loop {
                    let item = uds.accept().map_ok(|(st, _)| UnixStream(st)).await;
                    yield item;
                }
            }
        };

        Ok(async move {
            Server::builder()
                .add_service(NodeServer::new(node))
                .add_service(IdentityServer::new(Identity {}))
                .serve_with_incoming_shutdown(incoming, shutdown.wait())
                .await
                .map_err(|error| {
                    error!(%error, "CsiServer failed");
                    error.into()
                })
        })
    }
}
