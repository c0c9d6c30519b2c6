//! Implementation of gRPC methods from the CSI Node gRPC service.
//!
//! Every mutating call reserves its volume for its whole duration, a second call on the same
//! volume is rejected with `ABORTED` until the first one returns.

use crate::{
    config::NodeConfig,
    dev::{Attach, Connector},
    filesystem_ops::FileSystem,
    mount::{self, Mounter},
    poller::{self, Probe},
};
use csi_driver::{
    csi::{
        node_server, node_service_capability,
        volume_capability::{access_mode::Mode, AccessType, MountVolume},
        NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
        NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse,
        NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse, NodePublishVolumeRequest,
        NodePublishVolumeResponse, NodeServiceCapability, NodeStageVolumeRequest,
        NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
        NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, VolumeCapability,
    },
    filesystem::FileSystem as Fs,
    limiter::VolumeTransitions,
    volume::{volume_name, VolumeStore},
};
use std::{
    fs::Permissions,
    io::ErrorKind,
    os::unix::fs::PermissionsExt,
    path::Path,
    sync::Arc,
};
use tonic::{Code, Request, Response, Status};
use tracing::{debug, error, info, trace, warn};

macro_rules! failure {
    (Code::$code:ident, $msg:literal) => {{ error!($msg); Status::new(Code::$code, $msg) }};
    (Code::$code:ident, $fmt:literal $(,$args:expr)+) => {{ let message = format!($fmt $(,$args)+); error!("{}", message); Status::new(Code::$code, message) }};
}

/// The Csi Node implementation.
#[derive(Clone)]
pub(crate) struct Node {
    config: Arc<NodeConfig>,
    transitions: VolumeTransitions,
    store: Arc<dyn VolumeStore>,
    attacher: Arc<dyn Attach>,
    mounter: Arc<dyn Mounter>,
    probe: Arc<dyn Probe>,
}

impl Node {
    /// Creates new node.
    pub(crate) fn new(
        config: NodeConfig,
        store: Arc<dyn VolumeStore>,
        attacher: Arc<dyn Attach>,
        mounter: Arc<dyn Mounter>,
        probe: Arc<dyn Probe>,
    ) -> Node {
        info!(
            node.id = config.node_name(),
            default_fs = %config.default_fs(),
            poll = ?config.poll(),
            "Creating CSI node"
        );
        Self {
            config: Arc::new(config),
            transitions: VolumeTransitions::new(),
            store,
            attacher,
            mounter,
            probe,
        }
    }

    /// Resolve the requested filesystem, falling back to the configured default.
    fn filesystem(&self, mount: &MountVolume, volume_id: &str) -> Result<Fs, Status> {
        let fs = Fs::resolve(&mount.fs_type, self.config.default_fs());
        if !fs.is_supported() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to handle volume {}: unsupported filesystem {}",
                volume_id,
                fs
            ));
        }
        Ok(fs)
    }

    /// Check the volume is not mounted at unrelated places.
    async fn check_multi_mount(&self, volume_id: &str, path: &str) -> Result<(), Status> {
        let mounts = self.mounter.list().await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to check the mounts of volume {}: {}",
                volume_id,
                error
            )
        })?;
        mount::check_multi_mount(&mounts, volume_id, path).map_err(|error| {
            error!(volume.id = volume_id, %error, "Conflicting mounts");
            Status::from(error)
        })
    }
}

/// The access type of a volume capability.
#[derive(Debug)]
enum VolumeAccess<'a> {
    Mount(&'a MountVolume),
    Block,
}

/// Check that the access mode requested by the volume capability is supported.
fn check_access_mode(volume_capability: &Option<VolumeCapability>) -> Result<(), String> {
    match volume_capability {
        Some(capability) => match &capability.access_mode {
            Some(access) => match Mode::try_from(access.mode) {
                Ok(Mode::SingleNodeWriter) => Ok(()),
                Ok(Mode::Unknown) => Err(String::from("volume capability: unknown access mode")),
                Ok(mode) => Err(format!(
                    "volume capability: unsupported access mode: {mode:?}"
                )),
                Err(_) => Err(format!(
                    "volume capability: invalid access mode: {}",
                    access.mode
                )),
            },
            None => Err(String::from("volume capability: missing access mode")),
        },
        None => Err(String::from("missing volume capability")),
    }
}

/// Get the access type of the volume capability.
fn get_access_type(
    volume_capability: &Option<VolumeCapability>,
) -> Result<VolumeAccess<'_>, String> {
    match volume_capability {
        Some(capability) => match &capability.access_type {
            Some(AccessType::Mount(mount)) => Ok(VolumeAccess::Mount(mount)),
            Some(AccessType::Block(_)) => Ok(VolumeAccess::Block),
            None => Err(String::from("volume capability: missing access type")),
        },
        None => Err(String::from("missing volume capability")),
    }
}

/// Validated stage parameters.
#[derive(Debug)]
struct StageRequest {
    volume_id: String,
    fs: Fs,
    staging_path: String,
    mount_flags: Vec<String>,
}

/// The access type requested by a publish.
#[derive(Debug)]
enum PublishAccess {
    /// Bind mount the staged filesystem.
    Filesystem { fs: Fs, mount_flags: Vec<String> },
    /// Raw block device access.
    Block,
}

/// Validated publish parameters.
#[derive(Debug)]
struct PublishRequest {
    volume_id: String,
    access: PublishAccess,
}

/// Compose the publish mount options: a bind mount, read-only if requested, along with the
/// capability flags.
fn publish_options(readonly: bool, mount_flags: &[String]) -> Vec<String> {
    let mut options = vec!["bind".to_string()];
    if readonly {
        options.push("ro".to_string());
    }
    for flag in mount_flags {
        if !options.contains(flag) {
            options.push(flag.clone());
        }
    }
    options
}

/// Create the publish target directory without any permissions, resetting the permissions of
/// an existing directory.
async fn create_target_dir(target: &str) -> std::io::Result<()> {
    let target = Path::new(target);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::DirBuilder::new().mode(0o000).create(target).await {
        Err(error) if error.kind() != ErrorKind::AlreadyExists => return Err(error),
        _ => {}
    }
    tokio::fs::set_permissions(target, Permissions::from_mode(0o000)).await
}

impl Node {
    fn validate_stage(&self, msg: &NodeStageVolumeRequest) -> Result<StageRequest, Status> {
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume: missing volume id"
            ));
        }
        let volume_id = volume_name(&msg.volume_id);

        if let Err(error) = check_access_mode(&msg.volume_capability) {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: {}",
                volume_id,
                error
            ));
        }
        let mount = match get_access_type(&msg.volume_capability) {
            Ok(VolumeAccess::Mount(mount)) => mount,
            Ok(VolumeAccess::Block) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Failed to stage volume {}: missing mount within volume capability",
                    volume_id
                ))
            }
            Err(error) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Failed to stage volume {}: {}",
                    volume_id,
                    error
                ))
            }
        };
        let fs = self.filesystem(mount, &volume_id)?;

        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to stage volume {}: missing staging path",
                volume_id
            ));
        }

        Ok(StageRequest {
            volume_id,
            fs,
            staging_path: msg.staging_target_path.clone(),
            mount_flags: mount.mount_flags.clone(),
        })
    }

    fn validate_publish(&self, msg: &NodePublishVolumeRequest) -> Result<PublishRequest, Status> {
        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume: missing volume id"
            ));
        }
        let volume_id = volume_name(&msg.volume_id);
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing target path",
                volume_id
            ));
        }
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: missing staging path",
                volume_id
            ));
        }
        if let Err(error) = check_access_mode(&msg.volume_capability) {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to publish volume {}: {}",
                volume_id,
                error
            ));
        }
        let access = match get_access_type(&msg.volume_capability) {
            Ok(VolumeAccess::Mount(mount)) => PublishAccess::Filesystem {
                fs: self.filesystem(mount, &volume_id)?,
                mount_flags: mount.mount_flags.clone(),
            },
            Ok(VolumeAccess::Block) => PublishAccess::Block,
            Err(error) => {
                return Err(failure!(
                    Code::InvalidArgument,
                    "Failed to publish volume {}: {}",
                    volume_id,
                    error
                ))
            }
        };
        Ok(PublishRequest { volume_id, access })
    }

    async fn stage(&self, request: StageRequest) -> Result<(), Status> {
        let StageRequest {
            volume_id,
            fs,
            staging_path,
            mount_flags,
        } = request;
        let poll = self.config.poll();

        debug!(volume.id = volume_id, "Waiting for the volume to be ready");
        let volume =
            poller::wait_for_volume_ready(self.store.as_ref(), &volume_id, poll).await?;

        // the volume may also be bind mounted by a previous publish
        self.check_multi_mount(&volume_id, &staging_path).await?;

        let portal = volume.target_portal();
        debug!(volume.id = volume_id, portal, "Waiting for the target to be reachable");
        poller::wait_for_portal_reachable(self.probe.as_ref(), &portal, poll).await?;

        let connector = Connector::from(&volume);
        debug!(volume.id = volume_id, ?connector, "Attaching disk");
        let device = self.attacher.connect(&connector).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: failed to attach disk: {}",
                volume_id,
                error
            )
        })?;
        if device.is_empty() {
            return Err(failure!(
                Code::Internal,
                "Failed to stage volume {}: connect reported success, but no device path was returned",
                volume_id
            ));
        }

        // the operator may have updated the record whilst we were waiting
        let mut volume = self.store.get(&volume_id).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: {}",
                volume_id,
                error
            )
        })?;
        let mount_info = &mut volume.spec.mount_info;
        mount_info.fs_type = fs.to_string();
        mount_info.device_path = device.clone();
        mount_info.staging_path = staging_path.clone();
        self.store.update(&volume).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to stage volume {}: {}",
                volume_id,
                error
            )
        })?;

        tokio::fs::create_dir_all(&staging_path)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to stage volume {}: failed to create {}: {}",
                    volume_id,
                    staging_path,
                    error
                )
            })?;

        match self.mounter.is_mount_point(&staging_path).await {
            Ok(true) => {
                info!(
                    volume.id = volume_id,
                    path = staging_path,
                    "Volume is already mounted"
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(error) => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to stage volume {}: failed to check {}: {}",
                    volume_id,
                    staging_path,
                    error
                ))
            }
        }

        info!(volume.id = volume_id, device, path = staging_path, %fs, "Formatting and mounting volume");
        self.mounter
            .format_and_mount(&device, &staging_path, &FileSystem::from(fs), &mount_flags)
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to stage volume {}: {}",
                    volume_id,
                    error
                )
            })
    }

    async fn unstage(&self, volume_id: &str, staging_path: &str) -> Result<(), Status> {
        let mounts = self.mounter.list().await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to unstage volume {}: {}",
                volume_id,
                error
            )
        })?;

        let (device, references) = mount::device_references(&mounts, staging_path);
        if references == 0 {
            info!(
                volume.id = volume_id,
                path = staging_path,
                "Volume is not staged"
            );
            return Ok(());
        }
        if references > 1 {
            warn!(
                volume.id = volume_id,
                path = staging_path,
                ?device,
                references,
                "Device of the staging path has more than one reference"
            );
        }

        debug!(volume.id = volume_id, path = staging_path, "Unmounting");
        self.mounter.unmount(staging_path).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to unstage volume {}: {}",
                volume_id,
                error
            )
        })?;

        let volume = self.store.get(volume_id).await.map_err(|error| {
            error!(volume.id = volume_id, %error, "Failed to unstage volume");
            Status::from(error)
        })?;

        info!(volume.id = volume_id, iqn = volume.iqn(), "Detaching disk");
        self.attacher
            .disconnect(volume.iqn(), &[volume.target_portal()])
            .await
            .map_err(|error| {
                failure!(
                    Code::Internal,
                    "Failed to unstage volume {}: failed to detach disk: {}",
                    volume_id,
                    error
                )
            })?;

        match tokio::fs::remove_dir_all(staging_path).await {
            Err(error) if error.kind() != ErrorKind::NotFound => Err(failure!(
                Code::Internal,
                "Failed to unstage volume {}: failed to remove {}: {}",
                volume_id,
                staging_path,
                error
            )),
            _ => {
                info!(volume.id = volume_id, ?device, "Volume unstaged");
                Ok(())
            }
        }
    }

    async fn publish_fs(
        &self,
        msg: &NodePublishVolumeRequest,
        volume_id: &str,
        fs: Fs,
        mount_flags: &[String],
    ) -> Result<(), Status> {
        let target = msg.target_path.as_str();
        let staging = msg.staging_target_path.as_str();

        self.check_multi_mount(volume_id, target).await?;

        let options = publish_options(msg.readonly, mount_flags);

        debug!(volume.id = volume_id, target, "Creating target directory");
        create_target_dir(target).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to publish volume {}: failed to create {}: {}",
                volume_id,
                target,
                error
            )
        })?;

        info!(volume.id = volume_id, staging, target, ?options, %fs, "Mounting volume");
        if let Err(error) = self
            .mounter
            .mount(staging, target, &FileSystem::from(fs), &options)
            .await
        {
            if let Err(remove_error) = tokio::fs::remove_dir(target).await {
                return Err(failure!(
                    Code::Internal,
                    "Failed to publish volume {}: {}, and failed to remove {}: {}",
                    volume_id,
                    error,
                    target,
                    remove_error
                ));
            }
            return Err(failure!(
                Code::Internal,
                "Failed to publish volume {}: {}",
                volume_id,
                error
            ));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl node_server::Node for Node {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_stage_volume {:?}", msg);

        let request = self.validate_stage(&msg)?;
        let _guard = self.transitions.acquire(&request.volume_id)?;

        info!(volume.id = request.volume_id, "Staging volume");
        self.stage(request).await?;
        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_unstage_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume: missing volume id"
            ));
        }
        let volume_id = volume_name(&msg.volume_id);
        if msg.staging_target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unstage volume {}: missing staging path",
                volume_id
            ));
        }
        let _guard = self.transitions.acquire(&volume_id)?;

        info!(volume.id = volume_id, "Unstaging volume");
        self.unstage(&volume_id, &msg.staging_target_path).await?;
        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_publish_volume {:?}", msg);

        let request = self.validate_publish(&msg)?;
        let _guard = self.transitions.acquire(&request.volume_id)?;

        match request.access {
            PublishAccess::Block => {
                return Err(failure!(
                    Code::Unimplemented,
                    "Failed to publish volume {}: block device provisioning is not supported",
                    request.volume_id
                ))
            }
            PublishAccess::Filesystem { fs, mount_flags } => {
                info!(volume.id = request.volume_id, target = msg.target_path, "Publishing volume");
                self.publish_fs(&msg, &request.volume_id, fs, &mount_flags)
                    .await?;
            }
        }
        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_unpublish_volume {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume: missing volume id"
            ));
        }
        let volume_id = volume_name(&msg.volume_id);
        if msg.target_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to unpublish volume {}: missing target path",
                volume_id
            ));
        }
        let _guard = self.transitions.acquire(&volume_id)?;

        let target = msg.target_path.as_str();
        match self.mounter.is_mount_point(target).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(volume.id = volume_id, target, "Volume is not mounted");
                return Ok(Response::new(NodeUnpublishVolumeResponse {}));
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                warn!(volume.id = volume_id, target, "Target does not exist");
                return Ok(Response::new(NodeUnpublishVolumeResponse {}));
            }
            Err(error) => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to unpublish volume {}: failed to check {}: {}",
                    volume_id,
                    target,
                    error
                ))
            }
        }

        info!(volume.id = volume_id, target, "Unpublishing volume");
        self.mounter.unmount(target).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to unpublish volume {}: {}",
                volume_id,
                error
            )
        })?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    /// Get volume stats method evaluates and returns capacity metrics.
    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let msg = request.into_inner();
        trace!("node_get_volume_stats {:?}", msg);

        if msg.volume_id.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats: missing volume id"
            ));
        }
        if msg.volume_path.is_empty() {
            return Err(failure!(
                Code::InvalidArgument,
                "Failed to get volume stats for {}: missing volume path",
                msg.volume_id
            ));
        }

        let volume_path = msg.volume_path.as_str();
        match self.mounter.is_mount_point(volume_path).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(failure!(
                    Code::NotFound,
                    "Volume path {} is not mounted",
                    volume_path
                ))
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(failure!(
                    Code::NotFound,
                    "Volume path {} does not exist",
                    volume_path
                ))
            }
            Err(error) => {
                return Err(failure!(
                    Code::Internal,
                    "Failed to check if volume path {} is mounted: {}",
                    volume_path,
                    error
                ))
            }
        }

        trace!("Getting statfs metrics for : {:?}", volume_path);
        let usage = self.mounter.usage(volume_path).await.map_err(|error| {
            failure!(
                Code::Internal,
                "Failed to retrieve capacity statistics for volume path {}: {}",
                volume_path,
                error
            )
        })?;
        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: usage.into(),
            volume_condition: None,
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let msg = request.into_inner();
        // TODO: grow the filesystem once the controller supports volume expansion
        warn!(
            volume.id = msg.volume_id,
            path = msg.volume_path,
            "NodeExpandVolume is not supported, ignoring request"
        );
        Ok(Response::new(NodeExpandVolumeResponse { capacity_bytes: 0 }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        let caps = vec![
            node_service_capability::rpc::Type::StageUnstageVolume,
            node_service_capability::rpc::Type::GetVolumeStats,
        ];

        debug!("NodeGetCapabilities request: {:?}", caps);

        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: caps
                .into_iter()
                .map(|c| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc { r#type: c as i32 },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        let node_id = self.config.node_name().to_string();

        debug!(node.id = node_id, "NodeGetInfo request");

        Ok(Response::new(NodeGetInfoResponse {
            node_id,
            max_volumes_per_node: 0,
            accessible_topology: None,
        }))
    }
}
