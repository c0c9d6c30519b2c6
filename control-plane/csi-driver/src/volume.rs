//! The jiva volume custom resource, which is created and driven by the jiva operator.
//! The node plugin reads its replication status and iSCSI target, and records where the
//! volume has been attached and mounted.
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, PostParams},
    Client, CustomResource, ResourceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::Snafu;
use tracing::{debug, trace};

#[derive(
    CustomResource, Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, JsonSchema,
)]
#[kube(
group = "openebs.io",
version = "v1alpha1",
kind = "JivaVolume",
plural = "jivavolumes",
namespaced,
status = "JivaVolumeStatus",
derive = "PartialEq",
derive = "Default",
shortname = "jv",
printcolumn = r#"{ "name":"replicacount", "type":"integer", "description":"number of replicas", "jsonPath":".status.replicaCount"}"#,
printcolumn = r#"{ "name":"phase", "type":"string", "description":"volume phase", "jsonPath":".status.phase"}"#,
printcolumn = r#"{ "name":"status", "type":"string", "description":"volume io status", "jsonPath":".status.status"}"#
)]
#[serde(rename_all = "camelCase")]
/// The volume spec, holding where the volume is served from and where it is mounted.
pub struct JivaVolumeSpec {
    /// The persistent volume this volume backs.
    #[serde(default)]
    pub pv: String,
    /// The requested capacity.
    #[serde(default)]
    pub capacity: String,
    /// The iSCSI target serving the volume.
    #[serde(default)]
    pub iscsi_spec: IscsiSpec,
    /// Written by the node plugin once the volume is attached.
    #[serde(default)]
    pub mount_info: MountInfo,
}

/// The iSCSI target of a volume.
#[derive(Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IscsiSpec {
    #[serde(rename = "targetIP", default)]
    pub target_ip: String,
    #[serde(default)]
    pub target_port: i32,
    #[serde(default)]
    pub iqn: String,
}

/// Where and how the volume is attached and mounted on its node.
#[derive(Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    #[serde(default, alias = "path")]
    pub staging_path: String,
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub device_path: String,
}

/// The phase of the volume, as driven by the operator.
#[derive(Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, Copy, JsonSchema)]
pub enum VolumePhase {
    Pending,
    Syncing,
    Ready,
    Failed,
    Deleting,
    #[default]
    #[serde(other)]
    Unknown,
}

/// The io mode of the volume target.
#[derive(Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, Copy, JsonSchema)]
pub enum VolumeStatus {
    #[serde(rename = "RW")]
    ReadWrite,
    #[serde(rename = "RO")]
    ReadOnly,
    #[default]
    #[serde(other)]
    Unknown,
}

/// The mode of a single replica.
#[derive(Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, JsonSchema)]
pub struct ReplicaStatus {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub mode: String,
}

/// Status of the volume which is driven and changed by the operator.
#[derive(Serialize, Deserialize, Default, Debug, Eq, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JivaVolumeStatus {
    #[serde(default)]
    pub status: VolumeStatus,
    #[serde(default)]
    pub replica_count: i32,
    #[serde(rename = "replicaStatus", default)]
    pub replica_statuses: Vec<ReplicaStatus>,
    #[serde(default)]
    pub phase: VolumePhase,
}

/// Whether a volume can serve IO.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Readiness {
    /// Ready and writable.
    Ready,
    /// Read-only whilst the connected replicas sync up.
    ReadOnly { replicas: Vec<ReplicaStatus> },
    /// Read-only and no replica has connected yet.
    ReplicasDisconnected,
    /// Any other state, eg: the volume is still being created.
    NotReady {
        phase: VolumePhase,
        status: VolumeStatus,
    },
}

impl JivaVolume {
    /// Classify the volume status.
    pub fn readiness(&self) -> Readiness {
        let status = self.status.clone().unwrap_or_default();
        match (status.phase, status.status) {
            (VolumePhase::Ready, VolumeStatus::ReadWrite) => Readiness::Ready,
            (_, VolumeStatus::ReadOnly) if status.replica_statuses.is_empty() => {
                Readiness::ReplicasDisconnected
            }
            (_, VolumeStatus::ReadOnly) => Readiness::ReadOnly {
                replicas: status.replica_statuses,
            },
            (phase, status) => Readiness::NotReady { phase, status },
        }
    }
    /// The iSCSI target portal, as `ip:port`.
    pub fn target_portal(&self) -> String {
        let iscsi = &self.spec.iscsi_spec;
        match iscsi.target_port {
            port if port > 0 => format!("{}:{}", iscsi.target_ip, port),
            _ => format!("{}:{}", iscsi.target_ip, utils::ISCSI_DEFAULT_PORT),
        }
    }
    /// The iSCSI qualified name of the target.
    pub fn iqn(&self) -> &str {
        &self.spec.iscsi_spec.iqn
    }
    /// A reference to this volume, for logging.
    pub fn object_ref(&self) -> ObjectReference {
        ObjectReference {
            api_version: Some("openebs.io/v1alpha1".to_string()),
            kind: Some("JivaVolume".to_string()),
            name: Some(self.name_any()),
            namespace: self.namespace(),
            ..Default::default()
        }
    }
}

/// Normalise a CSI volume id into the name of its volume resource.
/// Any `prefix/` is stripped and the name is cut to the kubernetes object name limit.
pub fn volume_name(volume_id: &str) -> String {
    let name = volume_id
        .rsplit('/')
        .next()
        .unwrap_or(volume_id)
        .to_lowercase()
        .chars()
        .take(utils::K8S_NAME_MAX_LEN)
        .collect::<String>();
    name.trim_end_matches(&['-', '.'][..]).to_string()
}

/// Volume store error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum StoreError {
    #[snafu(display("JivaVolume {} not found", name))]
    NotFound { name: String },
    #[snafu(display("Failed to {} JivaVolume {}: {}", operation, name, source))]
    Kube {
        operation: &'static str,
        name: String,
        source: kube::Error,
    },
}

impl From<StoreError> for tonic::Status {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound { .. } => tonic::Status::not_found(error.to_string()),
            StoreError::Kube { .. } => tonic::Status::internal(error.to_string()),
        }
    }
}

/// Access to the volume records.
#[tonic::async_trait]
pub trait VolumeStore: Send + Sync {
    /// Get the volume record with the given name.
    async fn get(&self, name: &str) -> Result<JivaVolume, StoreError>;
    /// Overwrite the volume record with the given record.
    async fn update(&self, volume: &JivaVolume) -> Result<(), StoreError>;
}

/// Volume store backed by the kubernetes api server.
#[derive(Clone)]
pub struct K8sVolumeStore {
    api: Api<JivaVolume>,
}

impl K8sVolumeStore {
    /// Create a new store for the volumes in the given namespace.
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[tonic::async_trait]
impl VolumeStore for K8sVolumeStore {
    async fn get(&self, name: &str) -> Result<JivaVolume, StoreError> {
        match self.api.get(name).await {
            Ok(volume) => {
                trace!(volume.id = name, status = ?volume.status, "Fetched JivaVolume");
                Ok(volume)
            }
            Err(kube::Error::Api(error)) if error.code == 404 => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            Err(source) => Err(StoreError::Kube {
                operation: "get",
                name: name.to_string(),
                source,
            }),
        }
    }

    async fn update(&self, volume: &JivaVolume) -> Result<(), StoreError> {
        let name = volume.name_any();
        // The whole record is replaced, changes made since it was fetched are not merged.
        self.api
            .replace(&name, &PostParams::default(), volume)
            .await
            .map_err(|source| StoreError::Kube {
                operation: "update",
                name: name.clone(),
                source,
            })?;
        debug!(volume = ?volume.object_ref(), mount_info = ?volume.spec.mount_info, "Updated JivaVolume");
        Ok(())
    }
}
