//! Fake collaborators of the node service.
use crate::{
    config::NodeConfig,
    dev::{Attach, Connector, DeviceError, DeviceName},
    filesystem_ops::FileSystem,
    mount::{FsUsage, MountEntry, MountError, Mounter},
    node::Node,
    poller::{PollConfig, Probe},
};
use csi_driver::{
    filesystem::FileSystem as Fs,
    volume::{
        IscsiSpec, JivaVolume, JivaVolumeSpec, JivaVolumeStatus, ReplicaStatus, StoreError,
        VolumePhase, VolumeStatus, VolumeStore,
    },
};
use std::{
    collections::VecDeque,
    io::ErrorKind,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// Build a volume record with the given status and number of replicas.
pub(crate) fn volume(
    name: &str,
    phase: VolumePhase,
    status: VolumeStatus,
    replicas: usize,
) -> JivaVolume {
    let mut volume = JivaVolume::new(
        name,
        JivaVolumeSpec {
            pv: name.to_string(),
            capacity: "5Gi".to_string(),
            iscsi_spec: IscsiSpec {
                target_ip: "10.0.0.7".to_string(),
                target_port: 3260,
                iqn: format!("iqn.2016-09.com.openebs.jiva:{name}"),
            },
            ..Default::default()
        },
    );
    volume.metadata.namespace = Some("openebs".to_string());
    volume.status = Some(JivaVolumeStatus {
        status,
        replica_count: replicas as i32,
        replica_statuses: (0..replicas)
            .map(|index| ReplicaStatus {
                address: format!("tcp://10.0.1.{index}:9502"),
                mode: "RW".to_string(),
            })
            .collect(),
        phase,
    });
    volume
}

/// A volume record which is ready to serve IO.
pub(crate) fn ready_volume(name: &str) -> JivaVolume {
    volume(name, VolumePhase::Ready, VolumeStatus::ReadWrite, 1)
}

enum StoreState {
    Scripted(VecDeque<JivaVolume>),
    Missing,
    Broken,
}

/// Volume store which returns a scripted sequence of records, the last one repeating.
pub(crate) struct FakeStore {
    state: Mutex<StoreState>,
    fail_update: bool,
    gets: AtomicUsize,
    updates: Mutex<Vec<JivaVolume>>,
}

impl FakeStore {
    fn with_state(state: StoreState) -> Self {
        Self {
            state: Mutex::new(state),
            fail_update: false,
            gets: AtomicUsize::new(0),
            updates: Mutex::new(vec![]),
        }
    }
    pub(crate) fn new(script: Vec<JivaVolume>) -> Self {
        Self::with_state(StoreState::Scripted(script.into()))
    }
    /// A store which serves the script but fails every update.
    pub(crate) fn read_only(script: Vec<JivaVolume>) -> Self {
        Self {
            fail_update: true,
            ..Self::new(script)
        }
    }
    /// A store which does not have any volume.
    pub(crate) fn missing() -> Self {
        Self::with_state(StoreState::Missing)
    }
    /// A store which fails every request.
    pub(crate) fn broken() -> Self {
        Self::with_state(StoreState::Broken)
    }
    /// Number of get requests.
    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
    /// The records written so far.
    pub(crate) fn updates(&self) -> Vec<JivaVolume> {
        self.updates.lock().unwrap().clone()
    }
}

fn server_error() -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: "etcdserver: request timed out".to_string(),
        reason: "InternalError".to_string(),
        code: 500,
    })
}

#[tonic::async_trait]
impl VolumeStore for FakeStore {
    async fn get(&self, name: &str) -> Result<JivaVolume, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        match &mut *self.state.lock().unwrap() {
            StoreState::Scripted(script) if script.len() > 1 => Ok(script.pop_front().unwrap()),
            StoreState::Scripted(script) => script.front().cloned().ok_or(StoreError::NotFound {
                name: name.to_string(),
            }),
            StoreState::Missing => Err(StoreError::NotFound {
                name: name.to_string(),
            }),
            StoreState::Broken => Err(StoreError::Kube {
                operation: "get",
                name: name.to_string(),
                source: server_error(),
            }),
        }
    }

    async fn update(&self, volume: &JivaVolume) -> Result<(), StoreError> {
        let broken = matches!(&*self.state.lock().unwrap(), StoreState::Broken);
        if broken || self.fail_update {
            return Err(StoreError::Kube {
                operation: "update",
                name: volume.metadata.name.clone().unwrap_or_default(),
                source: server_error(),
            });
        }
        self.updates.lock().unwrap().push(volume.clone());
        Ok(())
    }
}

/// Attacher which records its calls and returns a fixed device.
#[derive(Default)]
pub(crate) struct FakeAttacher {
    device: String,
    fail: bool,
    fail_disconnect: bool,
    connects: Mutex<Vec<Connector>>,
    disconnects: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeAttacher {
    pub(crate) fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            ..Default::default()
        }
    }
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
    /// An attacher which connects but fails to disconnect.
    pub(crate) fn failing_disconnect(device: &str) -> Self {
        Self {
            fail_disconnect: true,
            ..Self::new(device)
        }
    }
    pub(crate) fn connects(&self) -> Vec<Connector> {
        self.connects.lock().unwrap().clone()
    }
    pub(crate) fn disconnects(&self) -> Vec<(String, Vec<String>)> {
        self.disconnects.lock().unwrap().clone()
    }
}

#[tonic::async_trait]
impl Attach for FakeAttacher {
    async fn connect(&self, connector: &Connector) -> Result<DeviceName, DeviceError> {
        self.connects.lock().unwrap().push(connector.clone());
        if self.fail {
            return Err(DeviceError::from("iscsiadm: login failed".to_string()));
        }
        Ok(self.device.clone())
    }

    async fn disconnect(&self, iqn: &str, portals: &[String]) -> Result<(), DeviceError> {
        self.disconnects
            .lock()
            .unwrap()
            .push((iqn.to_string(), portals.to_vec()));
        if self.fail_disconnect {
            return Err(DeviceError::from("iscsiadm: logout failed".to_string()));
        }
        Ok(())
    }
}

/// A call made to the `FakeMounter`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) enum MountCall {
    FormatAndMount {
        device: String,
        target: String,
        fs: String,
        options: Vec<String>,
    },
    Mount {
        source: String,
        target: String,
        fs: String,
        options: Vec<String>,
    },
    Unmount {
        target: String,
    },
}

/// Mounter keeping its own mount table.
#[derive(Default)]
pub(crate) struct FakeMounter {
    mounts: Mutex<Vec<MountEntry>>,
    calls: Mutex<Vec<MountCall>>,
    fail_mount: bool,
    fail_unmount: bool,
}

impl FakeMounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    /// A mounter whose mount calls fail.
    pub(crate) fn failing() -> Self {
        Self {
            fail_mount: true,
            ..Default::default()
        }
    }
    /// A mounter whose unmount calls fail.
    pub(crate) fn failing_unmount() -> Self {
        Self {
            fail_unmount: true,
            ..Default::default()
        }
    }
    /// Add an existing mount.
    pub(crate) fn add_mount(&self, source: &str, path: &str) {
        self.mounts.lock().unwrap().push(MountEntry {
            source: source.to_string(),
            path: path.to_string(),
            fs_type: "ext4".to_string(),
            options: vec!["rw".to_string()],
        });
    }
    pub(crate) fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }
    pub(crate) fn is_mounted(&self, path: &str) -> bool {
        self.mounts.lock().unwrap().iter().any(|entry| entry.path == path)
    }
    fn add(&self, source: &str, target: &str, fs: &FileSystem, options: &[String]) {
        self.mounts.lock().unwrap().push(MountEntry {
            source: source.to_string(),
            path: target.to_string(),
            fs_type: fs.to_string(),
            options: options.to_vec(),
        });
    }
    fn failure(&self, source: &str, target: &str) -> Result<(), MountError> {
        match self.fail_mount {
            true => Err(MountError::MountFailed {
                device: source.to_string(),
                target: target.to_string(),
                source: std::io::Error::from(ErrorKind::PermissionDenied),
            }),
            false => Ok(()),
        }
    }
}

#[tonic::async_trait]
impl Mounter for FakeMounter {
    async fn list(&self) -> Result<Vec<MountEntry>, MountError> {
        Ok(self.mounts.lock().unwrap().clone())
    }

    async fn is_mount_point(&self, path: &str) -> std::io::Result<bool> {
        if self.is_mounted(path) {
            return Ok(true);
        }
        match Path::new(path).exists() {
            true => Ok(false),
            false => Err(std::io::Error::from(ErrorKind::NotFound)),
        }
    }

    async fn format_and_mount(
        &self,
        device: &str,
        target: &str,
        fs: &FileSystem,
        options: &[String],
    ) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(MountCall::FormatAndMount {
            device: device.to_string(),
            target: target.to_string(),
            fs: fs.to_string(),
            options: options.to_vec(),
        });
        self.failure(device, target)?;
        self.add(device, target, fs, options);
        Ok(())
    }

    async fn mount(
        &self,
        source: &str,
        target: &str,
        fs: &FileSystem,
        options: &[String],
    ) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(MountCall::Mount {
            source: source.to_string(),
            target: target.to_string(),
            fs: fs.to_string(),
            options: options.to_vec(),
        });
        self.failure(source, target)?;
        self.add(source, target, fs, options);
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), MountError> {
        self.calls.lock().unwrap().push(MountCall::Unmount {
            target: target.to_string(),
        });
        if self.fail_unmount {
            return Err(MountError::UnmountFailed {
                target: target.to_string(),
                source: std::io::Error::from_raw_os_error(nix::libc::EBUSY),
            });
        }
        self.mounts
            .lock()
            .unwrap()
            .retain(|entry| entry.path != target);
        Ok(())
    }

    async fn usage(&self, _path: &str) -> Result<FsUsage, MountError> {
        Ok(FsUsage {
            bytes_total: 5 << 30,
            bytes_available: 4 << 30,
            bytes_used: 1 << 30,
            inodes_total: 1000,
            inodes_available: 900,
            inodes_used: 100,
        })
    }
}

/// Probe which fails the first few attempts.
pub(crate) struct FakeProbe {
    failures: usize,
    attempts: AtomicUsize,
}

impl FakeProbe {
    pub(crate) fn reachable() -> Self {
        Self::reachable_after(1)
    }
    pub(crate) fn unreachable() -> Self {
        Self::reachable_after(usize::MAX)
    }
    /// Reachable from the given attempt onwards.
    pub(crate) fn reachable_after(attempt: usize) -> Self {
        Self {
            failures: attempt.saturating_sub(1),
            attempts: AtomicUsize::new(0),
        }
    }
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl Probe for FakeProbe {
    async fn probe(&self, _portal: &str) -> std::io::Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        match attempt < self.failures {
            true => Err(std::io::Error::from(ErrorKind::ConnectionRefused)),
            false => Ok(()),
        }
    }
}

/// The node service, its fake collaborators and a scratch directory.
pub(crate) struct Fixture {
    pub(crate) node: Node,
    pub(crate) store: Arc<FakeStore>,
    pub(crate) attacher: Arc<FakeAttacher>,
    pub(crate) mounter: Arc<FakeMounter>,
    pub(crate) probe: Arc<FakeProbe>,
    pub(crate) dir: tempfile::TempDir,
}

impl Fixture {
    pub(crate) fn new(store: FakeStore, attacher: FakeAttacher, mounter: FakeMounter) -> Self {
        Self::with_parts(store, attacher, mounter, FakeProbe::reachable(), poll_config())
    }
    pub(crate) fn with_parts(
        store: FakeStore,
        attacher: FakeAttacher,
        mounter: FakeMounter,
        probe: FakeProbe,
        poll: PollConfig,
    ) -> Self {
        let config = NodeConfig::new("node-1", "openebs", Fs::Ext4, poll);
        let store = Arc::new(store);
        let attacher = Arc::new(attacher);
        let mounter = Arc::new(mounter);
        let probe = Arc::new(probe);
        let node = Node::new(
            config,
            store.clone(),
            attacher.clone(),
            mounter.clone(),
            probe.clone(),
        );
        Self {
            node,
            store,
            attacher,
            mounter,
            probe,
            dir: tempfile::tempdir().unwrap(),
        }
    }
    /// A path in the scratch directory.
    pub(crate) fn path(&self, relative: &str) -> String {
        self.dir.path().join(relative).to_string_lossy().into_owned()
    }
}

/// Three retries, without any noticeable delay.
pub(crate) fn poll_config() -> PollConfig {
    PollConfig::new(3, Duration::from_millis(1), Duration::from_millis(1))
}
