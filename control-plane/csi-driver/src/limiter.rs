//! Volume Concurrency Limiter Module
//!
//! In general the Cluster Orchestrator (CO) is responsible for ensuring that there is no more
//! than one call “in-flight” per volume at a given time. However, in some circumstances, the
//! CO MAY lose state (for example when the CO crashes and restarts), and MAY issue multiple
//! calls simultaneously for the same volume. The plugin SHOULD handle this as gracefully as
//! possible. The error code ABORTED MAY be returned by the plugin in this case (see the Error
//! Scheme section for details).
use snafu::Snafu;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::trace;

/// Volume concurrency limiter error variants.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)), context(suffix(false)))]
pub enum Error {
    #[snafu(display("An operation on volume {} is already in progress", id))]
    OperationInProgress { id: String },
}

impl From<Error> for tonic::Status {
    fn from(error: Error) -> Self {
        match error {
            Error::OperationInProgress { .. } => tonic::Status::aborted(error.to_string()),
        }
    }
}

/// The set of volumes which have a mutating operation in-flight.
/// Clones share the same set, so a single instance is created when the service starts.
#[derive(Clone, Debug, Default)]
pub struct VolumeTransitions {
    inventory: Arc<Mutex<HashSet<String>>>,
}

impl VolumeTransitions {
    /// Create a new, empty, transition set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tries to take a new volume reservation and returns error if an existing
    /// operation is already in progress.
    /// The reservation is returned when the guard is dropped.
    pub fn acquire(&self, id: &str) -> Result<VolumeOpGuard, Error> {
        match self.try_insert(id) {
            true => {
                trace!(volume.id = id, "New reservation");
                Ok(VolumeOpGuard {
                    id: id.to_string(),
                    transitions: self.clone(),
                })
            }
            false => {
                trace!(volume.id = id, "Operation already exists for volume");
                Err(Error::OperationInProgress { id: id.to_string() })
            }
        }
    }

    /// Atomically test and insert the volume, returning whether it was inserted.
    pub fn try_insert(&self, id: &str) -> bool {
        self.inventory().insert(id.to_string())
    }

    /// Remove the volume from the set. Removing an absent volume is a no-op.
    pub fn release(&self, id: &str) {
        self.inventory().remove(id);
    }

    /// Whether the volume currently has an operation in-flight.
    pub fn contains(&self, id: &str) -> bool {
        self.inventory().contains(id)
    }

    // The set holds no invariant which a panicking holder could break.
    fn inventory(&self) -> MutexGuard<'_, HashSet<String>> {
        self.inventory
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// This Operation guard is used to ensure there is no more than 1 in-flight operation
/// for a given volume by taking a reservation for the volume's id.
/// When this is dropped the reservation is returned and a new operation can be accepted.
#[derive(Debug)]
pub struct VolumeOpGuard {
    id: String,
    transitions: VolumeTransitions,
}

impl VolumeOpGuard {
    /// The volume this guard holds the reservation for.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for VolumeOpGuard {
    fn drop(&mut self) {
        self.transitions.release(&self.id);
        trace!(volume.id = self.id, "Reservation returned");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn single_reservation_per_volume() {
        let transitions = VolumeTransitions::new();

        let guard = transitions.acquire("v1").expect("first reservation");
        assert_eq!(guard.id(), "v1");
        assert!(transitions.contains("v1"));

        let error = transitions.acquire("v1").expect_err("volume is busy");
        let status = tonic::Status::from(error);
        assert_eq!(status.code(), tonic::Code::Aborted);

        // unrelated volumes are not affected
        let other = transitions.acquire("v2").expect("other volume is free");

        drop(guard);
        assert!(!transitions.contains("v1"));
        assert!(transitions.contains("v2"));
        let _again = transitions.acquire("v1").expect("reservation was returned");
        drop(other);
        assert!(!transitions.contains("v2"));
    }

    #[test]
    fn release_is_idempotent() {
        let transitions = VolumeTransitions::new();
        assert!(transitions.try_insert("v1"));
        assert!(!transitions.try_insert("v1"));
        transitions.release("v1");
        transitions.release("v1");
        assert!(!transitions.contains("v1"));
        assert!(transitions.try_insert("v1"));
    }

    #[test]
    fn clones_share_the_set() {
        let transitions = VolumeTransitions::new();
        let clone = transitions.clone();
        let _guard = transitions.acquire("v1").unwrap();
        assert!(clone.acquire("v1").is_err());
    }

    #[test]
    fn concurrent_reservations() {
        const THREADS: usize = 8;
        let transitions = VolumeTransitions::new();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|_| {
                let transitions = transitions.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    transitions.try_insert("v1")
                })
            })
            .collect::<Vec<_>>();

        let acquired = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|acquired| *acquired)
            .count();
        assert_eq!(acquired, 1);
    }
}
