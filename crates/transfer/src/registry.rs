use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Tracks which logical files are currently being merged.
///
/// Created once at startup and shared by handle. The mutex only guards the
/// membership set and is never held across a merge.
#[derive(Debug, Default)]
pub struct MergeRegistry {
    in_flight: Mutex<HashSet<String>>,
}

impl MergeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked.
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `name` as in flight. Returns `false` without blocking if it
    /// already is.
    pub fn try_acquire(&self, name: &str) -> bool {
        self.set().insert(name.to_string())
    }

    /// Unregisters `name`. No-op if it was never registered.
    pub fn release(&self, name: &str) {
        self.set().remove(name);
    }

    /// Returns `true` if a merge of `name` is in flight.
    pub fn is_in_flight(&self, name: &str) -> bool {
        self.set().contains(name)
    }

    /// Returns every in-flight name, sorted.
    pub fn in_flight(&self) -> Vec<String> {
        let mut names: Vec<String> = self.set().iter().cloned().collect();
        names.sort();
        names
    }

    /// RAII form of [`try_acquire`](Self::try_acquire): the returned guard
    /// releases `name` when dropped.
    pub fn lock(self: &Arc<Self>, name: &str) -> Option<MergeGuard> {
        self.try_acquire(name).then(|| MergeGuard {
            registry: Arc::clone(self),
            name: name.to_string(),
        })
    }
}

/// Exclusive claim on a logical file name; released on drop.
#[derive(Debug)]
pub struct MergeGuard {
    registry: Arc<MergeRegistry>,
    name: String,
}

impl MergeGuard {
    /// The logical name this guard holds.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.registry.release(&self.name);
    }
}
