//! Resource provider that counts acquisitions and releases

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use columba_core::{ColumbaError, ColumbaResult, ResourceLease, ResourceProvider};
use parking_lot::Mutex;

#[derive(Default)]
pub struct CountingResourceProvider {
    held: Arc<AtomicUsize>,
    acquired: AtomicUsize,
    failing: Mutex<HashSet<String>>,
}

impl CountingResourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every future acquisition of `resource` fail
    pub fn fail_on(&self, resource: impl Into<String>) {
        self.failing.lock().insert(resource.into());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    /// Leases currently outstanding
    pub fn held(&self) -> usize {
        self.held.load(Ordering::SeqCst)
    }

    /// Successful acquisitions so far
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

impl ResourceProvider for CountingResourceProvider {
    fn acquire(&self, resource: &str) -> ColumbaResult<ResourceLease> {
        if self.failing.lock().contains(resource) {
            return Err(ColumbaError::resource(resource, "simulated acquisition failure"));
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.held.fetch_add(1, Ordering::SeqCst);
        let held = self.held.clone();
        Ok(ResourceLease::new(resource, move || {
            held.fetch_sub(1, Ordering::SeqCst);
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_drop_releases() {
        let provider = CountingResourceProvider::new();
        let lease = provider.acquire("wake_lock").unwrap();
        assert_eq!(provider.held(), 1);
        drop(lease);
        assert_eq!(provider.held(), 0);
        assert_eq!(provider.acquired(), 1);
    }

    #[test]
    fn test_scripted_failure() {
        let provider = CountingResourceProvider::new();
        provider.fail_on("multicast_lock");
        assert!(provider.acquire("multicast_lock").is_err());
        assert!(provider.acquire("wake_lock").is_ok());
    }
}
