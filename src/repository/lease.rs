//! Per-package mutation leases
//!
//! Mutations of one package are serialized; different packages proceed
//! independently. Leases are process-local.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct Leases {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Leases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock shared by every mutation of `(repository, package)`
    ///
    /// Callers hold the returned mutex's guard for the duration of the
    /// mutation.
    pub fn lease(&self, repository: &str, package: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{repository}/{package}"))
            .or_default()
            .clone()
    }

    /// Run `f` while holding the lease of `(repository, package)`
    pub fn with_lease<T>(&self, repository: &str, package: &str, f: impl FnOnce() -> T) -> T {
        let lease = self.lease(repository, package);
        let _guard = lease.lock();
        f()
    }
}
