use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::ops::Range;

use super::ExportError;

/// Who holds a port and for which export.
#[derive(Debug, Clone)]
pub struct PortLease {
    pub owner_key: String,
    pub vm_name: String,
    pub export_name: String,
}

/// Hands out unique TCP ports from a bounded pool and takes them back on
/// teardown. Allocation always returns the lowest free port so reuse is
/// predictable in logs and tests.
pub struct PortAllocator {
    range: Range<u16>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    leases: BTreeMap<u16, PortLease>,
    /// Ports the kernel reported as busy at reconciliation time
    excluded: BTreeSet<u16>,
}

impl PortAllocator {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            range,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Returns the lowest free port in the pool and records its owner.
    pub fn allocate(
        &self,
        owner_key: impl Into<String>,
        vm_name: impl Into<String>,
        export_name: impl Into<String>,
    ) -> Result<u16, ExportError> {
        let mut inner = self.inner.lock();
        let port = self
            .range
            .clone()
            .find(|p| !inner.leases.contains_key(p) && !inner.excluded.contains(p))
            .ok_or(ExportError::NoFreePorts)?;

        inner.leases.insert(
            port,
            PortLease {
                owner_key: owner_key.into(),
                vm_name: vm_name.into(),
                export_name: export_name.into(),
            },
        );
        debug!("Allocated port {}", port);
        Ok(port)
    }

    /// Frees a port. Releasing an unallocated port is a no-op.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock();
        if inner.leases.remove(&port).is_some() {
            debug!("Released port {}", port);
        }
    }

    /// Every port currently held by the given owner, used by the completion
    /// path to tear down a whole job at once.
    pub fn ports_for_owner(&self, owner_key: &str) -> Vec<u16> {
        let inner = self.inner.lock();
        inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.owner_key == owner_key)
            .map(|(port, _)| *port)
            .collect()
    }

    /// The lease on a port, if any.
    pub fn lease(&self, port: u16) -> Option<PortLease> {
        self.inner.lock().leases.get(&port).cloned()
    }

    /// Every allocated port.
    pub fn allocated_ports(&self) -> Vec<u16> {
        self.inner.lock().leases.keys().copied().collect()
    }

    /// Re-adopt a lease discovered during crash recovery.
    pub fn adopt(
        &self,
        port: u16,
        owner_key: impl Into<String>,
        vm_name: impl Into<String>,
        export_name: impl Into<String>,
    ) {
        let mut inner = self.inner.lock();
        inner.leases.insert(
            port,
            PortLease {
                owner_key: owner_key.into(),
                vm_name: vm_name.into(),
                export_name: export_name.into(),
            },
        );
    }

    /// Rejects ports the kernel reports as already in use. Run once at
    /// startup before any allocation.
    pub fn reconcile_with_os(&self) {
        let mut busy = BTreeSet::new();
        for port in self.range.clone() {
            if TcpListener::bind(("127.0.0.1", port)).is_err() {
                busy.insert(port);
            }
        }

        if !busy.is_empty() {
            warn!("Ports already in use at startup: {:?}", busy);
        }

        let mut inner = self.inner.lock();
        let leased: BTreeSet<u16> = inner.leases.keys().copied().collect();
        inner.excluded = busy.difference(&leased).copied().collect();
        info!(
            "Port pool [{}, {}): {} excluded by OS reconciliation",
            self.range.start,
            self.range.end,
            inner.excluded.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_lowest_free_port_first() {
        let pool = PortAllocator::new(10100..10104);
        assert_eq!(pool.allocate("j1", "vm", "vm-disk0").unwrap(), 10100);
        assert_eq!(pool.allocate("j1", "vm", "vm-disk1").unwrap(), 10101);
        pool.release(10100);
        assert_eq!(pool.allocate("j2", "vm", "vm-disk0").unwrap(), 10100);
    }

    #[test]
    fn pool_exhaustion() {
        let pool = PortAllocator::new(10100..10102);
        pool.allocate("j1", "vm", "a").unwrap();
        pool.allocate("j1", "vm", "b").unwrap();
        assert!(matches!(
            pool.allocate("j1", "vm", "c"),
            Err(ExportError::NoFreePorts)
        ));
    }

    #[test]
    fn release_is_idempotent() {
        let pool = PortAllocator::new(10100..10102);
        let port = pool.allocate("j1", "vm", "a").unwrap();
        pool.release(port);
        pool.release(port);
        assert_eq!(pool.allocated_ports(), Vec::<u16>::new());
    }

    #[test]
    fn lease_records_owner_and_export() {
        let pool = PortAllocator::new(10100..10110);
        let port = pool.allocate("job-9", "pgtest1", "pgtest1-disk0").unwrap();
        let lease = pool.lease(port).unwrap();
        assert_eq!(lease.owner_key, "job-9");
        assert_eq!(lease.vm_name, "pgtest1");
        assert_eq!(lease.export_name, "pgtest1-disk0");
        assert!(pool.lease(10109).is_none());
    }

    #[test]
    fn ports_for_owner_tracks_each_job() {
        let pool = PortAllocator::new(10100..10110);
        let a = pool.allocate("job-1", "vm1", "vm1-disk0").unwrap();
        let b = pool.allocate("job-1", "vm1", "vm1-disk1").unwrap();
        let c = pool.allocate("job-2", "vm2", "vm2-disk0").unwrap();

        assert_eq!(pool.ports_for_owner("job-1"), vec![a, b]);
        assert_eq!(pool.ports_for_owner("job-2"), vec![c]);
        assert!(pool.ports_for_owner("job-3").is_empty());

        pool.release(a);
        pool.release(b);
        assert!(pool.ports_for_owner("job-1").is_empty());
    }

    #[test]
    fn create_then_destroy_round_trips_to_empty() {
        let pool = PortAllocator::new(10100..10105);
        let ports: Vec<u16> = (0..3)
            .map(|i| pool.allocate("j", "vm", format!("vm-disk{}", i)).unwrap())
            .collect();
        for port in ports {
            pool.release(port);
        }
        assert!(pool.allocated_ports().is_empty());
    }
}
