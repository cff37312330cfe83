use log::debug;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Fixed pool of kernel NBD devices for restore mounts. Each device can
/// back at most one mount, so pool size bounds concurrent mounts.
pub struct NbdDevicePool {
    devices: Vec<String>,
    in_use: Mutex<BTreeSet<String>>,
}

impl NbdDevicePool {
    /// `/dev/nbd0` .. `/dev/nbd{count-1}`
    pub fn new(count: u32) -> Self {
        Self {
            devices: (0..count).map(|i| format!("/dev/nbd{}", i)).collect(),
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// Take the lowest free device, or `None` when the pool is exhausted.
    pub fn acquire(&self) -> Option<String> {
        let mut in_use = self.in_use.lock();
        let device = self
            .devices
            .iter()
            .find(|d| !in_use.contains(*d))?
            .clone();
        in_use.insert(device.clone());
        debug!("Acquired NBD device {}", device);
        Some(device)
    }

    /// Return a device to the pool. Idempotent.
    pub fn release(&self, device: &str) {
        if self.in_use.lock().remove(device) {
            debug!("Released NBD device {}", device);
        }
    }

    /// Re-claim a device discovered in a persisted mount row at startup.
    pub fn adopt(&self, device: &str) {
        self.in_use.lock().insert(device.to_string());
    }

    pub fn capacity(&self) -> usize {
        self.devices.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_lowest_device_first() {
        let pool = NbdDevicePool::new(3);
        assert_eq!(pool.acquire().as_deref(), Some("/dev/nbd0"));
        assert_eq!(pool.acquire().as_deref(), Some("/dev/nbd1"));
        pool.release("/dev/nbd0");
        assert_eq!(pool.acquire().as_deref(), Some("/dev/nbd0"));
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = NbdDevicePool::new(1);
        assert!(pool.acquire().is_some());
        assert!(pool.acquire().is_none());
    }

    #[test]
    fn release_is_idempotent_and_round_trips() {
        let pool = NbdDevicePool::new(2);
        let device = pool.acquire().unwrap();
        pool.release(&device);
        pool.release(&device);
        assert_eq!(pool.in_use_count(), 0);

        // acquire → release leaves the pool exactly as before
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        pool.release(&a);
        pool.release(&b);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn adopt_marks_device_busy() {
        let pool = NbdDevicePool::new(2);
        pool.adopt("/dev/nbd0");
        assert_eq!(pool.acquire().as_deref(), Some("/dev/nbd1"));
        assert!(pool.acquire().is_none());
    }
}
