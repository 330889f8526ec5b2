use std::collections::HashSet;
use std::sync::Mutex;

use crate::error::WorkerError;

/// Maximum number of network slots (each maps to a /30 subnet).
const MAX_SLOTS: u16 = 256;

/// Guest CIDs 0-2 are reserved by the vsock spec (hypervisor/local/host).
const CID_BASE: u32 = 3;

/// Host-side resources tied to one slot: TAP device, /30 subnet, MAC, CID.
/// Persisted as `net.json` in the sandbox directory so crash recovery and
/// wake can reclaim the same identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NetLease {
    pub slot: u16,
    pub tap_name: String,
    pub guest_ip: String,
    pub gateway_ip: String,
    pub guest_mac: String,
    pub guest_cid: u32,
}

impl NetLease {
    fn for_slot(slot: u16, sandbox_id: &str) -> Self {
        Self {
            slot,
            tap_name: tap_name_for(sandbox_id),
            guest_ip: format!("172.16.{}.2", slot),
            gateway_ip: format!("172.16.{}.1", slot),
            guest_mac: mac_for_slot(slot),
            guest_cid: CID_BASE + slot as u32,
        }
    }

    pub fn subnet(&self) -> String {
        format!("172.16.{}.0/30", self.slot)
    }
}

/// Derive a TAP device name from the sandbox ID.
/// TAP names are limited to 15 chars by the kernel: "tap-" + first 11 chars.
pub fn tap_name_for(sandbox_id: &str) -> String {
    let suffix: String = sandbox_id.chars().take(11).collect();
    format!("tap-{}", suffix)
}

/// Compute the guest MAC address from a slot number.
fn mac_for_slot(slot: u16) -> String {
    let hi = (slot >> 8) as u8;
    let lo = (slot & 0xFF) as u8;
    format!("AA:FC:00:00:{:02X}:{:02X}", hi, lo)
}

/// Worker-wide allocator for TAP/IP/CID slots.
///
/// A snapshot-restored VM keeps its prior interfaces, so wake must be able to
/// reclaim the exact slot the sandbox held before hibernation.
pub struct NetworkPool {
    used: Mutex<HashSet<u16>>,
}

impl Default for NetworkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkPool {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Allocate the next available slot. Fails fast when the pool is empty.
    pub fn allocate(&self, sandbox_id: &str) -> Result<NetLease, WorkerError> {
        let mut used = self.used.lock().unwrap();
        for slot in 0..MAX_SLOTS {
            if !used.contains(&slot) {
                used.insert(slot);
                return Ok(NetLease::for_slot(slot, sandbox_id));
            }
        }
        Err(WorkerError::ResourceExhausted(format!(
            "all {} network slots in use",
            MAX_SLOTS
        )))
    }

    /// Reclaim a specific slot, as required when restoring a snapshot.
    pub fn reclaim(&self, slot: u16, sandbox_id: &str) -> Result<NetLease, WorkerError> {
        let mut used = self.used.lock().unwrap();
        if slot >= MAX_SLOTS {
            return Err(WorkerError::ResourceExhausted(format!(
                "slot {} out of range",
                slot
            )));
        }
        if !used.insert(slot) {
            return Err(WorkerError::ResourceExhausted(format!(
                "slot {} already in use",
                slot
            )));
        }
        Ok(NetLease::for_slot(slot, sandbox_id))
    }

    /// Release a previously allocated slot.
    pub fn release(&self, slot: u16) {
        self.used.lock().unwrap().remove(&slot);
    }

    pub fn active_count(&self) -> usize {
        self.used.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_hands_out_sequential_slots() {
        let pool = NetworkPool::new();
        assert_eq!(pool.allocate("sb_a").unwrap().slot, 0);
        assert_eq!(pool.allocate("sb_b").unwrap().slot, 1);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn lease_derives_network_identity() {
        let pool = NetworkPool::new();
        let _ = pool.allocate("sb_first").unwrap();
        let lease = pool.allocate("sb_1234567890ABCDEF").unwrap();
        assert_eq!(lease.slot, 1);
        assert_eq!(lease.guest_ip, "172.16.1.2");
        assert_eq!(lease.gateway_ip, "172.16.1.1");
        assert_eq!(lease.subnet(), "172.16.1.0/30");
        assert_eq!(lease.guest_mac, "AA:FC:00:00:00:01");
        assert_eq!(lease.guest_cid, 4);
        assert_eq!(lease.tap_name, "tap-sb_12345678");
        assert!(lease.tap_name.len() <= 15);
    }

    #[test]
    fn exhaustion_fails_fast() {
        let pool = NetworkPool::new();
        for i in 0..256 {
            pool.allocate(&format!("sb_{}", i)).unwrap();
        }
        let result = pool.allocate("sb_extra");
        assert!(matches!(result, Err(WorkerError::ResourceExhausted(_))));
    }

    #[test]
    fn release_makes_slot_reusable() {
        let pool = NetworkPool::new();
        let lease = pool.allocate("sb_a").unwrap();
        pool.release(lease.slot);
        assert_eq!(pool.allocate("sb_b").unwrap().slot, lease.slot);
    }

    #[test]
    fn reclaim_returns_same_identity() {
        let pool = NetworkPool::new();
        let lease = pool.allocate("sb_wake").unwrap();
        pool.release(lease.slot);

        let reclaimed = pool.reclaim(lease.slot, "sb_wake").unwrap();
        assert_eq!(reclaimed, lease);
    }

    #[test]
    fn reclaim_taken_slot_fails() {
        let pool = NetworkPool::new();
        let lease = pool.allocate("sb_a").unwrap();
        let result = pool.reclaim(lease.slot, "sb_b");
        assert!(matches!(result, Err(WorkerError::ResourceExhausted(_))));
    }

    #[test]
    fn double_release_is_noop() {
        let pool = NetworkPool::new();
        let lease = pool.allocate("sb_a").unwrap();
        pool.release(lease.slot);
        pool.release(lease.slot);
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn mac_for_high_slot() {
        assert_eq!(mac_for_slot(255), "AA:FC:00:00:00:FF");
    }
}
