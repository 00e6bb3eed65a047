//! Subnet Allocator (spec §4.1): assigns /30 blocks out of a large private
//! CIDR. All state transitions are serialized through a single mutex —
//! there is never a reason to hold it across suspending I/O.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use sandbox_types::{NetworkAllocation, SandboxError, SandboxResult};

use crate::core::ids;

struct State {
    used: HashSet<u32>,
    cursor: u32,
}

pub struct SubnetAllocator {
    prefix_octet: u8,
    pool_size: u32,
    tap_prefix: String,
    state: Mutex<State>,
}

impl SubnetAllocator {
    pub fn new(prefix_octet: u8, pool_size: u32, tap_prefix: impl Into<String>) -> Self {
        Self {
            prefix_octet,
            pool_size,
            tap_prefix: tap_prefix.into(),
            state: Mutex::new(State {
                used: HashSet::new(),
                cursor: 0,
            }),
        }
    }

    pub fn pool_size(&self) -> u32 {
        self.pool_size
    }

    /// `block(id) = hash(id) mod pool_size` — used for create (so cross-worker
    /// wake lands on the same block) and for `IsTAPAvailable`.
    pub fn deterministic_block(&self, sandbox_id: &str) -> u32 {
        ids::block_for(sandbox_id, self.pool_size)
    }

    pub fn tap_name(&self, block: u32) -> String {
        format!("{}-tap{}", self.tap_prefix, block)
    }

    /// Parses a block index back out of a tap name produced by `tap_name`,
    /// for cases (recovery scan) where only the device name is known.
    pub fn parse_block(&self, tap_name: &str) -> Option<u32> {
        tap_name
            .strip_prefix(&self.tap_prefix)?
            .strip_prefix("tap")?
            .parse()
            .ok()
    }

    fn derive(&self, block: u32) -> NetworkAllocation {
        let base = 4u32 * block;
        let b1 = ((base >> 16) & 0xFF) as u8;
        let b2 = ((base >> 8) & 0xFF) as u8;
        let b3 = (base & 0xFF) as u8;
        NetworkAllocation {
            block,
            host_ip: Ipv4Addr::new(self.prefix_octet, b1, b2, b3 + 1),
            guest_ip: Ipv4Addr::new(self.prefix_octet, b1, b2, b3 + 2),
            tap_name: self.tap_name(block),
        }
    }

    /// Scans from the cursor for the first free block; advances the cursor
    /// past it regardless of outcome on subsequent calls.
    pub fn allocate(&self) -> SandboxResult<NetworkAllocation> {
        let mut st = self.state.lock().unwrap();
        if st.used.len() as u64 >= self.pool_size as u64 {
            return Err(SandboxError::ResourceExhausted(
                "subnet pool exhausted".into(),
            ));
        }
        let start = st.cursor;
        for step in 0..self.pool_size {
            let candidate = (start + step) % self.pool_size;
            if !st.used.contains(&candidate) {
                st.used.insert(candidate);
                st.cursor = (candidate + 1) % self.pool_size;
                return Ok(self.derive(candidate));
            }
        }
        Err(SandboxError::ResourceExhausted(
            "subnet pool exhausted".into(),
        ))
    }

    /// Reserves a specific block (by tap name), as used during snapshot
    /// restore and deterministic placement on create.
    pub fn allocate_specific(&self, tap_name: &str) -> SandboxResult<NetworkAllocation> {
        let block = self
            .parse_block(tap_name)
            .ok_or_else(|| SandboxError::InvalidArgument(format!("bad tap name: {tap_name}")))?;
        let mut st = self.state.lock().unwrap();
        if !st.used.insert(block) {
            return Err(SandboxError::PreconditionFailed(format!(
                "block {block} already in use"
            )));
        }
        Ok(self.derive(block))
    }

    /// Reserves a block directly, bypassing tap-name parsing. Used by
    /// `create`, which already knows the deterministic block index.
    pub fn allocate_block(&self, block: u32) -> SandboxResult<NetworkAllocation> {
        let mut st = self.state.lock().unwrap();
        if !st.used.insert(block) {
            return Err(SandboxError::PreconditionFailed(format!(
                "block {block} already in use"
            )));
        }
        Ok(self.derive(block))
    }

    /// Non-reserving lookup.
    pub fn can_allocate_specific(&self, tap_name: &str) -> bool {
        match self.parse_block(tap_name) {
            Some(block) => !self.state.lock().unwrap().used.contains(&block),
            None => false,
        }
    }

    pub fn can_allocate_block(&self, block: u32) -> bool {
        !self.state.lock().unwrap().used.contains(&block)
    }

    /// Idempotent.
    pub fn release(&self, block: u32) {
        self.state.lock().unwrap().used.remove(&block);
    }

    /// Marks a block used without deriving/returning an allocation; used by
    /// orphan recovery to reserve blocks backing leftover TAP devices found
    /// on disk before any sandbox is registered for them.
    pub fn mark_used(&self, block: u32) {
        self.state.lock().unwrap().used.insert(block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> SubnetAllocator {
        SubnetAllocator::new(10, 64, "wk")
    }

    #[test]
    fn allocate_then_release_then_allocate_specific_yields_same_ips() {
        let a = allocator();
        let first = a.allocate().unwrap();
        a.release(first.block);
        let second = a.allocate_specific(&a.tap_name(first.block)).unwrap();
        assert_eq!(first.host_ip, second.host_ip);
        assert_eq!(first.guest_ip, second.guest_ip);
    }

    #[test]
    fn allocate_specific_rejects_conflict() {
        let a = allocator();
        let alloc = a.allocate().unwrap();
        let name = a.tap_name(alloc.block);
        assert!(a.allocate_specific(&name).is_err());
    }

    #[test]
    fn exhaustion_still_allows_release() {
        let a = allocator();
        let mut blocks = Vec::new();
        for _ in 0..64 {
            blocks.push(a.allocate().unwrap().block);
        }
        assert!(matches!(
            a.allocate(),
            Err(SandboxError::ResourceExhausted(_))
        ));
        a.release(blocks[0]);
        assert!(a.allocate().is_ok());
    }

    #[test]
    fn derive_lands_in_prefix_with_netmask_30() {
        let a = allocator();
        let alloc = a.allocate_block(12345).unwrap();
        assert_eq!(alloc.host_ip.octets()[0], 10);
        assert_eq!(alloc.guest_ip.octets()[3] - alloc.host_ip.octets()[3], 1);
    }

    #[test]
    fn can_allocate_specific_is_non_reserving() {
        let a = allocator();
        let name = a.tap_name(5);
        assert!(a.can_allocate_specific(&name));
        assert!(a.can_allocate_specific(&name));
    }

    #[test]
    fn deterministic_block_matches_ids_helper() {
        let a = allocator();
        assert_eq!(
            a.deterministic_block("sbx-aaaa"),
            ids::block_for("sbx-aaaa", 64)
        );
    }
}
