//! Sandbox id generation and the deterministic derivations keyed on it:
//! subnet block index, guest MAC, and (in `subnet.rs`) the derived IPs.
//!
//! `DefaultHasher` is deliberately avoided for `block_for` — its output is
//! not guaranteed stable across Rust versions or process restarts, which
//! would break cross-worker deterministic placement (P3). `sha2::Sha256`
//! is already a dependency the teacher uses for content hashing
//! (`images/upload.rs`), so it is reused here instead.

use rand::RngCore;
use sha2::{Digest, Sha256};

const SANDBOX_ID_PREFIX: &str = "sbx-";

/// Generates a fresh, opaque sandbox id: `sbx-` followed by 8 lowercase hex
/// characters drawn from a CSPRNG.
pub fn new_sandbox_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{SANDBOX_ID_PREFIX}{}", hex::encode(bytes))
}

fn digest(id: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.finalize().into()
}

/// `block(id) = hash(id) mod pool_size`, the deterministic placement
/// function from spec §3. Stable across processes and Rust versions.
pub fn block_for(id: &str, pool_size: u32) -> u32 {
    let d = digest(id);
    let v = u32::from_be_bytes([d[0], d[1], d[2], d[3]]);
    v % pool_size
}

/// Deterministic guest MAC derived from the sandbox id: a locally
/// administered, unicast address (first octet's multicast bit clear,
/// locally-administered bit set) so it never collides with a real
/// vendor-assigned OUI.
pub fn mac_for(id: &str) -> [u8; 6] {
    let d = digest(id);
    let mut mac = [d[0], d[1], d[2], d[3], d[4], d[5]];
    mac[0] = (mac[0] & 0xFE) | 0x02;
    mac
}

pub fn mac_to_string(mac: [u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_for_is_deterministic() {
        let a = block_for("sbx-deadbeef", 1 << 22);
        let b = block_for("sbx-deadbeef", 1 << 22);
        assert_eq!(a, b);
    }

    #[test]
    fn block_for_is_in_range() {
        for id in ["sbx-aaaaaaaa", "sbx-00000000", "sbx-ffffffff"] {
            let b = block_for(id, 1024);
            assert!(b < 1024);
        }
    }

    #[test]
    fn mac_is_locally_administered_unicast() {
        let mac = mac_for("sbx-deadbeef");
        assert_eq!(mac[0] & 0x01, 0, "multicast bit must be clear");
        assert_eq!(mac[0] & 0x02, 0x02, "locally-administered bit must be set");
    }

    #[test]
    fn mac_is_deterministic() {
        assert_eq!(mac_for("sbx-abc123"), mac_for("sbx-abc123"));
    }

    #[test]
    fn new_sandbox_id_has_expected_shape() {
        let id = new_sandbox_id();
        assert!(id.starts_with(SANDBOX_ID_PREFIX));
        assert_eq!(id.len(), SANDBOX_ID_PREFIX.len() + 8);
    }
}
