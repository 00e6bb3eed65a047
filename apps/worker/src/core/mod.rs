pub mod agent_client;
pub mod archiver;
pub mod drives;
pub mod hostnet;
pub mod hypervisor;
pub mod ids;
pub mod objectstore;
pub mod subnet;
pub mod vsock;

/// Returns true when the worker should skip real host-level side effects
/// (device creation, iptables, subprocess spawns that require root). Mirrors
/// the teacher's `AGENT_TEST_MODE` escape hatch used throughout `core::net`.
pub fn test_mode() -> bool {
    std::env::var("WORKER_TEST_MODE").is_ok()
}
