//! Host Network Programmer (spec §4.2). All operations shell out to the
//! host's `ip`/`iptables`/`sysctl` binaries via `tokio::process::Command`,
//! the same pattern the teacher's `core/net.rs` uses throughout. Every
//! operation here is idempotent, checking state with `-C`/`show` before
//! mutating, matching `ensure_iptables_rule` / `create_tap_with_vlan`.

use anyhow::{bail, Context, Result};
use sandbox_types::NetworkAllocation;
use tokio::process::Command;
use tokio::sync::OnceCell;

use crate::core::test_mode;

pub struct HostNetProgrammer {
    /// Overrides auto-detection of the default egress interface; mainly for
    /// tests and constrained hosts where `ip route show default` is absent.
    egress_iface: Option<String>,
    forwarding_once: OnceCell<()>,
}

impl HostNetProgrammer {
    pub fn new(egress_iface: Option<String>) -> Self {
        Self {
            egress_iface,
            forwarding_once: OnceCell::new(),
        }
    }

    pub async fn create_tap(&self, alloc: &NetworkAllocation) -> Result<()> {
        if test_mode() {
            return Ok(());
        }
        let name = &alloc.tap_name;
        let exists = Command::new("ip")
            .args(["link", "show", name])
            .output()
            .await?
            .status
            .success();
        if !exists {
            run("ip", &["tuntap", "add", "dev", name, "mode", "tap"]).await?;
        }
        run(
            "ip",
            &[
                "addr",
                "replace",
                &format!("{}/30", alloc.host_ip),
                "dev",
                name,
            ],
        )
        .await?;
        run("ip", &["link", "set", name, "up"]).await?;
        Ok(())
    }

    /// Suppresses "not found" so repeated or out-of-order teardown is safe.
    pub async fn delete_tap(&self, name: &str) -> Result<()> {
        if test_mode() {
            return Ok(());
        }
        let output = Command::new("sudo")
            .args(["-n", "ip", "link", "del", name])
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if stderr.contains("Cannot find device") || stderr.contains("does not exist") || stderr.is_empty() {
            return Ok(());
        }
        bail!("failed to delete tap {name}: {stderr}")
    }

    /// Installs DNAT for `host_port -> guest_ip:guest_port`. Returns whether
    /// a rule was actually added (vs. already present), so the caller can
    /// decide whether `remove_dnat` has anything to undo. Per the open
    /// design question in spec §9, only the PREROUTING rule controls this
    /// flag — the FORWARD accept rule is best-effort and untracked.
    pub async fn add_dnat(&self, alloc: &NetworkAllocation, host_port: u16, guest_port: u16) -> Result<bool> {
        if test_mode() {
            return Ok(true);
        }
        let dest = format!("{}:{}", alloc.guest_ip, guest_port);
        let hp = host_port.to_string();
        let added = ensure_iptables_rule(
            "nat",
            "PREROUTING",
            &["-p", "tcp", "--dport", &hp, "-j", "DNAT", "--to-destination", &dest],
        )
        .await?;

        // Best-effort FORWARD accept; failures here are not fatal and do not
        // affect the add-dnat flag (matches the spec's chosen semantics).
        let _ = ensure_iptables_rule(
            "filter",
            "FORWARD",
            &["-p", "tcp", "-d", &alloc.guest_ip.to_string(), "--dport", &guest_port.to_string(), "-j", "ACCEPT"],
        )
        .await;

        Ok(added)
    }

    pub async fn remove_dnat(&self, alloc: &NetworkAllocation, host_port: u16, guest_port: u16) -> Result<()> {
        if test_mode() {
            return Ok(());
        }
        let dest = format!("{}:{}", alloc.guest_ip, guest_port);
        let hp = host_port.to_string();
        let _ = Command::new("sudo")
            .args([
                "-n", "iptables", "-t", "nat", "-D", "PREROUTING", "-p", "tcp", "--dport", &hp, "-j", "DNAT",
                "--to-destination", &dest,
            ])
            .status()
            .await;
        let _ = Command::new("sudo")
            .args([
                "-n", "iptables", "-D", "FORWARD", "-p", "tcp", "-d", &alloc.guest_ip.to_string(), "--dport",
                &guest_port.to_string(), "-j", "ACCEPT",
            ])
            .status()
            .await;
        Ok(())
    }

    /// One-time process-wide setup: IPv4 forwarding, loopback-source
    /// routing, and a SNAT rule covering the private prefix so sandboxes
    /// can reach the outside world. Safe to call repeatedly — only the
    /// first call does work, and the underlying rule-add is idempotent too.
    pub async fn enable_forwarding(&self, private_prefix_cidr: &str) -> Result<()> {
        if test_mode() {
            return Ok(());
        }
        self.forwarding_once
            .get_or_try_init(|| async {
                run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
                run("sysctl", &["-w", "net.ipv4.conf.all.route_localnet=1"]).await?;
                let iface = match &self.egress_iface {
                    Some(i) => i.clone(),
                    None => detect_default_interface().await.unwrap_or_else(|_| String::new()),
                };
                if !iface.is_empty() {
                    ensure_iptables_rule(
                        "nat",
                        "POSTROUTING",
                        &["-s", private_prefix_cidr, "-o", &iface, "-j", "MASQUERADE"],
                    )
                    .await?;
                }
                Ok::<_, anyhow::Error>(())
            })
            .await?;
        Ok(())
    }

    /// Binds an ephemeral loopback port, reads it back, and releases it. A
    /// brief TOCTOU race is acceptable per spec §4.2 — the port is consumed
    /// immediately by the caller (DNAT install + hypervisor attach).
    pub async fn find_free_port(&self) -> Result<u16> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .context("failed to bind ephemeral port")?;
        let port = listener.local_addr()?.port();
        drop(listener);
        Ok(port)
    }
}

async fn run(cmd: &str, args: &[&str]) -> Result<()> {
    let mut full_args = vec!["-n", cmd];
    full_args.extend_from_slice(args);
    let output = Command::new("sudo").args(&full_args).output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("command `sudo {cmd} {}` failed: {}", args.join(" "), stderr.trim());
    }
    Ok(())
}

/// Checks with `-C` before appending with `-A`. Returns whether the rule was
/// newly added (false means it already existed).
async fn ensure_iptables_rule(table: &str, chain: &str, rule_args: &[&str]) -> Result<bool> {
    let mut check_args = vec!["-n", "iptables", "-t", table, "-C", chain];
    check_args.extend_from_slice(rule_args);
    let check = Command::new("sudo").args(&check_args).status().await?;
    if check.success() {
        return Ok(false);
    }
    let mut add_args = vec!["-n", "iptables", "-t", table, "-A", chain];
    add_args.extend_from_slice(rule_args);
    let status = Command::new("sudo").args(&add_args).status().await?;
    if !status.success() {
        bail!("failed to add iptables rule: -t {table} -A {chain} {}", rule_args.join(" "));
    }
    Ok(true)
}

async fn detect_default_interface() -> Result<String> {
    let output = Command::new("ip").args(["route", "show", "default"]).output().await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .split_whitespace()
        .skip_while(|w| *w != "dev")
        .nth(1)
        .map(|s| s.to_string())
        .context("could not detect default network interface")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn find_free_port_returns_usable_port() {
        let hn = HostNetProgrammer::new(None);
        let port = hn.find_free_port().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_mode_short_circuits_device_operations() {
        std::env::set_var("WORKER_TEST_MODE", "1");
        let hn = HostNetProgrammer::new(None);
        let alloc = NetworkAllocation {
            block: 1,
            host_ip: "10.0.0.1".parse().unwrap(),
            guest_ip: "10.0.0.2".parse().unwrap(),
            tap_name: "wk-tap1".into(),
        };
        assert!(hn.create_tap(&alloc).await.is_ok());
        assert!(hn.delete_tap(&alloc.tap_name).await.is_ok());
        std::env::remove_var("WORKER_TEST_MODE");
    }
}
