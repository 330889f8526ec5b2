use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

use crate::error::WorkerError;
use crate::netpool::NetLease;

/// Host interface NAT egress leaves through.
const DEFAULT_EGRESS_IFACE: &str = "eth0";

fn egress_iface() -> String {
    std::env::var("OSBOX_EGRESS_IFACE").unwrap_or_else(|_| DEFAULT_EGRESS_IFACE.to_string())
}

/// Optional per-sandbox egress cap in Mbit/s. Unset or 0 disables shaping.
fn egress_cap_mbps() -> Option<u32> {
    std::env::var("OSBOX_BANDWIDTH_MBPS")
        .ok()?
        .parse()
        .ok()
        .filter(|&mbps| mbps > 0)
}

/// One iptables rule, expressed once and used for both append (`-A`) and
/// delete (`-D`) so setup and teardown cannot drift apart.
struct NatRule {
    table: Option<&'static str>,
    chain: &'static str,
    spec: Vec<String>,
}

impl NatRule {
    fn args(&self, action: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.spec.len() + 4);
        if let Some(table) = self.table {
            args.push("-t".to_string());
            args.push(table.to_string());
        }
        args.push(action.to_string());
        args.push(self.chain.to_string());
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// The three rules a guest needs: masquerade its /30 on the way out, and
/// forward traffic both directions across the TAP.
fn nat_rules(lease: &NetLease, iface: &str) -> Vec<NatRule> {
    let owned = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        NatRule {
            table: Some("nat"),
            chain: "POSTROUTING",
            spec: owned(&["-o", iface, "-s", &lease.subnet(), "-j", "MASQUERADE"]),
        },
        NatRule {
            table: None,
            chain: "FORWARD",
            spec: owned(&["-i", &lease.tap_name, "-o", iface, "-j", "ACCEPT"]),
        },
        NatRule {
            table: None,
            chain: "FORWARD",
            spec: owned(&[
                "-i", iface, "-o", &lease.tap_name,
                "-m", "state", "--state", "RELATED,ESTABLISHED", "-j", "ACCEPT",
            ]),
        },
    ]
}

/// Wire up host networking for a lease: TAP device, gateway address, NAT.
///
/// Also runs on wake with the sandbox's original lease; a restored VM expects
/// the identical host-side interface.
pub async fn setup(sandbox_id: &str, lease: &NetLease) -> Result<(), WorkerError> {
    let iface = egress_iface();

    info!(
        sandbox_id = %sandbox_id,
        tap = %lease.tap_name,
        guest_ip = %lease.guest_ip,
        gateway = %lease.gateway_ip,
        "wiring guest network"
    );

    exec("ip", &["tuntap", "add", &lease.tap_name, "mode", "tap"]).await?;
    exec(
        "ip",
        &["addr", "add", &format!("{}/30", lease.gateway_ip), "dev", &lease.tap_name],
    )
    .await?;
    exec("ip", &["link", "set", &lease.tap_name, "up"]).await?;

    for rule in nat_rules(lease, &iface) {
        exec_owned("iptables", rule.args("-A")).await?;
    }

    if let Some(mbps) = egress_cap_mbps() {
        shape_egress(&lease.tap_name, mbps).await?;
    }

    Ok(())
}

/// Undo host networking for a lease. Every removal is attempted even when an
/// earlier one fails; rules come off in reverse order of installation.
pub async fn teardown(sandbox_id: &str, lease: &NetLease) {
    let iface = egress_iface();

    info!(sandbox_id = %sandbox_id, tap = %lease.tap_name, "unwiring guest network");

    for rule in nat_rules(lease, &iface).iter().rev() {
        if let Err(e) = exec_owned("iptables", rule.args("-D")).await {
            warn!(chain = rule.chain, error = %e, "iptables rule removal failed");
        }
    }

    // Deleting the TAP also discards any qdisc attached to it.
    if let Err(e) = exec("ip", &["link", "del", &lease.tap_name]).await {
        warn!(tap = %lease.tap_name, error = %e, "TAP removal failed");
    }
}

/// Delete a TAP device by name. Crash recovery uses this for devices whose
/// lease bookkeeping died with the previous worker process.
pub async fn delete_tap(tap_name: &str) {
    if let Err(e) = exec("ip", &["link", "del", tap_name]).await {
        warn!(tap = %tap_name, error = %e, "stale TAP removal failed");
    }
}

/// Cap guest egress with a token bucket on the TAP device.
async fn shape_egress(tap_name: &str, mbps: u32) -> Result<(), WorkerError> {
    let rate = format!("{}mbit", mbps);
    let burst = format!("{}k", mbps * 10);
    exec(
        "tc",
        &[
            "qdisc", "add", "dev", tap_name, "root", "tbf",
            "rate", &rate, "burst", &burst, "latency", "50ms",
        ],
    )
    .await
}

async fn exec(program: &str, args: &[&str]) -> Result<(), WorkerError> {
    exec_owned(program, args.iter().map(|s| s.to_string()).collect()).await
}

async fn exec_owned(program: &str, args: Vec<String>) -> Result<(), WorkerError> {
    let rendered = format!("{} {}", program, args.join(" "));

    let output = Command::new(program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| WorkerError::io(rendered.clone(), e))?;

    if output.status.success() {
        return Ok(());
    }

    let detail = String::from_utf8_lossy(&output.stderr);
    Err(WorkerError::io(
        format!("{} exited with {}: {}", rendered, output.status, detail.trim()),
        std::io::Error::new(std::io::ErrorKind::Other, "command failed"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease() -> NetLease {
        NetLease {
            slot: 4,
            tap_name: "tap-sb_testlease".chars().take(15).collect(),
            guest_ip: "172.16.4.2".into(),
            gateway_ip: "172.16.4.1".into(),
            guest_mac: "AA:FC:00:00:00:04".into(),
            guest_cid: 7,
        }
    }

    #[test]
    fn rule_args_carry_table_action_and_chain() {
        let rules = nat_rules(&lease(), "eth0");
        assert_eq!(rules.len(), 3);

        let masq = rules[0].args("-A");
        assert_eq!(
            masq,
            vec!["-t", "nat", "-A", "POSTROUTING", "-o", "eth0", "-s", "172.16.4.0/30", "-j", "MASQUERADE"]
        );

        let forward = rules[1].args("-A");
        assert!(forward.starts_with(&["-A".to_string(), "FORWARD".to_string()]));
    }

    #[test]
    fn append_and_delete_differ_only_in_action() {
        for rule in nat_rules(&lease(), "eth0") {
            let added = rule.args("-A");
            let deleted = rule.args("-D");
            assert_eq!(added.len(), deleted.len());
            let diffs: Vec<_> = added
                .iter()
                .zip(deleted.iter())
                .filter(|(a, d)| a != d)
                .collect();
            assert_eq!(diffs.len(), 1);
            assert_eq!(diffs[0], (&"-A".to_string(), &"-D".to_string()));
        }
    }

    #[test]
    fn return_traffic_rule_matches_established_state() {
        let rules = nat_rules(&lease(), "bond0");
        let back = rules[2].args("-A");
        assert!(back.contains(&"RELATED,ESTABLISHED".to_string()));
        assert!(back.contains(&"bond0".to_string()));
        assert!(back.contains(&lease().tap_name));
    }

    #[tokio::test]
    async fn exec_surfaces_stderr_of_failing_command() {
        let result = exec("sh", &["-c", "echo boom >&2; exit 3"]).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn exec_missing_program_is_an_io_error() {
        let result = exec("/nonexistent/osbox-tool", &["x"]).await;
        assert!(matches!(result, Err(WorkerError::IoError { .. })));
    }
}
