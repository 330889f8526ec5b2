use std::time::Duration;

use serde::Serialize;

use crate::id;

/// Parameters for creating a Firecracker VM.
pub struct VmConfig {
    pub sandbox_id: String,
    pub kernel_path: String,
    pub rootfs_path: String,
    pub workspace_path: String,
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub vsock_uds_path: String,
    pub guest_cid: u32,
    pub tap_dev_name: String,
    pub guest_mac: String,
    pub guest_ip: String,
    pub gateway_ip: String,
}

/// Firecracker JSON configuration structures.
#[derive(Serialize)]
pub struct FirecrackerConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    pub vsock: Vsock,
    #[serde(rename = "network-interfaces")]
    pub network_interfaces: Vec<NetworkInterface>,
}

#[derive(Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Serialize)]
pub struct Vsock {
    pub guest_cid: u32,
    pub uds_path: String,
}

#[derive(Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

impl VmConfig {
    /// Kernel cmdline: guest IP configuration for the init script plus the
    /// gateway hint the agent uses for the egress proxy.
    pub fn boot_args(&self) -> String {
        format!(
            "{} ip={}::{}:255.255.255.252::eth0:off osb.gateway={}",
            BASE_BOOT_ARGS, self.guest_ip, self.gateway_ip, self.gateway_ip
        )
    }

    /// Build the Firecracker JSON configuration.
    ///
    /// The rootfs is mounted read-write as the root device; the workspace
    /// volume is the second block device and appears as /dev/vdb in the guest.
    pub fn to_firecracker_config(&self) -> FirecrackerConfig {
        FirecrackerConfig {
            boot_source: BootSource {
                kernel_image_path: self.kernel_path.clone(),
                boot_args: self.boot_args(),
            },
            drives: vec![
                Drive {
                    drive_id: "rootfs".to_string(),
                    path_on_host: self.rootfs_path.clone(),
                    is_root_device: true,
                    is_read_only: false,
                },
                Drive {
                    drive_id: "workspace".to_string(),
                    path_on_host: self.workspace_path.clone(),
                    is_root_device: false,
                    is_read_only: false,
                },
            ],
            machine_config: MachineConfig {
                vcpu_count: self.vcpu_count,
                mem_size_mib: self.mem_size_mib,
                smt: false,
            },
            vsock: Vsock {
                guest_cid: self.guest_cid,
                uds_path: self.vsock_uds_path.clone(),
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: self.guest_mac.clone(),
                host_dev_name: self.tap_dev_name.clone(),
            }],
        }
    }

    /// Serialize the Firecracker configuration to a JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_firecracker_config())
    }
}

/// S3-compatible object storage settings for the checkpoint store.
#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
}

/// Worker daemon configuration.
pub struct WorkerConfig {
    pub worker_id: String,
    pub grpc_port: u16,
    pub proxy_port: u16,
    pub data_dir: String,
    pub kernel_path: String,
    /// Endpoint advertised in wake connect coordinates.
    pub endpoint: String,
    pub s3: Option<S3Config>,
    /// Default rolling timeout for new sandboxes.
    pub default_timeout: Duration,
    /// Deadline extension granted per activity.
    pub roll_amount: Duration,
    /// Upper bound on how far a deadline may roll past the last activity.
    pub roll_cap: Duration,
    /// Router scan tick.
    pub scan_interval: Duration,
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let grpc_port = env_parse("OSBOX_GRPC_PORT", 50051u16);
        Self {
            worker_id: std::env::var("OSBOX_WORKER_ID")
                .unwrap_or_else(|_| id::generate_id(id::WORKER_PREFIX)),
            grpc_port,
            proxy_port: env_parse("OSBOX_PROXY_PORT", 3128),
            data_dir: std::env::var("OSBOX_DATA_DIR")
                .unwrap_or_else(|_| "/var/osbox".to_string()),
            kernel_path: std::env::var("OSBOX_KERNEL_PATH")
                .unwrap_or_else(|_| "/var/osbox/images/vmlinux-5.10".to_string()),
            endpoint: std::env::var("OSBOX_ENDPOINT")
                .unwrap_or_else(|_| format!("http://127.0.0.1:{}", grpc_port)),
            s3: s3_from_env(),
            default_timeout: Duration::from_secs(env_parse("OSBOX_DEFAULT_TIMEOUT_SECS", 300u64)),
            roll_amount: Duration::from_secs(env_parse("OSBOX_ROLL_SECS", 60u64)),
            roll_cap: Duration::from_secs(env_parse("OSBOX_ROLL_CAP_SECS", 3600u64)),
            scan_interval: Duration::from_secs(env_parse("OSBOX_SCAN_INTERVAL_SECS", 30u64)),
        }
    }

    pub fn images_dir(&self) -> String {
        format!("{}/images", self.data_dir)
    }

    pub fn sandboxes_dir(&self) -> String {
        format!("{}/sandboxes", self.data_dir)
    }

    pub fn sandbox_dir(&self, sandbox_id: &str) -> String {
        format!("{}/sandboxes/{}", self.data_dir, sandbox_id)
    }

    pub fn checkpoints_dir(&self) -> String {
        format!("{}/checkpoints", self.data_dir)
    }

    pub fn ca_dir(&self) -> String {
        format!("{}/ca", self.data_dir)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn s3_from_env() -> Option<S3Config> {
    let bucket = std::env::var("OSBOX_S3_BUCKET").ok()?;
    Some(S3Config {
        bucket,
        region: std::env::var("OSBOX_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        endpoint: std::env::var("OSBOX_S3_ENDPOINT").ok(),
        access_key: std::env::var("OSBOX_S3_ACCESS_KEY").unwrap_or_default(),
        secret_key: std::env::var("OSBOX_S3_SECRET_KEY").unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vm_config() -> VmConfig {
        VmConfig {
            sandbox_id: "sb_test123".to_string(),
            kernel_path: "/var/osbox/images/vmlinux-5.10".to_string(),
            rootfs_path: "/var/osbox/sandboxes/sb_test123/rootfs.ext4".to_string(),
            workspace_path: "/var/osbox/sandboxes/sb_test123/workspace.ext4".to_string(),
            vcpu_count: 2,
            mem_size_mib: 512,
            vsock_uds_path: "/var/osbox/sandboxes/sb_test123/vsock.sock".to_string(),
            guest_cid: 5,
            tap_dev_name: "tap-sb_test123".to_string(),
            guest_mac: "AA:FC:00:00:00:02".to_string(),
            guest_ip: "172.16.2.2".to_string(),
            gateway_ip: "172.16.2.1".to_string(),
        }
    }

    #[test]
    fn boot_args_carry_ip_and_gateway() {
        let args = test_vm_config().boot_args();
        assert!(args.contains("ip=172.16.2.2::172.16.2.1:255.255.255.252::eth0:off"));
        assert!(args.contains("osb.gateway=172.16.2.1"));
        assert!(args.starts_with("console=ttyS0"));
    }

    #[test]
    fn firecracker_config_has_workspace_as_second_drive() {
        let json = test_vm_config().to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["drives"][0]["drive_id"], "rootfs");
        assert_eq!(parsed["drives"][0]["is_root_device"], true);
        assert_eq!(parsed["drives"][0]["is_read_only"], false);
        assert_eq!(parsed["drives"][1]["drive_id"], "workspace");
        assert_eq!(parsed["drives"][1]["is_root_device"], false);
        assert_eq!(
            parsed["drives"][1]["path_on_host"],
            "/var/osbox/sandboxes/sb_test123/workspace.ext4"
        );
    }

    #[test]
    fn firecracker_config_vsock_and_network() {
        let json = test_vm_config().to_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["vsock"]["guest_cid"], 5);
        assert_eq!(
            parsed["vsock"]["uds_path"],
            "/var/osbox/sandboxes/sb_test123/vsock.sock"
        );
        assert_eq!(parsed["network-interfaces"][0]["iface_id"], "eth0");
        assert_eq!(
            parsed["network-interfaces"][0]["host_dev_name"],
            "tap-sb_test123"
        );
        assert_eq!(parsed["machine-config"]["vcpu_count"], 2);
        assert_eq!(parsed["machine-config"]["mem_size_mib"], 512);
        assert_eq!(parsed["machine-config"]["smt"], false);
    }

    #[test]
    fn path_helpers() {
        let config = WorkerConfig {
            worker_id: "wrk_test".to_string(),
            grpc_port: 50051,
            proxy_port: 3128,
            data_dir: "/var/osbox".to_string(),
            kernel_path: "/var/osbox/images/vmlinux".to_string(),
            endpoint: "http://127.0.0.1:50051".to_string(),
            s3: None,
            default_timeout: Duration::from_secs(300),
            roll_amount: Duration::from_secs(60),
            roll_cap: Duration::from_secs(3600),
            scan_interval: Duration::from_secs(30),
        };
        assert_eq!(config.images_dir(), "/var/osbox/images");
        assert_eq!(config.sandbox_dir("sb_a"), "/var/osbox/sandboxes/sb_a");
        assert_eq!(config.checkpoints_dir(), "/var/osbox/checkpoints");
        assert_eq!(config.ca_dir(), "/var/osbox/ca");
    }
}
