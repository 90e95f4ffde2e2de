//! Typed desired-state model decoded from control-plane events.
//!
//! Every struct tolerates missing fields (`serde(default)`) because the
//! control plane omits anything it considers irrelevant for the operation at
//! hand; an event carries exactly the slice of the model it needs.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

/// Desired-state descriptor for one container. The uuid is the stable
/// identity: it maps to at most one live container on this host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Instance {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub kind: String,
    pub hostname: String,
    /// Engine container id recorded by a previous activation, if any.
    pub external_id: Option<String>,
    pub agent_id: i64,
    /// Non-empty marks a system container ("NetworkAgent" is the designated
    /// overlay endpoint).
    pub system_container: Option<String>,
    /// Container created outside this control plane; its link configuration
    /// must not be rewritten.
    pub native_container: bool,
    pub nics: Vec<Nic>,
    pub ports: Vec<Port>,
    pub instance_links: Vec<Link>,
    pub network_container: Option<Box<Instance>>,
    pub data_volumes_from_containers: Vec<Instance>,
    pub volumes_from_data_volume_mounts: Vec<Volume>,
    pub milli_cpu_reservation: i64,
    pub memory_reservation: i64,
    pub fields: InstanceFields,
    /// Per-host overlay endpoint table keyed by host id.
    pub ipsec: HashMap<String, IpsecEndpoint>,
    /// Snapshot of the target's engine config, present on link targets.
    pub inspect_snapshot: Option<InspectSnapshot>,
    pub process_data: ProcessData,
}

impl Instance {
    /// True when nic 0 declares the given emulated network service.
    pub fn has_service(&self, kind: &str) -> bool {
        self.nics
            .iter()
            .filter(|n| n.device_number == 0)
            .any(|n| n.network.network_services.iter().any(|s| s.kind == kind))
    }

    pub fn is_system(&self) -> bool {
        self.system_container.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Primary address, mac and subnet of the primary nic, when assigned.
    pub fn primary_ip_and_mac(&self) -> Option<(String, String, String)> {
        for nic in &self.nics {
            for ip in &nic.ip_addresses {
                if ip.role == "primary" {
                    let subnet = format!("{}/{}", ip.subnet.network_address, ip.subnet.cidr_size);
                    return Some((ip.address.clone(), nic.mac_address.clone(), subnet));
                }
            }
        }
        None
    }
}

/// The fields bag: everything the control plane knows about the desired
/// container configuration that is not identity or topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceFields {
    pub image_uuid: String,
    pub command: Command,
    /// Legacy: appended to a whitespace-split string command.
    pub command_args: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_dir: String,
    pub entry_point: Vec<String>,
    pub tty: bool,
    pub stdin_open: bool,
    pub domain_name: String,
    pub stop_signal: String,
    pub user: String,
    pub labels: BTreeMap<String, String>,
    pub privileged: bool,
    pub read_only: bool,
    pub publish_all_ports: bool,
    pub data_volumes: Vec<String>,
    pub volume_driver: String,
    pub blkio_device_options: BTreeMap<String, DeviceOptions>,
    pub extra_hosts: Vec<String>,
    pub security_opt: Vec<String>,
    pub devices: Vec<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub dns_opt: Vec<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
    pub group_add: Vec<String>,
    pub pid_mode: String,
    pub ipc_mode: String,
    pub uts: String,
    pub log_config: Option<LogConfig>,
    pub restart_policy: Option<RestartPolicy>,
    pub cpu_shares: i64,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub cpu_set: String,
    pub cpu_set_mems: String,
    pub blkio_weight: u16,
    pub cgroup_parent: String,
    pub memory: i64,
    pub memory_swap: i64,
    pub memory_swappiness: Option<i64>,
    pub oom_kill_disable: Option<bool>,
    pub oom_score_adj: i64,
    pub shm_size: i64,
    pub pids_limit: i64,
    pub tmpfs: BTreeMap<String, String>,
    pub sysctls: BTreeMap<String, String>,
    pub storage_opt: BTreeMap<String, String>,
    pub ulimits: Vec<Ulimit>,
    pub run_init: Option<bool>,
    pub health_cmd: Vec<String>,
    pub health_interval: i64,
    pub health_timeout: i64,
    pub health_retries: i64,
}

/// The command field arrives either as an argv array or, from older control
/// planes, as a single whitespace-joined string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Argv(Vec<String>),
}

impl Default for Command {
    fn default() -> Self {
        Command::Argv(Vec::new())
    }
}

impl Command {
    pub fn is_empty(&self) -> bool {
        match self {
            Command::Shell(s) => s.trim().is_empty(),
            Command::Argv(v) => v.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogConfig {
    pub driver: String,
    pub config: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestartPolicy {
    pub name: String,
    pub maximum_retry_count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// Per-device block-IO throttles. The device key may be [`crate::DEFAULT_DISK`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceOptions {
    pub read_iops: u64,
    pub write_iops: u64,
    pub read_bps: u64,
    pub write_bps: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProcessData {
    /// The instance's state is already satisfied externally; the reconciler
    /// must not touch its container.
    #[serde(alias = "containerNoOpEvent")]
    pub no_op: bool,
    /// Stop timeout in seconds, when the operation takes one.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Host {
    pub id: i64,
    pub uuid: String,
    pub name: String,
}

/// One network attachment. Device number 0 is the primary nic and decides the
/// engine network mode.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Nic {
    pub mac_address: String,
    pub device_number: i64,
    pub ip_addresses: Vec<IpAddress>,
    pub network: Network,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpAddress {
    pub address: String,
    pub role: String,
    pub subnet: Subnet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Subnet {
    pub cidr_size: i64,
    pub network_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Network {
    pub name: String,
    /// Selects the engine network mode: dockerHost, dockerNone,
    /// dockerContainer, anything else means the default bridge.
    pub kind: String,
    pub network_services: Vec<NetworkService>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkService {
    pub kind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Port {
    pub protocol: String,
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub bind_address: Option<String>,
}

/// Reference to another instance for discovery-env synthesis.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Link {
    pub link_name: String,
    pub target_instance: Instance,
    pub ports: Vec<LinkPort>,
    /// Alternate names the target is known by ("{stack}_{service}" style).
    pub instance_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LinkPort {
    pub protocol: String,
    pub private_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IpsecEndpoint {
    pub nat: u16,
    pub isakmp: u16,
}

/// Subset of the target container's engine config carried on link targets so
/// their environment can be re-exported to the linking container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InspectSnapshot {
    pub config: InspectConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct InspectConfig {
    pub env: Vec<String>,
}

/// Volume descriptor. A non-empty driver plus name marks a managed volume;
/// everything else is a plain bind mount or anonymous volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub uri: String,
    pub device_number: i64,
    pub driver: String,
    pub driver_opts: BTreeMap<String, String>,
    pub is_host_path: bool,
    pub instance: Option<Box<Instance>>,
}

impl Volume {
    /// Managed volumes are provisioned through the engine volume API or a
    /// storage plugin rather than bind-mounted.
    pub fn is_managed(&self) -> bool {
        !self.driver.is_empty() && !self.name.is_empty()
    }
}

/// Host facts gathered at startup: engine version, storage driver and the
/// local disk table used for DEFAULT_DISK substitution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InfoData {
    pub version: String,
    pub storage_driver: String,
    pub disks: Vec<DiskInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiskInfo {
    pub device: String,
    pub iops: u64,
}

impl InfoData {
    /// The highest-IOPS local disk, used to resolve the DEFAULT_DISK sentinel.
    pub fn default_disk(&self) -> Option<&str> {
        self.disks
            .iter()
            .max_by_key(|d| d.iops)
            .map(|d| d.device.as_str())
    }
}
