// Re-export dependencies used in public interfaces of common types
pub use serde::{Deserialize, Serialize};
pub use uuid;

pub mod event;
pub mod model;

pub use event::{EventDecodeError, EventEnvelope, EventReply, EventRequest, PullParams};
pub use model::{
    Command, DeviceOptions, DiskInfo, Host, InfoData, InspectConfig, InspectSnapshot, Instance,
    InstanceFields, IpAddress, IpsecEndpoint, Link, LinkPort, LogConfig, Network, NetworkService,
    Nic, Port, ProcessData, RestartPolicy, Subnet, Ulimit, Volume,
};

/// Label stamped on every container this agent creates; the primary lookup key.
pub const UUID_LABEL: &str = "io.shepherd.container.uuid";
pub const NAME_LABEL: &str = "io.shepherd.container.name";
pub const AGENT_ID_LABEL: &str = "io.shepherd.container.agent_id";
pub const SYSTEM_LABEL: &str = "io.shepherd.container.system";
pub const PULL_IMAGE_LABEL: &str = "io.shepherd.container.pull_image";
pub const MAC_LABEL: &str = "io.shepherd.container.mac";
pub const IP_LABEL: &str = "io.shepherd.container.ip";
pub const AGENT_URL_LABEL: &str = "io.shepherd.container.agent.url";

/// Search-domain suffix owned by the cluster DNS; entries ending in it are
/// internal and may be supplemented from the host's resolv.conf.
pub const INTERNAL_DNS_SUFFIX: &str = "shepherd.internal";

/// Value prefix used by link-emulation `*_NAME` variables.
pub const LINK_NAME_PREFIX: &str = "/shepherd/";

/// Sentinel device name in blkio options, replaced by the host's fastest disk.
pub const DEFAULT_DISK: &str = "DEFAULT_DISK";
