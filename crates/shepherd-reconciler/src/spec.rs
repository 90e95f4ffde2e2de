//! Container spec builder: a pure transform from Instance × Host × InfoData
//! to the engine create-time configuration.
//!
//! The build is an ordered pipeline of pure steps, each taking the input and
//! the spec so far and returning the next spec. The order is fixed and load
//! bearing: the bulk field copy (including the legacy command merge) runs
//! before every step that appends to `env`, so synthesized variables are
//! never clobbered.

use std::collections::HashMap;

use bollard::container::Config;
use bollard::models::{
    DeviceMapping, HealthConfig, HostConfig, HostConfigLogConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum, ResourcesUlimits, ThrottleDevice,
};
use tracing::{trace, warn};

use shepherd_common::{
    Command, Host, InfoData, Instance, AGENT_ID_LABEL, AGENT_URL_LABEL, DEFAULT_DISK, NAME_LABEL,
    SYSTEM_LABEL, UUID_LABEL,
};

use crate::context::Settings;
use crate::netmode;
use crate::volumes;

/// References resolved against the engine before the pure build runs.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRefs {
    /// Engine ids of the containers named by `data_volumes_from_containers`.
    pub volumes_from_ids: Vec<String>,
    /// Engine id (or derived name) of the network container for
    /// `container:` network mode.
    pub network_container_id: Option<String>,
}

pub struct BuildInput<'a> {
    pub instance: &'a Instance,
    pub host: &'a Host,
    pub info: &'a InfoData,
    pub settings: &'a Settings,
    pub refs: ResolvedRefs,
    /// Raw contents of the host's resolv.conf; empty when unreadable.
    pub resolv_conf: String,
}

#[derive(Debug, Clone, Default)]
pub struct SpecParts {
    pub config: Config<String>,
    pub host_config: HostConfig,
}

impl SpecParts {
    /// Collapse into the engine create payload.
    pub fn into_config(mut self) -> Config<String> {
        self.config.host_config = Some(self.host_config);
        self.config
    }
}

type Step = fn(&BuildInput, SpecParts) -> SpecParts;

/// The fixed build order. `fields` must stay ahead of every env-appending
/// step; `network` must stay behind `ports` and `links` because it clears
/// both for modes that do not support them.
pub const PIPELINE: &[(&str, Step)] = &[
    ("base", base),
    ("fields", fields),
    ("ports", ports),
    ("volumes", data_volumes),
    ("links", native_links),
    ("network", network),
    ("system", system_marker),
    ("control-url", control_url),
    ("resources", resources),
    ("health", health_check),
];

pub fn build_spec(input: &BuildInput) -> SpecParts {
    let mut spec = SpecParts::default();
    for (name, step) in PIPELINE {
        trace!(step = name, "applying spec step");
        spec = step(input, spec);
    }
    spec
}

pub(crate) fn add_label(config: &mut Config<String>, key: &str, value: impl Into<String>) {
    config
        .labels
        .get_or_insert_with(HashMap::new)
        .insert(key.to_string(), value.into());
}

pub(crate) fn append_env<I>(config: &mut Config<String>, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    let env = config.env.get_or_insert_with(Vec::new);
    for (key, value) in vars {
        env.push(format!("{key}={value}"));
    }
}

fn base(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let instance = input.instance;
    spec.host_config.privileged = Some(instance.fields.privileged);
    spec.host_config.readonly_rootfs = Some(instance.fields.read_only);
    spec.host_config.publish_all_ports = Some(instance.fields.publish_all_ports);
    if !instance.hostname.is_empty() {
        spec.config.hostname = Some(instance.hostname.clone());
    }
    add_label(&mut spec.config, UUID_LABEL, &instance.uuid);
    if !instance.name.is_empty() {
        add_label(&mut spec.config, NAME_LABEL, &instance.name);
    }
    spec
}

/// Bulk copy of the fields bag. The legacy string command plus `commandArgs`
/// merge happens here, before anything appends to the environment.
fn fields(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let fields = &input.instance.fields;
    let config = &mut spec.config;

    match &fields.command {
        Command::Argv(argv) if !argv.is_empty() => {
            config.cmd = Some(argv.clone());
        }
        Command::Shell(raw) if !raw.trim().is_empty() => {
            let mut parts: Vec<String> =
                raw.split_whitespace().map(str::to_string).collect();
            parts.extend(fields.command_args.iter().cloned());
            config.cmd = Some(parts);
        }
        _ => {}
    }

    append_env(
        config,
        fields.environment.iter().map(|(k, v)| (k.clone(), v.clone())),
    );

    if !fields.working_dir.is_empty() {
        config.working_dir = Some(fields.working_dir.clone());
    }
    if !fields.entry_point.is_empty() {
        config.entrypoint = Some(fields.entry_point.clone());
    }
    config.tty = Some(fields.tty);
    config.open_stdin = Some(fields.stdin_open);
    if !fields.domain_name.is_empty() {
        config.domainname = Some(fields.domain_name.clone());
    }
    if !fields.stop_signal.is_empty() {
        config.stop_signal = Some(fields.stop_signal.clone());
    }
    if !fields.user.is_empty() {
        config.user = Some(fields.user.clone());
    }
    for (key, value) in &fields.labels {
        add_label(config, key, value);
    }

    let hc = &mut spec.host_config;
    if !fields.extra_hosts.is_empty() {
        hc.extra_hosts = Some(fields.extra_hosts.clone());
    }
    if !fields.dns.is_empty() {
        hc.dns = Some(fields.dns.clone());
    }
    if !fields.dns_search.is_empty() {
        hc.dns_search = Some(fields.dns_search.clone());
    }
    if !fields.dns_opt.is_empty() {
        hc.dns_options = Some(fields.dns_opt.clone());
    }
    if !fields.cap_add.is_empty() {
        hc.cap_add = Some(fields.cap_add.clone());
    }
    if !fields.cap_drop.is_empty() {
        hc.cap_drop = Some(fields.cap_drop.clone());
    }
    if !fields.group_add.is_empty() {
        hc.group_add = Some(fields.group_add.clone());
    }
    if !fields.security_opt.is_empty() {
        hc.security_opt = Some(fields.security_opt.clone());
    }
    if !fields.devices.is_empty() {
        hc.devices = Some(fields.devices.iter().map(|d| device_mapping(d)).collect());
    }
    if let Some(log_config) = &fields.log_config {
        hc.log_config = Some(HostConfigLogConfig {
            typ: Some(log_config.driver.clone()),
            config: Some(log_config.config.clone().into_iter().collect()),
        });
    }
    if let Some(policy) = &fields.restart_policy {
        hc.restart_policy = Some(RestartPolicy {
            name: restart_policy_name(&policy.name),
            maximum_retry_count: Some(policy.maximum_retry_count),
        });
    }
    if !fields.pid_mode.is_empty() {
        hc.pid_mode = Some(fields.pid_mode.clone());
    }
    if !fields.ipc_mode.is_empty() {
        hc.ipc_mode = Some(fields.ipc_mode.clone());
    }
    if !fields.uts.is_empty() {
        hc.uts_mode = Some(fields.uts.clone());
    }
    if !fields.cgroup_parent.is_empty() {
        hc.cgroup_parent = Some(fields.cgroup_parent.clone());
    }
    if !fields.cpu_set.is_empty() {
        hc.cpuset_cpus = Some(fields.cpu_set.clone());
    }
    if !fields.cpu_set_mems.is_empty() {
        hc.cpuset_mems = Some(fields.cpu_set_mems.clone());
    }
    if !fields.volume_driver.is_empty() {
        hc.volume_driver = Some(fields.volume_driver.clone());
    }
    if fields.blkio_weight != 0 {
        hc.blkio_weight = Some(fields.blkio_weight);
    }
    if fields.cpu_period != 0 {
        hc.cpu_period = Some(fields.cpu_period);
    }
    if fields.cpu_quota != 0 {
        hc.cpu_quota = Some(fields.cpu_quota);
    }
    if fields.memory != 0 {
        hc.memory = Some(fields.memory);
    }
    if fields.memory_swap != 0 {
        hc.memory_swap = Some(fields.memory_swap);
    }
    if fields.memory_swappiness.is_some() {
        hc.memory_swappiness = fields.memory_swappiness;
    }
    if fields.oom_kill_disable.is_some() {
        hc.oom_kill_disable = fields.oom_kill_disable;
    }
    if fields.oom_score_adj != 0 {
        hc.oom_score_adj = Some(fields.oom_score_adj);
    }
    if fields.shm_size != 0 {
        hc.shm_size = Some(fields.shm_size);
    }
    if fields.pids_limit != 0 {
        hc.pids_limit = Some(fields.pids_limit);
    }
    if !fields.tmpfs.is_empty() {
        hc.tmpfs = Some(fields.tmpfs.clone().into_iter().collect());
    }
    if !fields.sysctls.is_empty() {
        hc.sysctls = Some(fields.sysctls.clone().into_iter().collect());
    }
    if !fields.storage_opt.is_empty() {
        hc.storage_opt = Some(fields.storage_opt.clone().into_iter().collect());
    }
    if !fields.ulimits.is_empty() {
        hc.ulimits = Some(
            fields
                .ulimits
                .iter()
                .map(|u| ResourcesUlimits {
                    name: Some(u.name.clone()),
                    soft: Some(u.soft),
                    hard: Some(u.hard),
                })
                .collect(),
        );
    }
    if fields.run_init.is_some() {
        hc.init = fields.run_init;
    }

    spec
}

fn ports(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let mut exposed: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();

    for port in &input.instance.ports {
        if port.private_port == 0 {
            continue;
        }
        let key = format!("{}/{}", port.private_port, port.protocol);
        let binding = PortBinding {
            host_ip: port.bind_address.clone(),
            host_port: port.public_port.map(|p| p.to_string()),
        };
        bindings
            .entry(key.clone())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(binding);
        exposed.insert(key, HashMap::new());
    }

    if !exposed.is_empty() {
        spec.config.exposed_ports = Some(exposed);
    }
    if !bindings.is_empty() {
        spec.host_config.port_bindings = Some(bindings);
    }
    spec
}

fn data_volumes(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let parsed = volumes::parse_data_volumes(&input.instance.fields.data_volumes);
    if !parsed.anonymous.is_empty() {
        spec.config.volumes = Some(
            parsed
                .anonymous
                .into_iter()
                .map(|path| (path, HashMap::new()))
                .collect(),
        );
    }
    if !parsed.binds.is_empty() {
        spec.host_config.binds = Some(parsed.binds);
    }
    if !input.refs.volumes_from_ids.is_empty() {
        spec.host_config.volumes_from = Some(input.refs.volumes_from_ids.clone());
    }
    spec
}

fn native_links(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let links: Vec<String> = input
        .instance
        .instance_links
        .iter()
        .filter(|link| !link.target_instance.uuid.is_empty())
        .map(|link| format!("{}:{}", link.target_instance.uuid, link.link_name))
        .collect();
    if !input.instance.instance_links.is_empty() {
        spec.host_config.links = Some(links);
    }
    spec
}

fn network(input: &BuildInput, spec: SpecParts) -> SpecParts {
    netmode::apply(input, spec)
}

fn system_marker(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let instance = input.instance;
    if !instance.is_system() {
        return spec;
    }
    if let Some(system) = &instance.system_container {
        add_label(&mut spec.config, SYSTEM_LABEL, system);
    }
    // system containers inherit the host's proxy settings
    append_env(
        &mut spec.config,
        input
            .settings
            .host_proxy_env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone())),
    );
    spec
}

/// Tell agent containers how to reach the control plane. A localhost-hosted
/// control plane cannot be dialed from inside the container's network
/// namespace, so its pieces are injected separately along with a local-agent
/// flag and the host-side proxy port.
fn control_url(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let instance = input.instance;
    if instance.agent_id == 0 && !instance.fields.labels.contains_key(AGENT_URL_LABEL) {
        return spec;
    }

    add_label(&mut spec.config, AGENT_ID_LABEL, instance.agent_id.to_string());

    let raw = input.settings.control_url.as_str();
    if raw.is_empty() {
        return spec;
    }
    match url::Url::parse(raw) {
        Ok(parsed) => {
            if parsed.host_str().is_some_and(|h| h.contains("localhost")) {
                append_env(
                    &mut spec.config,
                    [
                        ("SHEPHERD_AGENT_INSTANCE".to_string(), "true".to_string()),
                        (
                            "SHEPHERD_CONFIG_URL_SCHEME".to_string(),
                            parsed.scheme().to_string(),
                        ),
                        (
                            "SHEPHERD_CONFIG_URL_PATH".to_string(),
                            parsed.path().to_string(),
                        ),
                        (
                            "SHEPHERD_CONFIG_URL_PORT".to_string(),
                            input.settings.api_proxy_port.to_string(),
                        ),
                    ],
                );
            } else {
                append_env(
                    &mut spec.config,
                    [
                        ("SHEPHERD_CONFIG_URL".to_string(), raw.to_string()),
                        ("SHEPHERD_URL".to_string(), raw.to_string()),
                    ],
                );
            }
        }
        Err(err) => warn!(url = raw, error = %err, "unparseable control url, not injecting"),
    }
    spec
}

fn resources(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let instance = input.instance;
    if instance.memory_reservation != 0 {
        spec.host_config.memory_reservation = Some(instance.memory_reservation);
    }

    // Integer math in this order avoids (milli / 1000) * 1024 truncating
    // small reservations to zero.
    let mut shares = instance.fields.cpu_shares;
    if instance.milli_cpu_reservation != 0 {
        shares = instance.milli_cpu_reservation * 1024 / 1000;
    }
    // kernel minimum
    if shares < 2 {
        shares = 2;
    }
    spec.host_config.cpu_shares = Some(shares);

    apply_device_options(input, &mut spec.host_config);
    spec
}

fn apply_device_options(input: &BuildInput, hc: &mut HostConfig) {
    let mut read_iops = Vec::new();
    let mut write_iops = Vec::new();
    let mut read_bps = Vec::new();
    let mut write_bps = Vec::new();

    for (device, options) in &input.instance.fields.blkio_device_options {
        let device = if device == DEFAULT_DISK {
            match input.info.default_disk() {
                Some(disk) => disk.to_string(),
                None => {
                    warn!(?options, "couldn't find default disk, not setting device options");
                    continue;
                }
            }
        } else {
            device.clone()
        };

        let throttle = |rate: u64| ThrottleDevice {
            path: Some(device.clone()),
            rate: Some(rate as i64),
        };
        if options.read_iops != 0 {
            read_iops.push(throttle(options.read_iops));
        }
        if options.write_iops != 0 {
            write_iops.push(throttle(options.write_iops));
        }
        if options.read_bps != 0 {
            read_bps.push(throttle(options.read_bps));
        }
        if options.write_bps != 0 {
            write_bps.push(throttle(options.write_bps));
        }
    }

    if !read_iops.is_empty() {
        hc.blkio_device_read_iops = Some(read_iops);
    }
    if !write_iops.is_empty() {
        hc.blkio_device_write_iops = Some(write_iops);
    }
    if !read_bps.is_empty() {
        hc.blkio_device_read_bps = Some(read_bps);
    }
    if !write_bps.is_empty() {
        hc.blkio_device_write_bps = Some(write_bps);
    }
}

fn health_check(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let fields = &input.instance.fields;
    if fields.health_cmd.is_empty() {
        return spec;
    }
    const NANOS_PER_SEC: i64 = 1_000_000_000;
    spec.config.healthcheck = Some(HealthConfig {
        test: Some(fields.health_cmd.clone()),
        interval: Some(fields.health_interval * NANOS_PER_SEC),
        timeout: Some(fields.health_timeout * NANOS_PER_SEC),
        retries: Some(fields.health_retries),
        ..Default::default()
    });
    spec
}

fn device_mapping(raw: &str) -> DeviceMapping {
    let mut parts = raw.split(':');
    let host = parts.next().unwrap_or_default().to_string();
    let container = parts.next().map(str::to_string).unwrap_or_else(|| host.clone());
    let permissions = parts.next().unwrap_or("rwm").to_string();
    DeviceMapping {
        path_on_host: Some(host),
        path_in_container: Some(container),
        cgroup_permissions: Some(permissions),
    }
}

fn restart_policy_name(name: &str) -> Option<RestartPolicyNameEnum> {
    match name {
        "always" => Some(RestartPolicyNameEnum::ALWAYS),
        "unless-stopped" => Some(RestartPolicyNameEnum::UNLESS_STOPPED),
        "on-failure" => Some(RestartPolicyNameEnum::ON_FAILURE),
        "no" => Some(RestartPolicyNameEnum::NO),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_common::DeviceOptions;

    pub(crate) fn input_for<'a>(
        instance: &'a Instance,
        host: &'a Host,
        info: &'a InfoData,
        settings: &'a Settings,
    ) -> BuildInput<'a> {
        BuildInput {
            instance,
            host,
            info,
            settings,
            refs: ResolvedRefs::default(),
            resolv_conf: String::new(),
        }
    }

    fn build(instance: &Instance) -> SpecParts {
        let host = Host::default();
        let info = InfoData::default();
        let settings = Settings::default();
        build_spec(&input_for(instance, &host, &info, &settings))
    }

    #[test]
    fn milli_cpu_reservation_overrides_explicit_shares() {
        let mut instance = Instance::default();
        instance.fields.cpu_shares = 100;
        instance.milli_cpu_reservation = 200;
        let spec = build(&instance);
        assert_eq!(spec.host_config.cpu_shares, Some(204));
    }

    #[test]
    fn cpu_shares_clamp_to_kernel_minimum() {
        let mut instance = Instance::default();
        instance.milli_cpu_reservation = 1;
        let spec = build(&instance);
        assert_eq!(spec.host_config.cpu_shares, Some(2));
    }

    #[test]
    fn legacy_command_merges_args_before_env_synthesis() {
        let mut instance = Instance::default();
        instance.fields.command = Command::Shell("redis-server --protected-mode no".into());
        instance.fields.command_args = vec!["--appendonly".into(), "yes".into()];
        let spec = build(&instance);
        assert_eq!(
            spec.config.cmd,
            Some(vec![
                "redis-server".to_string(),
                "--protected-mode".to_string(),
                "no".to_string(),
                "--appendonly".to_string(),
                "yes".to_string(),
            ])
        );
    }

    #[test]
    fn synthesized_env_survives_the_field_copy() {
        let mut instance = Instance::default();
        instance.uuid = "i-1".into();
        instance.agent_id = 7;
        instance
            .fields
            .environment
            .insert("FROM_FIELDS".into(), "1".into());
        let host = Host::default();
        let info = InfoData::default();
        let settings = Settings {
            control_url: "https://control.example.com/v1".into(),
            ..Default::default()
        };
        let spec = build_spec(&input_for(&instance, &host, &info, &settings));
        let env = spec.config.env.unwrap();
        let from_fields = env.iter().position(|e| e == "FROM_FIELDS=1").unwrap();
        let injected = env
            .iter()
            .position(|e| e == "SHEPHERD_URL=https://control.example.com/v1")
            .unwrap();
        assert!(from_fields < injected);
    }

    #[test]
    fn localhost_control_plane_is_not_dialed_directly() {
        let mut instance = Instance::default();
        instance.agent_id = 7;
        let host = Host::default();
        let info = InfoData::default();
        let settings = Settings {
            control_url: "http://localhost:8080/v1".into(),
            api_proxy_port: 9342,
            ..Default::default()
        };
        let spec = build_spec(&input_for(&instance, &host, &info, &settings));
        let env = spec.config.env.unwrap();
        assert!(env.contains(&"SHEPHERD_AGENT_INSTANCE=true".to_string()));
        assert!(env.contains(&"SHEPHERD_CONFIG_URL_SCHEME=http".to_string()));
        assert!(env.contains(&"SHEPHERD_CONFIG_URL_PATH=/v1".to_string()));
        assert!(env.contains(&"SHEPHERD_CONFIG_URL_PORT=9342".to_string()));
        assert!(!env.iter().any(|e| e.starts_with("SHEPHERD_URL=")));
    }

    #[test]
    fn default_disk_sentinel_resolves_to_fastest_disk() {
        let mut instance = Instance::default();
        instance.fields.blkio_device_options.insert(
            DEFAULT_DISK.to_string(),
            DeviceOptions { read_iops: 2000, ..Default::default() },
        );
        let host = Host::default();
        let info = InfoData {
            disks: vec![
                shepherd_common::model::DiskInfo { device: "/dev/sda".into(), iops: 300 },
                shepherd_common::model::DiskInfo { device: "/dev/nvme0n1".into(), iops: 8000 },
            ],
            ..Default::default()
        };
        let settings = Settings::default();
        let spec = build_spec(&input_for(&instance, &host, &info, &settings));
        let throttles = spec.host_config.blkio_device_read_iops.unwrap();
        assert_eq!(throttles[0].path.as_deref(), Some("/dev/nvme0n1"));
        assert_eq!(throttles[0].rate, Some(2000));
    }

    #[test]
    fn default_disk_sentinel_without_disks_is_skipped() {
        let mut instance = Instance::default();
        instance.fields.blkio_device_options.insert(
            DEFAULT_DISK.to_string(),
            DeviceOptions { write_bps: 1_000_000, ..Default::default() },
        );
        let spec = build(&instance);
        assert!(spec.host_config.blkio_device_write_bps.is_none());
    }

    #[test]
    fn health_check_translates_to_engine_units() {
        let mut instance = Instance::default();
        instance.fields.health_cmd = vec!["CMD".into(), "curl -f localhost".into()];
        instance.fields.health_interval = 5;
        instance.fields.health_timeout = 3;
        instance.fields.health_retries = 4;
        let spec = build(&instance);
        let health = spec.config.healthcheck.unwrap();
        assert_eq!(health.interval, Some(5_000_000_000));
        assert_eq!(health.timeout, Some(3_000_000_000));
        assert_eq!(health.retries, Some(4));
    }

    #[test]
    fn proxy_env_only_reaches_system_containers() {
        let mut settings = Settings::default();
        settings
            .host_proxy_env
            .insert("http_proxy".into(), "http://proxy:3128".into());
        let host = Host::default();
        let info = InfoData::default();

        let plain = Instance::default();
        let spec = build_spec(&input_for(&plain, &host, &info, &settings));
        assert!(!spec
            .config
            .env
            .unwrap_or_default()
            .iter()
            .any(|e| e.starts_with("http_proxy=")));

        let mut system = Instance::default();
        system.system_container = Some("NetworkAgent".into());
        let spec = build_spec(&input_for(&system, &host, &info, &settings));
        assert!(spec
            .config
            .env
            .unwrap()
            .contains(&"http_proxy=http://proxy:3128".to_string()));
    }
}
