//! Network mode resolution and the layered network behaviors: MAC/IP
//! labeling, port-map clearing, link emulation, the IPsec overlay ports and
//! DNS search scaffolding.

use std::collections::HashMap;

use tracing::warn;

use shepherd_common::{Instance, INTERNAL_DNS_SUFFIX, IP_LABEL, MAC_LABEL};

use crate::links;
use crate::spec::{add_label, append_env, BuildInput, SpecParts};

/// What the chosen network mode supports. Modes that share another namespace
/// can neither publish ports nor set a hostname.
#[derive(Debug, Clone, Copy)]
pub struct NetworkCapabilities {
    pub ports: bool,
    pub hostname: bool,
}

impl Default for NetworkCapabilities {
    fn default() -> Self {
        NetworkCapabilities { ports: true, hostname: true }
    }
}

/// The network step of the spec pipeline. Order within the step matters:
/// mode selection decides the capabilities everything else keys off.
pub fn apply(input: &BuildInput, mut spec: SpecParts) -> SpecParts {
    let caps = apply_network_mode(input, &mut spec);
    apply_mac_and_ip(input.instance, &mut spec, caps);
    clear_unsupported_ports(&mut spec, caps);
    apply_link_emulation(input.instance, &mut spec);
    apply_ipsec(input.instance, input.host.id, &mut spec);
    apply_dns_search(input, &mut spec);
    spec
}

/// Only host, none and container modes are recognized; everything else is
/// the default bridge.
fn apply_network_mode(input: &BuildInput, spec: &mut SpecParts) -> NetworkCapabilities {
    let mut caps = NetworkCapabilities::default();
    let Some(nic) = input.instance.nics.first() else {
        return caps;
    };
    match nic.network.kind.as_str() {
        "dockerHost" => {
            caps = NetworkCapabilities { ports: false, hostname: false };
            spec.config.network_disabled = Some(false);
            spec.host_config.network_mode = Some("host".to_string());
            spec.host_config.links = None;
        }
        "dockerNone" => {
            caps.ports = false;
            spec.config.network_disabled = Some(true);
            spec.host_config.network_mode = Some("none".to_string());
            spec.host_config.links = None;
        }
        "dockerContainer" => {
            caps = NetworkCapabilities { ports: false, hostname: false };
            let id = input
                .refs
                .network_container_id
                .clone()
                .or_else(|| input.instance.network_container.as_ref().map(|c| c.uuid.clone()));
            if let Some(id) = id {
                spec.host_config.network_mode = Some(format!("container:{id}"));
                spec.host_config.links = None;
            }
        }
        _ => {}
    }
    caps
}

/// The MAC comes from the lowest-device-number nic and only applies when the
/// mode supports it. The primary IP is exported as a label only; a separate
/// collaborator injects it into the container.
fn apply_mac_and_ip(instance: &Instance, spec: &mut SpecParts, caps: NetworkCapabilities) {
    let mac = instance
        .nics
        .iter()
        .min_by_key(|nic| nic.device_number)
        .map(|nic| nic.mac_address.clone())
        .unwrap_or_default();
    if !mac.is_empty() {
        if caps.ports && caps.hostname {
            spec.config.mac_address = Some(mac.clone());
        }
        add_label(&mut spec.config, MAC_LABEL, mac);
    }

    if !caps.hostname {
        spec.config.hostname = None;
    }

    if let Some(nic) = instance.nics.first() {
        let primary = nic.ip_addresses.iter().find(|ip| {
            ip.role == "primary" && !ip.address.is_empty() && ip.subnet.cidr_size != 0
        });
        if let Some(ip) = primary {
            add_label(
                &mut spec.config,
                IP_LABEL,
                format!("{}/{}", ip.address, ip.subnet.cidr_size),
            );
        }
    }
}

/// The engine rejects port configuration for modes that don't support it.
fn clear_unsupported_ports(spec: &mut SpecParts, caps: NetworkCapabilities) {
    if !caps.ports {
        spec.host_config.publish_all_ports = Some(false);
        spec.config.exposed_ports = None;
        spec.host_config.port_bindings = None;
    }
}

/// Suppress native linking and synthesize discovery env instead. Containers
/// managed outside the control plane keep their native link configuration:
/// on restart we could not rebuild it.
fn apply_link_emulation(instance: &Instance, spec: &mut SpecParts) {
    if !instance.has_service("linkService") || instance.native_container {
        return;
    }
    spec.host_config.links = None;
    let env = links::link_env(&instance.instance_links);
    if !env.is_empty() {
        append_env(&mut spec.config, env);
    }
}

/// A designated network agent declaring the IPsec tunnel service exposes UDP
/// 500/4500, bound per the host-keyed endpoint table, merged into whatever
/// port map the spec already carries.
fn apply_ipsec(instance: &Instance, host_id: i64, spec: &mut SpecParts) {
    let network_agent = match instance.system_container.as_deref() {
        None | Some("") | Some("NetworkAgent") => true,
        Some(_) => false,
    };
    if !network_agent || !instance.has_service("ipsecTunnelService") {
        return;
    }
    let Some(endpoint) = instance.ipsec.get(&host_id.to_string()) else {
        return;
    };

    let bindings = spec.host_config.port_bindings.get_or_insert_with(HashMap::new);
    for (key, host_port) in [("500/udp", endpoint.isakmp), ("4500/udp", endpoint.nat)] {
        let binding = bollard::models::PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: Some(host_port.to_string()),
        };
        bindings
            .entry(key.to_string())
            .or_insert_with(|| Some(Vec::new()))
            .get_or_insert_with(Vec::new)
            .push(binding);
        spec.config
            .exposed_ports
            .get_or_insert_with(HashMap::new)
            .insert(key.to_string(), HashMap::new());
    }
}

fn apply_dns_search(input: &BuildInput, spec: &mut SpecParts) {
    if let Some(existing) = &spec.host_config.dns_search {
        let scaffolded = scaffold_dns_search(existing, &input.resolv_conf);
        spec.host_config.dns_search = Some(scaffolded);
    }
}

/// When every configured search entry is cluster-internal, the host's own
/// search domains are prepended so in-container lookups still resolve host
/// names. Several `search` lines may appear; the last one wins.
pub fn scaffold_dns_search(existing: &[String], resolv_conf: &str) -> Vec<String> {
    if existing.is_empty() {
        return existing.to_vec();
    }
    let all_internal = existing.iter().all(|s| s.ends_with(INTERNAL_DNS_SUFFIX));
    if !all_internal {
        return existing.to_vec();
    }

    let mut host_domains: Vec<&str> = Vec::new();
    for line in resolv_conf.lines() {
        if let Some(rest) = line.strip_prefix("search") {
            host_domains = rest.split_whitespace().collect();
        }
    }

    let mut result: Vec<String> = Vec::new();
    for domain in host_domains {
        if !result.iter().any(|d| d == domain) && !existing.iter().any(|d| d == domain) {
            result.push(domain.to_string());
        }
    }
    result.extend(existing.iter().cloned());
    result
}

/// iptables argument vectors marking DNS traffic from this container so the
/// cluster DNS recursor can tell clients apart. The mark folds the last two
/// octets of the primary address.
pub fn dns_redirect_rules(instance: &Instance) -> Option<[Vec<String>; 2]> {
    if !instance.has_service("dnsService") || instance.kind == "virtualMachine" {
        return None;
    }
    let (ip, mac, subnet) = instance.primary_ip_and_mac()?;
    let octets: Vec<&str> = ip.split('.').collect();
    if octets.len() != 4 {
        return None;
    }
    let third: u32 = octets[2].parse().ok()?;
    let fourth: u32 = octets[3].parse().ok()?;
    let mark = (third * 1000 + fourth).to_string();

    let owned = |args: &[&str]| args.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    Some([
        owned(&[
            "iptables", "-w", "-t", "nat", "-A", "SHEPHERD_PREROUTING", "!", "-s", &subnet,
            "-d", "169.254.169.250", "-m", "mac", "--mac-source", &mac, "-j", "MARK",
            "--set-mark", &mark,
        ]),
        owned(&[
            "iptables", "-w", "-t", "nat", "-A", "SHEPHERD_POSTROUTING", "!", "-s", &subnet,
            "-d", "169.254.169.250", "-m", "mark", "--mark", &mark, "-j", "SNAT", "--to", &ip,
        ]),
    ])
}

/// Best-effort execution of the DNS redirect rules; a failure never fails
/// activation.
pub fn install_dns_redirect(instance: &Instance) {
    let Some(rules) = dns_redirect_rules(instance) else {
        return;
    };
    for rule in rules {
        let output = std::process::Command::new(&rule[0]).args(&rule[1..]).output();
        match output {
            Ok(out) if out.status.success() => {}
            Ok(out) => warn!(
                rule = rule.join(" "),
                stderr = %String::from_utf8_lossy(&out.stderr),
                "dns redirect rule failed"
            ),
            Err(err) => warn!(rule = rule.join(" "), error = %err, "dns redirect rule not run"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Settings;
    use crate::spec::{build_spec, BuildInput, ResolvedRefs};
    use shepherd_common::{
        Host, InfoData, IpAddress, IpsecEndpoint, Network, NetworkService, Nic, Port, Subnet,
    };

    fn instance_with_kind(kind: &str) -> Instance {
        let mut instance = Instance::default();
        instance.uuid = "i-1".into();
        instance.hostname = "web-1".into();
        instance.ports.push(Port {
            protocol: "tcp".into(),
            private_port: 8080,
            public_port: Some(80),
            bind_address: None,
        });
        instance.nics.push(Nic {
            device_number: 0,
            mac_address: "02:42:ac:11:00:02".into(),
            network: Network { kind: kind.into(), ..Default::default() },
            ..Default::default()
        });
        instance
    }

    fn build(instance: &Instance) -> crate::spec::SpecParts {
        build_with(instance, String::new())
    }

    fn build_with(instance: &Instance, resolv_conf: String) -> crate::spec::SpecParts {
        let host = Host { id: 3, ..Default::default() };
        let info = InfoData::default();
        let settings = Settings::default();
        let input = BuildInput {
            instance,
            host: &host,
            info: &info,
            settings: &settings,
            refs: ResolvedRefs::default(),
            resolv_conf,
        };
        build_spec(&input)
    }

    #[test]
    fn host_kind_maps_to_host_mode_without_ports_or_links() {
        let mut instance = instance_with_kind("dockerHost");
        instance.instance_links.push(shepherd_common::Link {
            link_name: "db".into(),
            target_instance: Instance { uuid: "i-db".into(), ..Default::default() },
            ..Default::default()
        });
        let spec = build(&instance);
        assert_eq!(spec.host_config.network_mode.as_deref(), Some("host"));
        assert!(spec.config.exposed_ports.is_none());
        assert!(spec.host_config.port_bindings.is_none());
        assert!(spec.host_config.links.is_none());
        // hostname unsupported in the host namespace
        assert!(spec.config.hostname.is_none());
    }

    #[test]
    fn none_kind_disables_networking_but_keeps_hostname() {
        let spec = build(&instance_with_kind("dockerNone"));
        assert_eq!(spec.host_config.network_mode.as_deref(), Some("none"));
        assert_eq!(spec.config.network_disabled, Some(true));
        assert!(spec.host_config.port_bindings.is_none());
        assert_eq!(spec.config.hostname.as_deref(), Some("web-1"));
    }

    #[test]
    fn container_kind_joins_the_resolved_namespace() {
        let instance = instance_with_kind("dockerContainer");
        let host = Host::default();
        let info = InfoData::default();
        let settings = Settings::default();
        let input = BuildInput {
            instance: &instance,
            host: &host,
            info: &info,
            settings: &settings,
            refs: ResolvedRefs {
                network_container_id: Some("ctr-9".into()),
                ..Default::default()
            },
            resolv_conf: String::new(),
        };
        let spec = build_spec(&input);
        assert_eq!(spec.host_config.network_mode.as_deref(), Some("container:ctr-9"));
    }

    #[test]
    fn bridge_kind_keeps_ports_and_mac() {
        let spec = build(&instance_with_kind("bridged"));
        assert!(spec.host_config.network_mode.is_none());
        assert!(spec.config.exposed_ports.is_some());
        assert_eq!(spec.config.mac_address.as_deref(), Some("02:42:ac:11:00:02"));
    }

    #[test]
    fn mac_comes_from_lowest_device_number() {
        let mut instance = instance_with_kind("bridged");
        instance.nics.insert(
            0,
            Nic {
                device_number: 2,
                mac_address: "02:42:ac:11:00:99".into(),
                ..Default::default()
            },
        );
        let spec = build(&instance);
        assert_eq!(spec.config.mac_address.as_deref(), Some("02:42:ac:11:00:02"));
    }

    #[test]
    fn primary_ip_becomes_a_label_only() {
        let mut instance = instance_with_kind("bridged");
        instance.nics[0].ip_addresses.push(IpAddress {
            address: "10.42.1.5".into(),
            role: "primary".into(),
            subnet: Subnet { cidr_size: 16, network_address: "10.42.0.0".into() },
        });
        let spec = build(&instance);
        let labels = spec.config.labels.unwrap();
        assert_eq!(labels.get(IP_LABEL).map(String::as_str), Some("10.42.1.5/16"));
        assert!(!spec
            .config
            .env
            .unwrap_or_default()
            .iter()
            .any(|e| e.contains("10.42.1.5")));
    }

    #[test]
    fn ipsec_ports_merge_into_existing_bindings() {
        let mut instance = instance_with_kind("bridged");
        instance.system_container = Some("NetworkAgent".into());
        instance.nics[0]
            .network
            .network_services
            .push(NetworkService { kind: "ipsecTunnelService".into() });
        instance
            .ipsec
            .insert("3".into(), IpsecEndpoint { nat: 4500, isakmp: 500 });
        let spec = build(&instance);
        let bindings = spec.host_config.port_bindings.unwrap();
        assert!(bindings.contains_key("8080/tcp"));
        let isakmp = bindings["500/udp"].as_ref().unwrap();
        assert_eq!(isakmp[0].host_port.as_deref(), Some("500"));
        let nat = bindings["4500/udp"].as_ref().unwrap();
        assert_eq!(nat[0].host_port.as_deref(), Some("4500"));
        let exposed = spec.config.exposed_ports.unwrap();
        assert!(exposed.contains_key("500/udp") && exposed.contains_key("4500/udp"));
    }

    #[test]
    fn ipsec_requires_endpoint_for_this_host() {
        let mut instance = instance_with_kind("bridged");
        instance.system_container = Some("NetworkAgent".into());
        instance.nics[0]
            .network
            .network_services
            .push(NetworkService { kind: "ipsecTunnelService".into() });
        instance
            .ipsec
            .insert("99".into(), IpsecEndpoint { nat: 4500, isakmp: 500 });
        let spec = build(&instance);
        assert!(!spec.host_config.port_bindings.unwrap().contains_key("500/udp"));
    }

    #[test]
    fn internal_only_search_is_prepended_from_resolv_conf() {
        let existing = vec![
            "svc.shepherd.internal".to_string(),
            "shepherd.internal".to_string(),
        ];
        let resolv = "nameserver 1.1.1.1\nsearch old.example.com\nsearch corp.example.com lab.example.com\n";
        let result = scaffold_dns_search(&existing, resolv);
        assert_eq!(
            result,
            vec![
                "corp.example.com".to_string(),
                "lab.example.com".to_string(),
                "svc.shepherd.internal".to_string(),
                "shepherd.internal".to_string(),
            ]
        );
    }

    #[test]
    fn external_search_entry_leaves_list_untouched() {
        let existing = vec![
            "svc.shepherd.internal".to_string(),
            "example.com".to_string(),
        ];
        let result = scaffold_dns_search(&existing, "search corp.example.com\n");
        assert_eq!(result, existing);
    }

    #[test]
    fn dns_search_scaffolding_applies_in_the_pipeline() {
        let mut instance = instance_with_kind("bridged");
        instance.fields.dns_search = vec!["shepherd.internal".to_string()];
        let spec = build_with(&instance, "search corp.example.com\n".to_string());
        assert_eq!(
            spec.host_config.dns_search.unwrap(),
            vec!["corp.example.com".to_string(), "shepherd.internal".to_string()]
        );
    }

    #[test]
    fn dns_redirect_rules_fold_the_mark() {
        let mut instance = instance_with_kind("bridged");
        instance.nics[0]
            .network
            .network_services
            .push(NetworkService { kind: "dnsService".into() });
        instance.nics[0].ip_addresses.push(IpAddress {
            address: "10.42.3.17".into(),
            role: "primary".into(),
            subnet: Subnet { cidr_size: 16, network_address: "10.42.0.0".into() },
        });
        let [prerouting, postrouting] = dns_redirect_rules(&instance).unwrap();
        assert!(prerouting.contains(&"3017".to_string()));
        assert!(prerouting.contains(&"02:42:ac:11:00:02".to_string()));
        assert!(postrouting.contains(&"10.42.3.17".to_string()));
        assert!(postrouting.contains(&"10.42.0.0/16".to_string()));
    }

    #[test]
    fn virtual_machines_get_no_dns_redirect() {
        let mut instance = instance_with_kind("bridged");
        instance.kind = "virtualMachine".into();
        instance.nics[0]
            .network
            .network_services
            .push(NetworkService { kind: "dnsService".into() });
        assert!(dns_redirect_rules(&instance).is_none());
    }
}
