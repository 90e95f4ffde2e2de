//! Link emulation: environment-variable substitute for native engine links.
//!
//! Containers parse these variables at startup, so the shape is a contract:
//! `<NAME>_PORT`, `<NAME>_PORT_<port>_<proto>[_ADDR|_PORT|_PROTO]` and
//! `<NAME>_ENV_<key>` must be produced verbatim.

use std::collections::BTreeMap;

use shepherd_common::{Link, LINK_NAME_PREFIX};

/// Synthesize the full discovery environment for a set of links.
pub fn link_env(links: &[Link]) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    for link in links {
        add_link_env(&link.link_name, link, &mut result, None);
        copy_link_env(&link.link_name, link, &mut result);
        for name in &link.instance_names {
            add_link_env(name, link, &mut result, Some(&link.link_name));
            copy_link_env(name, link, &mut result);
            // alternate names follow the {stack}_{service} format; also
            // export under the bare service name
            if let Some((_, service)) = name.split_once('_') {
                add_link_env(service, link, &mut result, Some(&link.link_name));
                copy_link_env(service, link, &mut result);
            }
        }
    }
    result
}

fn add_link_env(name: &str, link: &Link, result: &mut BTreeMap<String, String>, alias_of: Option<&str>) {
    let prefix = to_env_name(name);
    result.insert(
        format!("{prefix}_NAME"),
        format!("{LINK_NAME_PREFIX}{name}"),
    );

    let address = alias_of.unwrap_or(name).to_lowercase();
    for port in &link.ports {
        let full = format!("{}://{}:{}", port.protocol, address, port.private_port);
        result.insert(format!("{prefix}_PORT"), full.clone());
        let port_prefix =
            format!("{prefix}_PORT_{}_{}", port.private_port, port.protocol).to_uppercase();
        result.insert(port_prefix.clone(), full);
        result.insert(format!("{port_prefix}_ADDR"), address.clone());
        result.insert(format!("{port_prefix}_PORT"), port.private_port.to_string());
        result.insert(format!("{port_prefix}_PROTO"), port.protocol.clone());
    }
}

/// Re-export the target's own environment under `<NAME>_ENV_<key>`, filtering
/// out variables that are themselves link-emulation output for some other
/// target, plus HOME and PATH.
fn copy_link_env(name: &str, link: &Link, result: &mut BTreeMap<String, String>) {
    let Some(snapshot) = &link.target_instance.inspect_snapshot else {
        return;
    };
    let envs = &snapshot.config.env;

    let mut ignore_prefixes = Vec::new();
    for env in envs {
        let Some((_, value)) = env.split_once('=') else { continue };
        if let Some(target_name) = value.strip_prefix(LINK_NAME_PREFIX) {
            let base = to_env_name(target_name);
            ignore_prefixes.push(format!("{base}_NAME"));
            ignore_prefixes.push(format!("{base}_PORT"));
            ignore_prefixes.push(format!("{base}_ENV"));
        }
    }

    let prefix = to_env_name(name);
    for env in envs {
        let Some((key, value)) = env.split_once('=') else { continue };
        if ignore_prefixes.iter().any(|p| key.starts_with(p.as_str())) {
            continue;
        }
        if key == "HOME" || key == "PATH" {
            continue;
        }
        result.insert(format!("{prefix}_ENV_{key}"), value.to_string());
    }
}

/// Uppercase the name and replace anything outside `[A-Za-z0-9_]` with `_`.
pub fn to_env_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shepherd_common::{InspectConfig, InspectSnapshot, Instance, LinkPort};

    fn link(name: &str, ports: &[(u16, &str)], target_env: &[&str]) -> Link {
        Link {
            link_name: name.to_string(),
            ports: ports
                .iter()
                .map(|(p, proto)| LinkPort { protocol: proto.to_string(), private_port: *p })
                .collect(),
            target_instance: Instance {
                inspect_snapshot: Some(InspectSnapshot {
                    config: InspectConfig {
                        env: target_env.iter().map(|s| s.to_string()).collect(),
                    },
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn port_variables_follow_the_contract() {
        let env = link_env(&[link("db", &[(5432, "tcp")], &[])]);
        assert_eq!(env["DB_NAME"], "/shepherd/db");
        assert_eq!(env["DB_PORT"], "tcp://db:5432");
        assert_eq!(env["DB_PORT_5432_TCP"], "tcp://db:5432");
        assert_eq!(env["DB_PORT_5432_TCP_ADDR"], "db");
        assert_eq!(env["DB_PORT_5432_TCP_PORT"], "5432");
        assert_eq!(env["DB_PORT_5432_TCP_PROTO"], "tcp");
    }

    #[test]
    fn target_env_is_reexported_with_filtering() {
        let env = link_env(&[link(
            "db",
            &[],
            &[
                "PG_VERSION=16.1",
                "HOME=/root",
                "PATH=/usr/bin",
                // link output inherited from the target's own links
                "CACHE_NAME=/shepherd/cache",
                "CACHE_PORT_6379_TCP=tcp://cache:6379",
                "CACHE_ENV_REDIS_VERSION=7",
            ],
        )]);
        assert_eq!(env["DB_ENV_PG_VERSION"], "16.1");
        assert!(!env.contains_key("DB_ENV_HOME"));
        assert!(!env.contains_key("DB_ENV_PATH"));
        assert!(!env.keys().any(|k| k.contains("CACHE")));
    }

    #[test]
    fn alternate_names_resolve_to_the_link_alias() {
        let mut l = link("db", &[(5432, "tcp")], &[]);
        l.instance_names = vec!["mystack_postgres".to_string()];
        let env = link_env(&[l]);
        // both the full name and the bare service name are exported, and
        // their address is the link alias
        assert_eq!(env["MYSTACK_POSTGRES_PORT_5432_TCP_ADDR"], "db");
        assert_eq!(env["POSTGRES_PORT_5432_TCP_ADDR"], "db");
        assert_eq!(env["POSTGRES_NAME"], "/shepherd/postgres");
    }

    #[test]
    fn env_name_sanitizes_punctuation() {
        assert_eq!(to_env_name("my-db.1"), "MY_DB_1");
    }
}
