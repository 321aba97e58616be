//! A minimal hosts-file lookup: the platform hosts file parsed once at startup
//! into an in-memory map.

#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::collections::HashMap;
use std::net::IpAddr;

use anyhow::{Context as _, Result};

#[cfg(unix)]
const HOSTS_PATH: &str = "/etc/hosts";

#[derive(Debug, Default, Clone)]
pub struct Hosts {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    /// Loads the platform hosts file.
    ///
    /// The file is read once; a process restart picks up edits.
    #[cfg(unix)]
    pub fn load() -> Result<Self> {
        let content = std::fs::read_to_string(HOSTS_PATH)
            .with_context(|| format!("Failed to read `{HOSTS_PATH}`"))?;

        let hosts = Self::parse(&content);

        tracing::debug!(num_hosts = %hosts.entries.len(), "Loaded hosts file");

        Ok(hosts)
    }

    #[cfg(not(unix))]
    pub fn load() -> Result<Self> {
        Ok(Self::default())
    }

    /// Parses hosts-file syntax from a string.
    pub fn parse(content: &str) -> Self {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or_default();

            let mut tokens = line.split_ascii_whitespace();
            let Some(ip) = tokens.next() else {
                continue;
            };
            let Ok(ip) = ip.parse::<IpAddr>() else {
                tracing::trace!(%ip, "Skipping hosts line with unparsable address");
                continue;
            };

            for host in tokens {
                entries.entry(host.to_ascii_lowercase()).or_default().push(ip);
            }
        }

        Self { entries }
    }

    /// All addresses bound to `host`, in file order.
    pub fn lookup(&self, host: &str) -> &[IpAddr] {
        self.entries
            .get(&host.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;

    #[test]
    fn can_parse_docker_etc_hosts() {
        let content = r#"127.0.0.1       localhost
        ::1     localhost ip6-localhost ip6-loopback
        fe00::  ip6-localnet
        ff02::1 ip6-allnodes
        203.0.113.10    portal
        203:0:113::10   portal"#;

        let hosts = Hosts::parse(content);

        assert_eq!(
            hosts.lookup("portal"),
            [
                IpAddr::from([203, 0, 113, 10]),
                IpAddr::from([
                    0x0203, 0x0000, 0x0113, 0x0000, 0x0000, 0x0000, 0x0000, 0x0010
                ]),
            ]
        );
    }

    #[test]
    fn can_parse_additional_hostnames() {
        let content = r#"127.0.0.1       localhost
        ::1     localhost ip6-localhost ip6-loopback
        "#;

        let hosts = Hosts::parse(content);

        assert_eq!(
            hosts.lookup("ip6-loopback"),
            [IpAddr::from(Ipv6Addr::LOCALHOST)]
        );
    }

    #[test]
    fn ignores_comments_and_bad_lines() {
        let content = r#"
            # The usual suspects.
            127.0.0.1       localhost
            fe00::
            203.0.113.10    portal # our portal
            not-an-ip       junk
        "#;

        let hosts = Hosts::parse(content);

        assert_eq!(hosts.lookup("portal"), [IpAddr::from([203, 0, 113, 10])]);
        assert_eq!(hosts.lookup("junk"), Vec::<IpAddr>::new());
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let hosts = Hosts::parse("192.0.2.1 Portal");

        assert_eq!(hosts.lookup("portal"), [IpAddr::from([192, 0, 2, 1])]);
        assert_eq!(hosts.lookup("PORTAL"), [IpAddr::from([192, 0, 2, 1])]);
    }

    #[test]
    fn unknown_host_has_no_addresses() {
        let hosts = Hosts::parse("127.0.0.1 localhost");

        assert_eq!(hosts.lookup("example.com"), Vec::<IpAddr>::new());
    }

    #[cfg(unix)]
    #[test]
    fn can_load_system_hosts_file() {
        let hosts = Hosts::load().unwrap();

        assert!(hosts.lookup("localhost").contains(&IpAddr::from(Ipv4Addr::LOCALHOST)));
    }
}
