use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::hosts::ReloadPolicy;
use crate::types::Zone;
use crate::upstream::Transport;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub dns_bind: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_bind: Option<SocketAddr>,
    /// Upstream nameserver; the system resolver's first nameserver if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<SocketAddr>,
    /// Upstream transport; follows the client's transport if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_protocol: Option<Transport>,
    pub upstream_timeout_ms: u64,
    pub hosts: HostsConfig,
    pub zones: Vec<Zone>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub reload: ReloadPolicy,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
            reload: ReloadPolicy::Watch,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dns_bind: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 53)),
            http_bind: None,
            upstream: None,
            upstream_protocol: None,
            upstream_timeout_ms: 2000,
            hosts: HostsConfig::default(),
            zones: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("gatedns.toml"))
            .merge(Json::file("gatedns.json"))
            .merge(Env::prefixed("GATEDNS_").split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if let Some(zone) = config.zones.iter().find(|z| z.name.trim().is_empty()) {
            anyhow::bail!("Zone with empty name in configuration: {:?}", zone);
        }

        Ok(config)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_apply_without_sources() {
        Jail::expect_with(|_jail| {
            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.dns_bind, "0.0.0.0:53".parse().unwrap());
            assert_eq!(config.upstream, None);
            assert_eq!(config.upstream_timeout(), Duration::from_secs(2));
            assert!(config.hosts.enabled);
            assert_eq!(config.hosts.reload, ReloadPolicy::Watch);
            assert!(config.zones.is_empty());
            Ok(())
        });
    }

    #[test]
    fn toml_file_and_env_are_layered() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gatedns.toml",
                r#"
                    dns_bind = "127.0.0.1:5353"
                    upstream = "10.0.2.3:53"
                    upstream_protocol = "tcp"

                    [hosts]
                    reload = "poll"

                    [[zones]]
                    name = "internal."
                    default_ip = "192.168.127.254"

                    [[zones.records]]
                    name = "gateway"
                    ip = "192.168.127.1"

                    [[zones.records]]
                    regexp = "^vm-.*$"
                    ip = "192.168.127.3"
                "#,
            )?;
            jail.set_env("GATEDNS_UPSTREAM_TIMEOUT_MS", "500");
            jail.set_env("GATEDNS_HOSTS__ENABLED", "false");

            let config = Config::load().map_err(|e| e.to_string())?;
            assert_eq!(config.dns_bind, "127.0.0.1:5353".parse().unwrap());
            assert_eq!(config.upstream, Some("10.0.2.3:53".parse().unwrap()));
            assert_eq!(config.upstream_protocol, Some(Transport::Tcp));
            assert_eq!(config.upstream_timeout(), Duration::from_millis(500));
            assert!(!config.hosts.enabled);
            assert_eq!(config.hosts.reload, ReloadPolicy::Poll);
            assert_eq!(config.zones.len(), 1);
            assert_eq!(config.zones[0].records.len(), 2);
            Ok(())
        });
    }

    #[test]
    fn malformed_zone_fails_to_load() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gatedns.json",
                r#"{"zones": [{"name": "internal.", "records": [{"ip": "10.0.0.1"}]}]}"#,
            )?;
            assert!(Config::load().is_err());
            Ok(())
        });
    }
}
