use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, sync::Arc, time::Duration};

use crate::{
    auth::{StaticAuthenticator, User},
    handler::ProxyContext,
    security::parse_allowlist,
};

#[derive(Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_client_ips: Option<Vec<String>>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<User>,
}

impl Config {
    /// `ip:port`, with IPv6 addresses bracketed.
    pub fn listen_addr(&self) -> String {
        if self.listen.ip.contains(':') {
            format!("[{}]:{}", self.listen.ip, self.listen.port)
        } else {
            format!("{}:{}", self.listen.ip, self.listen.port)
        }
    }

    /// Builds the per-listener settings, validating the allowlist.
    pub fn proxy_context(&self) -> Result<ProxyContext> {
        let mut context = ProxyContext::new();

        if !self.auth.users.is_empty() {
            let authenticator = StaticAuthenticator::new(self.auth.users.iter().cloned());
            context = context.with_authenticator(Arc::new(authenticator));
        }
        if let Some(secs) = self.listen.request_timeout_secs {
            context = context.with_request_timeout(Duration::from_secs(secs));
        }
        if let Some(entries) = &self.listen.allowed_client_ips {
            let networks = parse_allowlist(entries).context("Invalid listen.allowed_client_ips")?;
            context = context.with_allowed_clients(networks);
        }

        Ok(context)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config as valid TOML")
}

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_has_no_auth() {
        let config = parse_config("[listen]\nip = \"127.0.0.1\"\nport = 7890\n").unwrap();
        let context = config.proxy_context().unwrap();

        assert_eq!(config.listen_addr(), "127.0.0.1:7890");
        assert!(context.authenticator().is_none());
        assert!(context.request_timeout().is_none());
        assert!(context.is_client_allowed("203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn full_config() {
        let config = parse_config(
            r#"
            [listen]
            ip = "::1"
            port = 8080
            allowed_client_ips = ["127.0.0.1", "10.0.0.0/8"]
            request_timeout_secs = 30

            [[auth.users]]
            username = "u"
            password = "p"
            "#,
        )
        .unwrap();
        let context = config.proxy_context().unwrap();

        assert_eq!(config.listen_addr(), "[::1]:8080");
        assert_eq!(context.request_timeout(), Some(Duration::from_secs(30)));
        assert!(context.is_client_allowed("10.1.2.3".parse().unwrap()));
        assert!(!context.is_client_allowed("192.168.0.1".parse().unwrap()));

        let authenticator = context.authenticator().unwrap();
        assert!(authenticator.verify("u", "p"));
        assert!(!authenticator.verify("u", "x"));
    }

    #[test]
    fn invalid_allowlist_is_rejected() {
        let config = parse_config(
            "[listen]\nip = \"0.0.0.0\"\nport = 1\nallowed_client_ips = [\"nope\"]\n",
        )
        .unwrap();
        assert!(config.proxy_context().is_err());
    }

    #[test]
    fn missing_listen_section_fails() {
        assert!(parse_config("[auth]\nusers = []\n").is_err());
    }

    #[test]
    fn missing_file_fails() {
        let err = load_config("does-not-exist.toml").err().unwrap();
        assert!(err.to_string().contains("does-not-exist.toml"));
    }
}
