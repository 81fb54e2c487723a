//! YAML configuration loading and validation.

use crate::error::ProxyError;
use serde::Deserialize;

fn default_heartbeat_timeout() -> u64 {
    10
}

fn default_forward_buff_size() -> usize {
    2048
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub addr: String,
    pub upstream_addrs: Vec<String>,
    #[serde(rename = "clientCACertPath")]
    pub client_ca_cert_path: String,
    pub server_cert_path: String,
    pub server_key_path: String,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    #[serde(default = "default_forward_buff_size")]
    pub forward_buff_size: usize,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PermsConfig {
    #[serde(default)]
    pub upstream_addrs: Vec<String>,
    #[serde(default)]
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct ClientConfig {
    pub id: String,
    #[serde(default)]
    pub perms: PermsConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigInvalid(format!("reading '{path}': {e}")))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ProxyError> {
        let cfg: Config = serde_yaml::from_str(content)
            .map_err(|e| ProxyError::ConfigInvalid(format!("parsing yaml: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.proxy.addr.trim().is_empty() {
            return Err(ProxyError::ConfigInvalid("proxy.addr must not be empty".into()));
        }
        if self.proxy.upstream_addrs.is_empty() {
            return Err(ProxyError::ConfigInvalid(
                "proxy.upstreamAddrs must be a non-empty list".into(),
            ));
        }
        if self.proxy.client_ca_cert_path.trim().is_empty()
            || self.proxy.server_cert_path.trim().is_empty()
            || self.proxy.server_key_path.trim().is_empty()
        {
            return Err(ProxyError::ConfigInvalid(
                "proxy.clientCACertPath, serverCertPath and serverKeyPath are all required".into(),
            ));
        }
        if self.proxy.heartbeat_timeout == 0 {
            return Err(ProxyError::ConfigInvalid(
                "proxy.heartbeatTimeout must be a positive number of seconds".into(),
            ));
        }
        if self.proxy.forward_buff_size == 0 {
            return Err(ProxyError::ConfigInvalid(
                "proxy.forwardBuffSize must be a positive number of bytes".into(),
            ));
        }
        Ok(())
    }
}
