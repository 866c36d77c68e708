//! Gateway server configuration

use std::net::SocketAddr;

use ocpp_gateway_core::PipeConfig;

/// Default websocket listen address
pub const DEFAULT_WS_ADDR: &str = "127.0.0.1:9310";

/// Default message bus topic prefix
pub const DEFAULT_TOPIC_PREFIX: &str = "cs";

/// Gateway server configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Websocket listen address
    pub ws_addr: SocketAddr,

    /// Prefix of the per-session message bus topics
    pub topic_prefix: String,

    /// Take transport security from a TLS-terminating proxy's headers
    pub trust_proxy_headers: bool,

    /// Subject organizations accepted on client certificates
    pub org_names: Vec<String>,

    /// Configuration of each session's pipe
    pub pipe: PipeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ws_addr: SocketAddr::from(([127, 0, 0, 1], 9310)),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            trust_proxy_headers: false,
            org_names: Vec::new(),
            pipe: PipeConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn new(ws_addr: SocketAddr) -> Self {
        Self {
            ws_addr,
            ..Default::default()
        }
    }

    pub fn with_topic_prefix(mut self, prefix: &str) -> Self {
        self.topic_prefix = prefix.to_string();
        self
    }

    pub fn with_trust_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }

    /// Accept client certificates issued to `org_name`
    pub fn with_org_name(mut self, org_name: &str) -> Self {
        self.org_names.push(org_name.to_string());
        self
    }

    pub fn with_org_names<I, S>(mut self, org_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.org_names.extend(org_names.into_iter().map(Into::into));
        self
    }

    pub fn with_pipe_config(mut self, pipe: PipeConfig) -> Self {
        self.pipe = pipe;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();

        assert_eq!(config.ws_addr, DEFAULT_WS_ADDR.parse().unwrap());
        assert_eq!(config.topic_prefix, "cs");
        assert!(!config.trust_proxy_headers);
        assert!(config.org_names.is_empty());
        assert_eq!(config.pipe, PipeConfig::default());
    }

    #[test]
    fn test_config_builder() {
        let config = GatewayConfig::new("0.0.0.0:80".parse().unwrap())
            .with_topic_prefix("gateway")
            .with_trust_proxy_headers(true)
            .with_org_name("Example Charging")
            .with_org_names(["Other Org"])
            .with_pipe_config(PipeConfig::default().with_response_timeout(Duration::from_secs(1)));

        assert_eq!(config.ws_addr.port(), 80);
        assert_eq!(config.topic_prefix, "gateway");
        assert!(config.trust_proxy_headers);
        assert_eq!(config.org_names, vec!["Example Charging", "Other Org"]);
        assert_eq!(config.pipe.response_timeout, Duration::from_secs(1));
    }
}
