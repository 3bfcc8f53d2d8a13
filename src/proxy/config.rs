//! Proxy endpoint configuration

/// Default proxy scheme
pub const DEFAULT_SCHEME: &str = "http";

/// A single egress proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Proxy scheme (http, https, socks5)
    pub scheme: String,
}

impl ProxyEndpoint {
    /// Parse a `host:port:username:password` entry (credentials optional)
    pub fn parse(entry: &str) -> Option<Self> {
        let parts: Vec<&str> = entry.trim().split(':').collect();
        if parts.len() < 2 {
            return None;
        }
        let port: u16 = parts[1].parse().ok()?;
        Some(Self {
            host: parts[0].to_string(),
            port,
            username: parts.get(2).unwrap_or(&"").to_string(),
            password: parts.get(3).unwrap_or(&"").to_string(),
            scheme: DEFAULT_SCHEME.to_string(),
        })
    }

    /// Stable identity used as the health-tally and pool key
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Proxy URL without credentials, as Chrome's --proxy-server wants it
    pub fn server_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Whether the endpoint requires authentication
    pub fn authenticated(&self) -> bool {
        !self.username.is_empty()
    }
}

/// Proxy configuration: the endpoint list plus the enable switch
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Endpoint entries in `host:port:username:password` form
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
}

impl ProxyConfig {
    /// Parse a comma- or newline-separated proxy list
    pub fn from_list(list: &str) -> Self {
        let endpoints: Vec<String> = list
            .split(|c| c == ',' || c == '\n')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let enabled = !endpoints.is_empty();
        Self { endpoints, enabled }
    }

    /// Parse the configured entries, dropping malformed ones
    pub fn parse_endpoints(&self) -> Vec<ProxyEndpoint> {
        self.endpoints
            .iter()
            .filter_map(|e| ProxyEndpoint::parse(e))
            .collect()
    }

    /// Check if at least one valid endpoint is configured
    pub fn is_configured(&self) -> bool {
        !self.parse_endpoints().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_entry() {
        let ep = ProxyEndpoint::parse("p1.example.com:8080:alice:s3cret").unwrap();
        assert_eq!(ep.host, "p1.example.com");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.username, "alice");
        assert!(ep.authenticated());
        assert_eq!(ep.server_url(), "http://p1.example.com:8080");
    }

    #[test]
    fn parses_unauthenticated_entry() {
        let ep = ProxyEndpoint::parse("10.0.0.2:3128").unwrap();
        assert!(!ep.authenticated());
        assert_eq!(ep.key(), "10.0.0.2:3128");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(ProxyEndpoint::parse("not-a-proxy").is_none());
        assert!(ProxyEndpoint::parse("host:notaport").is_none());
    }

    #[test]
    fn from_list_splits_and_enables() {
        let config = ProxyConfig::from_list("a.example.com:8080:u:p, b.example.com:8081:u:p");
        assert!(config.enabled);
        assert_eq!(config.parse_endpoints().len(), 2);
    }
}
