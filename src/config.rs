use std::net::{Ipv4Addr, Ipv6Addr};

/// One DoH provider: hostname for SNI/authority, query path, and the fixed
/// endpoint addresses we dial directly (no bootstrap resolution needed).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub host: String,
    pub path: String,
    pub ipv4: Vec<Ipv4Addr>,
    pub ipv6: Vec<Ipv6Addr>,
}

impl ProviderConfig {
    /// Dial order: IPv6 endpoints first, then IPv4.
    pub fn endpoints(&self) -> Vec<std::net::IpAddr> {
        self.ipv6
            .iter()
            .copied()
            .map(std::net::IpAddr::V6)
            .chain(self.ipv4.iter().copied().map(std::net::IpAddr::V4))
            .collect()
    }

    /// Cloudflare answers `*`/ANY with NOTIMP, so it is never asked.
    pub fn refuses_any(&self) -> bool {
        self.name == "cloudflare"
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// UDP port to serve on (53 unless overridden via `HERMOD_PORT`).
    pub port: u16,
    /// Redis cache backend URL; in-process cache when unset.
    pub redis_url: Option<String>,
    /// Enables the in-place status display and verbose logging.
    pub debug: bool,
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    /// Build configuration from the environment. No flags are required; the
    /// provider table is built in.
    pub fn from_env() -> Self {
        let port = std::env::var("HERMOD_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(53);
        let redis_url = std::env::var("HERMOD_REDIS_URL").ok().filter(|v| !v.is_empty());
        let debug = std::env::var("HERMOD_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            port,
            redis_url,
            debug,
            providers: default_providers(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 53,
            redis_url: None,
            debug: false,
            providers: default_providers(),
        }
    }
}

/// The built-in upstream table.
pub fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            name: "cloudflare".to_string(),
            host: "cloudflare-dns.com".to_string(),
            path: "/dns-query".to_string(),
            ipv4: vec![Ipv4Addr::new(1, 0, 0, 1), Ipv4Addr::new(1, 1, 1, 1)],
            ipv6: vec![
                "2606:4700:4700::1111".parse().expect("valid cloudflare IPv6"),
                "2606:4700:4700::1001".parse().expect("valid cloudflare IPv6"),
            ],
        },
        ProviderConfig {
            name: "google".to_string(),
            host: "dns.google".to_string(),
            path: "/resolve".to_string(),
            ipv4: vec![Ipv4Addr::new(8, 8, 4, 4), Ipv4Addr::new(8, 8, 8, 8)],
            ipv6: vec![
                "2001:4860:4860::8844".parse().expect("valid google IPv6"),
                "2001:4860:4860::8888".parse().expect("valid google IPv6"),
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_table_defaults() {
        let providers = default_providers();
        assert_eq!(providers.len(), 2);
        let cloudflare = &providers[0];
        assert_eq!(cloudflare.host, "cloudflare-dns.com");
        assert_eq!(cloudflare.path, "/dns-query");
        assert!(cloudflare.refuses_any());
        let google = &providers[1];
        assert_eq!(google.path, "/resolve");
        assert!(!google.refuses_any());
    }

    #[test]
    fn endpoints_prefer_ipv6() {
        let google = &default_providers()[1];
        let endpoints = google.endpoints();
        assert_eq!(endpoints.len(), 4);
        assert!(endpoints[0].is_ipv6());
        assert!(endpoints[2].is_ipv4());
    }
}
