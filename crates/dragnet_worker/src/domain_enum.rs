//! Domain enumeration for discovered hosts.
//!
//! Four sources, unioned: reverse DNS (PTR), certificate CN/SANs on the
//! HTTPS ports, and domain-bearing HTTP response headers on the common
//! web ports. Every candidate passes the same validation before it is
//! stored with its provenance.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use dragnet_protocol::defaults::{HTTP_ENUM_PORTS, SSL_PORTS};

use crate::ssl_cert::SslCertGrabber;

const MAX_DOMAIN_LEN: usize = 253;

/// A domain name with where it was seen.
pub type SourcedDomain = (String, String);

/// Enumerates domain names that point at an IP.
pub struct DomainEnumerator {
    timeout: Duration,
    resolver: Option<TokioAsyncResolver>,
    cert_grabber: SslCertGrabber,
    domain_pattern: Regex,
    header_patterns: Vec<Regex>,
}

impl Default for DomainEnumerator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl DomainEnumerator {
    pub fn new(io_timeout: Duration) -> Self {
        // System resolver when available; enumeration just skips the DNS
        // source otherwise.
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .ok()
            .or_else(|| {
                Some(TokioAsyncResolver::tokio(
                    ResolverConfig::default(),
                    ResolverOpts::default(),
                ))
            });

        let header_patterns = [
            r"(?i)Server:\s*([^\r\n]+)",
            r"(?i)X-Powered-By:\s*([^\r\n]+)",
            r"(?i)Location:\s*https?://([^/\r\n]+)",
            r"(?i)Set-Cookie:.*domain=([^;\r\n]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("static pattern"))
        .collect();

        Self {
            timeout: io_timeout,
            resolver,
            cert_grabber: SslCertGrabber::new(io_timeout),
            domain_pattern: Regex::new(
                r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
            )
            .expect("static pattern"),
            header_patterns,
        }
    }

    /// Enumerate domains for `host_ip`, deduplicated and validated.
    /// Per-source failures degrade to an empty contribution.
    pub async fn enumerate(&self, host_ip: &str) -> Vec<SourcedDomain> {
        let mut found: Vec<SourcedDomain> = Vec::new();
        let mut push = |name: String, source: &str, found: &mut Vec<SourcedDomain>| {
            let name = name.trim().trim_end_matches('.').to_lowercase();
            if self.is_valid_domain(&name) && !found.iter().any(|(n, _)| *n == name) {
                found.push((name, source.to_string()));
            }
        };

        for name in self.reverse_dns(host_ip).await {
            push(name, "reverse_dns", &mut found);
        }

        for (name, source) in self.ssl_domains(host_ip).await {
            push(name, source, &mut found);
        }

        for name in self.http_header_domains(host_ip).await {
            push(name, "http_header", &mut found);
        }

        found
    }

    async fn reverse_dns(&self, host_ip: &str) -> Vec<String> {
        let Some(resolver) = &self.resolver else {
            return Vec::new();
        };
        let Ok(ip) = host_ip.parse::<IpAddr>() else {
            return Vec::new();
        };
        match timeout(self.timeout, resolver.reverse_lookup(ip)).await {
            Ok(Ok(lookup)) => lookup.iter().map(|name| name.to_string()).collect(),
            Ok(Err(err)) => {
                debug!(host_ip, %err, "reverse lookup failed");
                Vec::new()
            }
            Err(_) => {
                debug!(host_ip, "reverse lookup timed out");
                Vec::new()
            }
        }
    }

    async fn ssl_domains(&self, host_ip: &str) -> Vec<(String, &'static str)> {
        let mut domains = Vec::new();
        for port in SSL_PORTS {
            let Some(record) = self.cert_grabber.grab(host_ip, *port).await else {
                continue;
            };
            let cn = record.subject.get("CN").cloned();
            if let Some(cn) = &cn {
                domains.push((cn.clone(), "ssl_cn"));
            }
            for domain in record.domains {
                if Some(&domain) != cn.as_ref() {
                    domains.push((domain, "ssl_san"));
                }
            }
        }
        domains
    }

    async fn http_header_domains(&self, host_ip: &str) -> Vec<String> {
        let mut domains = Vec::new();
        for port in HTTP_ENUM_PORTS {
            match self.probe_http(host_ip, *port).await {
                Some(response) => domains.extend(self.domains_from_headers(&response)),
                None => continue,
            }
        }
        domains
    }

    async fn probe_http(&self, host_ip: &str, port: u16) -> Option<String> {
        let mut stream = timeout(self.timeout, TcpStream::connect((host_ip, port)))
            .await
            .ok()?
            .ok()?;
        let request = format!("GET / HTTP/1.1\r\nHost: {host_ip}\r\n\r\n");
        timeout(self.timeout, stream.write_all(request.as_bytes()))
            .await
            .ok()?
            .ok()?;

        let mut buf = [0u8; 4096];
        match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).to_string()),
            _ => None,
        }
    }

    /// Harvest candidate names from response headers. Validation happens
    /// at collection time, so header values that are not domains (most
    /// Server: banners) simply drop out.
    pub fn domains_from_headers(&self, response: &str) -> Vec<String> {
        let mut candidates = Vec::new();
        for pattern in &self.header_patterns {
            for caps in pattern.captures_iter(response) {
                if let Some(value) = caps.get(1) {
                    candidates.push(value.as_str().trim().to_string());
                }
            }
        }
        candidates
    }

    /// RFC-ish validation: label shape, at least one dot, length bound,
    /// and not an IP literal.
    pub fn is_valid_domain(&self, domain: &str) -> bool {
        if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
            return false;
        }
        if !domain.contains('.') {
            return false;
        }
        if domain.parse::<Ipv4Addr>().is_ok() {
            return false;
        }
        self.domain_pattern.is_match(domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enumerator() -> DomainEnumerator {
        DomainEnumerator::default()
    }

    #[test]
    fn valid_domains_pass() {
        let e = enumerator();
        assert!(e.is_valid_domain("example.com"));
        assert!(e.is_valid_domain("www.example.co.uk"));
        assert!(e.is_valid_domain("a-b.example.io"));
    }

    #[test]
    fn invalid_domains_fail() {
        let e = enumerator();
        assert!(!e.is_valid_domain(""));
        assert!(!e.is_valid_domain("localhost"));
        assert!(!e.is_valid_domain("192.0.2.1"));
        assert!(!e.is_valid_domain("-bad.example.com"));
        assert!(!e.is_valid_domain(&format!("{}.com", "a".repeat(300))));
    }

    #[test]
    fn headers_yield_candidates() {
        let e = enumerator();
        let response = "HTTP/1.1 302 Found\r\n\
            Server: Apache\r\n\
            Location: https://www.example.com/login\r\n\
            Set-Cookie: session=abc; domain=example.com; path=/\r\n\
            X-Powered-By: PHP/8.1\r\n\r\n";
        let candidates = e.domains_from_headers(response);
        assert!(candidates.contains(&"www.example.com".to_string()));
        assert!(candidates.contains(&"example.com".to_string()));
        // Server and X-Powered-By values are captured but fail validation.
        assert!(candidates.contains(&"Apache".to_string()));
        assert!(!e.is_valid_domain("apache"));
    }
}
