//! Banner classification and follow-up policy.
//!
//! A regex table maps service types to weighted indicator patterns. Port
//! affinity and corroborating indicators nudge the confidence up; the
//! strongest detections decide whether SSL or domain follow-up work is
//! worth queueing.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Services the classifier can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Http,
    Https,
    Ssh,
    Ftp,
    Smtp,
    Dns,
    Mysql,
    Postgresql,
    Redis,
    Mongodb,
    Mssql,
    Telnet,
    Imap,
    Pop3,
    Rdp,
    Vnc,
    Unknown,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Http => "http",
            ServiceType::Https => "https",
            ServiceType::Ssh => "ssh",
            ServiceType::Ftp => "ftp",
            ServiceType::Smtp => "smtp",
            ServiceType::Dns => "dns",
            ServiceType::Mysql => "mysql",
            ServiceType::Postgresql => "postgresql",
            ServiceType::Redis => "redis",
            ServiceType::Mongodb => "mongodb",
            ServiceType::Mssql => "mssql",
            ServiceType::Telnet => "telnet",
            ServiceType::Imap => "imap",
            ServiceType::Pop3 => "pop3",
            ServiceType::Rdp => "rdp",
            ServiceType::Vnc => "vnc",
            ServiceType::Unknown => "unknown",
        }
    }

    /// Ports that corroborate a detection of this service.
    fn affinity_ports(&self) -> &'static [u16] {
        match self {
            ServiceType::Http => &[80, 8080, 8000],
            ServiceType::Https => &[443, 8443, 9443],
            ServiceType::Ssh => &[22],
            ServiceType::Ftp => &[21],
            ServiceType::Smtp => &[25, 587, 465],
            ServiceType::Dns => &[53],
            ServiceType::Mysql => &[3306],
            ServiceType::Postgresql => &[5432],
            ServiceType::Redis => &[6379],
            ServiceType::Mongodb => &[27017],
            ServiceType::Mssql => &[1433],
            ServiceType::Telnet => &[23],
            ServiceType::Imap => &[143, 993],
            ServiceType::Pop3 => &[110, 995],
            ServiceType::Rdp => &[3389],
            ServiceType::Vnc => &[5900, 5901],
            ServiceType::Unknown => &[],
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One service detected in a banner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDetection {
    pub service_type: ServiceType,
    pub confidence: f64,
    pub version: Option<String>,
    pub additional_info: HashMap<String, String>,
}

impl ServiceDetection {
    fn new(service_type: ServiceType, confidence: f64) -> Self {
        Self {
            service_type,
            confidence,
            version: None,
            additional_info: HashMap::new(),
        }
    }
}

const SSL_INDICATORS: &[&str] = &[
    "ssl", "tls", "https", "starttls", "ssl/tls", "tls/ssl", "secure", "encrypted", "certificate",
    "x509",
];

const WEB_INDICATORS: &[&str] = &[
    "http", "https", "www", "web", "server", "apache", "nginx", "iis", "lighttpd", "caddy",
    "tomcat", "jetty",
];

/// Analyzes banners to detect services and drive follow-up queueing.
pub struct BannerAnalyzer {
    patterns: Vec<(ServiceType, Vec<(Regex, f64)>)>,
    version_patterns: Vec<(ServiceType, Vec<Regex>)>,
    server_header: Regex,
    ssh_info: Regex,
}

impl Default for BannerAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl BannerAnalyzer {
    pub fn new() -> Self {
        let table: &[(ServiceType, &[(&str, f64)])] = &[
            (
                ServiceType::Http,
                &[
                    (r"(apache|httpd)", 0.9),
                    (r"nginx", 0.9),
                    (r"iis", 0.9),
                    (r"lighttpd", 0.8),
                    (r"caddy", 0.8),
                    (r"http/1\.[01]", 0.7),
                    (r"server:\s*([^\r\n]+)", 0.6),
                ],
            ),
            (
                ServiceType::Https,
                &[
                    (r"https", 0.8),
                    (r"ssl", 0.7),
                    (r"tls", 0.7),
                    (r"secure", 0.6),
                ],
            ),
            (
                ServiceType::Ssh,
                &[
                    (r"ssh-2\.0", 0.95),
                    (r"openssh", 0.9),
                    (r"dropbear", 0.8),
                    (r"libssh", 0.7),
                ],
            ),
            (
                ServiceType::Ftp,
                &[
                    (r"vsftpd", 0.9),
                    (r"proftpd", 0.8),
                    (r"pure-ftpd", 0.8),
                    (r"220.*ftp", 0.7),
                ],
            ),
            (
                ServiceType::Smtp,
                &[
                    (r"postfix", 0.9),
                    (r"sendmail", 0.8),
                    (r"exim", 0.8),
                    (r"220.*smtp", 0.7),
                    (r"esmtp", 0.7),
                ],
            ),
            (
                ServiceType::Dns,
                &[
                    (r"bind", 0.9),
                    (r"dnsmasq", 0.8),
                    (r"powerdns", 0.8),
                    (r"53.*dns", 0.6),
                ],
            ),
            (
                ServiceType::Mysql,
                &[(r"mysql", 0.9), (r"mariadb", 0.9), (r"percona", 0.8)],
            ),
            (
                ServiceType::Postgresql,
                &[(r"postgresql", 0.9), (r"postgres", 0.8)],
            ),
            (ServiceType::Redis, &[(r"redis", 0.9)]),
            (
                ServiceType::Mongodb,
                &[(r"mongodb", 0.9), (r"mongo", 0.8)],
            ),
            (
                ServiceType::Mssql,
                &[(r"mssql", 0.9), (r"sql server", 0.8)],
            ),
            (ServiceType::Telnet, &[(r"telnet", 0.8)]),
            (
                ServiceType::Imap,
                &[(r"imap", 0.8), (r"dovecot", 0.9)],
            ),
            (ServiceType::Pop3, &[(r"pop3", 0.8)]),
            (
                ServiceType::Rdp,
                &[(r"rdp", 0.8), (r"terminal services", 0.7)],
            ),
            (
                ServiceType::Vnc,
                &[(r"vnc", 0.8), (r"tightvnc", 0.9), (r"tigervnc", 0.9)],
            ),
        ];

        let patterns = table
            .iter()
            .map(|(service, entries)| {
                let compiled = entries
                    .iter()
                    .map(|(pattern, confidence)| {
                        (Regex::new(pattern).expect("static pattern"), *confidence)
                    })
                    .collect();
                (*service, compiled)
            })
            .collect();

        let version_table: &[(ServiceType, &[&str])] = &[
            (
                ServiceType::Http,
                &[
                    r"apache/([0-9.]+)",
                    r"nginx/([0-9.]+)",
                    r"iis/([0-9.]+)",
                    r"server:\s*([^\r\n]+)",
                ],
            ),
            (
                ServiceType::Ssh,
                &[r"openssh_([0-9.]+)", r"ssh-2\.0-([^\s]+)"],
            ),
            (
                ServiceType::Ftp,
                &[r"vsftpd\s+([0-9.]+)", r"proftpd\s+([0-9.]+)"],
            ),
            (
                ServiceType::Smtp,
                &[r"postfix/([0-9.]+)", r"sendmail\s+([0-9.]+)"],
            ),
            (
                ServiceType::Mysql,
                &[r"mysql\s+([0-9.]+)", r"mariadb\s+([0-9.]+)"],
            ),
        ];
        let version_patterns = version_table
            .iter()
            .map(|(service, entries)| {
                let compiled = entries
                    .iter()
                    .map(|pattern| Regex::new(pattern).expect("static pattern"))
                    .collect();
                (*service, compiled)
            })
            .collect();

        Self {
            patterns,
            version_patterns,
            server_header: Regex::new(r"server:\s*([^\r\n]+)").expect("static pattern"),
            ssh_info: Regex::new(r"ssh-([0-9.]+)-(\S+)").expect("static pattern"),
        }
    }

    /// Classify a banner observed on `port`, strongest detection first.
    pub fn analyze(&self, banner: &str, port: u16) -> Vec<ServiceDetection> {
        if banner.trim().is_empty() {
            return vec![ServiceDetection::new(ServiceType::Unknown, 0.0)];
        }

        let banner = banner.to_lowercase();
        let mut detections = Vec::new();

        for (service, patterns) in &self.patterns {
            for (pattern, base_confidence) in patterns {
                if pattern.is_match(&banner) {
                    let confidence =
                        self.adjusted_confidence(*base_confidence, &banner, port, *service);
                    let mut detection = ServiceDetection::new(*service, confidence);
                    detection.version = self.extract_version(&banner, *service);
                    detection.additional_info = self.extract_additional_info(&banner, *service);
                    detections.push(detection);
                }
            }
        }

        // Generic fallback buckets when no named service matched.
        if detections.is_empty() {
            if SSL_INDICATORS.iter().any(|ind| banner.contains(ind)) {
                detections.push(ServiceDetection::new(ServiceType::Https, 0.5));
            } else if WEB_INDICATORS.iter().any(|ind| banner.contains(ind)) {
                detections.push(ServiceDetection::new(ServiceType::Http, 0.5));
            } else {
                detections.push(ServiceDetection::new(ServiceType::Unknown, 0.0));
            }
        }

        // HTTP spoken on 443 is almost certainly HTTPS underneath.
        if port == 443
            && detections
                .iter()
                .any(|d| d.service_type == ServiceType::Http)
        {
            detections.push(ServiceDetection::new(ServiceType::Https, 0.9));
        }

        detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        detections
    }

    fn adjusted_confidence(
        &self,
        base: f64,
        banner: &str,
        port: u16,
        service: ServiceType,
    ) -> f64 {
        let mut confidence = base;

        if service.affinity_ports().contains(&port) {
            confidence += 0.1;
        }

        if matches!(service, ServiceType::Http | ServiceType::Https) {
            let hits = WEB_INDICATORS
                .iter()
                .filter(|ind| banner.contains(*ind))
                .count();
            if hits > 1 {
                confidence += 0.1;
            }
        }
        if service == ServiceType::Https {
            let hits = SSL_INDICATORS
                .iter()
                .filter(|ind| banner.contains(*ind))
                .count();
            if hits > 1 {
                confidence += 0.1;
            }
        }

        confidence.min(1.0)
    }

    fn extract_version(&self, banner: &str, service: ServiceType) -> Option<String> {
        let patterns = self
            .version_patterns
            .iter()
            .find(|(svc, _)| *svc == service)
            .map(|(_, patterns)| patterns)?;
        for pattern in patterns {
            if let Some(caps) = pattern.captures(banner) {
                if let Some(version) = caps.get(1) {
                    return Some(version.as_str().to_string());
                }
            }
        }
        None
    }

    fn extract_additional_info(&self, banner: &str, service: ServiceType) -> HashMap<String, String> {
        let mut info = HashMap::new();

        if matches!(service, ServiceType::Http | ServiceType::Https) {
            if let Some(caps) = self.server_header.captures(banner) {
                info.insert("server".to_string(), caps[1].trim().to_string());
            }
        }
        if service == ServiceType::Ssh {
            if let Some(caps) = self.ssh_info.captures(banner) {
                info.insert("ssh_version".to_string(), caps[1].to_string());
                info.insert("software".to_string(), caps[2].to_string());
            }
        }

        info
    }

    /// Should this banner trigger an SSL certificate grab?
    pub fn should_queue_ssl_cert(&self, detections: &[ServiceDetection]) -> bool {
        detections.iter().any(|detection| {
            if detection.service_type == ServiceType::Https {
                return true;
            }
            // Text protocols advertising STARTTLS-style upgrades.
            if matches!(
                detection.service_type,
                ServiceType::Smtp | ServiceType::Imap | ServiceType::Pop3
            ) {
                if let Some(server) = detection.additional_info.get("server") {
                    let server = server.to_lowercase();
                    return SSL_INDICATORS.iter().any(|ind| server.contains(ind));
                }
            }
            false
        })
    }

    /// Should this banner trigger domain enumeration?
    pub fn should_queue_domain_enum(&self, detections: &[ServiceDetection]) -> bool {
        detections.iter().any(|d| {
            matches!(d.service_type, ServiceType::Http | ServiceType::Https)
        })
    }

    /// Priority of a follow-up job: the strongest triggering detection,
    /// scaled to 0..=10.
    pub fn followup_priority(
        &self,
        detections: &[ServiceDetection],
        triggering: &[ServiceType],
    ) -> i64 {
        detections
            .iter()
            .filter(|d| triggering.contains(&d.service_type))
            .map(|d| (d.confidence * 10.0) as i64)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> BannerAnalyzer {
        BannerAnalyzer::new()
    }

    #[test]
    fn openssh_banner_on_port_22() {
        let detections = analyzer().analyze("SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5", 22);
        let ssh = detections
            .iter()
            .find(|d| d.service_type == ServiceType::Ssh)
            .expect("ssh detected");
        assert!(ssh.confidence >= 0.9);
        assert_eq!(ssh.version.as_deref(), Some("8.2"));
        assert!(ssh.additional_info["software"].eq_ignore_ascii_case("OpenSSH_8.2p1"));
        assert_eq!(ssh.additional_info["ssh_version"], "2.0");
    }

    #[test]
    fn nginx_banner_detects_http_with_version() {
        let detections = analyzer().analyze("HTTP/1.1 200 OK\r\nServer: nginx/1.18.0", 80);
        let http = detections
            .iter()
            .find(|d| d.service_type == ServiceType::Http)
            .expect("http detected");
        assert!(http.confidence >= 0.9);
        assert_eq!(http.additional_info["server"], "nginx/1.18.0");
    }

    #[test]
    fn http_on_port_443_implies_https() {
        let detections = analyzer().analyze("HTTP/1.1 301 Moved\r\nServer: Apache", 443);
        let https = detections
            .iter()
            .find(|d| d.service_type == ServiceType::Https)
            .expect("https inferred");
        assert!(https.confidence >= 0.9);
    }

    #[test]
    fn canonical_services_classify_with_half_confidence_or_more() {
        let cases: &[(&str, u16, ServiceType)] = &[
            ("220 mail.example.com ESMTP Postfix", 25, ServiceType::Smtp),
            ("220 ProFTPD 1.3.6 Server ready", 21, ServiceType::Ftp),
            ("5.7.33-MySQL Community Server", 3306, ServiceType::Mysql),
            ("PostgreSQL 13.3 on x86_64", 5432, ServiceType::Postgresql),
            ("-ERR unknown command redis_version", 6379, ServiceType::Redis),
            ("* OK Dovecot ready.", 143, ServiceType::Imap),
            ("RFB 003.008 TigerVNC", 5900, ServiceType::Vnc),
        ];
        for (banner, port, expected) in cases {
            let detections = analyzer().analyze(banner, *port);
            let hit = detections
                .iter()
                .find(|d| d.service_type == *expected)
                .unwrap_or_else(|| panic!("{expected} not detected in {banner:?}"));
            assert!(hit.confidence >= 0.5, "{expected} confidence too low");
        }
    }

    #[test]
    fn empty_banner_is_unknown() {
        let detections = analyzer().analyze("   ", 80);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].service_type, ServiceType::Unknown);
        assert_eq!(detections[0].confidence, 0.0);
    }

    #[test]
    fn generic_ssl_keywords_fall_back_to_https_bucket() {
        let detections = analyzer().analyze("certificate x509 gibberish", 9999);
        assert_eq!(detections[0].service_type, ServiceType::Https);
        assert_eq!(detections[0].confidence, 0.5);
    }

    #[test]
    fn detections_sorted_by_confidence() {
        let detections = analyzer().analyze("nginx secure tls server https", 443);
        for pair in detections.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
    }

    #[test]
    fn followup_policy_https() {
        let a = analyzer();
        let detections = a.analyze("HTTP/1.1 200 OK\r\nServer: nginx", 443);
        assert!(a.should_queue_ssl_cert(&detections));
        assert!(a.should_queue_domain_enum(&detections));
    }

    #[test]
    fn followup_policy_plain_ssh() {
        let a = analyzer();
        let detections = a.analyze("SSH-2.0-OpenSSH_8.2p1", 22);
        assert!(!a.should_queue_ssl_cert(&detections));
        assert!(!a.should_queue_domain_enum(&detections));
    }

    #[test]
    fn smtp_with_starttls_server_hint_queues_ssl() {
        let mut detection = ServiceDetection::new(ServiceType::Smtp, 0.9);
        detection
            .additional_info
            .insert("server".to_string(), "Postfix STARTTLS ready".to_string());
        assert!(analyzer().should_queue_ssl_cert(&[detection]));
    }

    #[test]
    fn priority_scales_with_confidence() {
        let a = analyzer();
        let mut detections = vec![ServiceDetection::new(ServiceType::Https, 0.95)];
        assert_eq!(
            a.followup_priority(&detections, &[ServiceType::Https]),
            9
        );
        detections.push(ServiceDetection::new(ServiceType::Http, 0.6));
        assert_eq!(
            a.followup_priority(&detections, &[ServiceType::Http, ServiceType::Https]),
            9
        );
        assert_eq!(a.followup_priority(&detections, &[ServiceType::Ssh]), 0);
    }
}
