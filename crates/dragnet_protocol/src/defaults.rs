//! Canonical default values shared across the engine.

/// Heartbeat period for registered workers, seconds.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Backoff after a failed heartbeat write, seconds.
pub const HEARTBEAT_RETRY_SECS: u64 = 10;

/// A worker whose heartbeat is older than this is considered crashed
/// (3x the heartbeat interval).
pub const WORKER_STALE_SECS: i64 = 90;

/// Dispatcher tick period, seconds.
pub const DISPATCH_INTERVAL_SECS: u64 = 1;

/// How often the dispatcher runs the stale-job sweeper, seconds.
pub const SWEEP_INTERVAL_SECS: u64 = 10;

/// Upper bound on ancillary jobs claimed per dispatcher tick.
pub const ANCILLARY_BATCH_SIZE: usize = 5;

/// Grace period for in-flight handlers during shutdown, seconds.
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

/// Default wall-clock budget for a masscan subprocess, seconds.
pub const MASSCAN_TIMEOUT_SECS: u64 = 3600;

/// Grace between SIGTERM and SIGKILL when a scan overruns, seconds.
pub const MASSCAN_KILL_GRACE_SECS: u64 = 5;

/// Default masscan packet rate.
pub const MASSCAN_RATE: u64 = 10_000;

/// Exclude file handed to every masscan invocation.
pub const MASSCAN_EXCLUDE_FILE: &str = "masscan/exclude.conf";

/// Socket deadline for banner grabs, seconds.
pub const BANNER_TIMEOUT_SECS: u64 = 3;

/// TCP+TLS deadline for certificate retrieval, seconds.
pub const SSL_TIMEOUT_SECS: u64 = 5;

/// Per-provider deadline for geolocation lookups, seconds.
pub const GEO_PROVIDER_TIMEOUT_SECS: u64 = 10;

/// Positive geolocation results are cached this long, seconds.
pub const GEO_CACHE_POSITIVE_SECS: u64 = 86_400;

/// Failed lookups are cached this long to avoid hammering providers.
pub const GEO_CACHE_NEGATIVE_SECS: u64 = 3_600;

/// A host's geolocation is refreshed once it is older than this, days.
pub const GEO_MAX_AGE_DAYS: i64 = 30;

/// Default retry budget for jobs.
pub const MAX_RETRIES: i64 = 3;

/// Ports that get an SSL certificate job at discovery time.
pub const SSL_PORTS: &[u16] = &[443, 8443, 9443, 10443];

/// Ports probed with a plaintext HTTP GET when grabbing banners.
pub const HTTP_BANNER_PORTS: &[u16] = &[80, 8080, 8000, 8008, 8888];

/// Ports probed for domain-bearing HTTP headers during enumeration.
pub const HTTP_ENUM_PORTS: &[u16] = &[80, 8080, 8000, 8008, 8888, 3000, 5000];

/// Ports that just volunteer a greeting banner on connect.
pub const GREETING_PORTS: &[u16] = &[22, 21, 25, 587, 465];

/// The curated default port list handed to masscan when neither explicit
/// ports nor all-ports mode is requested. Grouped by service family.
pub const DEFAULT_SCAN_PORTS: &[&str] = &[
    // HTTP/HTTPS
    "80,443,8080,8443,8888,8000,8081,8082,8083,8084,8085,8086,8087,8088,8089,8090",
    // Databases (SQL Server, MySQL, PostgreSQL, Redis, MongoDB, Elasticsearch)
    "1433,1434,3306,3307,5432,5433,6379,27017,27018,27019,6380,6381,9200,9300",
    // Mail (SMTP, POP3, IMAP)
    "25,465,587,110,995,143,993",
    // FTP/SFTP/SSH
    "20,21,22,989,990",
    // DNS, DNS over TLS
    "53,853",
    // Docker API, Swarm, overlay network
    "2375,2376,2377,4789,7946",
    // Kubernetes: API server, etcd, kubelet
    "6443,8001,8002,10250,10255,10256,2379,2380",
    // Proxies / load balancers
    "3128,8118,9090,9091,9092,8181,8282",
    // SOCKS, Tor
    "1080,1081,9050,9051,9150",
    // LDAP, LDAPS
    "389,636",
    // Portmapper, Microsoft RPC, NetBIOS, SMB, Java RMI
    "111,135,139,445,1099,1098",
    // SNMP, Prometheus exporters, Alertmanager
    "161,162,9100,9090,9093,9094",
    // ISAKMP/IKE, OpenVPN, PPTP
    "500,4500,1194,1723",
    // Cassandra, CouchDB
    "7000,7001,7199,9042,8087",
    // RabbitMQ, ActiveMQ
    "5671,5672,15672,61613,61614,61616",
    // Git, SVN over HTTPS
    "9418,443",
    // RDP, VNC
    "3389,5900,5901,5902",
    // Memcached
    "11211,11212,11213,11214,11215",
    // Solr
    "8983,8984,8985",
    // Common dev servers (Django, Node, Angular, Flask)
    "8000,8080,3000,4200,5000,8008,9000",
];

/// Join the curated port groups into one masscan `--ports` argument.
pub fn default_port_spec() -> String {
    DEFAULT_SCAN_PORTS.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_spec_is_flat() {
        let spec = default_port_spec();
        assert!(spec.starts_with("80,443"));
        assert!(!spec.contains(' '));
        // Well over a hundred entries across the groups.
        assert!(spec.split(',').count() > 120);
    }

    #[test]
    fn stale_threshold_covers_heartbeats() {
        assert!(WORKER_STALE_SECS as u64 >= 2 * HEARTBEAT_INTERVAL_SECS);
    }
}
