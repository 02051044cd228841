//! IP geolocation with provider fallback and caching.
//!
//! Private and reserved addresses never reach a provider. Successful
//! lookups are cached for 24 hours, failures for one hour. The cache
//! guard is held across the fetch, so concurrent jobs for the same IP
//! cost a single provider call.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use dragnet_db::GeoRecord;
use dragnet_protocol::defaults::{
    GEO_CACHE_NEGATIVE_SECS, GEO_CACHE_POSITIVE_SECS, GEO_PROVIDER_TIMEOUT_SECS,
};

/// Result of a geolocation lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoOutcome {
    /// RFC 1918 / loopback / link-local / ULA; no provider consulted.
    PrivateIp,
    InvalidIp,
    /// Every provider came up empty.
    NotFound,
    Found(GeoRecord),
}

struct CacheEntry {
    value: Option<GeoRecord>,
    expires_at: Instant,
}

/// Geolocation client with a fixed provider order.
pub struct GeolocationClient {
    http: reqwest::Client,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Default for GeolocationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GeolocationClient {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(GEO_PROVIDER_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            http,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Look up `ip_address`, consulting the cache first.
    pub async fn lookup(&self, ip_address: &str) -> GeoOutcome {
        let Ok(ip) = ip_address.parse::<IpAddr>() else {
            warn!(ip_address, "invalid IP address for geolocation");
            return GeoOutcome::InvalidIp;
        };
        if is_private_or_reserved(ip) {
            debug!(ip_address, "skipping geolocation for private IP");
            return GeoOutcome::PrivateIp;
        }

        let mut cache = self.cache.lock().await;
        if let Some(entry) = cache.get(ip_address) {
            if entry.expires_at > Instant::now() {
                return match &entry.value {
                    Some(record) => GeoOutcome::Found(record.clone()),
                    None => GeoOutcome::NotFound,
                };
            }
            cache.remove(ip_address);
        }

        let result = self.fetch_from_providers(ip_address).await;
        let (entry, outcome) = match result {
            Some(record) => (
                CacheEntry {
                    value: Some(record.clone()),
                    expires_at: Instant::now() + Duration::from_secs(GEO_CACHE_POSITIVE_SECS),
                },
                GeoOutcome::Found(record),
            ),
            None => (
                CacheEntry {
                    value: None,
                    expires_at: Instant::now() + Duration::from_secs(GEO_CACHE_NEGATIVE_SECS),
                },
                GeoOutcome::NotFound,
            ),
        };
        cache.insert(ip_address.to_string(), entry);
        outcome
    }

    async fn fetch_from_providers(&self, ip: &str) -> Option<GeoRecord> {
        let providers: [(&str, fn(&Value, &str) -> Option<GeoRecord>); 4] = [
            ("ip-api.com", parse_ip_api),
            ("ipinfo.io", parse_ipinfo),
            ("freeipapi.com", parse_freeipapi),
            ("ipgeolocation.io", parse_ipgeolocation),
        ];

        for (provider, parse) in providers {
            match self.fetch_provider_json(provider, ip).await {
                Ok(body) => {
                    if let Some(record) = parse(&body, ip) {
                        debug!(ip, provider, "geolocation resolved");
                        return Some(record);
                    }
                }
                Err(err) => {
                    warn!(ip, provider, %err, "geolocation provider failed");
                }
            }
        }
        None
    }

    async fn fetch_provider_json(&self, provider: &str, ip: &str) -> anyhow::Result<Value> {
        let request = match provider {
            "ip-api.com" => self.http.get(format!(
                "http://ip-api.com/json/{ip}?fields=status,message,country,countryCode,region,regionName,city,lat,lon,timezone,isp,org,as,query"
            )),
            "ipinfo.io" => {
                let mut req = self.http.get(format!("https://ipinfo.io/{ip}/json"));
                if let Ok(token) = std::env::var("IPINFO_TOKEN") {
                    req = req.bearer_auth(token);
                }
                req
            }
            "freeipapi.com" => self
                .http
                .get(format!("https://freeipapi.com/api/json/{ip}")),
            "ipgeolocation.io" => {
                let mut url = format!("https://api.ipgeolocation.io/ipgeo?ip={ip}");
                if let Ok(key) = std::env::var("IPGEOLOCATION_API_KEY") {
                    url.push_str(&format!("&apiKey={key}"));
                }
                self.http.get(url)
            }
            other => anyhow::bail!("unknown provider: {other}"),
        };

        let response = request.send().await?.error_for_status()?;
        Ok(response.json().await?)
    }
}

/// Addresses that never leave the local network get no provider call.
pub fn is_private_or_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // ULA fc00::/7
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // link-local fe80::/10
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key)?.as_str().map(|s| s.to_string())
}

fn f64_field(value: &Value, key: &str) -> Option<f64> {
    let field = value.get(key)?;
    field
        .as_f64()
        .or_else(|| field.as_str().and_then(|s| s.parse().ok()))
}

fn parse_ip_api(body: &Value, _ip: &str) -> Option<GeoRecord> {
    if str_field(body, "status").as_deref() != Some("success") {
        return None;
    }
    Some(GeoRecord {
        ip: str_field(body, "query"),
        country: str_field(body, "country"),
        country_code: str_field(body, "countryCode"),
        region: str_field(body, "regionName"),
        city: str_field(body, "city"),
        latitude: f64_field(body, "lat"),
        longitude: f64_field(body, "lon"),
        timezone: str_field(body, "timezone"),
        isp: str_field(body, "isp"),
        organization: str_field(body, "org"),
        asn: str_field(body, "as"),
        provider: Some("ip-api.com".to_string()),
    })
}

fn parse_ipinfo(body: &Value, _ip: &str) -> Option<GeoRecord> {
    if body.get("error").is_some() {
        return None;
    }
    let (latitude, longitude) = match str_field(body, "loc") {
        Some(loc) => {
            let mut parts = loc.splitn(2, ',');
            (
                parts.next().and_then(|v| v.parse().ok()),
                parts.next().and_then(|v| v.parse().ok()),
            )
        }
        None => (None, None),
    };
    Some(GeoRecord {
        ip: str_field(body, "ip"),
        country: str_field(body, "country"),
        country_code: None,
        region: str_field(body, "region"),
        city: str_field(body, "city"),
        latitude,
        longitude,
        timezone: str_field(body, "timezone"),
        isp: str_field(body, "org"),
        organization: str_field(body, "org"),
        asn: None,
        provider: Some("ipinfo.io".to_string()),
    })
}

fn parse_freeipapi(body: &Value, ip: &str) -> Option<GeoRecord> {
    body.get("countryName")?;
    Some(GeoRecord {
        ip: Some(ip.to_string()),
        country: str_field(body, "countryName"),
        country_code: str_field(body, "countryCode"),
        region: str_field(body, "regionName"),
        city: str_field(body, "cityName"),
        latitude: f64_field(body, "latitude"),
        longitude: f64_field(body, "longitude"),
        timezone: str_field(body, "timeZone"),
        isp: None,
        organization: None,
        asn: None,
        provider: Some("freeipapi.com".to_string()),
    })
}

fn parse_ipgeolocation(body: &Value, _ip: &str) -> Option<GeoRecord> {
    if body.get("message").is_some() {
        return None;
    }
    Some(GeoRecord {
        ip: str_field(body, "ip"),
        country: str_field(body, "country_name"),
        country_code: str_field(body, "country_code2"),
        region: str_field(body, "state_prov"),
        city: str_field(body, "city"),
        latitude: f64_field(body, "latitude"),
        longitude: f64_field(body, "longitude"),
        timezone: body
            .get("time_zone")
            .and_then(|tz| tz.get("name"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        isp: str_field(body, "isp"),
        organization: None,
        asn: None,
        provider: Some("ipgeolocation.io".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_reserved_ranges_are_skipped() {
        for ip in [
            "10.0.0.1",
            "172.16.5.5",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
        ] {
            assert!(
                is_private_or_reserved(ip.parse().unwrap()),
                "{ip} should be private/reserved"
            );
        }
        for ip in ["8.8.8.8", "203.0.113.5", "2001:4860:4860::8888"] {
            assert!(
                !is_private_or_reserved(ip.parse().unwrap()),
                "{ip} should be public"
            );
        }
    }

    #[tokio::test]
    async fn private_ip_short_circuits() {
        let client = GeolocationClient::new();
        assert_eq!(client.lookup("192.168.1.10").await, GeoOutcome::PrivateIp);
        assert_eq!(client.lookup("not-an-ip").await, GeoOutcome::InvalidIp);
    }

    #[test]
    fn ip_api_payload_parses() {
        let body: Value = serde_json::from_str(
            r#"{
                "status": "success", "query": "203.0.113.5",
                "country": "Germany", "countryCode": "DE",
                "regionName": "Bavaria", "city": "Munich",
                "lat": 48.13, "lon": 11.57, "timezone": "Europe/Berlin",
                "isp": "Example ISP", "org": "Example Org", "as": "AS64500 Example"
            }"#,
        )
        .unwrap();
        let record = parse_ip_api(&body, "203.0.113.5").unwrap();
        assert_eq!(record.country.as_deref(), Some("Germany"));
        assert_eq!(record.country_code.as_deref(), Some("DE"));
        assert_eq!(record.latitude, Some(48.13));
        assert_eq!(record.asn.as_deref(), Some("AS64500 Example"));
        assert_eq!(record.provider.as_deref(), Some("ip-api.com"));
    }

    #[test]
    fn ip_api_failure_is_none() {
        let body: Value =
            serde_json::from_str(r#"{"status": "fail", "message": "private range"}"#).unwrap();
        assert!(parse_ip_api(&body, "10.0.0.1").is_none());
    }

    #[test]
    fn ipinfo_loc_splits_into_lat_lon() {
        let body: Value = serde_json::from_str(
            r#"{"ip": "203.0.113.5", "country": "DE", "loc": "48.13,11.57", "org": "AS64500 Example"}"#,
        )
        .unwrap();
        let record = parse_ipinfo(&body, "203.0.113.5").unwrap();
        assert_eq!(record.latitude, Some(48.13));
        assert_eq!(record.longitude, Some(11.57));
    }

    #[test]
    fn ipgeolocation_error_is_none() {
        let body: Value =
            serde_json::from_str(r#"{"message": "API key missing"}"#).unwrap();
        assert!(parse_ipgeolocation(&body, "203.0.113.5").is_none());
    }

    #[test]
    fn freeipapi_string_coordinates_parse() {
        let body: Value = serde_json::from_str(
            r#"{"countryName": "Germany", "cityName": "Munich", "latitude": "48.13", "longitude": "11.57"}"#,
        )
        .unwrap();
        let record = parse_freeipapi(&body, "203.0.113.5").unwrap();
        assert_eq!(record.latitude, Some(48.13));
        assert_eq!(record.provider.as_deref(), Some("freeipapi.com"));
    }
}
