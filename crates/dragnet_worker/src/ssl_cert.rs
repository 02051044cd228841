//! SSL certificate retrieval.
//!
//! Connects with verification off, captures the presented leaf
//! certificate, and decodes the fields the store keeps: subject/issuer,
//! validity window, fingerprints, SANs and the interesting extensions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::DateTime;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use dragnet_db::CertificateRecord;
use dragnet_protocol::defaults::SSL_TIMEOUT_SECS;

use crate::tls;

/// Grabs TLS certificates from hosts.
pub struct SslCertGrabber {
    timeout: Duration,
}

impl Default for SslCertGrabber {
    fn default() -> Self {
        Self::new(Duration::from_secs(SSL_TIMEOUT_SECS))
    }
}

impl SslCertGrabber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Retrieve and decode the certificate presented at `host_ip:port`.
    /// Handshake or parse failures are best-effort: logged and None.
    pub async fn grab(&self, host_ip: &str, port: u16) -> Option<CertificateRecord> {
        let der = match self.fetch_peer_der(host_ip, port).await {
            Ok(Some(der)) => der,
            Ok(None) => return None,
            Err(err) => {
                debug!(host_ip, port, %err, "certificate grab failed");
                return None;
            }
        };
        parse_certificate(&der, host_ip, port)
    }

    async fn fetch_peer_der(&self, host_ip: &str, port: u16) -> anyhow::Result<Option<Vec<u8>>> {
        let stream = timeout(self.timeout, TcpStream::connect((host_ip, port))).await??;

        let connector = TlsConnector::from(tls::insecure_client_config());
        let name = tls::server_name(host_ip)
            .ok_or_else(|| anyhow::anyhow!("invalid server name: {host_ip}"))?;
        let tls_stream = timeout(self.timeout, connector.connect(name, stream)).await??;

        let (_, session) = tls_stream.get_ref();
        Ok(session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.as_ref().to_vec()))
    }
}

/// Decode a DER certificate into the storable record.
pub fn parse_certificate(der: &[u8], host_ip: &str, port: u16) -> Option<CertificateRecord> {
    let (_, cert) = match X509Certificate::from_der(der) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(host_ip, port, %err, "certificate parse failed");
            return None;
        }
    };

    let subject = name_attributes(cert.subject());
    let issuer = name_attributes(cert.issuer());

    let mut extensions = BTreeMap::new();
    let mut san_domains = Vec::new();
    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::SubjectAlternativeName(san) => {
                let mut names = Vec::new();
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => {
                            names.push(format!("DNS:{dns}"));
                            san_domains.push(dns.to_string());
                        }
                        GeneralName::IPAddress(ip) => {
                            names.push(format!("IP:{}", hex::encode(ip)));
                        }
                        other => names.push(format!("{other}")),
                    }
                }
                extensions.insert("subjectAltName".to_string(), names.join(", "));
            }
            ParsedExtension::KeyUsage(ku) => {
                extensions.insert("keyUsage".to_string(), ku.to_string());
            }
            ParsedExtension::ExtendedKeyUsage(eku) => {
                let mut uses = Vec::new();
                if eku.any {
                    uses.push("any".to_string());
                }
                if eku.server_auth {
                    uses.push("serverAuth".to_string());
                }
                if eku.client_auth {
                    uses.push("clientAuth".to_string());
                }
                if eku.code_signing {
                    uses.push("codeSigning".to_string());
                }
                if eku.email_protection {
                    uses.push("emailProtection".to_string());
                }
                if eku.time_stamping {
                    uses.push("timeStamping".to_string());
                }
                if eku.ocsp_signing {
                    uses.push("ocspSigning".to_string());
                }
                for oid in &eku.other {
                    uses.push(oid.to_id_string());
                }
                extensions.insert("extendedKeyUsage".to_string(), uses.join(", "));
            }
            ParsedExtension::BasicConstraints(bc) => {
                let mut value = format!("CA:{}", if bc.ca { "TRUE" } else { "FALSE" });
                if let Some(len) = bc.path_len_constraint {
                    value.push_str(&format!(", pathlen:{len}"));
                }
                extensions.insert("basicConstraints".to_string(), value);
            }
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                if let Some(key_id) = &aki.key_identifier {
                    extensions.insert(
                        "authorityKeyIdentifier".to_string(),
                        hex::encode_upper(key_id.0),
                    );
                }
            }
            ParsedExtension::SubjectKeyIdentifier(ski) => {
                extensions.insert("subjectKeyIdentifier".to_string(), hex::encode_upper(ski.0));
            }
            ParsedExtension::CRLDistributionPoints(points) => {
                let mut uris = Vec::new();
                for point in points.iter() {
                    if let Some(DistributionPointName::FullName(names)) = &point.distribution_point
                    {
                        for name in names {
                            if let GeneralName::URI(uri) = name {
                                uris.push(uri.to_string());
                            }
                        }
                    }
                }
                if !uris.is_empty() {
                    extensions.insert("crlDistributionPoints".to_string(), uris.join(", "));
                }
            }
            ParsedExtension::AuthorityInfoAccess(aia) => {
                let mut entries = Vec::new();
                for desc in &aia.accessdescs {
                    if let GeneralName::URI(uri) = &desc.access_location {
                        entries.push(format!("{} - {uri}", desc.access_method.to_id_string()));
                    }
                }
                if !entries.is_empty() {
                    extensions.insert("authorityInfoAccess".to_string(), entries.join(", "));
                }
            }
            _ => {}
        }
    }

    // Domains: CN plus every DNS SAN.
    let mut domains = Vec::new();
    if let Some(cn) = subject.get("CN") {
        domains.push(cn.clone());
    }
    for san in san_domains {
        if !domains.contains(&san) {
            domains.push(san);
        }
    }

    Some(CertificateRecord {
        host_ip: host_ip.to_string(),
        port,
        subject,
        issuer,
        version: Some((cert.version().0 + 1).to_string()),
        serial_number: Some(cert.raw_serial_as_string()),
        not_before: asn1_time_to_rfc3339(cert.validity().not_before.timestamp()),
        not_after: asn1_time_to_rfc3339(cert.validity().not_after.timestamp()),
        fingerprint_sha1: fingerprint_sha1(der),
        fingerprint_sha256: fingerprint_sha256(der),
        signature_algorithm: Some(cert.signature_algorithm.algorithm.to_id_string()),
        extensions,
        domains,
        raw_certificate: hex::encode(der),
    })
}

fn name_attributes(name: &X509Name<'_>) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    let mut put = |key: &str, value: Option<&str>| {
        if let Some(value) = value {
            attrs.insert(key.to_string(), value.to_string());
        }
    };
    put(
        "CN",
        name.iter_common_name().next().and_then(|a| a.as_str().ok()),
    );
    put(
        "O",
        name.iter_organization().next().and_then(|a| a.as_str().ok()),
    );
    put(
        "OU",
        name.iter_organizational_unit()
            .next()
            .and_then(|a| a.as_str().ok()),
    );
    put("C", name.iter_country().next().and_then(|a| a.as_str().ok()));
    put(
        "ST",
        name.iter_state_or_province()
            .next()
            .and_then(|a| a.as_str().ok()),
    );
    put(
        "L",
        name.iter_locality().next().and_then(|a| a.as_str().ok()),
    );
    attrs
}

fn asn1_time_to_rfc3339(unix: i64) -> Option<String> {
    DateTime::from_timestamp(unix, 0).map(|dt| dt.to_rfc3339())
}

/// Uppercase hex SHA-1 fingerprint of the DER bytes.
pub fn fingerprint_sha1(der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(der);
    hex::encode_upper(hasher.finalize())
}

/// Uppercase hex SHA-256 fingerprint of the DER bytes.
pub fn fingerprint_sha256(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hex::encode_upper(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_are_stable_uppercase_hex() {
        let der = b"not a real certificate";
        let sha1 = fingerprint_sha1(der);
        let sha256 = fingerprint_sha256(der);
        assert_eq!(sha1.len(), 40);
        assert_eq!(sha256.len(), 64);
        assert_eq!(sha1, sha1.to_uppercase());
        assert_eq!(sha256, sha256.to_uppercase());
        // Same bytes, same identity.
        assert_eq!(sha256, fingerprint_sha256(der));
    }

    #[test]
    fn timestamps_render_rfc3339() {
        let rendered = asn1_time_to_rfc3339(0).unwrap();
        assert!(rendered.starts_with("1970-01-01T00:00:00"));
    }

    #[test]
    fn garbage_der_parses_to_none() {
        assert!(parse_certificate(b"garbage", "203.0.113.5", 443).is_none());
    }
}
