//! Banner grabbing for discovered ports.
//!
//! Prefers nmap's version probes (`-sV --script banner -oX -`), falling
//! back to a raw socket read with port-specific nudges when nmap is
//! missing or comes back empty. UDP is not supported.

use std::process::Stdio;
use std::time::Duration;

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use dragnet_protocol::defaults::{BANNER_TIMEOUT_SECS, HTTP_BANNER_PORTS};

use crate::tls;

const MAX_BANNER_LEN: usize = 500;
const TLS_BANNER_PORTS: &[u16] = &[443, 8443, 9443];

/// Grabs service banners from open ports.
pub struct BannerGrabber {
    timeout: Duration,
}

impl Default for BannerGrabber {
    fn default() -> Self {
        Self::new(Duration::from_secs(BANNER_TIMEOUT_SECS))
    }
}

impl BannerGrabber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Grab a banner from `host:port`. Returns None when nothing useful
    /// came back; per-target I/O errors are swallowed at debug level.
    pub async fn grab(&self, host: &str, port: u16, protocol: &str) -> Option<String> {
        if !protocol.eq_ignore_ascii_case("tcp") {
            return None;
        }

        match self.grab_via_nmap(host, port).await {
            Ok(Some(banner)) => return Some(banner),
            Ok(None) => {}
            Err(err) => debug!(host, port, %err, "nmap banner grab failed"),
        }

        self.grab_via_socket(host, port).await
    }

    async fn grab_via_nmap(&self, host: &str, port: u16) -> anyhow::Result<Option<String>> {
        let host_timeout = format!("{}s", self.timeout.as_secs());
        let mut cmd = Command::new("nmap");
        cmd.args([
            "-Pn",
            "-n",
            "-sV",
            "--version-light",
            "--host-timeout",
            &host_timeout,
            "--max-retries",
            "1",
            "--script",
            "banner",
            "-p",
            &port.to_string(),
            "-oX",
            "-",
        ])
        .arg(host)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

        let budget = self.timeout.saturating_add(Duration::from_secs(5)).max(Duration::from_secs(10));
        let output = match timeout(budget, cmd.output()).await {
            Ok(output) => output?,
            Err(_) => return Ok(None),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(None);
        }
        Ok(parse_nmap_banner(&stdout, port).map(|banner| clean_banner(&banner)))
    }

    async fn grab_via_socket(&self, host: &str, port: u16) -> Option<String> {
        let stream = match timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                debug!(host, port, %err, "socket banner grab failed");
                return None;
            }
            Err(_) => {
                debug!(host, port, "socket banner grab timed out");
                return None;
            }
        };

        let mut stream = stream;
        let mut banner = self.read_some(&mut stream).await.unwrap_or_default();

        if banner.is_empty() {
            if TLS_BANNER_PORTS.contains(&port) {
                banner = self.https_nudge(stream, host).await.unwrap_or_default();
            } else if HTTP_BANNER_PORTS.contains(&port) {
                banner = self.http_nudge(&mut stream, host).await.unwrap_or_default();
            } else {
                // Greeting protocols (SSH, FTP, SMTP) and everything else
                // get one more chance to volunteer something.
                banner = self.read_some(&mut stream).await.unwrap_or_default();
            }
        }

        if banner.is_empty() {
            None
        } else {
            Some(clean_banner(&banner))
        }
    }

    async fn read_some(&self, stream: &mut TcpStream) -> Option<String> {
        let mut buf = [0u8; 1024];
        match timeout(self.timeout, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).trim().to_string()),
            _ => None,
        }
    }

    async fn http_nudge(&self, stream: &mut TcpStream, host: &str) -> Option<String> {
        let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n");
        timeout(self.timeout, stream.write_all(request.as_bytes()))
            .await
            .ok()?
            .ok()?;
        self.read_some(stream).await
    }

    async fn https_nudge(&self, stream: TcpStream, host: &str) -> Option<String> {
        let connector = TlsConnector::from(tls::insecure_client_config());
        let name = tls::server_name(host)?;
        let mut tls_stream = timeout(self.timeout, connector.connect(name, stream))
            .await
            .ok()?
            .ok()?;

        let request = format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n");
        timeout(self.timeout, tls_stream.write_all(request.as_bytes()))
            .await
            .ok()?
            .ok()?;

        let mut buf = [0u8; 1024];
        match timeout(self.timeout, tls_stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => Some(String::from_utf8_lossy(&buf[..n]).trim().to_string()),
            _ => None,
        }
    }
}

/// Pull a banner out of nmap XML: service attributes first, then the
/// banner script output.
pub fn parse_nmap_banner(xml: &str, port: u16) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let port_str = port.to_string();

    let mut in_target_port = false;
    let mut service_banner: Option<String> = None;
    let mut script_banner: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) => match e.name().as_ref() {
                b"port" => {
                    in_target_port = get_attr(e, "portid").as_deref() == Some(&port_str);
                }
                b"service" if in_target_port && service_banner.is_none() => {
                    service_banner = assemble_service_banner(e);
                }
                b"script" if in_target_port => {
                    if get_attr(e, "id").as_deref() == Some("banner") {
                        if let Some(output) = get_attr(e, "output") {
                            if !output.is_empty() {
                                script_banner = Some(output);
                            }
                        }
                    }
                }
                _ => {}
            },
            Ok(Event::End(ref e)) if e.name().as_ref() == b"port" => {
                in_target_port = false;
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    service_banner.or(script_banner)
}

fn assemble_service_banner(e: &BytesStart) -> Option<String> {
    let name = get_attr(e, "name").unwrap_or_default();
    let product = get_attr(e, "product").unwrap_or_default();
    let version = get_attr(e, "version").unwrap_or_default();
    let extrainfo = get_attr(e, "extrainfo").unwrap_or_default();
    let banner_attr = get_attr(e, "banner").unwrap_or_default();

    let mut parts = Vec::new();
    for value in [&name, &product, &version] {
        if !value.is_empty() {
            parts.push(value.clone());
        }
    }
    if !extrainfo.is_empty() {
        parts.push(format!("({extrainfo})"));
    }
    if parts.is_empty() && !banner_attr.is_empty() {
        parts.push(banner_attr);
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" "))
    }
}

fn get_attr(e: &BytesStart, name: &str) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == name.as_bytes() {
            return attr.unescape_value().ok().map(|v| v.to_string());
        }
    }
    None
}

/// Normalize whitespace and truncate to a storable length.
pub fn clean_banner(banner: &str) -> String {
    let flattened = banner.replace("\r\n", " ").replace(['\n', '\r'], " ");
    let collapsed = flattened.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_BANNER_LEN {
        let truncated: String = collapsed.chars().take(MAX_BANNER_LEN).collect();
        format!("{truncated}...")
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NMAP_XML: &str = r#"<?xml version="1.0"?>
<nmaprun>
  <host>
    <ports>
      <port protocol="tcp" portid="22">
        <state state="open"/>
        <service name="ssh" product="OpenSSH" version="8.2p1" extrainfo="Ubuntu Linux; protocol 2.0"/>
        <script id="banner" output="SSH-2.0-OpenSSH_8.2p1 Ubuntu-4ubuntu0.5"/>
      </port>
      <port protocol="tcp" portid="80">
        <state state="open"/>
        <service name="http" product="nginx" version="1.18.0"/>
      </port>
    </ports>
  </host>
</nmaprun>"#;

    #[test]
    fn service_attributes_win_over_script_output() {
        let banner = parse_nmap_banner(NMAP_XML, 22).unwrap();
        assert_eq!(banner, "ssh OpenSSH 8.2p1 (Ubuntu Linux; protocol 2.0)");
    }

    #[test]
    fn right_port_is_selected() {
        let banner = parse_nmap_banner(NMAP_XML, 80).unwrap();
        assert_eq!(banner, "http nginx 1.18.0");
        assert!(parse_nmap_banner(NMAP_XML, 443).is_none());
    }

    #[test]
    fn script_output_is_the_fallback() {
        let xml = r#"<nmaprun><host><ports>
            <port protocol="tcp" portid="21">
              <service/>
              <script id="banner" output="220 ProFTPD Server ready."/>
            </port>
        </ports></host></nmaprun>"#;
        let banner = parse_nmap_banner(xml, 21).unwrap();
        assert_eq!(banner, "220 ProFTPD Server ready.");
    }

    #[test]
    fn banner_attribute_is_used_when_fields_are_empty() {
        let xml = r#"<nmaprun><host><ports>
            <port protocol="tcp" portid="23">
              <service banner="login:"/>
            </port>
        </ports></host></nmaprun>"#;
        assert_eq!(parse_nmap_banner(xml, 23).unwrap(), "login:");
    }

    #[test]
    fn malformed_xml_yields_none() {
        assert!(parse_nmap_banner("<nmaprun><port", 22).is_none());
    }

    #[test]
    fn clean_banner_normalizes_whitespace() {
        assert_eq!(
            clean_banner("HTTP/1.1 200 OK\r\nServer:   nginx\r\n\r\n"),
            "HTTP/1.1 200 OK Server: nginx"
        );
    }

    #[test]
    fn clean_banner_truncates_long_output() {
        let long = "x".repeat(600);
        let cleaned = clean_banner(&long);
        assert_eq!(cleaned.chars().count(), MAX_BANNER_LEN + 3);
        assert!(cleaned.ends_with("..."));
    }

    #[test]
    fn udp_is_unsupported() {
        let grabber = BannerGrabber::default();
        let result = futures_block(grabber.grab("192.0.2.1", 53, "udp"));
        assert!(result.is_none());
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
