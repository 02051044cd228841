//! Masscan command assembly and the streaming discovery pipeline.
//!
//! The subprocess's stdout is parsed line by line as it arrives; every
//! `Discovered open port ...` line becomes one atomic store transaction
//! (upsert + follow-up fan-out). The scan has a hard wall-clock budget:
//! polite termination first, SIGKILL after a short grace.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use dragnet_db::{PrimaryJobRow, Store};
use dragnet_protocol::defaults::{
    default_port_spec, MASSCAN_KILL_GRACE_SECS, MASSCAN_RATE, MASSCAN_TIMEOUT_SECS,
    MASSCAN_EXCLUDE_FILE,
};
use dragnet_protocol::ScanOptions;

use crate::metrics::{Metrics, METRICS};
use crate::shutdown::ShutdownSignal;

/// Builds the masscan command line. Plain data with setters, stringified
/// at the end; the assembled command is also what lands on the scan row.
#[derive(Debug, Clone)]
pub struct MasscanCommand {
    masscan_path: String,
    target: String,
    top_ports: bool,
    udp: bool,
    tcp: bool,
    syn: bool,
    banners: bool,
    wait: u64,
    rate: u64,
    exclude_file: String,
    resume: bool,
    all_ports: bool,
    ports: String,
    proxychains: bool,
}

impl Default for MasscanCommand {
    fn default() -> Self {
        Self {
            masscan_path: "/usr/bin/masscan".to_string(),
            target: String::new(),
            top_ports: false,
            udp: false,
            tcp: false,
            syn: true,
            banners: false,
            wait: 0,
            rate: MASSCAN_RATE,
            exclude_file: MASSCAN_EXCLUDE_FILE.to_string(),
            resume: false,
            all_ports: false,
            ports: default_port_spec(),
            proxychains: false,
        }
    }
}

impl MasscanCommand {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Self::default()
        }
    }

    /// Apply job options the way the scheduler stores them.
    pub fn apply_options(mut self, options: &ScanOptions) -> Self {
        self.syn = options.syn;
        if options.tcp {
            self.tcp = true;
        }
        if options.udp {
            self.udp = true;
        }
        if options.tcp_udp {
            self.tcp = true;
            self.udp = true;
        }
        if let Some(rate) = options.rate {
            self.rate = rate;
        }
        if options.resume {
            self.resume = true;
        }
        if options.all_ports {
            self.all_ports = true;
        }
        self.proxychains = options.use_proxychains;
        self
    }

    /// Explicit ports disable all-ports mode.
    pub fn with_ports(mut self, ports: &[u16]) -> Self {
        if !ports.is_empty() {
            self.ports = ports
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.all_ports = false;
        }
        self
    }

    pub fn with_masscan_path(mut self, path: impl Into<String>) -> Self {
        self.masscan_path = path.into();
        self
    }

    pub fn with_banners(mut self, enabled: bool) -> Self {
        self.banners = enabled;
        self
    }

    /// Assemble the shell command string.
    pub fn build(&self) -> String {
        let mut cmd: Vec<String> = Vec::new();
        if self.proxychains {
            cmd.push("proxychains".to_string());
        }
        cmd.push(self.masscan_path.clone());

        if !self.target.is_empty() {
            cmd.push(self.target.clone());
        }

        if self.udp {
            cmd.push("-sU".to_string());
        }
        if self.tcp {
            cmd.push("-sT".to_string());
        }
        if self.syn {
            cmd.push("-sS".to_string());
        }

        if self.top_ports {
            cmd.push("--top-ports".to_string());
        } else if self.all_ports {
            cmd.push("--ports".to_string());
            cmd.push("1-65535".to_string());
        } else {
            cmd.push("--ports".to_string());
            cmd.push(self.ports.clone());
        }

        if self.banners {
            cmd.push("--banners".to_string());
        }

        cmd.push("--wait".to_string());
        cmd.push(self.wait.to_string());
        cmd.push("--rate".to_string());
        cmd.push(self.rate.to_string());
        cmd.push("--exclude-file".to_string());
        cmd.push(self.exclude_file.clone());

        if self.resume {
            cmd.push("--resume".to_string());
        }

        cmd.join(" ")
    }
}

/// Runs masscan jobs against the store.
pub struct DiscoveryPipeline {
    store: Store,
    discovery_pattern: Regex,
    /// Overrides the job's command, for tests that fake the scanner.
    command_override: Option<String>,
}

impl DiscoveryPipeline {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            discovery_pattern: Regex::new(
                r"Discovered open port (\d+)/(tcp|udp) on ((?:\d{1,3}\.){3}\d{1,3})",
            )
            .expect("static pattern"),
            command_override: None,
        }
    }

    /// Replace the assembled masscan invocation with an arbitrary shell
    /// command. The pipeline consumes its stdout exactly as it would
    /// masscan's.
    pub fn with_command_override(mut self, command: impl Into<String>) -> Self {
        self.command_override = Some(command.into());
        self
    }

    /// Execute a masscan job end to end. The job row is not transitioned
    /// here; the caller owns lifecycle marks.
    pub async fn run(&self, job: &PrimaryJobRow, shutdown: &ShutdownSignal) -> Result<()> {
        let options = job.options();
        let command = match &self.command_override {
            Some(command) => command.clone(),
            None => MasscanCommand::new(&job.target)
                .apply_options(&options)
                .with_ports(&job.ports())
                .build(),
        };
        let budget = Duration::from_secs(options.timeout.unwrap_or(MASSCAN_TIMEOUT_SECS));

        let scan = self.store.create_scan(&command, "masscan").await?;
        self.store.attach_scan(job.id, scan.id).await?;
        info!(job_uuid = %job.job_uuid, scan_uuid = %scan.scan_uuid, %command, "starting scan");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to spawn scan subprocess")?;

        let stdout = child.stdout.take().context("scan subprocess has no stdout")?;
        let stderr = child.stderr.take().context("scan subprocess has no stderr")?;

        let run = async {
            let stream = self.consume_stdout(stdout, scan.id, job.id, shutdown);
            let drain = drain_stderr(stderr);
            let (streamed, _) = tokio::join!(stream, drain);
            streamed?;
            child.wait().await.context("Failed to wait for scan subprocess")
        };

        match timeout(budget, run).await {
            Ok(Ok(status)) if status.success() => {
                self.store.finish_scan(scan.id, "completed").await?;
                info!(job_uuid = %job.job_uuid, "scan completed");
                Ok(())
            }
            Ok(Ok(status)) => {
                self.store.finish_scan(scan.id, "failed").await?;
                bail!(
                    "masscan failed with exit code {}",
                    status.code().unwrap_or(-1)
                );
            }
            Ok(Err(err)) => {
                self.store.finish_scan(scan.id, "failed").await?;
                Err(err)
            }
            Err(_) => {
                let secs = budget.as_secs();
                warn!(job_uuid = %job.job_uuid, secs, "scan timed out, terminating");
                terminate_child(&mut child).await;
                self.store.finish_scan(scan.id, "failed").await?;
                bail!("masscan timed out after {secs} seconds");
            }
        }
    }

    /// Read stdout in small chunks, frame on newlines, and process each
    /// discovery line in order. A worker shutdown interrupts the stream
    /// mid-read; the subprocess is then reaped via kill-on-drop.
    async fn consume_stdout(
        &self,
        mut stdout: tokio::process::ChildStdout,
        scan_id: i64,
        job_id: i64,
        shutdown: &ShutdownSignal,
    ) -> Result<()> {
        let mut chunk = [0u8; 1024];
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let read = tokio::select! {
                _ = shutdown.signalled() => bail!("scan interrupted by worker shutdown"),
                read = stdout.read(&mut chunk) => read?,
            };
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line[..line.len() - 1]);
                let line = line.trim();
                if !line.is_empty() {
                    self.handle_line(line, scan_id, job_id).await?;
                }
            }
        }

        // Trailing data without a newline still counts.
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer);
            let line = line.trim();
            if !line.is_empty() {
                self.handle_line(line, scan_id, job_id).await?;
            }
        }

        Ok(())
    }

    async fn handle_line(&self, line: &str, scan_id: i64, job_id: i64) -> Result<()> {
        let Some(caps) = self.discovery_pattern.captures(line) else {
            debug!(line, "ignoring scan output");
            return Ok(());
        };
        let port: u16 = caps[1].parse().context("port out of range")?;
        let proto = &caps[2];
        let host_ip = &caps[3];

        let outcome = self
            .store
            .record_discovery(scan_id, job_id, host_ip, port, proto)
            .await?;
        Metrics::inc(&METRICS.discoveries);
        Metrics::add(&METRICS.followups_enqueued, outcome.enqueued.len() as u64);
        Ok(())
    }
}

async fn drain_stderr(mut stderr: tokio::process::ChildStderr) {
    let mut sink = Vec::new();
    let _ = stderr.read_to_end(&mut sink).await;
    if !sink.is_empty() {
        debug!(bytes = sink.len(), "scan stderr drained");
    }
}

/// SIGTERM, wait out the grace period, then SIGKILL.
async fn terminate_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        if timeout(Duration::from_secs(MASSCAN_KILL_GRACE_SECS), child.wait())
            .await
            .is_ok()
        {
            return;
        }
    }

    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_command_shape() {
        let cmd = MasscanCommand::new("10.0.0.0/24").build();
        assert!(cmd.starts_with("/usr/bin/masscan 10.0.0.0/24 -sS --ports 80,443"));
        assert!(cmd.contains("--wait 0"));
        assert!(cmd.contains("--rate 10000"));
        assert!(cmd.contains("--exclude-file masscan/exclude.conf"));
        assert!(!cmd.contains("--resume"));
    }

    #[test]
    fn explicit_ports_override_the_curated_list() {
        let cmd = MasscanCommand::new("192.0.2.1")
            .with_ports(&[22, 80])
            .build();
        assert!(cmd.contains("--ports 22,80"));
        assert!(!cmd.contains("1-65535"));
    }

    #[test]
    fn all_ports_mode() {
        let options = ScanOptions {
            all_ports: true,
            ..Default::default()
        };
        let cmd = MasscanCommand::new("192.0.2.1")
            .apply_options(&options)
            .build();
        assert!(cmd.contains("--ports 1-65535"));
    }

    #[test]
    fn explicit_ports_win_over_all_ports() {
        let options = ScanOptions {
            all_ports: true,
            ..Default::default()
        };
        let cmd = MasscanCommand::new("192.0.2.1")
            .apply_options(&options)
            .with_ports(&[443])
            .build();
        assert!(cmd.contains("--ports 443"));
        assert!(!cmd.contains("1-65535"));
    }

    #[test]
    fn scan_mode_flags() {
        let options = ScanOptions {
            syn: false,
            tcp_udp: true,
            rate: Some(100),
            resume: true,
            use_proxychains: true,
            ..Default::default()
        };
        let cmd = MasscanCommand::new("192.0.2.1")
            .apply_options(&options)
            .build();
        assert!(cmd.starts_with("proxychains /usr/bin/masscan"));
        assert!(cmd.contains("-sU"));
        assert!(cmd.contains("-sT"));
        assert!(!cmd.contains("-sS"));
        assert!(cmd.contains("--rate 100"));
        assert!(cmd.ends_with("--resume"));
    }

    #[test]
    fn discovery_pattern_matches_masscan_output() {
        let re = Regex::new(r"Discovered open port (\d+)/(tcp|udp) on ((?:\d{1,3}\.){3}\d{1,3})")
            .unwrap();
        let caps = re
            .captures("Discovered open port 443/tcp on 203.0.113.5")
            .unwrap();
        assert_eq!(&caps[1], "443");
        assert_eq!(&caps[2], "tcp");
        assert_eq!(&caps[3], "203.0.113.5");

        assert!(re.captures("Discovered open port 53/udp on 10.0.0.1").is_some());
        // Case-sensitive and protocol-restricted.
        assert!(re.captures("discovered open port 80/tcp on 10.0.0.1").is_none());
        assert!(re.captures("Discovered open port 80/sctp on 10.0.0.1").is_none());
        assert!(re.captures("rate: 0.10-kpps, 0.00% done").is_none());
    }
}
