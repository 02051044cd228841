//! Job commands: create, list, status, cancel, cleanup.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Args;
use regex::Regex;

use dragnet_db::CreateJobRequest;
use dragnet_protocol::{JobStatus, PrimaryJobType, ScanOptions};

use super::output::{opt, short_uuid, status_cell, table};

#[derive(Args, Debug)]
pub struct CreateJobArgs {
    /// Job type.
    #[arg(long = "type", value_name = "TYPE")]
    job_type: String,
    /// Target IP, CIDR range, or hostname.
    #[arg(long)]
    target: String,
    /// Ports to scan (comma-separated).
    #[arg(long, value_delimiter = ',')]
    ports: Vec<u16>,
    /// Queue name.
    #[arg(long, default_value = "default")]
    queue: String,
    /// Job priority (higher runs first).
    #[arg(long, default_value_t = 0)]
    priority: i64,
    /// Schedule for later (RFC 3339 or `YYYY-MM-DDTHH:MM:SS`).
    #[arg(long)]
    schedule: Option<String>,
    /// Use SYN scan (the default mode).
    #[arg(long)]
    syn: bool,
    /// Use TCP connect scan.
    #[arg(long)]
    tcp: bool,
    /// Use UDP scan.
    #[arg(long)]
    udp: bool,
    /// Scan the full 1-65535 range.
    #[arg(long)]
    all_ports: bool,
    /// Packet rate.
    #[arg(long)]
    rate: Option<u64>,
    /// Maximum scan duration in seconds.
    #[arg(long, default_value_t = 3600)]
    timeout: u64,
    /// Route the scanner through proxychains.
    #[arg(long)]
    proxychains: bool,
    /// Resume a previously interrupted scan.
    #[arg(long)]
    resume: bool,
}

pub async fn create_job(args: CreateJobArgs) -> Result<()> {
    let job_type: PrimaryJobType = args
        .job_type
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown job type: {}", args.job_type))?;

    validate_target(&args.target)?;
    let scheduled_for = args
        .schedule
        .as_deref()
        .map(parse_schedule)
        .transpose()
        .context("invalid --schedule value")?;

    let options = ScanOptions {
        syn: args.syn || !(args.tcp || args.udp),
        tcp: args.tcp,
        udp: args.udp,
        all_ports: args.all_ports,
        rate: args.rate,
        timeout: Some(args.timeout),
        use_proxychains: args.proxychains,
        resume: args.resume,
        ..Default::default()
    };

    let store = super::open_store().await?;
    let job = store
        .create_primary_job(CreateJobRequest {
            job_type,
            target: args.target,
            queue: args.queue,
            ports: args.ports,
            options,
            priority: args.priority,
            scheduled_for,
            max_retries: 3,
        })
        .await?;

    println!("Created job {}", job.job_uuid);
    println!("  type:     {}", job.job_type);
    println!("  target:   {}", job.target);
    println!("  priority: {}", job.priority);
    if let Some(scheduled) = &job.scheduled_for {
        println!("  scheduled for: {scheduled}");
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct ListJobsArgs {
    /// Filter by status.
    #[arg(long)]
    status: Option<String>,
    /// Filter by queue.
    #[arg(long)]
    queue: Option<String>,
    /// Maximum rows.
    #[arg(long, default_value_t = 50)]
    limit: i64,
}

pub async fn list_jobs(args: ListJobsArgs) -> Result<()> {
    let status = args
        .status
        .as_deref()
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(|err| anyhow::anyhow!("{err}"))?;

    let store = super::open_store().await?;
    let jobs = store
        .list_jobs(status, args.queue.as_deref(), args.limit)
        .await?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    let mut out = table(&["UUID", "TYPE", "STATUS", "TARGET", "PRIORITY", "PROGRESS", "CREATED"]);
    for job in &jobs {
        out.add_row(vec![
            comfy_table::Cell::new(short_uuid(&job.job_uuid)),
            comfy_table::Cell::new(&job.job_type),
            status_cell(job.status()),
            comfy_table::Cell::new(&job.target),
            comfy_table::Cell::new(job.priority),
            comfy_table::Cell::new(format!("{}%", job.progress)),
            comfy_table::Cell::new(&job.created_at),
        ]);
    }
    println!("{out}");
    println!("{} job(s)", jobs.len());
    Ok(())
}

pub async fn job_status(job_uuid: &str) -> Result<()> {
    let store = super::open_store().await?;
    let Some(job) = store.primary_by_uuid(job_uuid).await? else {
        bail!("job not found: {job_uuid}");
    };

    println!("Job {}", job.job_uuid);
    println!("  type:         {}", job.job_type);
    println!("  status:       {}", job.status());
    println!("  target:       {}", job.target);
    println!("  progress:     {}%", job.progress);
    println!("  retries:      {}/{}", job.retry_count, job.max_retries);
    println!("  created at:   {}", job.created_at);
    println!("  started at:   {}", opt(&job.started_at));
    println!("  completed at: {}", opt(&job.completed_at));
    if let Some(worker) = &job.assigned_worker {
        println!("  worker:       {worker}");
    }
    if let Some(error) = &job.error_message {
        println!("  error:        {error}");
    }
    Ok(())
}

pub async fn cancel(job_uuid: &str) -> Result<()> {
    let store = super::open_store().await?;
    if store.cancel_job(job_uuid).await? {
        println!("Cancelled job {job_uuid}");
        Ok(())
    } else {
        bail!("job {job_uuid} not found or not cancellable");
    }
}

pub async fn cleanup(days: i64, dry_run: bool) -> Result<()> {
    let store = super::open_store().await?;
    let report = store.cleanup(days, dry_run).await?;
    if dry_run {
        println!(
            "Would delete {} primary and {} ancillary job(s) older than {days} day(s)",
            report.primary, report.ancillary
        );
    } else {
        println!(
            "Deleted {} primary and {} ancillary job(s) older than {days} day(s)",
            report.primary, report.ancillary
        );
    }
    Ok(())
}

/// Accept an IPv4 address, an IPv4 CIDR range, or a hostname.
fn validate_target(target: &str) -> Result<()> {
    if target.is_empty() {
        bail!("target must not be empty");
    }

    let (addr, prefix) = match target.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (target, None),
    };

    if let Some(prefix) = prefix {
        let bits: u8 = prefix
            .parse()
            .with_context(|| format!("invalid CIDR prefix in target: {target}"))?;
        if bits > 32 {
            bail!("invalid CIDR prefix in target: {target}");
        }
        addr.parse::<std::net::Ipv4Addr>()
            .with_context(|| format!("invalid network address in target: {target}"))?;
        return Ok(());
    }

    if addr.parse::<std::net::Ipv4Addr>().is_ok() {
        return Ok(());
    }

    let hostname = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?)*$",
    )
    .expect("static pattern");
    if hostname.is_match(addr) && addr.len() <= 253 {
        return Ok(());
    }
    bail!("invalid target: {target}");
}

fn parse_schedule(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .with_context(|| format!("unparseable schedule: {raw}"))?;
    Ok(naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_validate() {
        assert!(validate_target("192.0.2.1").is_ok());
        assert!(validate_target("10.0.0.0/30").is_ok());
        assert!(validate_target("scanme.example.com").is_ok());
        assert!(validate_target("").is_err());
        assert!(validate_target("10.0.0.0/64").is_err());
        assert!(validate_target("not a host").is_err());
        assert!(validate_target("999.1.2.3").is_err());
    }

    #[test]
    fn schedules_parse() {
        assert!(parse_schedule("2026-08-01T12:00:00+00:00").is_ok());
        assert!(parse_schedule("2026-08-01T12:00:00").is_ok());
        assert!(parse_schedule("noon tomorrow").is_err());
    }
}
