//! Metrics exposition in Prometheus text format.

use anyhow::Result;

use dragnet_db::MetricsReport;

pub async fn print_metrics() -> Result<()> {
    let store = super::open_store().await?;
    let report = store.metrics_snapshot().await?;
    print!("{}", render(&report));
    Ok(())
}

/// Render the aggregate report as text exposition lines.
pub fn render(report: &MetricsReport) -> String {
    let mut out = String::new();

    out.push_str("# HELP dragnet_primary_jobs Primary jobs by status\n");
    out.push_str("# TYPE dragnet_primary_jobs gauge\n");
    for (status, count) in &report.primary_by_status {
        out.push_str(&format!(
            "dragnet_primary_jobs{{status=\"{status}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP dragnet_ancillary_jobs Ancillary jobs by type and status\n");
    out.push_str("# TYPE dragnet_ancillary_jobs gauge\n");
    for (job_type, status, count) in &report.ancillary_by_status {
        out.push_str(&format!(
            "dragnet_ancillary_jobs{{type=\"{job_type}\",status=\"{status}\"}} {count}\n"
        ));
    }

    out.push_str("# HELP dragnet_workers Workers by status\n");
    out.push_str("# TYPE dragnet_workers gauge\n");
    for (status, count) in &report.workers_by_status {
        out.push_str(&format!("dragnet_workers{{status=\"{status}\"}} {count}\n"));
    }

    out.push_str("# HELP dragnet_queue_depth Pending jobs per queue\n");
    out.push_str("# TYPE dragnet_queue_depth gauge\n");
    for (queue, depth) in &report.queue_depth {
        out.push_str(&format!("dragnet_queue_depth{{queue=\"{queue}\"}} {depth}\n"));
    }

    out.push_str("# HELP dragnet_hosts_total Hosts discovered\n");
    out.push_str("# TYPE dragnet_hosts_total gauge\n");
    out.push_str(&format!("dragnet_hosts_total {}\n", report.hosts_total));
    out.push_str("# HELP dragnet_hosts_recent Hosts seen in the last hour\n");
    out.push_str("# TYPE dragnet_hosts_recent gauge\n");
    out.push_str(&format!("dragnet_hosts_recent {}\n", report.hosts_last_hour));

    out.push_str("# HELP dragnet_ports_total Ports discovered\n");
    out.push_str("# TYPE dragnet_ports_total gauge\n");
    out.push_str(&format!("dragnet_ports_total {}\n", report.ports_total));
    out.push_str("# HELP dragnet_ports_recent Ports seen in the last hour\n");
    out.push_str("# TYPE dragnet_ports_recent gauge\n");
    out.push_str(&format!("dragnet_ports_recent {}\n", report.ports_last_hour));

    out.push_str("# HELP dragnet_domains_total Domains recorded\n");
    out.push_str("# TYPE dragnet_domains_total gauge\n");
    out.push_str(&format!("dragnet_domains_total {}\n", report.domains_total));
    out.push_str("# HELP dragnet_certificates_total Certificates recorded\n");
    out.push_str("# TYPE dragnet_certificates_total gauge\n");
    out.push_str(&format!(
        "dragnet_certificates_total {}\n",
        report.certificates_total
    ));

    out.push_str("# HELP dragnet_primary_errors_total Failed primary jobs\n");
    out.push_str("# TYPE dragnet_primary_errors_total gauge\n");
    out.push_str(&format!(
        "dragnet_primary_errors_total {}\n",
        report.primary_errors
    ));
    out.push_str("# HELP dragnet_primary_cancelled_total Cancelled primary jobs\n");
    out.push_str("# TYPE dragnet_primary_cancelled_total gauge\n");
    out.push_str(&format!(
        "dragnet_primary_cancelled_total {}\n",
        report.primary_cancelled
    ));

    out.push_str("# HELP dragnet_job_progress Progress of running primary jobs\n");
    out.push_str("# TYPE dragnet_job_progress gauge\n");
    for (job_uuid, progress) in &report.running_progress {
        out.push_str(&format!(
            "dragnet_job_progress{{job=\"{job_uuid}\"}} {progress}\n"
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_section() {
        let report = MetricsReport {
            primary_by_status: vec![("completed".into(), 3)],
            ancillary_by_status: vec![("banner_grab".into(), "pending".into(), 5)],
            workers_by_status: vec![("idle".into(), 1)],
            queue_depth: vec![("default".into(), 2)],
            hosts_total: 10,
            hosts_last_hour: 4,
            ports_total: 25,
            ports_last_hour: 7,
            domains_total: 3,
            certificates_total: 1,
            primary_errors: 1,
            primary_cancelled: 0,
            running_progress: vec![("abc-123".into(), 40)],
        };
        let text = render(&report);
        assert!(text.contains("dragnet_primary_jobs{status=\"completed\"} 3"));
        assert!(text.contains("dragnet_ancillary_jobs{type=\"banner_grab\",status=\"pending\"} 5"));
        assert!(text.contains("dragnet_workers{status=\"idle\"} 1"));
        assert!(text.contains("dragnet_queue_depth{queue=\"default\"} 2"));
        assert!(text.contains("dragnet_hosts_total 10"));
        assert!(text.contains("dragnet_ports_recent 7"));
        assert!(text.contains("dragnet_job_progress{job=\"abc-123\"} 40"));
    }
}
