use std::fmt::Write as _;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use reqwest::Client;
use tracing::info;
use tsdb_ingest::LoadSummary;

const REPORT_MEASUREMENT: &str = "load_benchmarks";
const DB_TYPE: &str = "tsdb";

/// Run parameters recorded alongside the result.
#[derive(Clone, Debug)]
pub struct ReportParams {
    pub hostname: String,
    pub destination: String,
    pub workers: usize,
    pub batch_size: usize,
    pub gzip: bool,
    pub tags: Vec<(String, String)>,
}

/// Persists the result of a load.
#[async_trait]
pub trait ReportSink {
    async fn report(&self, params: &ReportParams, summary: &LoadSummary) -> anyhow::Result<()>;
}

/// Writes the result as a single line-protocol record to an InfluxDB-compatible endpoint.
pub struct InfluxReporter {
    client: Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl InfluxReporter {
    pub fn new(client: Client, host: &str, database: String, user: String, password: String) -> Self {
        let url = if host.starts_with("http://") || host.starts_with("https://") {
            format!("{}/write", host.trim_end_matches('/'))
        } else {
            format!("http://{}/write", host.trim_end_matches('/'))
        };

        Self {
            client,
            url,
            database,
            user,
            password,
        }
    }
}

#[async_trait]
impl ReportSink for InfluxReporter {
    async fn report(&self, params: &ReportParams, summary: &LoadSummary) -> anyhow::Result<()> {
        let timestamp_nanos = chrono::Utc::now()
            .timestamp_nanos_opt()
            .context("System clock is outside the representable nanosecond range.")?;
        let line = render_line(params, summary, timestamp_nanos);

        let mut request = self.client.post(&self.url).query(&[("db", self.database.as_str())]);
        if !self.user.is_empty() {
            request = request.basic_auth(&self.user, Some(&self.password));
        }

        let response = request
            .body(line)
            .send()
            .await
            .with_context(|| format!("Failed to send report to '{}'.", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| String::from("<no body>"));
            bail!("Report destination responded with {}: {}", status, body);
        }

        info!(url = %self.url, database = %self.database, "Result report written.");
        Ok(())
    }
}

/// Resolves the hostname recorded in reports.
pub fn local_hostname() -> anyhow::Result<String> {
    let hostname = hostname::get().context("Failed to query the operating system for the local hostname.")?;
    Ok(hostname.to_string_lossy().into_owned())
}

fn render_line(params: &ReportParams, summary: &LoadSummary, timestamp_nanos: i64) -> String {
    let mut line = String::from(REPORT_MEASUREMENT);
    let mut tag = |key: &str, value: &str| {
        let _ = write!(line, ",{}={}", escape(key), escape(value));
    };

    tag("db_type", DB_TYPE);
    tag("hostname", &params.hostname);
    tag("destination_url", &params.destination);
    tag("workers", &params.workers.to_string());
    tag("batch_size", &params.batch_size.to_string());
    tag("gzip", if params.gzip { "true" } else { "false" });
    for (key, value) in &params.tags {
        tag(key, value);
    }

    let _ = write!(
        line,
        " items={}i,values={}i,mean_rate={},took_secs={},backoff_secs={} {}",
        summary.items,
        summary.values,
        summary.values_rate(),
        summary.elapsed.as_secs_f64(),
        summary.backoff.as_secs_f64(),
        timestamp_nanos
    );
    line
}

// Line protocol tag keys and values escape commas, spaces and equals signs.
fn escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, ',' | ' ' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn renders_line_protocol() {
        let params = ReportParams {
            hostname: "bench-1".to_string(),
            destination: "db1:8242".to_string(),
            workers: 4,
            batch_size: 1000,
            gzip: true,
            tags: vec![("run name".to_string(), "a,b".to_string())],
        };
        let summary = LoadSummary {
            items: 10,
            values: 40,
            batches: 1,
            workers: 4,
            elapsed: Duration::from_secs(2),
            backoff: Duration::ZERO,
            per_worker: Vec::new(),
        };

        assert_eq!(
            render_line(&params, &summary, 7),
            "load_benchmarks,db_type=tsdb,hostname=bench-1,destination_url=db1:8242,workers=4,batch_size=1000,\
             gzip=true,run\\ name=a\\,b items=10i,values=40i,mean_rate=20,took_secs=2,backoff_secs=0 7"
        );
    }

    #[test]
    fn hostname_comes_from_the_os() {
        let hostname = local_hostname().expect("the OS should always report a hostname");
        assert_eq!(hostname, hostname::get().unwrap().to_string_lossy());
        assert!(!hostname.is_empty());
    }

    #[test]
    fn report_url() {
        let reporter = InfluxReporter::new(Client::new(), "reports:8086/", "db".into(), "".into(), "".into());
        assert_eq!(reporter.url, "http://reports:8086/write");

        let reporter = InfluxReporter::new(Client::new(), "https://reports", "db".into(), "".into(), "".into());
        assert_eq!(reporter.url, "https://reports/write");
    }
}
