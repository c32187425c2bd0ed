use std::{num::ParseIntError, time::Duration};

use anyhow::{bail, Context as _};
use clap::{ArgAction, Parser, ValueEnum};
use tracing::level_filters::LevelFilter;
use tsdb_ingest::{
    reader::InputFormat,
    transport::{RetryPolicy, DEFAULT_MAX_DIAL_ATTEMPTS},
    Endpoint, LoadSettings, TransportKind,
};

/// Workload the input corpus was generated for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum UseCase {
    Devops,
    Iot,
    Dashboard,
    Vehicle,
}

impl UseCase {
    /// Checks that points of this use case can be loaded.
    ///
    /// Only the vehicle workload has a known, fixed field set per point.
    pub fn ensure_supported(self) -> anyhow::Result<()> {
        match self {
            Self::Vehicle => Ok(()),
            other => bail!("Use case '{:?}' is not supported: its field count per point is not known.", other),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum InputFormatArg {
    Json,
    Binary,
}

impl From<InputFormatArg> for InputFormat {
    fn from(value: InputFormatArg) -> Self {
        match value {
            InputFormatArg::Json => InputFormat::Json,
            InputFormatArg::Binary => InputFormat::Binary,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum TransportArg {
    Http,
    Rpc,
}

impl From<TransportArg> for TransportKind {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Http => TransportKind::Http,
            TransportArg::Rpc => TransportKind::Rpc,
        }
    }
}

fn parse_millis(value: &str) -> Result<Duration, ParseIntError> {
    value.parse().map(Duration::from_millis)
}

/// Loads a pre-generated point corpus from stdin into a time-series store.
#[derive(Parser, Debug)]
#[command(about)]
pub struct Cli {
    /// Enable verbose output. (Specify twice for more verbosity.)
    #[arg(short = 'v', long, action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,

    /// Target hosts, comma-separated. Workers are assigned to them round-robin.
    #[arg(long, default_value = "127.0.0.1")]
    pub hosts: String,

    /// Target port.
    #[arg(long, default_value_t = 8242)]
    pub port: u16,

    /// Use case the input was generated for.
    #[arg(long, value_enum, default_value_t = UseCase::Vehicle)]
    pub use_case: UseCase,

    /// Records per batch.
    #[arg(long, default_value_t = 1000)]
    pub batch_size: usize,

    /// Number of concurrent workers.
    #[arg(long, default_value_t = 1)]
    pub workers: usize,

    /// Number of runtime worker threads.
    #[arg(long, default_value_t = 16)]
    pub cores: usize,

    /// Time to wait, in milliseconds, when an HTTP target signals backpressure.
    #[arg(long = "backoff", value_name = "MILLIS", value_parser = parse_millis, default_value = "1000")]
    pub http_backoff: Duration,

    /// Input encoding.
    #[arg(long, value_enum, default_value_t = InputFormatArg::Json)]
    pub input_format: InputFormatArg,

    /// Transport used to reach the target. HTTP carries JSON input, RPC carries binary input.
    #[arg(long, value_enum, default_value_t = TransportArg::Http)]
    pub transport: TransportArg,

    /// Whether to write data. Set to false to measure input read speed.
    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    pub do_load: bool,

    /// Attempts per RPC batch before the worker gives up.
    #[arg(long, default_value_t = 4)]
    pub rpc_max_attempts: usize,

    /// Base interval between RPC retries, in milliseconds. The Nth retry waits N times this.
    #[arg(long, value_name = "MILLIS", value_parser = parse_millis, default_value = "1000")]
    pub rpc_retry_interval: Duration,

    /// Database to store the result report in.
    #[arg(long, default_value = "database_benchmarks")]
    pub report_database: String,

    /// Host to send the result report to. No report is sent when unset.
    #[arg(long)]
    pub report_host: Option<String>,

    /// User for the report host.
    #[arg(long, default_value = "")]
    pub report_user: String,

    /// Password for the report host.
    #[arg(long, default_value = "")]
    pub report_password: String,

    /// Extra tags for the result report, as comma-separated `key:value` pairs.
    #[arg(long, default_value = "")]
    pub report_tags: String,
}

impl Cli {
    /// Gets the configured log level based on the user-supplied verbosity level.
    pub fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    }

    /// Builds the load settings, checking everything that can be checked before touching the network.
    pub fn load_settings(&self) -> anyhow::Result<LoadSettings> {
        self.use_case.ensure_supported()?;

        if self.cores == 0 {
            bail!("Impossible cores number: {}.", self.cores);
        }

        let endpoints = Endpoint::parse_list(&self.hosts, self.port);
        let settings = LoadSettings {
            endpoints,
            batch_size: self.batch_size,
            workers: self.workers,
            input_format: self.input_format.into(),
            transport: self.transport.into(),
            do_load: self.do_load,
            retry: RetryPolicy {
                max_dial_attempts: DEFAULT_MAX_DIAL_ATTEMPTS,
                max_send_attempts: self.rpc_max_attempts,
                interval: self.rpc_retry_interval,
            },
            http_backoff: self.http_backoff,
        };
        settings.validate().context("Invalid load settings.")?;

        Ok(settings)
    }

    /// Parses the extra report tags.
    pub fn report_tags(&self) -> anyhow::Result<Vec<(String, String)>> {
        self.report_tags
            .split(',')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                pair.split_once(':')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .with_context(|| format!("Report tag '{}' is not a key:value pair.", pair))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("bulk-load").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults() {
        let cli = parse(&[]);
        let settings = cli.load_settings().unwrap();

        assert_eq!(settings.endpoints, vec![Endpoint::new("127.0.0.1", 8242)]);
        assert_eq!(settings.batch_size, 1000);
        assert_eq!(settings.workers, 1);
        assert_eq!(settings.transport, TransportKind::Http);
        assert_eq!(settings.input_format, InputFormat::Json);
        assert!(settings.do_load);
        assert_eq!(settings.http_backoff, Duration::from_secs(1));
        assert_eq!(settings.retry.max_send_attempts, 4);
        assert_eq!(cli.log_level(), LevelFilter::INFO);
    }

    #[test]
    fn rpc_settings() {
        let cli = parse(&[
            "--hosts",
            "db1,db2",
            "--port",
            "9000",
            "--transport",
            "rpc",
            "--input-format",
            "binary",
            "--do-load",
            "false",
            "--rpc-retry-interval",
            "250",
            "-vv",
        ]);
        let settings = cli.load_settings().unwrap();

        assert_eq!(settings.endpoints.len(), 2);
        assert_eq!(settings.endpoints[1], Endpoint::new("db2", 9000));
        assert_eq!(settings.transport, TransportKind::Rpc);
        assert!(!settings.do_load);
        assert_eq!(settings.retry.interval, Duration::from_millis(250));
        assert_eq!(cli.log_level(), LevelFilter::TRACE);
    }

    #[test]
    fn configuration_faults() {
        assert!(parse(&["--use-case", "devops"]).load_settings().is_err());
        assert!(parse(&["--cores", "0"]).load_settings().is_err());
        assert!(parse(&["--workers", "0"]).load_settings().is_err());
        assert!(parse(&["--transport", "rpc"]).load_settings().is_err());
        assert!(parse(&["--input-format", "binary"]).load_settings().is_err());
    }

    #[test]
    fn report_tags() {
        let cli = parse(&["--report-tags", "env:ci,run:42"]);
        assert_eq!(
            cli.report_tags().unwrap(),
            vec![("env".into(), "ci".into()), ("run".into(), "42".into())]
        );

        assert!(parse(&["--report-tags", "oops"]).report_tags().is_err());
        assert!(parse(&[]).report_tags().unwrap().is_empty());
    }
}
