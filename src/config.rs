use crate::constants;
use crate::error::{ExcavatorError, Result};
use clap::{Parser, ValueEnum};
use regex::Regex;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// What a run does with the export directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Convert .evtx files to XML exports only
    Xml,
    /// Parse and normalize exports, print documents without sending
    Json,
    /// Parse, normalize and send exports to the index
    Send,
    /// Convert, then parse, normalize and send (Windows only)
    Auto,
}

impl Mode {
    pub fn converts(self) -> bool {
        matches!(self, Mode::Xml | Mode::Auto)
    }

    pub fn processes(self) -> bool {
        !matches!(self, Mode::Xml)
    }

    pub fn delivers(self) -> bool {
        matches!(self, Mode::Send | Mode::Auto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Http,
    Https,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "excavator")]
#[command(about = "Reassemble exported event logs and bulk-load them into an index")]
#[command(version)]
pub struct Cli {
    /// Operating mode
    #[arg(short = 'm', long, value_enum)]
    pub mode: Option<Mode>,

    /// Directory holding the exported logs
    #[arg(short = 'p', long)]
    pub path: Option<PathBuf>,

    /// Index host. Default is 127.0.0.1
    #[arg(long)]
    pub ip: Option<String>,

    /// Index port. Default is 9200
    #[arg(long)]
    pub port: Option<u16>,

    /// http or https
    #[arg(long, value_enum)]
    pub scheme: Option<Scheme>,

    /// Username for index authorization
    #[arg(long)]
    pub user: Option<String>,

    /// Password for index authorization
    #[arg(long)]
    pub pwd: Option<String>,

    /// File to process; '*' selects every file in the directory
    #[arg(short = 'f', long)]
    pub file: Option<String>,

    /// Name of the target index
    #[arg(short = 'i', long)]
    pub index: Option<String>,

    /// Number of documents per bulk request
    #[arg(short = 's', long)]
    pub size: Option<usize>,

    /// TOML file with [sink], [retry] and [pipeline] sections
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Give up on a batch after this many failed attempts (unbounded when omitted)
    #[arg(long)]
    pub retry_max_attempts: Option<u32>,

    /// Pause between failed bulk attempts
    #[arg(long)]
    pub retry_backoff_ms: Option<u64>,

    /// Number of files processed concurrently
    #[arg(long)]
    pub jobs: Option<usize>,

    /// Directory receiving crash dumps of unparseable records
    #[arg(long)]
    pub crash_dir: Option<PathBuf>,
}

/// Optional on-disk configuration; every key may be overridden from the CLI.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub sink: FileSinkConfig,
    pub retry: FileRetryConfig,
    pub pipeline: FilePipelineConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileSinkConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<Scheme>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub index: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileRetryConfig {
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FilePipelineConfig {
    pub batch_size: Option<usize>,
    pub jobs: Option<usize>,
    pub crash_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            ExcavatorError::Configuration(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl SinkConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            host: constants::DEFAULT_HOST.to_string(),
            port: constants::DEFAULT_PORT,
            scheme: Scheme::Http,
            user: None,
            password: None,
        }
    }
}

/// How a failed bulk write is retried. `max_attempts: None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub mode: Mode,
    pub path: PathBuf,
    pub file: String,
    pub index: String,
    pub batch_size: usize,
    pub jobs: usize,
    pub crash_dir: PathBuf,
    pub sink: SinkConfig,
    pub retry: RetryPolicy,
}

impl Settings {
    /// Merge CLI values over the config file over the defaults. Credentials
    /// missing from both fall back to the environment.
    pub fn resolve(cli: Cli) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let mode = cli.mode.ok_or_else(|| {
            ExcavatorError::Configuration(
                "Please specify a valid mode i.e. xml, send, json, auto".to_string(),
            )
        })?;
        let path = cli.path.ok_or_else(|| {
            ExcavatorError::Configuration("The path to the exported logs is required".to_string())
        })?;

        let user = cli
            .user
            .or(file.sink.user)
            .or_else(|| std::env::var(constants::ENV_USER).ok());
        let password = cli
            .pwd
            .or(file.sink.password)
            .or_else(|| std::env::var(constants::ENV_PASSWORD).ok());

        let sink = SinkConfig {
            host: cli
                .ip
                .or(file.sink.host)
                .unwrap_or_else(|| constants::DEFAULT_HOST.to_string()),
            port: cli.port.or(file.sink.port).unwrap_or(constants::DEFAULT_PORT),
            scheme: cli.scheme.or(file.sink.scheme).unwrap_or(Scheme::Http),
            user,
            password,
        };

        let retry = RetryPolicy {
            max_attempts: cli.retry_max_attempts.or(file.retry.max_attempts),
            backoff: Duration::from_millis(
                cli.retry_backoff_ms.or(file.retry.backoff_ms).unwrap_or(0),
            ),
        };

        let crash_dir = cli
            .crash_dir
            .or(file.pipeline.crash_dir)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            mode,
            path,
            file: cli.file.unwrap_or_else(|| constants::ALL_FILES.to_string()),
            index: cli
                .index
                .or(file.sink.index)
                .unwrap_or_else(|| constants::DEFAULT_INDEX.to_string())
                .to_lowercase(),
            batch_size: cli
                .size
                .or(file.pipeline.batch_size)
                .unwrap_or(constants::DEFAULT_BATCH_SIZE),
            jobs: cli.jobs.or(file.pipeline.jobs).unwrap_or(1),
            crash_dir,
            sink,
            retry,
        })
    }

    /// Checks performed before any I/O.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_host(&self.sink.host) {
            return Err(ExcavatorError::Configuration(format!(
                "Invalid host address '{}'",
                self.sink.host
            )));
        }
        if self.sink.port == 0 {
            return Err(ExcavatorError::Configuration("Port must be non-zero".to_string()));
        }
        if self.sink.user.is_some() != self.sink.password.is_some() {
            return Err(ExcavatorError::Configuration(
                "User and password must be given together".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ExcavatorError::Configuration(
                "Batch size must be positive".to_string(),
            ));
        }
        if self.jobs == 0 {
            return Err(ExcavatorError::Configuration("Jobs must be positive".to_string()));
        }
        if self.index.is_empty() || self.index.chars().any(char::is_whitespace) {
            return Err(ExcavatorError::Configuration(format!(
                "Invalid index name '{}'",
                self.index
            )));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ExcavatorError::Configuration(
                "Retry max attempts must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    /// Verifies the source directory and, for single-file runs, the file.
    pub fn check_input(&self) -> Result<()> {
        if !self.path.is_dir() {
            return Err(ExcavatorError::InputUnavailable(format!(
                "Specified path '{}' does not exist",
                self.path.display()
            )));
        }
        if !self.all_files() && !self.path.join(&self.file).is_file() {
            return Err(ExcavatorError::InputUnavailable(format!(
                "Specified file '{}' does not exist",
                self.file
            )));
        }
        Ok(())
    }

    pub fn all_files(&self) -> bool {
        self.file == constants::ALL_FILES
    }
}

fn is_valid_host(host: &str) -> bool {
    static HOSTNAME: OnceLock<Regex> = OnceLock::new();
    if host.parse::<IpAddr>().is_ok() {
        return true;
    }
    // Dotted quads that failed to parse as an address are out-of-range IPs
    if host.split('.').all(|part| part.chars().all(|c| c.is_ascii_digit())) {
        return false;
    }
    let re = HOSTNAME.get_or_init(|| {
        Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$")
            .expect("hostname pattern is valid")
    });
    re.is_match(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["excavator"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_and_lowercased_index() {
        let settings = Settings::resolve(cli(&["-m", "send", "-p", "logs", "-i", "WinLogs"])).unwrap();
        assert_eq!(settings.index, "winlogs");
        assert_eq!(settings.batch_size, 100);
        assert_eq!(settings.file, "*");
        assert_eq!(settings.sink.base_url(), "http://127.0.0.1:9200");
        assert_eq!(settings.retry, RetryPolicy::unbounded());
        settings.validate().unwrap();
    }

    #[test]
    fn test_missing_mode_is_configuration_error() {
        let err = Settings::resolve(cli(&["-p", "logs"])).unwrap_err();
        assert!(matches!(err, ExcavatorError::Configuration(_)));
    }

    #[test]
    fn test_rejects_bad_address_and_zero_batch() {
        let mut settings = Settings::resolve(cli(&["-m", "send", "-p", "logs"])).unwrap();
        settings.sink.host = "300.1.1.1".to_string();
        assert!(settings.validate().is_err());

        settings.sink.host = "elastic.internal".to_string();
        settings.validate().unwrap();

        settings.batch_size = 0;
        assert!(matches!(settings.validate(), Err(ExcavatorError::Configuration(_))));
    }

    #[test]
    fn test_config_file_is_overridden_by_cli() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("excavator.toml");
        fs::write(
            &path,
            r#"
[sink]
host = "10.0.0.5"
port = 9300
scheme = "https"

[retry]
max_attempts = 5
backoff_ms = 250

[pipeline]
batch_size = 50
"#,
        )
        .unwrap();

        let settings = Settings::resolve(cli(&[
            "-m",
            "send",
            "-p",
            "logs",
            "--port",
            "9201",
            "--config",
            path.to_str().unwrap(),
        ]))
        .unwrap();

        assert_eq!(settings.sink.host, "10.0.0.5");
        assert_eq!(settings.sink.port, 9201);
        assert_eq!(settings.sink.scheme, Scheme::Https);
        assert_eq!(settings.batch_size, 50);
        assert_eq!(settings.retry.max_attempts, Some(5));
        assert_eq!(settings.retry.backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_check_input_reports_missing_file() {
        let dir = tempdir().unwrap();
        let settings = Settings::resolve(cli(&[
            "-m",
            "json",
            "-p",
            dir.path().to_str().unwrap(),
            "-f",
            "Security.xml",
        ]))
        .unwrap();
        let err = settings.check_input().unwrap_err();
        assert!(matches!(err, ExcavatorError::InputUnavailable(_)));

        fs::write(dir.path().join("Security.xml"), "").unwrap();
        settings.check_input().unwrap();
    }

    #[test]
    fn test_retry_policy_bounds() {
        let bounded = RetryPolicy { max_attempts: Some(2), backoff: Duration::ZERO };
        assert!(bounded.allows(1));
        assert!(!bounded.allows(2));
        assert!(RetryPolicy::unbounded().allows(u32::MAX - 1));
    }
}
