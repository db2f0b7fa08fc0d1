use std::path::Path;
use std::time::Duration;

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::controller::MonitorTiming;
use crate::error::{Error, Result};

/// Fallback config file looked up in the working directory.
const CWD_CONFIG: &str = "config.yaml";

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch a QA test run live", long_about = None)]
pub struct Cli {
    /// Test to monitor
    pub test_id: String,

    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Backend base URL
    #[arg(long, env = "QA_MONITOR_BASE_URL")]
    pub base_url: Option<String>,

    /// Delay before opening the live stream, in milliseconds
    #[arg(long)]
    pub settle_delay_ms: Option<u64>,

    /// Delay before the monitor hides after a terminal event, in milliseconds
    #[arg(long)]
    pub auto_hide_ms: Option<u64>,

    /// Only watch; do not ask the backend to start a run
    #[arg(long)]
    pub no_start: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TimingConfig {
    pub settle_delay_ms: u64,
    pub auto_hide_ms: u64,
}

impl TimingConfig {
    pub fn monitor_timing(&self) -> MonitorTiming {
        MonitorTiming {
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            auto_hide: Duration::from_millis(self.auto_hide_ms),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<(Cli, Self)> {
        Self::load_from_args(std::env::args())
    }

    /// Layer defaults, the config file, `QA_MONITOR_*` environment variables
    /// and CLI flags, in increasing priority.
    pub fn load_from_args<I, T>(args: I) -> Result<(Cli, Self)>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli = Cli::try_parse_from(args).map_err(|e| Error::Config(e.to_string()))?;
        let config = Self::build(&cli)?;
        Ok((cli, config))
    }

    fn build(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("server.base_url", "http://localhost:8000")?
            .set_default("timing.settle_delay_ms", 1000)?
            .set_default("timing.auto_hide_ms", 8000)?;

        match &cli.config {
            Some(path) => builder = builder.add_source(File::with_name(path)),
            None if Path::new(CWD_CONFIG).exists() => {
                builder = builder.add_source(File::with_name(CWD_CONFIG));
            }
            None => {}
        }

        // E.g. QA_MONITOR_TIMING__AUTO_HIDE_MS=3000
        builder = builder.add_source(
            Environment::with_prefix("QA_MONITOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(url) = &cli.base_url {
            builder = builder.set_override("server.base_url", url.as_str())?;
        }
        if let Some(ms) = cli.settle_delay_ms {
            builder = builder.set_override("timing.settle_delay_ms", ms)?;
        }
        if let Some(ms) = cli.auto_hide_ms {
            builder = builder.set_override("timing.auto_hide_ms", ms)?;
        }

        Ok(builder.build()?.try_deserialize()?)
    }
}
