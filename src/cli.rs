//! CLI argument parsing for miniprof

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Output format for correlated results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "miniprof")]
#[command(version)]
#[command(
    about = "Profile simulated page and XHR requests, then correlate them through the result endpoint",
    long_about = None
)]
pub struct Cli {
    /// Load profiler configuration from a TOML file
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the profiler base path (e.g. /mini-profiler-resources/)
    #[arg(long = "base-path", value_name = "PATH")]
    pub base_path: Option<String>,

    /// Number of XHR requests issued after the page load
    #[arg(short = 'n', long = "requests", default_value = "8")]
    pub requests: usize,

    /// Worker threads handling requests concurrently
    #[arg(short = 't', long = "threads", default_value = "4")]
    pub threads: usize,

    /// Override retention of stored profiles, in seconds
    #[arg(long = "retention-secs", value_name = "SECS")]
    pub retention_secs: Option<u64>,

    /// Print the timing tree of the page profile
    #[arg(long = "tree")]
    pub tree: bool,

    /// Output format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long = "debug")]
    pub debug: bool,
}
