use std::ffi::OsStr;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use runledger_config::RetentionPolicyKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "invalid log format '{other}', expected one of: human, json"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct ServeArgs {
    #[arg(long, help = "Listen address, overriding [server].bind")]
    pub bind: Option<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct CompareArgs {
    #[arg(help = "Baseline run id (or latest/legacy)")]
    pub run_a: String,

    #[arg(help = "Candidate run id (or latest/legacy)")]
    pub run_b: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct CleanupArgs {
    #[arg(
        long,
        value_parser = parse_retention_policy,
        help = "Retention policy: keep_best or tiered (default from config)"
    )]
    pub policy: Option<RetentionPolicyKind>,

    #[arg(long, help = "Recent runs kept by the tiered policy")]
    pub keep_experimental: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Serve the HTTP API
    Serve(ServeArgs),
    /// List registered runs with their evaluation counts
    Runs,
    /// Print the current and latest run ids
    Latest,
    /// Compare the evaluations of two runs
    Compare(CompareArgs),
    /// Prune runs according to the retention policy
    Cleanup(CleanupArgs),
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Run-scoped result store for repository analysis runs")]
pub struct Cli {
    #[arg(
        long,
        global = true,
        default_value = ".",
        help = "Workspace root holding .runledger/"
    )]
    pub workspace: PathBuf,

    #[arg(
        long,
        global = true,
        default_value = "human",
        value_parser = parse_log_format,
        help = "Log format: human or json"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_log_format(value: &str) -> Result<LogFormat, String> {
    value.parse()
}

fn parse_retention_policy(value: &str) -> Result<RetentionPolicyKind, String> {
    value.parse()
}
