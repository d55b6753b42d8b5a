//! CLI argument parsing for tracelift

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// How the summary is printed to stdout
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table (default)
    Text,
    /// JSON document for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tracelift")]
#[command(version)]
#[command(about = "Lift LTTng kernel trace text into processes, descriptors and syscall sequences", long_about = None)]
pub struct Cli {
    /// babeltrace text output to parse
    #[arg(value_name = "TRACE")]
    pub trace: PathBuf,

    /// JSON map of pid to `lsof -Fn` output, naming descriptors opened before tracing
    #[arg(long = "fd-snapshot", value_name = "JSON")]
    pub fd_snapshot: Option<PathBuf>,

    /// TOML configuration with [pipeline] settings and [[rule]] overrides
    #[arg(short, long, value_name = "TOML")]
    pub config: Option<PathBuf>,

    /// Directory receiving the JSON artifacts
    #[arg(
        short = 'o',
        long = "output-dir",
        value_name = "DIR",
        default_value = "tracelift-out"
    )]
    pub output_dir: PathBuf,

    /// Pre-scan the trace for fork and context facts before the main pass
    #[arg(long)]
    pub prescan: bool,

    /// Also write every resolved event to events.json
    #[arg(long = "emit-events")]
    pub emit_events: bool,

    /// Summary format (text or json)
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_trace() {
        assert!(Cli::try_parse_from(["tracelift"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["tracelift", "trace.txt"]);
        assert_eq!(cli.trace, PathBuf::from("trace.txt"));
        assert_eq!(cli.output_dir, PathBuf::from("tracelift-out"));
        assert_eq!(cli.format, OutputFormat::Text);
        assert!(cli.fd_snapshot.is_none());
        assert!(cli.config.is_none());
        assert!(!cli.prescan);
        assert!(!cli.emit_events);
        assert!(!cli.debug);
    }

    #[test]
    fn test_cli_all_flags() {
        let cli = Cli::parse_from([
            "tracelift",
            "trace.txt",
            "--fd-snapshot",
            "fds.json",
            "--config",
            "tracelift.toml",
            "-o",
            "out",
            "--prescan",
            "--emit-events",
            "--format",
            "json",
            "--debug",
        ]);
        assert_eq!(cli.fd_snapshot, Some(PathBuf::from("fds.json")));
        assert_eq!(cli.config, Some(PathBuf::from("tracelift.toml")));
        assert_eq!(cli.output_dir, PathBuf::from("out"));
        assert!(cli.prescan);
        assert!(cli.emit_events);
        assert_eq!(cli.format, OutputFormat::Json);
        assert!(cli.debug);
    }

    #[test]
    fn test_cli_rejects_unknown_format() {
        assert!(Cli::try_parse_from(["tracelift", "t.txt", "--format", "csv"]).is_err());
    }
}
