//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use recheck_config::BackendKind;
use std::path::PathBuf;

/// Check regular expressions for ReDoS vulnerabilities using a recheck backend.
#[derive(Parser, Debug)]
#[command(name = "recheck")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to <config dir>/recheck/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check one or more patterns and print one diagnostics document per line.
    Check(CheckArgs),

    /// Start the configured backend and report whether it answers.
    Ping(PingArgs),

    /// Print the resolved configuration.
    Config,
}

#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Pattern sources, without delimiters.
    #[arg(required = true)]
    pub sources: Vec<String>,

    /// Regular expression flags applied to every pattern.
    #[arg(long, default_value = "")]
    pub flags: String,

    /// Override the configured backend.
    #[arg(long)]
    pub backend: Option<BackendKind>,

    /// Stream checker log lines to stderr.
    #[arg(long)]
    pub log: bool,

    /// Checker parameters as a JSON object, e.g. '{"timeout": 5000}'.
    #[arg(long)]
    pub params: Option<String>,
}

#[derive(Parser, Debug)]
pub struct PingArgs {
    /// Override the configured backend.
    #[arg(long)]
    pub backend: Option<BackendKind>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_check() {
        let cli = Cli::try_parse_from([
            "recheck",
            "-vv",
            "check",
            "^(a+)+$",
            "^a$",
            "--flags",
            "i",
            "--backend",
            "java",
            "--log",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Check(args) => {
                assert_eq!(args.sources, vec!["^(a+)+$", "^a$"]);
                assert_eq!(args.flags, "i");
                assert_eq!(args.backend, Some(BackendKind::Java));
                assert!(args.log);
                assert!(args.params.is_none());
            }
            other => panic!("Expected check, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_backend() {
        let result = Cli::try_parse_from(["recheck", "ping", "--backend", "synckit"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_requires_a_source() {
        assert!(Cli::try_parse_from(["recheck", "check"]).is_err());
    }
}
