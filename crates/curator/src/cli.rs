use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Overrides;

#[derive(Debug, Parser)]
#[command(name = "curator", version, about = "Smoke/fire detection dataset curator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest, deduplicate, balance, validate, split and persist the corpus
    Curate(CurateArgs),
    /// Scan the configured sources and report integrity problems
    Check(CheckArgs),
}

#[derive(Debug, Args)]
pub struct CurateArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: PathBuf,

    /// Overrides the configured split seed
    #[arg(long)]
    pub seed: Option<u64>,

    /// Overrides the configured output directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(short, long)]
    pub config: PathBuf,

    /// Exit with an error when any source has issues
    #[arg(long)]
    pub fail_on_issues: bool,
}

impl CurateArgs {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            seed: self.seed,
            output_dir: self.output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_curate_with_overrides() {
        let cli = Cli::parse_from([
            "curator", "curate", "--config", "curator.toml", "--seed", "7", "--output", "/tmp/out",
        ]);
        let Command::Curate(args) = cli.command else {
            panic!("Expected curate subcommand");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.seed, Some(7));
        assert_eq!(overrides.output_dir, Some(PathBuf::from("/tmp/out")));
    }

    #[test]
    fn test_parses_check() {
        let cli = Cli::parse_from(["curator", "check", "-c", "curator.toml", "--fail-on-issues"]);
        match cli.command {
            Command::Check(args) => {
                assert_eq!(args.config, PathBuf::from("curator.toml"));
                assert!(args.fail_on_issues);
            }
            other => panic!("Expected check subcommand, got {other:?}"),
        }
    }
}
