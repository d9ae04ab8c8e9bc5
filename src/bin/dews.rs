//! dews - dengue early-warning batch runner
//!
//! Usage:
//!   dews run --config pipeline.json
//!   dews predict --config pipeline.json

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use dews_core::{Pipeline, PipelineConfig, RunSummary};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dews")]
#[command(about = "Retrospective and predictive dengue alerts per region")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train every model, save the artifacts and write all alert tables
    Run {
        /// Pipeline configuration (JSON); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Forecast and alert from saved artifacts without retraining
    Predict {
        /// Pipeline configuration (JSON); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

impl Commands {
    fn config_path(&self) -> Option<&PathBuf> {
        match self {
            Commands::Run { config } | Commands::Predict { config } => config.as_ref(),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> dews_core::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_json_file(path),
        None => Ok(PipelineConfig::default()),
    }
}

fn execute(command: &Commands) -> dews_core::Result<RunSummary> {
    let pipeline = Pipeline::new(load_config(command.config_path())?)?;
    info!(run_id = %pipeline.run_id(), "starting dews");
    match command {
        Commands::Run { .. } => pipeline.run(),
        Commands::Predict { .. } => pipeline.predict_from_artifacts(),
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let summary = match execute(&cli.command) {
        Ok(summary) => summary,
        Err(e) => {
            error!(error = %e, "pipeline failed");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&summary) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "failed to encode summary");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use clap::error::ErrorKind;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_subcommands_and_config_flag() {
        let cli = Cli::try_parse_from(["dews", "predict", "--config", "pipeline.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Predict { .. }));
        assert_eq!(cli.command.config_path(), Some(&PathBuf::from("pipeline.json")));

        let cli = Cli::try_parse_from(["dews", "run", "-c", "other.json"]).unwrap();
        assert!(matches!(cli.command, Commands::Run { .. }));

        let cli = Cli::try_parse_from(["dews", "run"]).unwrap();
        assert!(cli.command.config_path().is_none());
    }

    #[test]
    fn test_help_and_bad_input() {
        let help = Cli::try_parse_from(["dews", "--help"]).err().unwrap();
        assert_eq!(help.kind(), ErrorKind::DisplayHelp);

        let unknown = Cli::try_parse_from(["dews", "train"]).err().unwrap();
        assert_eq!(unknown.kind(), ErrorKind::InvalidSubcommand);

        let extra = Cli::try_parse_from(["dews", "run", "stray"]).err().unwrap();
        assert_eq!(extra.kind(), ErrorKind::UnknownArgument);
    }
}
