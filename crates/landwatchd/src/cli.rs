use std::ffi::OsStr;
use std::path::PathBuf;

use clap::Parser;
use landwatch_core::AnalysisKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "LANDWATCH analysis daemon")]
pub struct Cli {
    #[arg(
        long,
        default_value = ".",
        help = "Directory holding landwatch.toml (created with defaults when missing)"
    )]
    pub config: PathBuf,

    #[arg(long, help = "Emit logs as JSON lines")]
    pub log_json: bool,

    #[arg(
        long,
        value_name = "ID",
        conflicts_with_all = ["drain_once", "run_due", "sweep_cache", "create_car", "detail", "map", "phases"],
        help = "Process one analysis and exit"
    )]
    pub process: Option<String>,

    #[arg(
        long,
        conflicts_with_all = ["run_due", "sweep_cache", "create_car", "detail", "map", "phases"],
        help = "Queue pending analyses, run them, and exit"
    )]
    pub drain_once: bool,

    #[arg(
        long,
        conflicts_with_all = ["sweep_cache", "create_car", "detail", "map", "phases"],
        help = "Launch due schedules, run the analyses they create, and exit"
    )]
    pub run_due: bool,

    #[arg(
        long,
        conflicts_with_all = ["create_car", "detail", "map", "phases"],
        help = "Delete expired cache rows and exit"
    )]
    pub sweep_cache: bool,

    #[arg(
        long,
        value_name = "KEY",
        conflicts_with_all = ["detail", "map", "phases"],
        help = "Create an analysis for a CAR key, run it, and print the record"
    )]
    pub create_car: Option<String>,

    #[arg(
        long,
        requires = "create_car",
        value_parser = parse_analysis_kind,
        help = "Analysis kind for --create-car: standard or deter"
    )]
    pub kind: Option<AnalysisKind>,

    #[arg(
        long,
        requires = "create_car",
        value_name = "YYYY-MM-DD",
        help = "Analysis date for --create-car (today when omitted)"
    )]
    pub date: Option<String>,

    #[arg(
        long = "doc",
        requires = "create_car",
        value_name = "DIGITS",
        help = "CPF/CNPJ to check, repeatable"
    )]
    pub docs: Vec<String>,

    #[arg(
        long,
        value_name = "ID",
        conflicts_with_all = ["map", "phases"],
        help = "Print the analysis report as JSON"
    )]
    pub detail: Option<String>,

    #[arg(
        long,
        value_name = "ID",
        conflicts_with = "phases",
        help = "Print the analysis map layer as JSON"
    )]
    pub map: Option<String>,

    #[arg(
        long,
        requires = "map",
        help = "Simplification tolerance for --map (clamped to 0..0.01)"
    )]
    pub tolerance: Option<f64>,

    #[arg(long, help = "Print indigenous-land phases as JSON")]
    pub phases: bool,

    #[arg(
        long,
        requires = "phases",
        value_name = "DATE",
        help = "Reference date for --phases (today when omitted)"
    )]
    pub as_of: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Daemon,
    Process(String),
    DrainOnce,
    RunDue,
    SweepCache,
    CreateCar {
        car_key: String,
        kind: Option<AnalysisKind>,
        date: Option<String>,
        docs: Vec<String>,
    },
    Detail(String),
    Map {
        analysis_id: String,
        tolerance: Option<f64>,
    },
    Phases {
        as_of: Option<String>,
    },
}

impl Cli {
    pub fn log_format(&self) -> LogFormat {
        if self.log_json {
            LogFormat::Json
        } else {
            LogFormat::Human
        }
    }

    pub fn command(&self) -> Command {
        if let Some(id) = &self.process {
            return Command::Process(id.clone());
        }
        if self.drain_once {
            return Command::DrainOnce;
        }
        if self.run_due {
            return Command::RunDue;
        }
        if self.sweep_cache {
            return Command::SweepCache;
        }
        if let Some(car_key) = &self.create_car {
            return Command::CreateCar {
                car_key: car_key.clone(),
                kind: self.kind,
                date: self.date.clone(),
                docs: self.docs.clone(),
            };
        }
        if let Some(id) = &self.detail {
            return Command::Detail(id.clone());
        }
        if let Some(id) = &self.map {
            return Command::Map {
                analysis_id: id.clone(),
                tolerance: self.tolerance,
            };
        }
        if self.phases {
            return Command::Phases {
                as_of: self.as_of.clone(),
            };
        }
        Command::Daemon
    }
}

pub fn parse_cli() -> Cli {
    let mut args: Vec<_> = std::env::args_os().collect();
    if args.get(1).is_some_and(|arg| arg == OsStr::new("--")) {
        args.remove(1);
    }

    Cli::parse_from(args)
}

fn parse_analysis_kind(value: &str) -> Result<AnalysisKind, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use landwatch_core::AnalysisKind;

    use super::{Cli, Command, LogFormat};

    #[test]
    fn no_flags_runs_the_daemon() {
        let cli = Cli::try_parse_from(["landwatchd"]).expect("bare invocation should parse");
        assert_eq!(cli.command(), Command::Daemon);
        assert_eq!(cli.log_format(), LogFormat::Human);
        assert_eq!(cli.config.to_str(), Some("."));
    }

    #[test]
    fn create_car_collects_kind_date_and_docs() {
        let cli = Cli::try_parse_from([
            "landwatchd",
            "--log-json",
            "--create-car",
            "PA-1500000-ABC",
            "--kind",
            "deter",
            "--date",
            "2024-05-01",
            "--doc",
            "123.456.789-09",
            "--doc",
            "12345678000195",
        ])
        .expect("create flags should parse");

        assert_eq!(cli.log_format(), LogFormat::Json);
        assert_eq!(
            cli.command(),
            Command::CreateCar {
                car_key: "PA-1500000-ABC".to_owned(),
                kind: Some(AnalysisKind::Deter),
                date: Some("2024-05-01".to_owned()),
                docs: vec!["123.456.789-09".to_owned(), "12345678000195".to_owned()],
            }
        );
    }

    #[test]
    fn map_accepts_tolerance() {
        let cli = Cli::try_parse_from(["landwatchd", "--map", "a-1", "--tolerance", "0.002"])
            .expect("map flags should parse");
        assert_eq!(
            cli.command(),
            Command::Map {
                analysis_id: "a-1".to_owned(),
                tolerance: Some(0.002),
            }
        );
    }

    #[test]
    fn one_shot_flags_are_mutually_exclusive() {
        assert!(Cli::try_parse_from(["landwatchd", "--detail", "a-1", "--map", "a-1"]).is_err());
        assert!(Cli::try_parse_from(["landwatchd", "--run-due", "--sweep-cache"]).is_err());
        assert!(Cli::try_parse_from(["landwatchd", "--process", "a-1", "--drain-once"]).is_err());
    }

    #[test]
    fn dependent_flags_require_their_command() {
        assert!(Cli::try_parse_from(["landwatchd", "--tolerance", "0.001"]).is_err());
        assert!(Cli::try_parse_from(["landwatchd", "--kind", "standard"]).is_err());
        assert!(Cli::try_parse_from(["landwatchd", "--as-of", "2024-01-01"]).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Cli::try_parse_from(["landwatchd", "--create-car", "PA-1", "--kind", "weekly"])
            .expect_err("invalid kind");
        assert!(err.to_string().contains("weekly"));
    }
}
