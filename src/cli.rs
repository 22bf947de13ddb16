// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::types::{Action, JobStatus};

/// Command-line arguments for `flowsched`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flowsched",
    version,
    about = "Run chip-design flow tasks in dependency order on a cluster or locally.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the workspace file (TOML).
    ///
    /// Default: `flowsched.toml` in the current working directory.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOWSCHED_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Schedule the selected tasks and wait for them to finish.
    Run(RunArgs),

    /// Validate the workspace and print its dependency graphs.
    Check(CheckArgs),

    /// List rows of the job store.
    Jobs(JobsArgs),
}

#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Only tasks of these blocks.
    #[arg(long = "block", value_name = "NAME")]
    pub blocks: Vec<String>,

    /// Only tasks of these versions.
    #[arg(long = "version", value_name = "NAME")]
    pub versions: Vec<String>,

    /// Only tasks of these flows.
    #[arg(long = "flow", value_name = "NAME")]
    pub flows: Vec<String>,

    /// Only these tasks.
    #[arg(long = "task", value_name = "NAME")]
    pub tasks: Vec<String>,

    /// Actions to execute per task, in order. Default: run.
    #[arg(long = "action", value_name = "ACTION", value_parser = parse_action)]
    pub actions: Vec<Action>,

    /// Keep scheduling later bundles after a failure.
    #[arg(long)]
    pub no_fail_fast: bool,

    /// Keep running serial groups past failed members.
    #[arg(long)]
    pub ignore_fail: bool,

    /// Walk the schedule without submitting anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    /// Also print every dependency path leading to the task of this name,
    /// in each unit that has one.
    #[arg(long, value_name = "TASK")]
    pub task: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct JobsArgs {
    /// Only jobs with this status, e.g. `running` or `failed`.
    #[arg(long, value_name = "STATUS", value_parser = parse_job_status)]
    pub status: Option<JobStatus>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

fn parse_action(s: &str) -> Result<Action, String> {
    s.parse()
}

fn parse_job_status(s: &str) -> Result<JobStatus, String> {
    JobStatus::parse(s.trim()).ok_or_else(|| format!("invalid job status: {s}"))
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_filters_repeat() {
        let args = CliArgs::try_parse_from([
            "flowsched", "run", "--block", "cpu", "--task", "a", "--task", "b", "--action",
            "build", "--action", "run", "--no-fail-fast",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.blocks, ["cpu"]);
        assert_eq!(run.tasks, ["a", "b"]);
        assert_eq!(run.actions, [Action::Build, Action::Run]);
        assert!(run.no_fail_fast);
    }

    #[test]
    fn config_is_global() {
        let args =
            CliArgs::try_parse_from(["flowsched", "jobs", "--config", "w.toml"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("w.toml")));
    }

    #[test]
    fn bad_action_is_rejected() {
        assert!(CliArgs::try_parse_from(["flowsched", "run", "--action", "nope"]).is_err());
    }
}
