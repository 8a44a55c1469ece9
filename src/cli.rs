// CLI-specific types and structures
// This module contains the command-line interface definitions

use chrono::NaiveDate;
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{CommitOrder, LogFormat, WorkerKind};

// CLI structure - global options plus one subcommand per job type
#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Bounded concurrent batch dispatcher with snapshot reconciliation")]
#[command(
    long_about = "Bounded concurrent batch dispatcher with snapshot reconciliation\n\nSUBCOMMANDS:\n  run        Process every file in a directory with bounded concurrency\n  reconcile  Diff a scraped snapshot against the last one and alert on new entries\n  watch      Alert when any wanted name shows up in an availability list\n\nCOMMON EXAMPLES:\n  sluice run ./clips ./reversed --pattern '*.wav' --batch-size 4 --wait 1s\n  sluice run ./urls ./videos --worker exec --exec 'yt-dlp -o {out} --batch-file {}' -j 8\n  scrape-events | sluice reconcile --state-dir ~/.local/state/sluice --keyed --to ops\n\nExit codes: 0 success, 1 fatal error, 2 usage error, 3 partial failure"
)]
#[command(author = "Dirk Loss <mail@dirk-loss.de>")]
#[command(version)]
#[command(args_override_self = true)]
pub struct Cli {
    /// Increase diagnostic output (-v info, -vv debug, -vvv trace); SLUICE_LOG overrides
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true, help_heading = "Output Options")]
    pub verbose: u8,

    /// Suppress progress lines and the summary
    #[arg(short = 'q', long = "quiet", global = true, help_heading = "Output Options")]
    pub quiet: bool,

    /// Disable emoji prefixes (also NO_EMOJI)
    #[arg(long = "no-emoji", global = true, help_heading = "Output Options")]
    pub no_emoji: bool,

    /// Diagnostic log format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true, help_heading = "Output Options")]
    pub log_format: LogFormat,

    /// Use this configuration file instead of the default search
    #[arg(long = "config-file", global = true, help_heading = "Configuration Options")]
    pub config_file: Option<String>,

    /// Ignore configuration files
    #[arg(long = "ignore-config", global = true, help_heading = "Configuration Options")]
    pub ignore_config: bool,

    /// Show where configuration is loaded from and exit
    #[arg(long = "show-config", help_heading = "Configuration Options")]
    pub show_config: bool,

    /// Expand an alias from the [aliases] section of the configuration file
    #[arg(short = 'a', long = "alias", global = true, help_heading = "Configuration Options")]
    pub alias: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process every file in a directory with bounded concurrency
    #[command(args_override_self = true)]
    Run(RunArgs),

    /// Diff a snapshot against the previously saved one and notify on new entries
    #[command(args_override_self = true)]
    Reconcile(ReconcileArgs),

    /// Notify when wanted names appear in an availability list
    #[command(args_override_self = true)]
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Directory containing the input files
    pub input_dir: PathBuf,

    /// Directory the outputs are written to (created if missing)
    pub output_dir: PathBuf,

    /// Glob for file names inside the input directory
    #[arg(short = 'p', long = "pattern", default_value = "*", help_heading = "Input Options")]
    pub pattern: String,

    /// Process at most N files
    #[arg(short = 'n', long = "limit", help_heading = "Input Options")]
    pub limit: Option<usize>,

    /// Skip files whose output already exists
    #[arg(long = "skip-existing", help_heading = "Input Options")]
    pub skip_existing: bool,

    /// Worker invocations in flight at once
    #[arg(short = 'j', long = "concurrency", default_value_t = num_cpus::get(), help_heading = "Performance Options")]
    pub concurrency: usize,

    /// Close a batch at this many items (batch-shaped workers)
    #[arg(long = "batch-size", help_heading = "Performance Options")]
    pub batch_size: Option<usize>,

    /// Close a batch this long after its first item, e.g. 250ms or 1s
    #[arg(long = "wait", value_parser = humantime::parse_duration, conflicts_with = "wait_ms", help_heading = "Performance Options")]
    pub wait: Option<Duration>,

    /// Same as --wait, in milliseconds
    #[arg(long = "wait-ms", help_heading = "Performance Options")]
    pub wait_ms: Option<u64>,

    /// Report results in completion order instead of input order
    #[arg(long = "unordered", help_heading = "Performance Options")]
    pub unordered: bool,

    /// Keep going after a failed item and exit with code 3
    #[arg(long = "tolerate-failures", help_heading = "Error Handling")]
    pub tolerate_failures: bool,

    /// Fail a worker invocation that runs longer than this, e.g. 30s
    #[arg(long = "timeout", value_parser = humantime::parse_duration, help_heading = "Error Handling")]
    pub timeout: Option<Duration>,

    /// Built-in worker
    #[arg(short = 'w', long = "worker", value_enum, default_value_t = WorkerKind::Reverse, help_heading = "Worker Options")]
    pub worker: WorkerKind,

    /// Command for --worker exec; {} is the input path, {stem} its file stem, {out} a scratch output path
    #[arg(long = "exec", help_heading = "Worker Options")]
    pub exec: Option<String>,

    /// Extension for output files (default: same as the input)
    #[arg(long = "out-ext", help_heading = "Worker Options")]
    pub out_ext: Option<String>,
}

#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Directory holding one saved snapshot per source
    #[arg(long = "state-dir")]
    pub state_dir: PathBuf,

    /// Snapshot name within the state directory
    #[arg(long = "source", default_value = "events")]
    pub source: String,

    /// JSON input file, or - for stdin
    #[arg(short = 'i', long = "input", default_value = "-")]
    pub input: String,

    /// Input is an array of event records keyed by title, date and start time
    /// (otherwise a JSON object mapping keys to records)
    #[arg(long = "keyed")]
    pub keyed: bool,

    /// Command that delivers one message; it reads the message on stdin, {to} is the recipient
    #[arg(long = "notify-cmd", help_heading = "Notification Options")]
    pub notify_cmd: Option<String>,

    /// Recipient of alerts (repeatable)
    #[arg(long = "to", help_heading = "Notification Options")]
    pub to: Vec<String>,

    /// Save the snapshot before or after alerts are sent
    #[arg(long = "commit-order", value_enum, default_value_t = CommitOrder::SaveThenNotify, help_heading = "Notification Options")]
    pub commit_order: CommitOrder,

    /// Anchor for event dates without a year (default: today)
    #[arg(long = "reference-date", value_parser = parse_reference_date)]
    pub reference_date: Option<NaiveDate>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Names to look for (repeatable)
    #[arg(long = "want", required = true, num_args = 1..)]
    pub want: Vec<String>,

    /// Available names, one per line; - for stdin
    #[arg(short = 'i', long = "input", default_value = "-")]
    pub input: String,

    /// Command that delivers one message; it reads the message on stdin, {to} is the recipient
    #[arg(long = "notify-cmd", help_heading = "Notification Options")]
    pub notify_cmd: Option<String>,

    /// Recipient of alerts (repeatable)
    #[arg(long = "to", help_heading = "Notification Options")]
    pub to: Vec<String>,
}

fn parse_reference_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_repeated_flags_override() {
        let cli = Cli::try_parse_from([
            "sluice", "run", "in", "out", "-j", "2", "--pattern", "*.wav", "-j", "8",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.concurrency, 8);
                assert_eq!(args.pattern, "*.wav");
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_conflicts_with_wait_ms() {
        assert!(Cli::try_parse_from([
            "sluice", "run", "in", "out", "--wait", "1s", "--wait-ms", "500"
        ])
        .is_err());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["sluice", "watch", "--want", "a", "b", "-vv", "--quiet"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(cli.quiet);
        match cli.command {
            Command::Watch(args) => assert_eq!(args.want, vec!["a", "b"]),
            other => panic!("expected watch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_reference_date() {
        assert!(Cli::try_parse_from([
            "sluice",
            "reconcile",
            "--state-dir",
            "s",
            "--reference-date",
            "15/03/2025"
        ])
        .is_err());
    }
}
