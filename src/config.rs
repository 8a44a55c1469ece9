use chrono::NaiveDate;
use clap::ValueEnum;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{Cli, Command, ReconcileArgs, RunArgs, WatchArgs};
use crate::error::SluiceError;
use crate::parallel::{BatchConfig, DispatchConfig};

/// Main configuration struct for Sluice
#[derive(Debug, Clone)]
pub struct SluiceConfig {
    pub output: OutputConfig,
    pub command: CommandConfig,
}

/// Output configuration shared by all subcommands
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub verbosity: u8,
    pub quiet: bool,
    pub emoji: bool,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub enum CommandConfig {
    Run(RunConfig),
    Reconcile(ReconcileConfig),
    Watch(WatchConfig),
}

/// `sluice run`
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub pattern: String,
    pub limit: Option<usize>,
    pub skip_existing: bool,
    pub out_ext: Option<String>,
    pub worker: WorkerKind,
    pub exec: Option<String>,
    pub dispatch: DispatchConfig,
    /// Set for batch-shaped workers
    pub batching: Option<BatchConfig>,
}

/// `sluice reconcile`
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub source: String,
    pub input: String,
    pub keyed: bool,
    pub notify_cmd: Option<String>,
    pub commit_order: CommitOrder,
}

/// `sluice watch`
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub want: Vec<String>,
    pub input: String,
    pub notify_cmd: Option<String>,
}

/// Built-in worker selection
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkerKind {
    /// Reverse the bytes of each file (batch-shaped)
    #[default]
    Reverse,
    /// Copy each file unchanged
    Copy,
    /// Run an external command per file
    Exec,
}

impl WorkerKind {
    pub fn is_batch_shaped(self) -> bool {
        matches!(self, WorkerKind::Reverse)
    }

    fn name(self) -> &'static str {
        match self {
            WorkerKind::Reverse => "reverse",
            WorkerKind::Copy => "copy",
            WorkerKind::Exec => "exec",
        }
    }
}

/// Whether the snapshot is saved before or after alerts go out
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitOrder {
    /// Save first; an alert lost to a crash is never re-sent
    #[default]
    SaveThenNotify,
    /// Notify first; a crash or failed delivery re-sends on the next cycle
    NotifyThenSave,
}

/// Diagnostic log format
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Deployment state fixed once at process start and passed down explicitly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Anchor for year-less event dates
    pub reference_date: NaiveDate,
    pub recipients: Vec<String>,
    pub state_dir: Option<PathBuf>,
}

impl RunContext {
    pub fn from_cli(cli: &Cli, today: NaiveDate) -> Self {
        match &cli.command {
            Command::Run(_) => Self {
                reference_date: today,
                recipients: Vec::new(),
                state_dir: None,
            },
            Command::Reconcile(args) => Self {
                reference_date: args.reference_date.unwrap_or(today),
                recipients: args.to.clone(),
                state_dir: Some(args.state_dir.clone()),
            },
            Command::Watch(args) => Self {
                reference_date: today,
                recipients: args.to.clone(),
                state_dir: None,
            },
        }
    }
}

impl SluiceConfig {
    /// Create configuration from CLI arguments
    pub fn from_cli(cli: &Cli) -> Self {
        let output = OutputConfig {
            verbosity: cli.verbose,
            quiet: cli.quiet,
            emoji: !cli.no_emoji && crate::platform::emoji_from_env(),
            log_format: cli.log_format,
        };
        let command = match &cli.command {
            Command::Run(args) => CommandConfig::Run(RunConfig::from_args(args)),
            Command::Reconcile(args) => CommandConfig::Reconcile(ReconcileConfig::from_args(args)),
            Command::Watch(args) => CommandConfig::Watch(WatchConfig::from_args(args)),
        };
        Self { output, command }
    }

    /// Reject settings that cannot work; the CLI exits with a usage error
    pub fn validate(&self) -> Result<(), SluiceError> {
        match &self.command {
            CommandConfig::Run(run) => run.validate(),
            CommandConfig::Reconcile(reconcile) => {
                if reconcile.source.trim().is_empty() {
                    return Err(SluiceError::Config("--source must not be empty".to_string()));
                }
                Ok(())
            }
            CommandConfig::Watch(watch) => {
                if watch.want.iter().all(|name| name.trim().is_empty()) {
                    return Err(SluiceError::Config(
                        "--want needs at least one non-empty name".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl RunConfig {
    fn from_args(args: &RunArgs) -> Self {
        let wait = args.wait.or(args.wait_ms.map(Duration::from_millis));
        let batching = if args.worker.is_batch_shaped() {
            let defaults = BatchConfig::default();
            Some(BatchConfig::new(
                args.batch_size.unwrap_or(defaults.max_batch_size),
                wait.unwrap_or(defaults.wait),
            ))
        } else if args.batch_size.is_some() || wait.is_some() {
            // Kept so validation can report it
            Some(BatchConfig::new(args.batch_size.unwrap_or(1), wait.unwrap_or_default()))
        } else {
            None
        };

        Self {
            input_dir: args.input_dir.clone(),
            output_dir: args.output_dir.clone(),
            pattern: args.pattern.clone(),
            limit: args.limit,
            skip_existing: args.skip_existing,
            out_ext: args.out_ext.clone(),
            worker: args.worker,
            exec: args.exec.clone(),
            dispatch: DispatchConfig {
                concurrency_limit: args.concurrency,
                order_preserving: !args.unordered,
                tolerate_failures: args.tolerate_failures,
                timeout: args.timeout,
                buffer_size: None,
            },
            batching,
        }
    }

    fn validate(&self) -> Result<(), SluiceError> {
        self.dispatch.validate()?;
        if let Some(batching) = &self.batching {
            if !self.worker.is_batch_shaped() {
                return Err(SluiceError::Config(format!(
                    "--batch-size and --wait only apply to batch-shaped workers, not '{}'",
                    self.worker.name()
                )));
            }
            batching.validate()?;
        }
        if self.limit == Some(0) {
            return Err(SluiceError::Config("--limit must be at least 1".to_string()));
        }
        if self.worker == WorkerKind::Exec && self.exec.is_none() {
            return Err(SluiceError::Config(
                "--worker exec requires --exec <COMMAND>".to_string(),
            ));
        }
        if self.exec.is_some() && self.worker != WorkerKind::Exec {
            return Err(SluiceError::Config(
                "--exec requires --worker exec".to_string(),
            ));
        }
        if self.pattern.contains('/') || self.pattern.contains(std::path::MAIN_SEPARATOR) {
            return Err(SluiceError::Config(format!(
                "--pattern '{}' must match file names inside the input directory",
                self.pattern
            )));
        }
        Ok(())
    }
}

impl ReconcileConfig {
    fn from_args(args: &ReconcileArgs) -> Self {
        Self {
            source: args.source.clone(),
            input: args.input.clone(),
            keyed: args.keyed,
            notify_cmd: args.notify_cmd.clone(),
            commit_order: args.commit_order,
        }
    }
}

impl WatchConfig {
    fn from_args(args: &WatchArgs) -> Self {
        Self {
            want: args.want.clone(),
            input: args.input.clone(),
            notify_cmd: args.notify_cmd.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    fn run_config(args: &[&str]) -> RunConfig {
        match SluiceConfig::from_cli(&parse(args)).command {
            CommandConfig::Run(run) => run,
            other => panic!("expected run config, got {:?}", other),
        }
    }

    #[test]
    fn test_run_defaults() {
        let run = run_config(&["sluice", "run", "in", "out"]);
        assert_eq!(run.worker, WorkerKind::Reverse);
        assert!(run.dispatch.order_preserving);
        assert!(!run.dispatch.tolerate_failures);
        assert_eq!(run.batching, Some(BatchConfig::default()));
        assert!(run.validate().is_ok());
    }

    #[test]
    fn test_wait_ms_alias() {
        let run = run_config(&["sluice", "run", "in", "out", "--batch-size", "8", "--wait-ms", "250"]);
        assert_eq!(
            run.batching,
            Some(BatchConfig::new(8, Duration::from_millis(250)))
        );

        let run = run_config(&["sluice", "run", "in", "out", "--wait", "2s"]);
        assert_eq!(run.batching.map(|b| b.wait), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_validation_errors() {
        let zero_batch = run_config(&["sluice", "run", "in", "out", "--batch-size", "0"]);
        assert!(matches!(zero_batch.validate(), Err(SluiceError::Config(_))));

        let zero_concurrency = run_config(&["sluice", "run", "in", "out", "-j", "0"]);
        assert!(zero_concurrency.validate().is_err());

        let zero_limit = run_config(&["sluice", "run", "in", "out", "--limit", "0"]);
        assert!(zero_limit.validate().is_err());

        let exec_without_command = run_config(&["sluice", "run", "in", "out", "--worker", "exec"]);
        assert!(exec_without_command.validate().is_err());

        let batch_on_single =
            run_config(&["sluice", "run", "in", "out", "--worker", "copy", "--batch-size", "2"]);
        assert!(batch_on_single.validate().is_err());
    }

    #[test]
    fn test_run_context_for_reconcile() {
        let today = NaiveDate::from_ymd_opt(2025, 3, 1).unwrap();
        let cli = parse(&[
            "sluice",
            "reconcile",
            "--state-dir",
            "/var/lib/sluice",
            "--to",
            "+15550001",
            "--to",
            "+15550002",
            "--reference-date",
            "2025-02-20",
        ]);
        let context = RunContext::from_cli(&cli, today);
        assert_eq!(context.reference_date, NaiveDate::from_ymd_opt(2025, 2, 20).unwrap());
        assert_eq!(context.recipients, vec!["+15550001", "+15550002"]);
        assert_eq!(context.state_dir, Some(PathBuf::from("/var/lib/sluice")));

        let cli = parse(&["sluice", "watch", "--want", "gpu_8x_a100"]);
        assert_eq!(RunContext::from_cli(&cli, today).reference_date, today);
    }

    #[test]
    fn test_commit_order_flag() {
        let cli = parse(&[
            "sluice",
            "reconcile",
            "--state-dir",
            "state",
            "--commit-order",
            "notify-then-save",
        ]);
        match SluiceConfig::from_cli(&cli).command {
            CommandConfig::Reconcile(reconcile) => {
                assert_eq!(reconcile.commit_order, CommitOrder::NotifyThenSave)
            }
            other => panic!("expected reconcile config, got {:?}", other),
        }
    }
}
