use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use is_terminal::IsTerminal;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use sluice::cli::Cli;
use sluice::config::{
    CommandConfig, OutputConfig, ReconcileConfig, RunConfig, RunContext, SluiceConfig,
    WatchConfig,
};
use sluice::config_file::ConfigFile;
use sluice::error::SluiceError;
use sluice::logging::init_logging;
use sluice::parallel::{Dispatcher, ProgressSink};
use sluice::platform::{
    emoji_from_env, error_line, shutdown_exit_code, Ctrl, ExitCode, SafeStderr, SafeStdout,
    SignalHandler,
};
use sluice::reconcile::{
    CommandNotifier, CycleReport, EventKeyDeriver, EventRecord, FileStore, LogNotifier,
    Notifier, Reconciler, Snapshot, Watchlist,
};
use sluice::source::{DirectorySource, OutputTarget, WorkSource};
use sluice::workers::{build_worker, FileSink};

fn main() -> Result<()> {
    // Broadcast channel for shutdown requests from the signal handler
    let (ctrl_tx, ctrl_rx) = unbounded::<Ctrl>();

    // Initialize signal handling early
    let _signal_handler = match SignalHandler::new(ctrl_tx) {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("Failed to initialize signal handling: {}", e);
            ExitCode::GeneralError.exit();
        }
    };

    let mut stderr = SafeStderr::new();

    // Process command line arguments with config file support
    let cli = process_args_with_config(&mut stderr);

    let config = SluiceConfig::from_cli(&cli);
    init_logging(config.output.verbosity, config.output.log_format);

    // Aliases survive parsing only when config files are ignored
    if !cli.alias.is_empty() {
        stderr
            .writeln(&error_line(
                "--alias needs a configuration file; it cannot be combined with --ignore-config",
                config.output.emoji,
            ))
            .unwrap_or(());
        ExitCode::InvalidUsage.exit();
    }

    if let Err(e) = config.validate() {
        stderr
            .writeln(&error_line(&e.to_string(), config.output.emoji))
            .unwrap_or(());
        ExitCode::InvalidUsage.exit();
    }

    // Fixed for the lifetime of the process
    let context = RunContext::from_cli(&cli, chrono::Local::now().date_naive());
    tracing::debug!(?context, "run context");

    let outcome = match &config.command {
        CommandConfig::Run(run) => run_command(run, &config.output, ctrl_rx, &mut stderr),
        CommandConfig::Reconcile(reconcile) => {
            reconcile_command(reconcile, &context, &config.output, &mut stderr)
        }
        CommandConfig::Watch(watch) => watch_command(watch, &context, &config.output, &mut stderr),
    };

    let exit_code = match outcome {
        Ok(code) => code,
        Err(e) => {
            stderr
                .writeln(&error_line(&format!("{:#}", e), config.output.emoji))
                .unwrap_or(());
            ExitCode::for_error(&e)
        }
    };

    // A signal-driven shutdown reports the signal, not the drained run
    if let Some(code) = shutdown_exit_code() {
        code.exit();
    }

    exit_code.exit();
}

fn run_command(
    run: &RunConfig,
    output: &OutputConfig,
    ctrl_rx: Receiver<Ctrl>,
    stderr: &mut SafeStderr,
) -> Result<ExitCode> {
    let target = OutputTarget::new(&run.output_dir, run.out_ext.clone());
    let mut source = DirectorySource::new(&run.input_dir, &run.pattern)
        .with_limit(run.limit)
        .skip_existing(run.skip_existing.then(|| target.clone()));
    let inputs = source.enumerate()?;

    if inputs.is_empty() {
        if !output.quiet {
            stderr.writeln(&format!(
                "No files matching '{}' in '{}'",
                run.pattern,
                run.input_dir.display()
            ))?;
        }
        return Ok(ExitCode::Success);
    }

    let worker = build_worker(&run.worker, run.exec.as_deref(), run.batching.clone())?;
    let file_sink = FileSink::new(inputs.clone(), target)?;
    let total = inputs.len();
    let mut sink = ProgressSink::new(file_sink, SafeStderr::new(), total)
        .quiet(output.quiet)
        .emoji(output.emoji);

    let dispatcher = Dispatcher::new(run.dispatch.clone()).with_ctrl(ctrl_rx);
    let summary = dispatcher.run(inputs, worker, &mut sink)?;

    if !output.quiet {
        stderr.writeln(&summary.format_summary())?;
    }
    tracing::info!(
        written = sink.into_inner().written(),
        peak_in_flight = summary.peak_in_flight,
        invocations = summary.invocations,
        "run complete"
    );

    if summary.is_full_success() {
        Ok(ExitCode::Success)
    } else {
        Ok(ExitCode::PartialFailure)
    }
}

fn reconcile_command(
    reconcile: &ReconcileConfig,
    context: &RunContext,
    output: &OutputConfig,
    stderr: &mut SafeStderr,
) -> Result<ExitCode> {
    let state_dir = context
        .state_dir
        .as_ref()
        .context("reconcile needs a state directory")?;
    let input = read_input(&reconcile.input)?;
    let notifier = build_notifier(reconcile.notify_cmd.as_deref())?;
    if context.recipients.is_empty() {
        tracing::warn!("no --to recipients given; new entries are only printed");
    }

    let reconciler =
        Reconciler::new(FileStore::open(state_dir)?).with_commit_order(reconcile.commit_order);

    if reconcile.keyed {
        let records: Vec<EventRecord> = serde_json::from_str(&input)
            .context("input must be a JSON array of event records")?;
        let deriver = EventKeyDeriver::new(context.reference_date);
        let (snapshot, skipped) = Snapshot::from_records(records, &deriver);
        if !skipped.is_empty() && !output.quiet {
            stderr.writeln(&format!(
                "Skipped {} records that could not be keyed",
                skipped.len()
            ))?;
        }
        let report =
            reconciler.run_cycle(&reconcile.source, &snapshot, &*notifier, &context.recipients)?;
        finish_cycle(&report, snapshot.len(), output, stderr)
    } else {
        let snapshot: Snapshot<Value> = serde_json::from_str(&input)
            .context("input must be a JSON object mapping keys to records")?;
        let report =
            reconciler.run_cycle(&reconcile.source, &snapshot, &*notifier, &context.recipients)?;
        finish_cycle(&report, snapshot.len(), output, stderr)
    }
}

fn finish_cycle<R: Serialize>(
    report: &CycleReport<R>,
    observed: usize,
    output: &OutputConfig,
    stderr: &mut SafeStderr,
) -> Result<ExitCode> {
    SafeStdout::new()
        .write_json(&report.delta)
        .context("failed to print delta")?;

    if !output.quiet {
        let line = if report.first_run {
            format!(
                "First run for '{}': saved {} entries, nothing to report",
                report.source, observed
            )
        } else {
            format!(
                "{} new of {} entries for '{}', {} notifications sent",
                report.delta.len(),
                observed,
                report.source,
                report.deliveries.len()
            )
        };
        stderr.writeln(&line)?;
    }

    for failure in &report.failures {
        stderr.writeln(&error_line(&failure.to_string(), output.emoji))?;
    }
    if report.all_delivered() {
        Ok(ExitCode::Success)
    } else {
        Ok(ExitCode::PartialFailure)
    }
}

fn watch_command(
    watch: &WatchConfig,
    context: &RunContext,
    output: &OutputConfig,
    stderr: &mut SafeStderr,
) -> Result<ExitCode> {
    let input = read_input(&watch.input)?;
    let available: Vec<&str> = input
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let watchlist = Watchlist::new(
        watch
            .want
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty()),
    );
    let found = watchlist.matches(&available);
    tracing::info!(available = available.len(), found = found.len(), "watchlist checked");

    let mut stdout = SafeStdout::new();
    for name in &found {
        stdout.writeln(name)?;
    }

    let Some(message) = Watchlist::message(&found) else {
        return Ok(ExitCode::Success);
    };

    let notifier = build_notifier(watch.notify_cmd.as_deref())?;
    let mut failed = false;
    for recipient in &context.recipients {
        if let Err(e) = notifier.send(recipient, &message) {
            tracing::warn!(error = %e, "notification failed");
            stderr.writeln(&error_line(&e.to_string(), output.emoji))?;
            failed = true;
        }
    }

    if failed {
        Ok(ExitCode::PartialFailure)
    } else {
        Ok(ExitCode::Success)
    }
}

fn build_notifier(command: Option<&str>) -> Result<Box<dyn Notifier>, SluiceError> {
    Ok(match command {
        Some(command) => Box::new(CommandNotifier::parse(command)?),
        None => Box::new(LogNotifier::new()),
    })
}

/// Read a whole input file, or stdin for "-"
fn read_input(path: &str) -> Result<String, SluiceError> {
    let read_error = |source: io::Error| SluiceError::SourceRead {
        path: PathBuf::from(path),
        source,
    };
    if path == "-" {
        if io::stdin().is_terminal() {
            tracing::warn!("reading input from the terminal; end it with Ctrl-D");
        }
        let mut input = String::new();
        io::stdin().read_to_string(&mut input).map_err(read_error)?;
        Ok(input)
    } else {
        fs::read_to_string(path).map_err(read_error)
    }
}

/// Extract the --config-file argument from raw args
fn extract_config_file_arg(args: &[String]) -> Option<String> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config-file" {
            return iter.next().cloned();
        }
        if let Some(path) = arg.strip_prefix("--config-file=") {
            return Some(path.to_string());
        }
    }
    None
}

fn process_args_with_config(stderr: &mut SafeStderr) -> Cli {
    // Get raw command line arguments
    let raw_args: Vec<String> = std::env::args().collect();

    // Extract --config-file argument early for use by config commands
    let config_file_path = extract_config_file_arg(&raw_args);

    // Check for --show-config first, before any other processing
    if raw_args.iter().any(|arg| arg == "--show-config") {
        SafeStdout::new()
            .writeln(ConfigFile::describe(config_file_path.as_deref()).trim_end())
            .unwrap_or(());
        ExitCode::Success.exit();
    }

    let processed_args = if raw_args.iter().any(|arg| arg == "--ignore-config") {
        raw_args
    } else {
        // Load config file and process aliases
        match ConfigFile::load_with_custom_path(config_file_path.as_deref()) {
            Ok(config_file) => match config_file.process_args(raw_args) {
                Ok(processed) => processed,
                Err(e) => {
                    stderr
                        .writeln(&error_line(&format!("Config error: {:#}", e), emoji_from_env()))
                        .unwrap_or(());
                    ExitCode::InvalidUsage.exit();
                }
            },
            Err(e) => {
                stderr
                    .writeln(&error_line(&format!("Config file error: {:#}", e), emoji_from_env()))
                    .unwrap_or(());
                ExitCode::GeneralError.exit();
            }
        }
    };

    // Parse with potentially modified arguments; clap exits with code 2 on usage errors
    Cli::parse_from(processed_args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_extract_config_file_arg() {
        assert_eq!(
            extract_config_file_arg(&args(&["sluice", "--config-file", "ci.ini", "run"])),
            Some("ci.ini".to_string())
        );
        assert_eq!(
            extract_config_file_arg(&args(&["sluice", "--config-file=ci.ini"])),
            Some("ci.ini".to_string())
        );
        assert_eq!(extract_config_file_arg(&args(&["sluice", "run"])), None);
    }
}
