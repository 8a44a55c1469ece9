//! Process plumbing shared by the subcommands: exit codes, signal-driven
//! shutdown and console writers that tolerate closed pipes.

use anyhow::Result;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;

use crate::error::SluiceError;

use signal_hook::consts::{SIGINT, SIGTERM};

#[cfg(unix)]
use signal_hook::{consts::SIGUSR1, iterator::Signals};

#[cfg(windows)]
use signal_hook::flag;

/// Process exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidUsage = 2,
    /// Some items or notifications failed, the rest were delivered
    PartialFailure = 3,
    SignalInt = 130,  // 128 + SIGINT (2)
    SignalPipe = 141, // 128 + SIGPIPE (13)
    SignalTerm = 143, // 128 + SIGTERM (15)
}

impl ExitCode {
    pub fn exit(self) -> ! {
        process::exit(self as i32)
    }

    /// Conventional `128 + n` status for a shutdown signal
    pub fn for_signal(signal: i32) -> Self {
        if signal == SIGTERM {
            ExitCode::SignalTerm
        } else {
            ExitCode::SignalInt
        }
    }

    /// Status for an error that ended a subcommand
    pub fn for_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<SluiceError>() {
            Some(SluiceError::Config(_)) => ExitCode::InvalidUsage,
            _ => ExitCode::GeneralError,
        }
    }
}

/// First shutdown signal received, 0 until one arrives
static SHUTDOWN_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Exit status owed to a shutdown signal, if one was received
pub fn shutdown_exit_code() -> Option<ExitCode> {
    match SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        0 => None,
        signal => Some(ExitCode::for_signal(signal)),
    }
}

/// Control messages from the signal handler to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ctrl {
    Shutdown { immediate: bool },
    PrintStats,
}

/// The first request drains, any later one cancels in-flight work
#[derive(Debug, Default)]
struct ShutdownRequests {
    received: u32,
}

impl ShutdownRequests {
    fn record(&mut self, signal: i32) -> Ctrl {
        self.received += 1;
        let _ = SHUTDOWN_SIGNAL.compare_exchange(0, signal, Ordering::SeqCst, Ordering::SeqCst);
        Ctrl::Shutdown {
            immediate: self.received > 1,
        }
    }
}

fn announce_graceful_shutdown() {
    eprintln!(
        "{}",
        error_line(
            "stopping: no new work will start, in-flight items are finishing (signal again to cancel them)",
            emoji_from_env(),
        )
    );
}

/// Background thread turning process signals into [`Ctrl`] messages
///
/// SIGINT and SIGTERM request a graceful shutdown; a second one cancels
/// in-flight work and exits. SIGUSR1 asks for a progress report.
pub struct SignalHandler {
    _handle: thread::JoinHandle<()>,
}

impl SignalHandler {
    pub fn new(ctrl_sender: Sender<Ctrl>) -> Result<Self> {
        #[cfg(unix)]
        {
            // SIGPIPE stays ignored so a child closing its stdin surfaces as
            // EPIPE on that write instead of ending the process
            let mut signals = Signals::new([SIGINT, SIGTERM, SIGUSR1])?;

            let handle = thread::spawn(move || {
                let mut requests = ShutdownRequests::default();
                for sig in signals.forever() {
                    match sig {
                        SIGINT | SIGTERM => {
                            let ctrl = requests.record(sig);
                            let immediate = ctrl == Ctrl::Shutdown { immediate: true };
                            tracing::debug!(signal = sig, immediate, "shutdown requested");
                            if !immediate {
                                announce_graceful_shutdown();
                            }
                            let _ = ctrl_sender.send(ctrl);
                            if immediate {
                                ExitCode::for_signal(sig).exit();
                            }
                        }
                        SIGUSR1 => {
                            let _ = ctrl_sender.send(Ctrl::PrintStats);
                        }
                        _ => {
                            tracing::warn!(signal = sig, "received unexpected signal");
                        }
                    }
                }
            });

            Ok(SignalHandler { _handle: handle })
        }

        #[cfg(windows)]
        {
            // Ctrl-C only; polled through a flag
            let interrupted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
            flag::register(SIGINT, std::sync::Arc::clone(&interrupted))?;

            let handle = thread::spawn(move || {
                let mut requests = ShutdownRequests::default();
                loop {
                    thread::sleep(std::time::Duration::from_millis(100));
                    if !interrupted.swap(false, Ordering::Relaxed) {
                        continue;
                    }
                    let ctrl = requests.record(SIGINT);
                    let immediate = ctrl == Ctrl::Shutdown { immediate: true };
                    if !immediate {
                        announce_graceful_shutdown();
                    }
                    let _ = ctrl_sender.send(ctrl);
                    if immediate {
                        ExitCode::for_signal(SIGINT).exit();
                    }
                }
            });

            Ok(SignalHandler { _handle: handle })
        }
    }
}

/// Emoji stay on unless NO_EMOJI is set
pub fn emoji_from_env() -> bool {
    std::env::var_os("NO_EMOJI").is_none()
}

/// User-facing error line, prefixed with the program name
pub fn error_line(message: &str, emoji: bool) -> String {
    if emoji {
        format!("🚨 sluice: {}", message)
    } else {
        format!("sluice: {}", message)
    }
}

/// Stdout writer for results; a closed reader ends the process quietly
pub struct SafeStdout {
    stdout: io::Stdout,
}

impl Default for SafeStdout {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeStdout {
    pub fn new() -> Self {
        Self {
            stdout: io::stdout(),
        }
    }

    pub fn writeln(&mut self, data: &str) -> Result<()> {
        match writeln!(self.stdout, "{}", data) {
            Ok(()) => Ok(()),
            Err(e) if is_broken_pipe(&e) => ExitCode::SignalPipe.exit(),
            Err(e) => Err(anyhow::anyhow!("Failed to write to stdout: {}", e)),
        }
    }

    /// Pretty-printed JSON document followed by a newline
    pub fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.writeln(&json)
    }
}

/// Stderr writer for progress and diagnostics
pub struct SafeStderr {
    stderr: io::Stderr,
}

impl Default for SafeStderr {
    fn default() -> Self {
        Self::new()
    }
}

impl SafeStderr {
    pub fn new() -> Self {
        Self {
            stderr: io::stderr(),
        }
    }

    pub fn writeln(&mut self, data: &str) -> Result<()> {
        match writeln!(self.stderr, "{}", data) {
            Ok(()) => Ok(()),
            Err(e) if is_broken_pipe(&e) => ExitCode::SignalPipe.exit(),
            // Nowhere left to report it
            Err(_) => ExitCode::GeneralError.exit(),
        }
    }
}

impl Write for SafeStderr {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stderr.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stderr.flush()
    }
}

fn is_broken_pipe(e: &io::Error) -> bool {
    #[cfg(unix)]
    {
        e.kind() == io::ErrorKind::BrokenPipe
    }
    #[cfg(windows)]
    {
        e.kind() == io::ErrorKind::BrokenPipe
            || e.raw_os_error() == Some(232) // ERROR_NO_DATA
            || e.raw_os_error() == Some(109) // ERROR_BROKEN_PIPE
    }
}
