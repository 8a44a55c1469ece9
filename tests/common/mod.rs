// tests/common/mod.rs
// Shared test utilities for integration tests
#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tempfile::TempDir;

/// Isolated environment for running the sluice binary: its own working
/// directory and home, so no user or project config leaks into a test
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create sandbox"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn path_str(&self, name: &str) -> String {
        self.join(name).to_string_lossy().into_owned()
    }

    /// Create `name` (and its parent directories) with `contents`
    pub fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, contents).expect("Failed to write file");
        path
    }

    /// Start sluice without waiting for it; stdin, stdout and stderr are piped
    pub fn spawn(&self, args: &[&str]) -> Child {
        let home = self.join("home");
        fs::create_dir_all(&home).expect("Failed to create home");

        Command::new(env!("CARGO_BIN_EXE_sluice"))
            .args(args)
            .current_dir(self.path())
            .env("HOME", &home)
            .env("XDG_CONFIG_HOME", home.join(".config"))
            .env("NO_EMOJI", "1")
            .env_remove("SLUICE_LOG")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to start sluice")
    }

    /// Run sluice with the given arguments and stdin; returns (stdout, stderr, exit code)
    pub fn run_with_input(&self, args: &[&str], input: &str) -> (String, String, i32) {
        let mut child = self.spawn(args);

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .expect("Failed to write to stdin");
        }

        let output = child.wait_with_output().expect("Failed to read output");
        (
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
            output.status.code().unwrap_or(-1),
        )
    }

    pub fn run(&self, args: &[&str]) -> (String, String, i32) {
        self.run_with_input(args, "")
    }
}
