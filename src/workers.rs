//! Built-in workers for `sluice run` and the sink that writes their output

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::WorkerKind;
use crate::error::SluiceError;
use crate::parallel::{
    BatchConfig, BatchWorker, CancelToken, ResultSink, SingleItemWorker, TaskResult, Worker,
};
use crate::source::{InputFile, OutputTarget};

const INPUT_PLACEHOLDER: &str = "{}";
const STEM_PLACEHOLDER: &str = "{stem}";
const OUT_PLACEHOLDER: &str = "{out}";

const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Build the worker selected on the command line
pub fn build_worker(
    kind: &WorkerKind,
    exec: Option<&str>,
    batching: Option<BatchConfig>,
) -> Result<Worker<InputFile, Vec<u8>>, SluiceError> {
    match kind {
        WorkerKind::Reverse => Ok(Worker::batched(
            ReverseWorker,
            batching.unwrap_or_default(),
        )),
        WorkerKind::Copy => Ok(Worker::single(CopyWorker)),
        WorkerKind::Exec => {
            let command = exec.ok_or_else(|| {
                SluiceError::Config("--worker exec requires --exec <COMMAND>".to_string())
            })?;
            Ok(Worker::single(ExecWorker::parse(command)?))
        }
    }
}

/// Reverses the bytes of every file in a batch; any unreadable file fails
/// the whole batch
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseWorker;

impl BatchWorker<InputFile, Vec<u8>> for ReverseWorker {
    fn process_batch(&self, items: Vec<InputFile>, cancel: &CancelToken) -> Result<Vec<Vec<u8>>> {
        let mut outputs = Vec::with_capacity(items.len());
        for item in &items {
            if cancel.is_cancelled() {
                bail!("cancelled while reversing '{}'", item.path.display());
            }
            let mut bytes = item.read_bytes()?;
            bytes.reverse();
            outputs.push(bytes);
        }
        Ok(outputs)
    }
}

/// Passes file contents through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyWorker;

impl SingleItemWorker<InputFile, Vec<u8>> for CopyWorker {
    fn process(&self, item: InputFile, _cancel: &CancelToken) -> Result<Vec<u8>> {
        item.read_bytes()
    }
}

/// Runs an external command per input file
///
/// Placeholders in the argument template: `{}` is the input path, `{stem}`
/// the file stem, `{out}` a scratch file path whose contents become the
/// output. Without `{out}` the command's stdout is the output.
#[derive(Debug, Clone)]
pub struct ExecWorker {
    template: Vec<String>,
}

impl ExecWorker {
    pub fn parse(command: &str) -> Result<Self, SluiceError> {
        let template = shell_words::split(command)
            .map_err(|e| SluiceError::Config(format!("invalid --exec command: {}", e)))?;
        if template.is_empty() {
            return Err(SluiceError::Config("--exec command is empty".to_string()));
        }
        Ok(Self { template })
    }

    fn uses_out_file(&self) -> bool {
        self.template.iter().any(|arg| arg.contains(OUT_PLACEHOLDER))
    }

    fn argv(&self, input: &InputFile, out: Option<&Path>) -> Vec<String> {
        let path = input.path.to_string_lossy();
        let stem = input.stem();
        let out = out.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        self.template
            .iter()
            .map(|arg| {
                arg.replace(OUT_PLACEHOLDER, &out)
                    .replace(STEM_PLACEHOLDER, &stem)
                    .replace(INPUT_PLACEHOLDER, &path)
            })
            .collect()
    }
}

impl SingleItemWorker<InputFile, Vec<u8>> for ExecWorker {
    fn process(&self, item: InputFile, cancel: &CancelToken) -> Result<Vec<u8>> {
        // Scratch space lives exactly as long as this invocation
        let scratch = if self.uses_out_file() {
            Some(
                tempfile::Builder::new()
                    .prefix("sluice-")
                    .tempdir()
                    .context("failed to create scratch directory")?,
            )
        } else {
            None
        };
        let out_path: Option<PathBuf> = scratch
            .as_ref()
            .map(|dir| dir.path().join(format!("{}.out", item.stem())));

        let argv = self.argv(&item, out_path.as_deref());
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("--exec command is empty"))?;

        tracing::debug!(command = ?argv, "running worker command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to start '{}'", program))?;

        let stdout = drain_pipe(child.stdout.take());
        let stderr = drain_pipe(child.stderr.take());
        let status = wait_or_kill(&mut child, cancel, program)?;
        let stdout = join_pipe(stdout)?;
        let stderr = join_pipe(stderr)?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let detail = stderr.lines().last().unwrap_or("").trim();
            if detail.is_empty() {
                bail!("'{}' exited with {}", program, status);
            }
            bail!("'{}' exited with {}: {}", program, status, detail);
        }

        match out_path {
            Some(path) => fs::read(&path)
                .with_context(|| format!("'{}' did not write its output file", program)),
            None => Ok(stdout),
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            pipe.read_to_end(&mut buf)?;
            Ok(buf)
        })
    })
}

fn join_pipe(handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Result<Vec<u8>> {
    match handle {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow!("pipe reader thread panicked"))?
            .context("failed to read command output"),
        None => Ok(Vec::new()),
    }
}

fn wait_or_kill(
    child: &mut Child,
    cancel: &CancelToken,
    program: &str,
) -> Result<std::process::ExitStatus> {
    loop {
        if let Some(status) = child.try_wait().context("failed to wait for command")? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            bail!("'{}' was cancelled", program);
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// Writes each successful output to its target path and counts them
pub struct FileSink {
    inputs: Vec<InputFile>,
    target: OutputTarget,
    written: usize,
}

impl FileSink {
    pub fn new(inputs: Vec<InputFile>, target: OutputTarget) -> Result<Self> {
        fs::create_dir_all(&target.dir).with_context(|| {
            format!("failed to create output directory '{}'", target.dir.display())
        })?;
        Ok(Self {
            inputs,
            target,
            written: 0,
        })
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl ResultSink<Vec<u8>> for FileSink {
    fn deliver(&mut self, result: TaskResult<Vec<u8>>) -> Result<()> {
        let TaskResult::Success { index, output } = result else {
            return Ok(());
        };
        let input = self
            .inputs
            .get(index)
            .ok_or_else(|| anyhow!("result for unknown item {}", index))?;
        let path = self.target.path_for(input);
        fs::write(&path, output)
            .with_context(|| format!("failed to write '{}'", path.display()))?;
        self.written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_input(dir: &Path, name: &str, contents: &[u8]) -> InputFile {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        InputFile::new(path)
    }

    #[test]
    fn test_reverse_worker() {
        let dir = TempDir::new().unwrap();
        let a = write_input(dir.path(), "a.raw", b"abc");
        let b = write_input(dir.path(), "b.raw", b"12");
        let outputs = ReverseWorker
            .process_batch(vec![a, b], &CancelToken::new())
            .unwrap();
        assert_eq!(outputs, vec![b"cba".to_vec(), b"21".to_vec()]);
    }

    #[test]
    fn test_reverse_worker_fails_whole_batch_on_missing_file() {
        let dir = TempDir::new().unwrap();
        let a = write_input(dir.path(), "a.raw", b"abc");
        let missing = InputFile::new(dir.path().join("missing.raw"));
        let err = ReverseWorker
            .process_batch(vec![a, missing], &CancelToken::new())
            .unwrap_err();
        assert!(format!("{:#}", err).contains("missing.raw"));
    }

    #[test]
    fn test_exec_placeholders() {
        let worker = ExecWorker::parse("convert '{}' --name {stem} -o {out}").unwrap();
        let input = InputFile::new("/in/my clip.wav");
        let argv = worker.argv(&input, Some(Path::new("/tmp/x/my clip.out")));
        assert_eq!(
            argv,
            vec![
                "convert",
                "/in/my clip.wav",
                "--name",
                "my clip",
                "-o",
                "/tmp/x/my clip.out"
            ]
        );
        assert!(worker.uses_out_file());
    }

    #[test]
    fn test_exec_rejects_bad_commands() {
        assert!(ExecWorker::parse("").is_err());
        assert!(ExecWorker::parse("echo 'unterminated").is_err());
        assert!(build_worker(&WorkerKind::Exec, None, None).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_stdout_is_output() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), "clip.wav", b"payload");
        let worker = ExecWorker::parse("cat {}").unwrap();
        let output = worker.process(input, &CancelToken::new()).unwrap();
        assert_eq!(output, b"payload");
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_out_file_is_output() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), "clip.wav", b"payload");
        let worker = ExecWorker::parse("cp {} {out}").unwrap();
        let output = worker.process(input, &CancelToken::new()).unwrap();
        assert_eq!(output, b"payload");
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_nonzero_exit_is_error() {
        let dir = TempDir::new().unwrap();
        let input = write_input(dir.path(), "clip.wav", b"payload");
        let worker = ExecWorker::parse("sh -c 'echo no such clip >&2; exit 3'").unwrap();
        let err = worker.process(input, &CancelToken::new()).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("no such clip"), "{}", message);
    }

    #[test]
    fn test_file_sink_writes_successes_only() {
        let input_dir = TempDir::new().unwrap();
        let output_dir = TempDir::new().unwrap();
        let inputs = vec![
            write_input(input_dir.path(), "a.wav", b"a"),
            write_input(input_dir.path(), "b.wav", b"b"),
        ];
        let target = OutputTarget::new(output_dir.path().join("nested"), Some("rev".to_string()));
        let mut sink = FileSink::new(inputs, target).unwrap();

        sink.deliver(TaskResult::Success {
            index: 0,
            output: b"A".to_vec(),
        })
        .unwrap();
        sink.deliver(TaskResult::Failure {
            index: 1,
            error: crate::error::TaskError::Cancelled,
        })
        .unwrap();

        assert_eq!(sink.written(), 1);
        assert_eq!(
            fs::read(output_dir.path().join("nested/a.rev")).unwrap(),
            b"A"
        );
        assert!(!output_dir.path().join("nested/b.rev").exists());
    }
}
