//! Work sources: anything that enumerates input items up front
//!
//! The dispatcher only needs an ordered list with a stable count, so sources
//! are enumerated once before a run starts.

use anyhow::Context;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::SluiceError;

pub trait WorkSource {
    type Item;

    fn enumerate(&mut self) -> Result<Vec<Self::Item>, SluiceError>;
}

/// In-memory source, mostly useful for tests and library callers
#[derive(Debug, Clone, Default)]
pub struct VecSource<T> {
    items: Vec<T>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self { items }
    }
}

impl<T> WorkSource for VecSource<T> {
    type Item = T;

    fn enumerate(&mut self) -> Result<Vec<T>, SluiceError> {
        Ok(std::mem::take(&mut self.items))
    }
}

/// One input file; the contents are read by the worker that handles it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct InputFile {
    pub path: PathBuf,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
    }

    pub fn read_bytes(&self) -> anyhow::Result<Vec<u8>> {
        fs::read(&self.path).with_context(|| format!("failed to read '{}'", self.path.display()))
    }
}

/// Where the output for an input file goes: `dir/<stem>.<extension>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTarget {
    pub dir: PathBuf,
    /// Keep the input's extension when unset
    pub extension: Option<String>,
}

impl OutputTarget {
    pub fn new(dir: impl Into<PathBuf>, extension: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            extension,
        }
    }

    pub fn path_for(&self, input: &InputFile) -> PathBuf {
        let extension = self
            .extension
            .as_deref()
            .map(|ext| ext.trim_start_matches('.').to_string())
            .or_else(|| input.extension());
        let name = match extension {
            Some(ext) if !ext.is_empty() => format!("{}.{}", input.stem(), ext),
            _ => input.stem(),
        };
        self.dir.join(name)
    }
}

/// Files in `dir` matching `pattern`, sorted by path
#[derive(Debug, Clone)]
pub struct DirectorySource {
    pub dir: PathBuf,
    pub pattern: String,
    pub limit: Option<usize>,
    /// Drop inputs whose output already exists
    pub skip_existing: Option<OutputTarget>,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            pattern: pattern.into(),
            limit: None,
            skip_existing: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    pub fn skip_existing(mut self, target: Option<OutputTarget>) -> Self {
        self.skip_existing = target;
        self
    }

    fn full_pattern(&self) -> Result<String, SluiceError> {
        let dir = self.dir.to_str().ok_or_else(|| SluiceError::SourcePattern {
            pattern: self.pattern.clone(),
            message: format!("directory '{}' is not valid UTF-8", self.dir.display()),
        })?;
        Ok(format!(
            "{}/{}",
            glob::Pattern::escape(dir.trim_end_matches('/')),
            self.pattern
        ))
    }
}

fn check_dir(dir: &Path) -> Result<(), SluiceError> {
    let metadata = fs::metadata(dir).map_err(|source| SluiceError::SourceRead {
        path: dir.to_path_buf(),
        source,
    })?;
    if !metadata.is_dir() {
        return Err(SluiceError::SourceRead {
            path: dir.to_path_buf(),
            source: io::Error::new(io::ErrorKind::Other, "not a directory"),
        });
    }
    Ok(())
}

impl WorkSource for DirectorySource {
    type Item = InputFile;

    fn enumerate(&mut self) -> Result<Vec<InputFile>, SluiceError> {
        check_dir(&self.dir)?;

        let pattern = self.full_pattern()?;
        let entries = glob::glob(&pattern).map_err(|e| SluiceError::SourcePattern {
            pattern: self.pattern.clone(),
            message: e.msg.to_string(),
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| SluiceError::SourceRead {
                path: e.path().to_path_buf(),
                source: e.into_error(),
            })?;
            if path.is_file() {
                files.push(InputFile::new(path));
            }
        }
        // Sort for consistent ordering
        files.sort();
        let matched = files.len();

        if let Some(target) = &self.skip_existing {
            files.retain(|file| !target.path_for(file).exists());
        }
        let skipped = matched - files.len();

        if let Some(limit) = self.limit {
            files.truncate(limit);
        }

        tracing::info!(
            dir = %self.dir.display(),
            pattern = %self.pattern,
            matched,
            skipped_existing = skipped,
            selected = files.len(),
            "enumerated work source"
        );
        Ok(files)
    }
}
