//! Local filesystem adapter.
//!
//! Units are the root directory and every sub-directory that directly
//! contains files. Records are text lines; the field name is the file path
//! relative to the root, so findings point at the file they came from.
//! Binary files (a NUL byte in the first 8 KiB) are skipped. Lines longer
//! than the record value cap are cut there and the rest of the line is
//! skipped without buffering it.
//!
//! Directories that cannot be listed are still reported as units; sampling
//! them fails, so the scan records them instead of silently passing over
//! them.
//!
//! Nothing is held open between reads, so this adapter follows the
//! stateless connection model.

use super::{AdapterConfig, AdapterFeature, RecordBatchStream, SourceAdapter, UnitFilter};
use crate::Result;
use crate::error::ScanError;
use crate::models::{
    ConnectionModel, MAX_VALUE_CHARS, SampledRecord, SourceType, Unit, UnitHandle,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use walkdir::WalkDir;

/// Bytes inspected when deciding whether a file is binary.
const BINARY_PROBE_BYTES: usize = 8 * 1024;

/// Bytes kept from one line. Enough for [`MAX_VALUE_CHARS`] characters of
/// any UTF-8 width.
const MAX_LINE_BYTES: usize = MAX_VALUE_CHARS * 4;

/// Display name of the root directory unit.
pub const ROOT_UNIT_NAME: &str = ".";

/// Adapter scanning text files under a local directory.
#[derive(Debug)]
pub struct FilesystemAdapter {
    config: AdapterConfig,
    root: PathBuf,
    connected: AtomicBool,
}

impl FilesystemAdapter {
    /// Creates an adapter for the directory named by `config.url`.
    ///
    /// # Errors
    /// Returns a configuration error if no path is configured.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| ScanError::configuration("filesystem source requires a path"))?;
        let root = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));

        Ok(Self {
            config,
            root,
            connected: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ScanError::configuration(
                "filesystem adapter used before connect",
            ))
        }
    }

    fn unit_name(&self, dir: &Path) -> String {
        match dir.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => ROOT_UNIT_NAME.to_string(),
            Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
            Err(_) => dir.to_string_lossy().into_owned(),
        }
    }
}

#[async_trait]
impl SourceAdapter for FilesystemAdapter {
    fn source_type(&self) -> SourceType {
        SourceType::Filesystem
    }

    fn config(&self) -> &AdapterConfig {
        &self.config
    }

    fn connection_model(&self) -> ConnectionModel {
        ConnectionModel::Stateless
    }

    fn supports_feature(&self, feature: AdapterFeature) -> bool {
        matches!(
            feature,
            AdapterFeature::DataSampling
                | AdapterFeature::ConcurrentUnits
                | AdapterFeature::SizeHints
                | AdapterFeature::ReadOnlyMode
        )
    }

    async fn connect(&self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            ScanError::connection_failed(
                format!("Cannot open directory '{}'", self.root.display()),
                e,
            )
        })?;

        if !metadata.is_dir() {
            return Err(ScanError::connection_failed(
                format!("'{}' is not a directory", self.root.display()),
                std::io::Error::new(std::io::ErrorKind::NotADirectory, "not a directory"),
            ));
        }

        self.connected.store(true, Ordering::Release);
        tracing::debug!("Opened filesystem source {}", self.root.display());
        Ok(())
    }

    async fn enumerate_units(&self, filter: &UnitFilter) -> Result<Vec<Unit>> {
        self.ensure_connected()?;
        let root = self.root.clone();

        let dirs = tokio::task::spawn_blocking(move || list_directories(&root))
            .await
            .map_err(|e| ScanError::unit_scan(ROOT_UNIT_NAME, format!("walk task failed: {}", e)))?;

        let units = dirs
            .into_iter()
            .map(|(dir, files)| {
                let unit = Unit::directory(self.unit_name(&dir), dir);
                match files {
                    Some(files) => unit.with_size_hint(files),
                    None => unit,
                }
            })
            .collect();

        Ok(filter.apply(units))
    }

    async fn sample(&self, unit: &Unit, sample_size: u32) -> Result<RecordBatchStream> {
        self.ensure_connected()?;
        let UnitHandle::Directory { path } = &unit.handle else {
            return Err(ScanError::unit_scan(
                &unit.name,
                "filesystem adapter can only sample directory units",
            ));
        };

        let dir = path.clone();
        let files = tokio::task::spawn_blocking(move || list_files(&dir))
            .await
            .map_err(|e| ScanError::unit_scan(&unit.name, format!("listing task failed: {}", e)))?
            .map_err(|e| ScanError::io(format!("Failed to list files in '{}'", unit.name), e))?;

        let state = LineReader {
            root: self.root.clone(),
            files: files.into(),
            current: None,
            remaining: sample_size,
            batch_size: self.config.fetch_size.max(1),
        };

        let stream = futures::stream::try_unfold(state, |mut state| async move {
            let batch = state.next_batch().await?;
            Ok::<_, ScanError>(if batch.is_empty() {
                None
            } else {
                Some((batch, state))
            })
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }
}

/// Directories under `root` that directly contain at least one file, with
/// their file counts. Directories that could not be read are included with
/// no count.
fn list_directories(root: &Path) -> Vec<(PathBuf, Option<u64>)> {
    let mut dirs = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                match e.path() {
                    Some(path) if path.is_dir() => {
                        tracing::warn!("Cannot read directory {}: {}", path.display(), e);
                        dirs.push((path.to_path_buf(), None));
                    }
                    _ => tracing::warn!("Skipping unreadable entry: {}", e),
                }
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        match count_files(entry.path()) {
            Ok(0) => {}
            Ok(files) => dirs.push((entry.into_path(), Some(files))),
            Err(e) => {
                tracing::warn!("Cannot list {}: {}", entry.path().display(), e);
                dirs.push((entry.into_path(), None));
            }
        }
    }
    dirs.sort();
    dirs.dedup_by(|a, b| a.0 == b.0);
    dirs
}

fn count_files(dir: &Path) -> walkdir::Result<u64> {
    let mut files = 0;
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        if entry?.file_type().is_file() {
            files += 1;
        }
    }
    Ok(files)
}

/// Regular files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(std::io::Error::other)?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    Ok(files)
}

struct OpenFile {
    field: String,
    reader: BufReader<File>,
}

/// Lazily reads lines across the files of one directory.
struct LineReader {
    root: PathBuf,
    files: VecDeque<PathBuf>,
    current: Option<OpenFile>,
    remaining: u32,
    batch_size: u32,
}

impl LineReader {
    async fn next_batch(&mut self) -> Result<Vec<SampledRecord>> {
        let want = self.remaining.min(self.batch_size) as usize;
        let mut batch = Vec::with_capacity(want);

        while batch.len() < want {
            let Some(file) = self.current_file().await? else {
                break;
            };

            let mut buf = Vec::new();
            let read = read_line_bounded(&mut file.reader, &mut buf, MAX_LINE_BYTES)
                .await
                .map_err(|e| ScanError::io(format!("Failed to read '{}'", file.field), e))?;
            if read == 0 {
                self.current = None;
                continue;
            }

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            batch.push(SampledRecord::new().with_field(file.field.clone(), line));
        }

        self.remaining -= batch.len() as u32;
        Ok(batch)
    }

    /// The file currently being read, opening the next text file if needed.
    async fn current_file(&mut self) -> Result<Option<&mut OpenFile>> {
        while self.current.is_none() {
            let Some(path) = self.files.pop_front() else {
                return Ok(None);
            };
            if is_binary(&path).await? {
                tracing::debug!("Skipping binary file {}", path.display());
                continue;
            }
            let file = File::open(&path)
                .await
                .map_err(|e| ScanError::io(format!("Failed to open '{}'", path.display()), e))?;
            let field = path
                .strip_prefix(&self.root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            self.current = Some(OpenFile {
                field,
                reader: BufReader::new(file),
            });
        }
        Ok(self.current.as_mut())
    }
}

/// Reads one line into `buf`, keeping at most `limit` bytes of it and
/// discarding the rest up to and including the newline.
///
/// Returns the number of bytes consumed from `reader`; zero means end of
/// input.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut consumed = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(consumed);
        }

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };
        let room = limit.saturating_sub(buf.len());
        buf.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let used = chunk.len();
        reader.consume(used);
        consumed += used;
        if done {
            return Ok(consumed);
        }
    }
}

async fn is_binary(path: &Path) -> Result<bool> {
    let file = File::open(path)
        .await
        .map_err(|e| ScanError::io(format!("Failed to open '{}'", path.display()), e))?;
    let mut probe = Vec::with_capacity(BINARY_PROBE_BYTES);
    file.take(BINARY_PROBE_BYTES as u64)
        .read_to_end(&mut probe)
        .await
        .map_err(|e| ScanError::io(format!("Failed to read '{}'", path.display()), e))?;
    Ok(probe.contains(&0))
}
