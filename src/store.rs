use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::marker::PhantomData;

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::PipelineError;
use crate::hasher;

/// Durable, ordered record sequence behind the ledger and the history store.
///
/// `append` must be durable before it returns. `truncate` only ever removes
/// records appended by the current writer that were never published.
pub trait AppendLog<T>: Send {
    fn load(&mut self) -> Result<Vec<T>, PipelineError>;
    fn append(&mut self, record: &T) -> Result<(), PipelineError>;
    fn truncate(&mut self, len: usize) -> Result<(), PipelineError>;
    fn flush(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Layout of a data directory.
#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ledger_path(&self) -> Utf8PathBuf {
        self.root.join("ledger.jsonl")
    }

    pub fn history_path(&self) -> Utf8PathBuf {
        self.root.join("history.jsonl")
    }

    pub fn blobs_dir(&self) -> Utf8PathBuf {
        self.root.join("blobs")
    }

    pub fn blobs(&self) -> BlobStore {
        BlobStore::new(self.blobs_dir())
    }

    pub fn ensure_root(&self) -> Result<(), PipelineError> {
        fs::create_dir_all(self.root.as_std_path()).map_err(PipelineError::storage)
    }
}

/// Content-addressed file bytes, keyed by their SHA-256 digest.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: Utf8PathBuf,
}

impl BlobStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn blob_path(&self, digest: &str) -> Utf8PathBuf {
        let shard = digest.get(..2).unwrap_or("xx");
        self.root.join(shard).join(digest)
    }

    pub fn contains(&self, digest: &str) -> bool {
        hasher::is_hex_digest(digest) && self.blob_path(digest).as_std_path().exists()
    }

    /// Writes `content` under `digest` unless it is already present.
    pub fn put(&self, digest: &str, content: &[u8]) -> Result<(), PipelineError> {
        if !hasher::is_hex_digest(digest) {
            return Err(PipelineError::Storage(format!("invalid blob digest: {digest}")));
        }
        let path = self.blob_path(digest);
        if path.as_std_path().exists() {
            return Ok(());
        }
        let parent = path
            .parent()
            .ok_or_else(|| PipelineError::storage("invalid blob path"))?;
        fs::create_dir_all(parent.as_std_path()).map_err(PipelineError::storage)?;
        let mut temp = tempfile::Builder::new()
            .prefix("biopipeline-blob")
            .tempfile_in(parent.as_std_path())
            .map_err(PipelineError::storage)?;
        temp.write_all(content).map_err(PipelineError::storage)?;
        temp.as_file().sync_all().map_err(PipelineError::storage)?;
        temp.persist(path.as_std_path())
            .map_err(PipelineError::storage)?;
        Ok(())
    }

    /// Reads a blob back and checks it still hashes to its key.
    pub fn get(&self, digest: &str) -> Result<Vec<u8>, PipelineError> {
        if !self.contains(digest) {
            return Err(PipelineError::NotFound(format!("content {digest}")));
        }
        let content = fs::read(self.blob_path(digest).as_std_path()).map_err(PipelineError::storage)?;
        if hasher::digest(&content) != digest {
            return Err(PipelineError::Storage(format!("blob {digest} is corrupted")));
        }
        Ok(content)
    }
}

/// In-process log for tests and ephemeral runs.
#[derive(Debug, Clone)]
pub struct MemoryLog<T> {
    records: Vec<T>,
}

impl<T> MemoryLog<T> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[T] {
        &self.records
    }
}

impl<T> Default for MemoryLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> AppendLog<T> for MemoryLog<T> {
    fn load(&mut self) -> Result<Vec<T>, PipelineError> {
        Ok(self.records.clone())
    }

    fn append(&mut self, record: &T) -> Result<(), PipelineError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn truncate(&mut self, len: usize) -> Result<(), PipelineError> {
        self.records.truncate(len);
        Ok(())
    }
}

/// One JSON document per line, fsynced on every append.
///
/// A writable log holds an exclusive advisory lock on its file for as long as
/// it is open, so a second process cannot interleave appends. A record that
/// fails to parse on the last line is a torn write and is cut off on load;
/// anywhere else it is corruption and loading fails.
#[derive(Debug)]
pub struct JsonLinesLog<T> {
    path: Utf8PathBuf,
    file: Option<File>,
    offsets: Vec<u64>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonLinesLog<T> {
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self, PipelineError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(PipelineError::storage)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(PipelineError::storage)?;
        file.try_lock_exclusive().map_err(|err| {
            PipelineError::Storage(format!("{path} is locked by another process: {err}"))
        })?;
        Ok(Self {
            path,
            file: Some(file),
            offsets: Vec::new(),
            _record: PhantomData,
        })
    }

    /// Opens without locking; `append` and `truncate` fail.
    pub fn open_read_only(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            offsets: Vec::new(),
            _record: PhantomData,
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

fn writable<'a>(file: &'a mut Option<File>, path: &Utf8Path) -> Result<&'a mut File, PipelineError> {
    file.as_mut()
        .ok_or_else(|| PipelineError::Storage(format!("{path} is opened read-only")))
}

impl<T: Serialize + DeserializeOwned> AppendLog<T> for JsonLinesLog<T> {
    fn load(&mut self) -> Result<Vec<T>, PipelineError> {
        let content = match fs::read(self.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(PipelineError::storage(err)),
        };

        let mut records = Vec::new();
        let mut offsets = Vec::new();
        let mut torn_at: Option<u64> = None;
        let mut missing_newline = false;
        let mut start = 0usize;
        let mut line_no = 0usize;

        while start < content.len() {
            line_no += 1;
            let (end, terminated) = match content[start..].iter().position(|b| *b == b'\n') {
                Some(pos) => (start + pos + 1, true),
                None => (content.len(), false),
            };
            let line = content[start..end].trim_ascii();
            if !line.is_empty() {
                match serde_json::from_slice::<T>(line) {
                    Ok(record) => {
                        records.push(record);
                        offsets.push(end as u64);
                        missing_newline = !terminated;
                    }
                    Err(err) if end == content.len() => {
                        tracing::warn!(
                            path = %self.path,
                            line = line_no,
                            error = %err,
                            "dropping torn tail record"
                        );
                        torn_at = Some(start as u64);
                    }
                    Err(err) => {
                        return Err(PipelineError::Storage(format!(
                            "{} is corrupt at line {line_no}: {err}",
                            self.path
                        )));
                    }
                }
            }
            start = end;
        }

        if let Some(file) = self.file.as_mut() {
            if let Some(len) = torn_at {
                file.set_len(len).map_err(PipelineError::storage)?;
                file.sync_all().map_err(PipelineError::storage)?;
            } else if missing_newline {
                file.write_all(b"\n").map_err(PipelineError::storage)?;
                file.sync_data().map_err(PipelineError::storage)?;
                if let Some(last) = offsets.last_mut() {
                    *last += 1;
                }
            }
        }

        self.offsets = offsets;
        Ok(records)
    }

    fn append(&mut self, record: &T) -> Result<(), PipelineError> {
        let mut line = serde_json::to_vec(record).map_err(PipelineError::storage)?;
        line.push(b'\n');
        let path = &self.path;
        let file = writable(&mut self.file, path)?;
        let start = file.metadata().map_err(PipelineError::storage)?.len();
        let written = file.write_all(&line).and_then(|()| file.sync_data());
        if let Err(err) = written {
            // Leave no partial line behind for the next append to land on.
            if let Err(undo) = file.set_len(start) {
                tracing::error!(
                    path = %path,
                    offset = start,
                    error = %undo,
                    "failed to cut back partial record"
                );
            }
            return Err(PipelineError::storage(err));
        }
        self.offsets.push(start + line.len() as u64);
        Ok(())
    }

    fn truncate(&mut self, len: usize) -> Result<(), PipelineError> {
        if len >= self.offsets.len() {
            return Ok(());
        }
        let keep = match len {
            0 => 0,
            n => self.offsets[n - 1],
        };
        let file = writable(&mut self.file, &self.path)?;
        file.set_len(keep).map_err(PipelineError::storage)?;
        file.sync_all().map_err(PipelineError::storage)?;
        self.offsets.truncate(len);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        match self.file.as_mut() {
            Some(file) => file.sync_all().map_err(PipelineError::storage),
            None => Ok(()),
        }
    }
}
