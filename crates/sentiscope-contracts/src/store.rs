use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::csv::{complete_records_len, encode_row, parse_rows};
use crate::errors::PipelineError;
use crate::records::{AnalysisRecord, Envelope, STORE_HEADER};

/// Append-only result store mirrored to disk after every unit.
///
/// Appends land in memory first and are then flushed. A failed flush leaves
/// the pending data in memory; the next `flush` (or append) retries it.
pub trait OutputStore {
    fn path(&self) -> &Path;

    /// Whether output for this unit was already persisted (resume support).
    fn contains(&self, tweet_id: &str, file_name: &str) -> bool;

    /// Number of records currently held (persisted or pending).
    fn record_count(&self) -> usize;

    fn append_records(
        &mut self,
        tweet_id: &str,
        file_name: &str,
        records: &[AnalysisRecord],
    ) -> Result<usize, PipelineError>;

    /// Stores the unnormalized response text. Returns `false` when the store
    /// format has no place for raw text.
    fn append_raw(
        &mut self,
        _tweet_id: &str,
        _file_name: &str,
        _raw: &str,
    ) -> Result<bool, PipelineError> {
        Ok(false)
    }

    fn flush(&mut self) -> Result<(), PipelineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Csv,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("json") => Some(Self::Json),
            Some("csv") => Some(Self::Csv),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// Opens the store for `path`. With `resume`, existing content is kept and
/// indexed; otherwise the file is started fresh.
pub fn open_store(
    format: OutputFormat,
    path: impl Into<PathBuf>,
    resume: bool,
) -> Result<Box<dyn OutputStore>, PipelineError> {
    Ok(match format {
        OutputFormat::Json => Box::new(JsonStore::open(path, resume)?),
        OutputFormat::Csv => Box::new(CsvStore::open(path, resume)?),
    })
}

/// Pretty JSON array of [`Envelope`]s, rewritten atomically on each flush.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    entries: Vec<Envelope>,
    done: HashSet<(String, String)>,
    dirty: bool,
}

impl JsonStore {
    pub fn open(path: impl Into<PathBuf>, resume: bool) -> Result<Self, PipelineError> {
        let path = path.into();
        let entries = if resume && path.exists() {
            read_envelopes(&path)?
        } else {
            Vec::new()
        };
        let done = entries.iter().map(Envelope::key).collect();
        let mut store = Self {
            path,
            entries,
            done,
            dirty: true,
        };
        store.flush()?;
        Ok(store)
    }

    pub fn entries(&self) -> &[Envelope] {
        &self.entries
    }

    pub fn push(&mut self, envelope: Envelope) -> Result<(), PipelineError> {
        self.done.insert(envelope.key());
        self.entries.push(envelope);
        self.dirty = true;
        self.flush()
    }
}

impl OutputStore for JsonStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn contains(&self, tweet_id: &str, file_name: &str) -> bool {
        self.done
            .contains(&(tweet_id.to_string(), file_name.to_string()))
    }

    fn record_count(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| {
                entry
                    .response
                    .get("tweets")
                    .and_then(|tweets| tweets.as_array())
                    .map(Vec::len)
                    .unwrap_or(0)
            })
            .sum()
    }

    fn append_records(
        &mut self,
        tweet_id: &str,
        file_name: &str,
        records: &[AnalysisRecord],
    ) -> Result<usize, PipelineError> {
        self.push(Envelope::normalized(tweet_id, file_name, records))?;
        Ok(records.len())
    }

    fn append_raw(
        &mut self,
        tweet_id: &str,
        file_name: &str,
        raw: &str,
    ) -> Result<bool, PipelineError> {
        self.push(Envelope::raw(tweet_id, file_name, raw))?;
        Ok(true)
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        if !self.dirty {
            return Ok(());
        }
        let encoded = serde_json::to_string_pretty(&self.entries)
            .map_err(|err| persistence(&self.path, std::io::Error::other(err)))?;
        write_atomic(&self.path, encoded.as_bytes())?;
        self.dirty = false;
        Ok(())
    }
}

/// 23-column CSV file; rows are appended, never rewritten.
///
/// `committed` is the byte length known to hold only complete rows. Bytes
/// past it (a torn write, or an interrupted run) are cut off before the next
/// append.
#[derive(Debug)]
pub struct CsvStore {
    path: PathBuf,
    pending: Vec<Vec<String>>,
    header_written: bool,
    done: HashSet<(String, String)>,
    rows: usize,
    committed: u64,
}

impl CsvStore {
    pub fn open(path: impl Into<PathBuf>, resume: bool) -> Result<Self, PipelineError> {
        let path = path.into();
        let mut store = Self {
            path,
            pending: Vec::new(),
            header_written: false,
            done: HashSet::new(),
            rows: 0,
            committed: 0,
        };

        if resume && store.path.exists() {
            let mut raw =
                fs::read_to_string(&store.path).map_err(|err| persistence(&store.path, err))?;
            let complete = complete_records_len(&raw);
            if complete < raw.len() {
                log::warn!(
                    "{}: discarding unterminated last row ({} bytes)",
                    store.path.display(),
                    raw.len() - complete
                );
                OpenOptions::new()
                    .write(true)
                    .open(&store.path)
                    .and_then(|file| file.set_len(complete as u64))
                    .map_err(|err| persistence(&store.path, err))?;
                raw.truncate(complete);
            }
            store.committed = complete as u64;
            let mut rows = parse_rows(&raw).into_iter();
            if let Some(header) = rows.next() {
                if header.iter().map(String::as_str).ne(STORE_HEADER.iter().copied()) {
                    return Err(PipelineError::malformed(format!(
                        "{} does not start with the expected CSV header",
                        store.path.display()
                    )));
                }
                store.header_written = true;
            }
            for row in rows.filter(|row| row.len() == STORE_HEADER.len()) {
                store.done.insert((row[0].clone(), row[1].clone()));
                store.rows += 1;
            }
        } else if store.path.exists() {
            fs::remove_file(&store.path).map_err(|err| persistence(&store.path, err))?;
        }

        store.flush()?;
        Ok(store)
    }

    /// Queues a full store row and flushes. Rows whose field count differs
    /// from the header are rejected.
    pub fn append_row(&mut self, row: Vec<String>) -> Result<(), PipelineError> {
        if row.len() != STORE_HEADER.len() {
            return Err(PipelineError::malformed(format!(
                "row has {} fields, expected {}",
                row.len(),
                STORE_HEADER.len()
            )));
        }
        self.done.insert((row[0].clone(), row[1].clone()));
        self.pending.push(row);
        self.rows += 1;
        self.flush()
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }
}

impl OutputStore for CsvStore {
    fn path(&self) -> &Path {
        &self.path
    }

    fn contains(&self, tweet_id: &str, file_name: &str) -> bool {
        self.done
            .contains(&(tweet_id.to_string(), file_name.to_string()))
    }

    fn record_count(&self) -> usize {
        self.rows
    }

    fn append_records(
        &mut self,
        tweet_id: &str,
        file_name: &str,
        records: &[AnalysisRecord],
    ) -> Result<usize, PipelineError> {
        for record in records {
            self.done
                .insert((tweet_id.to_string(), file_name.to_string()));
            self.pending.push(record.store_row(tweet_id, file_name));
            self.rows += 1;
        }
        self.flush()?;
        Ok(records.len())
    }

    fn flush(&mut self) -> Result<(), PipelineError> {
        if self.header_written && self.pending.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| persistence(&self.path, err))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| persistence(&self.path, err))?;
        let on_disk = file
            .metadata()
            .map_err(|err| persistence(&self.path, err))?
            .len();
        if on_disk > self.committed {
            file.set_len(self.committed)
                .map_err(|err| persistence(&self.path, err))?;
        } else if on_disk < self.committed {
            // Truncated or replaced behind our back; start over from what is there.
            self.committed = on_disk;
            self.header_written = on_disk > 0;
        }

        let mut buffer = String::new();
        if !self.header_written {
            buffer.push_str(&encode_row(&STORE_HEADER));
            buffer.push('\n');
        }
        for row in &self.pending {
            buffer.push_str(&encode_row(row.as_slice()));
            buffer.push('\n');
        }

        if let Err(err) = file
            .write_all(buffer.as_bytes())
            .and_then(|_| file.sync_data())
        {
            // Pending rows must leave no bytes behind.
            let _ = file.set_len(self.committed);
            return Err(persistence(&self.path, err));
        }

        self.committed += buffer.len() as u64;
        self.header_written = true;
        self.pending.clear();
        Ok(())
    }
}

pub fn read_envelopes(path: &Path) -> Result<Vec<Envelope>, PipelineError> {
    let raw = fs::read_to_string(path).map_err(|err| persistence(path, err))?;
    serde_json::from_str(&raw).map_err(|err| {
        PipelineError::malformed(format!("{} is not a JSON envelope array: {err}", path.display()))
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| persistence(path, err))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_data()?;
        fs::rename(&tmp_path, path)
    })();
    result.map_err(|err| persistence(path, err))
}

fn persistence(path: &Path, source: std::io::Error) -> PipelineError {
    PipelineError::Persistence {
        path: path.to_path_buf(),
        source,
    }
}
