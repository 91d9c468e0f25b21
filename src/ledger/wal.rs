//! Write-Ahead Log (WAL) implementation
//!
//! Text log with one entry per line: `seq id payload\n`.
//! Every append is flushed and fsynced before it is acknowledged.
//!
//! A crash in the middle of an append can leave a final line without its
//! newline. That torn tail is cut off on open; any other malformed line is
//! reported as corruption.

use crate::common::utils::{sync_parent_dir, temp_path};
use crate::common::{Error, Result};
use crate::ledger::entry::LedgerEntry;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only entry log
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    len: usize,
}

impl Wal {
    /// Open or create the WAL file and return it with the entries it holds.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<LedgerEntry>)> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = Self::recover(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok((
            Self {
                path,
                writer: BufWriter::new(file),
                len: entries.len(),
            },
            entries,
        ))
    }

    /// Read the log, trimming a torn final line from disk if present
    fn recover(path: &Path) -> Result<Vec<LedgerEntry>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let complete = raw
            .iter()
            .rposition(|b| *b == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(0);

        if complete < raw.len() {
            tracing::warn!(
                "WAL {} ends with a torn line ({} bytes), discarding it",
                path.display(),
                raw.len() - complete
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(complete as u64)?;
            file.sync_all()?;
        }

        let text = std::str::from_utf8(&raw[..complete])
            .map_err(|_| Error::Wal(format!("{} is not valid UTF-8", path.display())))?;
        parse_lines(text, path)
    }

    /// Append one entry and make it durable
    pub fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        writeln!(self.writer, "{}", entry)?;
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        self.len += 1;
        Ok(())
    }

    /// Atomically replace the whole log with `entries`
    pub fn rewrite(&mut self, entries: &[LedgerEntry]) -> Result<()> {
        self.writer.flush()?;
        write_entries_atomic(&self.path, entries)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.len = entries.len();
        Ok(())
    }

    /// Number of entries currently in the file
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read a fully written entry file (e.g. a snapshot); missing file means empty.
pub fn read_entries(path: &Path) -> Result<Vec<LedgerEntry>> {
    match fs::read_to_string(path) {
        Ok(text) => parse_lines(&text, path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Write entries to a temp file, fsync, then rename over `path`.
pub fn write_entries_atomic(path: &Path, entries: &[LedgerEntry]) -> Result<()> {
    let tmp = temp_path(path);
    {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            writeln!(writer, "{}", entry)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_parent_dir(path)
}

fn parse_lines(text: &str, path: &Path) -> Result<Vec<LedgerEntry>> {
    text.lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<LedgerEntry>().map_err(|e| {
                Error::Wal(format!("{}: {}", path.display(), e))
            })
        })
        .collect()
}
