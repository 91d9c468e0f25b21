//! Payment id index for fast duplicate detection
//!
//! Ids live in a `HashSet` and are appended to `ids.idx`, one per line.
//! The file may accumulate repeats (replays, restarts); `compact` rewrites it
//! deduplicated via temp file + rename.

use crate::common::Result;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct IdIndex {
    path: PathBuf,
    ids: HashSet<String>,
    file_lines: usize,
}

impl IdIndex {
    /// Load the index file if present
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut ids = HashSet::new();
        let mut file_lines = 0;

        match fs::read_to_string(&path) {
            Ok(text) => {
                for line in text.lines() {
                    let id = line.trim();
                    if id.is_empty() {
                        continue;
                    }
                    file_lines += 1;
                    ids.insert(id.to_string());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            path,
            ids,
            file_lines,
        })
    }

    /// Check if an id has been recorded
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record an id durably. Returns false if it was already known.
    pub fn insert(&mut self, id: &str) -> Result<bool> {
        if self.ids.contains(id) {
            return Ok(false);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", id)?;
        file.sync_data()?;

        self.ids.insert(id.to_string());
        self.file_lines += 1;
        Ok(true)
    }

    /// Add ids that are already durable elsewhere (e.g. in the WAL) without
    /// touching the index file.
    pub fn extend_in_memory<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> usize {
        let before = self.ids.len();
        self.ids.extend(ids.into_iter().map(str::to_string));
        self.ids.len() - before
    }

    /// Rewrite the index file with exactly one line per known id.
    /// Returns the number of redundant lines removed.
    pub fn compact(&mut self) -> Result<usize> {
        let tmp = crate::common::utils::temp_path(&self.path);
        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            let mut sorted: Vec<&String> = self.ids.iter().collect();
            sorted.sort();
            for id in sorted {
                writeln!(writer, "{}", id)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        crate::common::utils::sync_parent_dir(&self.path)?;

        let removed = self.file_lines.saturating_sub(self.ids.len());
        self.file_lines = self.ids.len();
        Ok(removed)
    }

    /// Number of known ids
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
