//! Persistent term and vote (`election.state`)

use crate::common::{write_atomic, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ELECTION_STATE_FILE: &str = "election.state";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentTerm {
    pub current_term: u64,
    pub voted_for: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Stores term and vote as JSON. Without a directory nothing is persisted.
#[derive(Debug)]
pub struct TermStore {
    path: Option<PathBuf>,
    last_saved: Option<(u64, Option<String>)>,
}

impl TermStore {
    pub fn new(data_dir: Option<&Path>) -> Self {
        Self {
            path: data_dir.map(|dir| dir.join(ELECTION_STATE_FILE)),
            last_saved: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn load(&mut self) -> Result<Option<PersistentTerm>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state: PersistentTerm = serde_json::from_str(&text)?;
        tracing::info!(
            "Loaded election state: term={}, voted_for={:?}",
            state.current_term,
            state.voted_for
        );
        self.last_saved = Some((state.current_term, state.voted_for.clone()));
        Ok(Some(state))
    }

    /// Write the term and vote if they changed since the last save
    pub fn save(&mut self, current_term: u64, voted_for: Option<&str>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let key = (current_term, voted_for.map(str::to_string));
        if self.last_saved.as_ref() == Some(&key) {
            return Ok(());
        }

        let state = PersistentTerm {
            current_term,
            voted_for: key.1.clone(),
            updated_at: Utc::now(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(path, &serde_json::to_vec(&state)?)?;
        self.last_saved = Some(key);
        Ok(())
    }
}
