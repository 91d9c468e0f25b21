//! Replicated ledger store
//!
//! Per-node durable record of payment entries. Entries are kept in memory in
//! sequence order; on disk they are split between the snapshot (committed
//! prefix) and the WAL (everything after it).
//!
//! Layout under the node directory:
//! - `wal.log`          entries not yet moved into the snapshot
//! - `ids.idx`          payment ids, one per line
//! - `commit.idx`       highest committed sequence
//! - `ledger.snapshot`  committed prefix, written on compaction
//!
//! Every entry also carries a chained blake3 digest over the log up to and
//! including it. Two logs with the same digest at a sequence hold the same
//! prefix, which is what a follower checks before following a commit.

use crate::common::utils::write_atomic;
use crate::common::{Error, LedgerConfig, Result};
use crate::ledger::entry::LedgerEntry;
use crate::ledger::index::IdIndex;
use crate::ledger::wal::{read_entries, write_entries_atomic, Wal};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const WAL_FILE: &str = "wal.log";
pub const IDS_FILE: &str = "ids.idx";
pub const COMMIT_FILE: &str = "commit.idx";
pub const SNAPSHOT_FILE: &str = "ledger.snapshot";

/// Ledger shared between the server, router and background tasks
pub type SharedLedger = Arc<Mutex<Ledger>>;

/// A committed sequence together with the log digest at that sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitPoint {
    pub sequence: u64,
    /// Hex-encoded chained digest of entries `0..=sequence`
    pub digest: String,
}

/// Result of applying an entry pushed by the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerAppend {
    /// Written at the requested sequence
    Applied,
    /// Same entry already held at this sequence, or id indexed without a
    /// log entry; nothing written
    Duplicate,
    /// Slot already holds this exact entry but its id was not indexed
    Replayed,
    /// Sequence is past the end of the local log; catch-up needed
    Behind { len: u64 },
}

impl FollowerAppend {
    /// Whether the leader may count this as an acknowledgment
    pub fn is_ack(&self) -> bool {
        !matches!(self, FollowerAppend::Behind { .. })
    }
}

pub struct Ledger {
    dir: PathBuf,
    wal: Wal,
    ids: IdIndex,
    entries: Vec<LedgerEntry>,
    /// Sequence of every payment id held in `entries`
    positions: HashMap<String, u64>,
    digests: Vec<blake3::Hash>,
    snapshot_len: u64,
    commit_index: Option<u64>,
    snapshot_threshold: usize,
}

impl Ledger {
    /// Open (or create) the ledger in `dir`, recovering snapshot, WAL, id
    /// index and commit index.
    pub fn open(dir: impl AsRef<Path>, config: &LedgerConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut entries = read_entries(&dir.join(SNAPSHOT_FILE))?;
        for (i, entry) in entries.iter().enumerate() {
            if entry.sequence != i as u64 {
                return Err(Error::Corrupted(format!(
                    "snapshot gap: expected sequence {}, found {}",
                    i, entry.sequence
                )));
            }
        }
        let snapshot_len = entries.len() as u64;

        let (mut wal, wal_entries) = Wal::open(dir.join(WAL_FILE))?;
        let mut overlap = 0usize;
        for entry in wal_entries {
            let len = entries.len() as u64;
            if entry.sequence < len {
                // Left over from a compaction interrupted before the WAL swap
                if entries[entry.sequence as usize] != entry {
                    return Err(Error::Corrupted(format!(
                        "WAL entry {} disagrees with snapshot",
                        entry.sequence
                    )));
                }
                overlap += 1;
            } else if entry.sequence == len {
                entries.push(entry);
            } else {
                return Err(Error::Corrupted(format!(
                    "WAL gap: expected sequence {}, found {}",
                    len, entry.sequence
                )));
            }
        }

        if overlap > 0 {
            tracing::info!(
                "Finishing interrupted compaction: dropping {} WAL entries already in snapshot",
                overlap
            );
            wal.rewrite(&entries[snapshot_len as usize..])?;
        }

        let commit_index = read_commit_index(&dir.join(COMMIT_FILE))?;
        if let Some(commit) = commit_index {
            if commit >= entries.len() as u64 {
                return Err(Error::Corrupted(format!(
                    "commit index {} beyond log length {}",
                    commit,
                    entries.len()
                )));
            }
        }

        let mut ids = IdIndex::open(dir.join(IDS_FILE))?;
        let restored = ids.extend_in_memory(entries.iter().map(|e| e.payment_id.as_str()));
        if restored > 0 {
            tracing::debug!("Restored {} ids missing from the id index", restored);
        }

        tracing::info!(
            "Ledger opened at {}: {} entries ({} in snapshot), commit index {:?}",
            dir.display(),
            entries.len(),
            snapshot_len,
            commit_index
        );

        let mut ledger = Self {
            dir,
            wal,
            ids,
            entries: Vec::with_capacity(entries.len()),
            positions: HashMap::with_capacity(entries.len()),
            digests: Vec::with_capacity(entries.len()),
            snapshot_len,
            commit_index,
            snapshot_threshold: config.snapshot_threshold,
        };
        for entry in entries {
            ledger.push_entry(entry);
        }
        Ok(ledger)
    }

    /// Open and wrap for sharing
    pub fn open_shared(dir: impl AsRef<Path>, config: &LedgerConfig) -> Result<SharedLedger> {
        Ok(Arc::new(Mutex::new(Self::open(dir, config)?)))
    }

    /// Append a new payment as leader.
    ///
    /// Returns `None` when the payment id is already recorded.
    pub fn append_as_leader(&mut self, payment_id: &str, payload: &str) -> Result<Option<u64>> {
        if self.ids.contains(payment_id) {
            tracing::debug!("Duplicate payment id {}", payment_id);
            return Ok(None);
        }

        let entry = LedgerEntry::new(self.len(), payment_id, payload);
        entry.validate()?;

        self.wal.append(&entry)?;
        let sequence = entry.sequence;
        self.push_entry(entry);
        self.record_id(payment_id)?;

        tracing::debug!("Appended {} at sequence {}", payment_id, sequence);
        Ok(Some(sequence))
    }

    /// Apply an entry pushed by the leader at its original sequence.
    pub fn append_as_follower(
        &mut self,
        sequence: u64,
        payment_id: &str,
        payload: &str,
    ) -> Result<FollowerAppend> {
        let entry = LedgerEntry::new(sequence, payment_id, payload);
        entry.validate()?;

        if let Some(&held) = self.positions.get(payment_id) {
            if held == sequence && self.entries[held as usize] == entry {
                if self.ids.contains(payment_id) {
                    return Ok(FollowerAppend::Duplicate);
                }
                self.record_id(payment_id)?;
                return Ok(FollowerAppend::Replayed);
            }
            let existing = self.entries[held as usize].to_string();
            tracing::error!(
                "Payment {} already held as {:?}, refusing {:?}",
                payment_id,
                existing,
                entry.to_string()
            );
            return Err(Error::SequenceConflict {
                sequence,
                existing,
                incoming: entry.to_string(),
            });
        }
        if self.ids.contains(payment_id) {
            return Ok(FollowerAppend::Duplicate);
        }

        if let Some(existing) = self.entries.get(sequence as usize) {
            tracing::error!(
                "Sequence conflict at {}: holding {:?}, refusing {:?}",
                sequence,
                existing.to_string(),
                entry.to_string()
            );
            return Err(Error::SequenceConflict {
                sequence,
                existing: existing.to_string(),
                incoming: entry.to_string(),
            });
        }

        let len = self.len();
        if sequence > len {
            tracing::debug!("Refusing sequence {}: local log ends at {}", sequence, len);
            return Ok(FollowerAppend::Behind { len });
        }

        self.wal.append(&entry)?;
        self.push_entry(entry);
        self.record_id(payment_id)?;
        Ok(FollowerAppend::Applied)
    }

    fn push_entry(&mut self, entry: LedgerEntry) {
        let digest = chain_digest(self.digests.last(), &entry);
        self.positions
            .insert(entry.payment_id.clone(), entry.sequence);
        self.digests.push(digest);
        self.entries.push(entry);
    }

    fn record_id(&mut self, payment_id: &str) -> Result<()> {
        if let Err(e) = self.ids.insert(payment_id) {
            // The entry itself is durable; keep dedup correct in memory.
            self.ids.extend_in_memory([payment_id]);
            return Err(e);
        }
        Ok(())
    }

    /// Raise the commit index to `sequence`, durably.
    ///
    /// Returns false if the index was already at or past `sequence`.
    pub fn advance_commit_index(&mut self, sequence: u64) -> Result<bool> {
        if matches!(self.commit_index, Some(current) if sequence <= current) {
            return Ok(false);
        }
        if sequence >= self.len() {
            return Err(Error::OutOfRange {
                sequence,
                len: self.len(),
            });
        }

        write_atomic(&self.dir.join(COMMIT_FILE), sequence.to_string().as_bytes())?;
        self.commit_index = Some(sequence);
        tracing::debug!("Commit index advanced to {}", sequence);

        if let Err(e) = self.snapshot_if_needed() {
            tracing::error!("Snapshot after commit {} failed: {}", sequence, e);
        }
        Ok(true)
    }

    /// Follow the leader's commit point.
    ///
    /// Only advances once the local log reaches the leader's committed
    /// sequence and holds the same prefix. A digest mismatch is a
    /// `SequenceConflict` and leaves the commit index untouched.
    pub fn follow_commit(&mut self, leader: &CommitPoint) -> Result<bool> {
        let Some(local) = self.digests.get(leader.sequence as usize) else {
            tracing::debug!(
                "Leader committed {}, local log ends at {}",
                leader.sequence,
                self.len()
            );
            return Ok(false);
        };
        if local.to_hex().as_str() != leader.digest {
            let existing = self.entries[leader.sequence as usize].to_string();
            tracing::error!(
                "Log diverges from leader at or before sequence {} (local entry {:?})",
                leader.sequence,
                existing
            );
            return Err(Error::SequenceConflict {
                sequence: leader.sequence,
                existing,
                incoming: format!("leader digest {}", leader.digest),
            });
        }
        self.advance_commit_index(leader.sequence)
    }

    /// Move the committed prefix into the snapshot once the WAL grows past
    /// the threshold.
    ///
    /// Order: snapshot (temp + rename), then WAL tail (temp + rename). A crash
    /// after the first rename leaves WAL entries that duplicate the snapshot,
    /// which `open` verifies and drops.
    pub fn snapshot_if_needed(&mut self) -> Result<bool> {
        let Some(commit) = self.commit_index else {
            return Ok(false);
        };
        if self.wal.len() <= self.snapshot_threshold || commit < self.snapshot_len {
            return Ok(false);
        }

        let new_snapshot_len = (commit + 1) as usize;
        write_entries_atomic(
            &self.dir.join(SNAPSHOT_FILE),
            &self.entries[..new_snapshot_len],
        )?;
        self.wal.rewrite(&self.entries[new_snapshot_len..])?;
        self.snapshot_len = new_snapshot_len as u64;

        tracing::info!(
            "Snapshot written: {} entries, {} left in WAL",
            self.snapshot_len,
            self.wal.len()
        );
        Ok(true)
    }

    /// Rewrite the id index without repeated lines
    pub fn compact_id_index(&mut self) -> Result<usize> {
        let removed = self.ids.compact()?;
        if removed > 0 {
            tracing::info!("Id index compacted: {} redundant lines removed", removed);
        }
        Ok(removed)
    }

    /// Entries from `index` to the end of the log
    pub fn entries_from(&self, index: u64) -> Vec<LedgerEntry> {
        self.entries
            .get(index as usize..)
            .map(<[LedgerEntry]>::to_vec)
            .unwrap_or_default()
    }

    pub fn entry(&self, sequence: u64) -> Option<&LedgerEntry> {
        self.entries.get(sequence as usize)
    }

    /// Sequence holding `payment_id`, if it is in the log
    pub fn sequence_of(&self, payment_id: &str) -> Option<u64> {
        self.positions.get(payment_id).copied()
    }

    pub fn is_committed(&self, sequence: u64) -> bool {
        matches!(self.commit_index, Some(commit) if sequence <= commit)
    }

    /// Hex digest of the log prefix ending at `sequence`
    pub fn digest_at(&self, sequence: u64) -> Option<String> {
        self.digests
            .get(sequence as usize)
            .map(|digest| digest.to_hex().to_string())
    }

    /// Commit index and its digest, as carried on heartbeats
    pub fn commit_point(&self) -> Option<CommitPoint> {
        let sequence = self.commit_index?;
        Some(CommitPoint {
            sequence,
            digest: self.digest_at(sequence)?,
        })
    }

    /// Has this payment id been recorded?
    pub fn seen(&self, payment_id: &str) -> bool {
        self.ids.contains(payment_id)
    }

    /// Number of entries; also the next sequence to assign
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.len().checked_sub(1)
    }

    pub fn commit_index(&self) -> Option<u64> {
        self.commit_index
    }

    /// Entries held in the WAL file (not yet in the snapshot)
    pub fn wal_len(&self) -> usize {
        self.wal.len()
    }

    pub fn snapshot_len(&self) -> u64 {
        self.snapshot_len
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn chain_digest(previous: Option<&blake3::Hash>, entry: &LedgerEntry) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    if let Some(previous) = previous {
        hasher.update(previous.as_bytes());
    }
    hasher.update(entry.to_string().as_bytes());
    hasher.finalize()
}

fn read_commit_index(path: &Path) -> Result<Option<u64>> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(None);
            }
            text.parse()
                .map(Some)
                .map_err(|_| Error::Corrupted(format!("bad commit index {:?}", text)))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(threshold: usize) -> LedgerConfig {
        LedgerConfig {
            snapshot_threshold: threshold,
            ..Default::default()
        }
    }

    #[test]
    fn test_leader_append_assigns_dense_sequences() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();

        assert_eq!(ledger.append_as_leader("tx1", "100").unwrap(), Some(0));
        assert_eq!(ledger.append_as_leader("tx2", "200").unwrap(), Some(1));
        assert_eq!(ledger.append_as_leader("tx1", "999").unwrap(), None);
        assert_eq!(ledger.len(), 2);
        assert!(ledger.seen("tx1"));
        assert_eq!(ledger.entry(0).unwrap().payload, "100");
    }

    #[test]
    fn test_follower_append_cases() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();

        assert_eq!(
            ledger.append_as_follower(0, "tx1", "100").unwrap(),
            FollowerAppend::Applied
        );
        assert_eq!(
            ledger.append_as_follower(0, "tx1", "100").unwrap(),
            FollowerAppend::Duplicate
        );
        assert_eq!(
            ledger.append_as_follower(5, "tx5", "500").unwrap(),
            FollowerAppend::Behind { len: 1 }
        );
        assert!(!ledger.seen("tx5"));
        // Same id at another sequence is a conflict, not a duplicate
        let err = ledger.append_as_follower(1, "tx1", "100").unwrap_err();
        assert!(matches!(err, Error::SequenceConflict { sequence: 1, .. }));
        assert_eq!(ledger.len(), 1);

        let err = ledger.append_as_follower(0, "tx9", "900").unwrap_err();
        assert!(matches!(err, Error::SequenceConflict { sequence: 0, .. }));
        assert_eq!(ledger.entry(0).unwrap().payment_id, "tx1");
    }

    #[test]
    fn test_commit_index_is_monotonic_and_durable() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
            for i in 0..4 {
                ledger.append_as_leader(&format!("tx{i}"), "1").unwrap();
            }
            assert!(ledger.advance_commit_index(2).unwrap());
            assert!(!ledger.advance_commit_index(1).unwrap());
            assert!(!ledger.advance_commit_index(2).unwrap());
            assert!(matches!(
                ledger.advance_commit_index(4),
                Err(Error::OutOfRange { sequence: 4, len: 4 })
            ));
            assert_eq!(ledger.commit_index(), Some(2));
        }

        let ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        assert_eq!(ledger.commit_index(), Some(2));
        assert_eq!(ledger.len(), 4);
    }

    fn leader_with(dir: &Path, ids: &[&str], commit: u64) -> Ledger {
        let mut leader = Ledger::open(dir, &config(100)).unwrap();
        for id in ids {
            leader.append_as_leader(id, "1").unwrap();
        }
        leader.advance_commit_index(commit).unwrap();
        leader
    }

    #[test]
    fn test_follow_commit_waits_for_local_log() {
        let leader_dir = tempdir().unwrap();
        let leader = leader_with(leader_dir.path(), &["tx0", "tx1", "tx2"], 2);
        let point = leader.commit_point().unwrap();
        assert_eq!(point.sequence, 2);

        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        assert!(!ledger.follow_commit(&point).unwrap());

        ledger.append_as_follower(0, "tx0", "1").unwrap();
        ledger.append_as_follower(1, "tx1", "1").unwrap();
        assert!(!ledger.follow_commit(&point).unwrap());
        assert_eq!(ledger.commit_index(), None);

        ledger.append_as_follower(2, "tx2", "1").unwrap();
        assert!(ledger.follow_commit(&point).unwrap());
        assert_eq!(ledger.commit_index(), Some(2));
        assert_eq!(ledger.digest_at(2), leader.digest_at(2));
    }

    #[test]
    fn test_follow_commit_refuses_divergent_prefix() {
        let leader_dir = tempdir().unwrap();
        let leader = leader_with(leader_dir.path(), &["tx-b", "tx-c"], 1);

        // Same id at the committed sequence, different entry before it
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        ledger.append_as_leader("tx-a", "1").unwrap();
        ledger.append_as_follower(1, "tx-c", "1").unwrap();

        let err = ledger.follow_commit(&leader.commit_point().unwrap()).unwrap_err();
        assert!(err.is_integrity_violation());
        assert_eq!(ledger.commit_index(), None);
        assert_eq!(ledger.entry(0).unwrap().payment_id, "tx-a");
    }

    #[test]
    fn test_sequence_lookup_and_commit_state() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
            ledger.append_as_leader("tx0", "1").unwrap();
            ledger.append_as_leader("tx1", "1").unwrap();
            ledger.advance_commit_index(0).unwrap();

            assert_eq!(ledger.sequence_of("tx1"), Some(1));
            assert_eq!(ledger.sequence_of("nope"), None);
            assert!(ledger.is_committed(0));
            assert!(!ledger.is_committed(1));
        }

        let ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        assert_eq!(ledger.sequence_of("tx1"), Some(1));
        assert_eq!(ledger.commit_point().unwrap().sequence, 0);
    }

    #[test]
    fn test_snapshot_moves_committed_prefix() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), &config(5)).unwrap();
            for i in 0..8 {
                ledger.append_as_leader(&format!("tx{i}"), "10").unwrap();
            }
            ledger.advance_commit_index(5).unwrap();

            assert_eq!(ledger.snapshot_len(), 6);
            assert_eq!(ledger.wal_len(), 2);
            assert_eq!(ledger.entries_from(0).len(), 8);
        }

        let snapshot = read_entries(&dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert_eq!(snapshot.len(), 6);
        let wal = read_entries(&dir.path().join(WAL_FILE)).unwrap();
        assert_eq!(wal[0].sequence, 6);

        let mut ledger = Ledger::open(dir.path(), &config(5)).unwrap();
        assert_eq!(ledger.len(), 8);
        assert!(ledger.seen("tx0"));
        assert_eq!(ledger.append_as_leader("tx8", "10").unwrap(), Some(8));
    }

    #[test]
    fn test_snapshot_waits_for_commit() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), &config(2)).unwrap();
        for i in 0..5 {
            ledger.append_as_leader(&format!("tx{i}"), "10").unwrap();
        }
        assert!(!ledger.snapshot_if_needed().unwrap());
        assert_eq!(ledger.wal_len(), 5);
    }

    #[test]
    fn test_crash_between_snapshot_and_wal_swap() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
            for i in 0..6 {
                ledger.append_as_leader(&format!("tx{i}"), "10").unwrap();
            }
            ledger.advance_commit_index(3).unwrap();
        }

        // Snapshot landed but the WAL still holds every entry
        let all = read_entries(&dir.path().join(WAL_FILE)).unwrap();
        write_entries_atomic(&dir.path().join(SNAPSHOT_FILE), &all[..4]).unwrap();

        let ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        assert_eq!(ledger.len(), 6);
        assert_eq!(ledger.snapshot_len(), 4);
        assert_eq!(ledger.wal_len(), 2);
        assert_eq!(ledger.commit_index(), Some(3));
        assert_eq!(ledger.entries_from(0), all);
    }

    #[test]
    fn test_ids_recovered_from_wal_when_index_lost() {
        let dir = tempdir().unwrap();
        {
            let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
            ledger.append_as_leader("tx1", "10").unwrap();
        }
        fs::remove_file(dir.path().join(IDS_FILE)).unwrap();

        let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        assert!(ledger.seen("tx1"));
        assert_eq!(ledger.append_as_leader("tx1", "10").unwrap(), None);

        ledger.compact_id_index().unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join(IDS_FILE)).unwrap(),
            "tx1\n"
        );
    }

    #[test]
    fn test_entries_from_past_end_is_empty() {
        let dir = tempdir().unwrap();
        let mut ledger = Ledger::open(dir.path(), &config(100)).unwrap();
        ledger.append_as_leader("tx1", "10").unwrap();
        assert!(ledger.entries_from(1).is_empty());
        assert!(ledger.entries_from(7).is_empty());
        assert_eq!(ledger.entries_from(0).len(), 1);
    }
}
