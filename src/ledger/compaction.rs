//! Background id-index compaction

use crate::ledger::store::SharedLedger;
use std::sync::PoisonError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Periodically rewrites the id index of a ledger without repeated lines
pub struct CompactionManager {
    ledger: SharedLedger,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl CompactionManager {
    pub fn new(ledger: SharedLedger, interval_secs: u64, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ledger,
            interval: Duration::from_secs(interval_secs.max(1)),
            shutdown,
        }
    }

    /// Run one pass. Errors are logged, never fatal.
    pub fn run_once(&self) -> usize {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        match ledger.compact_id_index() {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!("Id index compaction failed: {}", e);
                0
            }
        }
    }

    pub fn start(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                    changed = self.shutdown.changed() => {
                        if changed.is_err() || *self.shutdown.borrow() {
                            tracing::debug!("Compaction task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::LedgerConfig;
    use crate::ledger::store::{Ledger, IDS_FILE};
    use tempfile::tempdir;

    #[test]
    fn test_run_once_dedups_index_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(IDS_FILE), "tx1\ntx1\ntx1\n").unwrap();
        let ledger = Ledger::open_shared(dir.path(), &LedgerConfig::default()).unwrap();

        let (_tx, rx) = watch::channel(false);
        let manager = CompactionManager::new(ledger, 60, rx);
        assert_eq!(manager.run_once(), 2);
        assert_eq!(manager.run_once(), 0);
    }

    #[test]
    fn test_run_once_survives_poisoned_lock() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(IDS_FILE), "tx1\ntx1\n").unwrap();
        let ledger = Ledger::open_shared(dir.path(), &LedgerConfig::default()).unwrap();

        let held = ledger.clone();
        let _ = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            panic!("writer died holding the ledger");
        })
        .join();
        assert!(ledger.is_poisoned());

        let (_tx, rx) = watch::channel(false);
        let manager = CompactionManager::new(ledger, 60, rx);
        assert_eq!(manager.run_once(), 1);
    }

    #[tokio::test]
    async fn test_task_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::open_shared(dir.path(), &LedgerConfig::default()).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = CompactionManager::new(ledger, 60, rx).start();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
