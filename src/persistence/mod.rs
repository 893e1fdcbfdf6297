//! Order snapshot persistence.
//!
//! On normal shutdown the three order maps are serialized to a per-task
//! file; the next startup of the same task id reloads and deletes it.
//! This is the sole durability mechanism for in-flight orders across
//! process restarts.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::Result;
use crate::ledger::OrderSnapshot;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.path(task_id).is_file()
    }

    pub fn save(&self, task_id: &str, snapshot: &OrderSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(task_id);
        fs::write(&path, serde_json::to_vec(snapshot)?)?;
        debug!(task_id, path = %path.display(), "order snapshot saved");
        Ok(())
    }

    pub fn load(&self, task_id: &str) -> Result<Option<OrderSnapshot>> {
        let path = self.path(task_id);
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Load the snapshot for a resumed task and delete the file, so a
    /// crash after this point cannot replay stale orders.
    pub fn take(&self, task_id: &str) -> Result<Option<OrderSnapshot>> {
        let snapshot = self.load(task_id)?;
        if snapshot.is_some() {
            if let Err(e) = fs::remove_file(self.path(task_id)) {
                warn!(task_id, error = %e, "could not delete order snapshot");
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    fn temp_store() -> SnapshotStore {
        let n = SEQ.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "slicer-snap-{}-{}",
            std::process::id(),
            n
        ));
        SnapshotStore::new(dir)
    }

    #[test]
    fn save_take_round_trip() {
        let store = temp_store();
        let task_id = "TWAP_Binance_BTCUSDT_20190725152929";
        assert!(store.load(task_id).unwrap().is_none());

        let snapshot = OrderSnapshot::default();
        store.save(task_id, &snapshot).unwrap();
        assert!(store.exists(task_id));

        let loaded = store.take(task_id).unwrap();
        assert!(loaded.is_some());
        // the file is consumed by take()
        assert!(!store.exists(task_id));
        assert!(store.take(task_id).unwrap().is_none());
    }
}
