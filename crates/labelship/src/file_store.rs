//! Directory-backed store shared by several worker processes.
//!
//! The tables live in one JSON snapshot (`store.json`). Writers take the
//! directory lock from `labelship-lock`, reload the snapshot, apply their
//! transaction and replace the file atomically. Readers never lock: they
//! always see a complete snapshot because replacement is a rename.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use labelship_lock::StoreLock;

use crate::store::{StoreError, TableBackend, Tables};

/// Snapshot file name inside the store directory.
pub const SNAPSHOT_FILE: &str = "store.json";

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    lock_wait: Duration,
    lock_stale_after: Duration,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_wait: Duration::from_secs(30),
            lock_stale_after: Duration::from_secs(120),
        }
    }

    /// How long writers queue for the directory lock, and when an abandoned
    /// lock may be taken over.
    pub fn with_lock_timing(mut self, wait: Duration, stale_after: Duration) -> Self {
        self.lock_wait = wait;
        self.lock_stale_after = stale_after;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn load(&self) -> Result<Tables> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(Tables::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read store snapshot {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse store snapshot {}", path.display()))
    }

    fn save(&self, tables: &Tables) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create store dir {}", self.dir.display()))?;
        atomic_write_json(&self.snapshot_path(), tables)
    }
}

impl TableBackend for FileStore {
    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        let tables = self.load().map_err(StoreError::Backend)?;
        Ok(f(&tables))
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create store dir {}", self.dir.display()))
            .map_err(StoreError::Backend)?;
        let _lock = StoreLock::acquire_waiting(
            &self.dir,
            self.lock_wait,
            self.lock_stale_after,
            Some("store write"),
        )
        .map_err(StoreError::Backend)?;

        let mut tables = self.load().map_err(StoreError::Backend)?;
        let out = f(&mut tables)?;
        self.save(&tables).map_err(StoreError::Backend)?;
        Ok(out)
    }
}

/// Best-effort fsync of the parent directory so the rename survives a crash.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = fs::File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

pub(crate) fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create tmp file {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("failed to write tmp file {}", tmp.display()))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).with_context(|| {
        format!(
            "failed to rename tmp file {} to {}",
            tmp.display(),
            path.display()
        )
    })?;

    fsync_parent_dir(path);
    Ok(())
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("failed to serialize store snapshot")?;
    atomic_write_bytes(path, &data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LabelStore, PurchaseCommit};
    use chrono::Utc;
    use labelship_types::{Order, Shipment, ShipmentLabelStatus, VoidStatus};
    use tempfile::tempdir;

    fn shipment(order_id: u64, tracking: &str) -> Shipment {
        Shipment {
            id: 0,
            order_id,
            source: "alpha".into(),
            tracking_number: tracking.into(),
            carrier: "ups".into(),
            service: "ground".into(),
            label_id: tracking.into(),
            label_url: format!("https://labels.example/{tracking}.pdf"),
            label_status: ShipmentLabelStatus::Active,
            void_status: VoidStatus::Active,
            cost: 4.0,
            currency: "USD".into(),
            created_by: "tester".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn missing_snapshot_reads_as_empty() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path().join("store"));
        assert!(store.list_orders().expect("list").is_empty());
        assert!(!store.snapshot_path().exists());
    }

    #[test]
    fn writes_persist_across_instances() {
        let td = tempdir().expect("tempdir");
        let dir = td.path().join("store");
        FileStore::new(&dir)
            .upsert_order(Order::new(5, "shopify", "S-5"))
            .expect("upsert");

        let reopened = FileStore::new(&dir);
        let order = reopened.get_order(5).expect("get").expect("order");
        assert_eq!(order.marketplace_order_id, "S-5");
        assert!(!labelship_lock::StoreLock::is_locked(&dir));
        assert!(!dir.join("store.tmp").exists());
    }

    #[test]
    fn failed_transaction_is_not_persisted() {
        let td = tempdir().expect("tempdir");
        let store = FileStore::new(td.path());
        store.upsert_order(Order::new(1, "ebay", "E-1")).expect("upsert");

        let err = store.record_failure(2).unwrap_err();
        assert!(matches!(err, StoreError::OrderNotFound(2)));

        let res = store.write(|t| {
            t.orders.clear();
            Err::<(), _>(StoreError::Poisoned)
        });
        assert!(res.is_err());
        assert!(store.get_order(1).expect("get").is_some());
    }

    #[test]
    fn duplicate_purchase_detected_through_snapshot() {
        let td = tempdir().expect("tempdir");
        let a = FileStore::new(td.path());
        let b = FileStore::new(td.path());
        a.upsert_order(Order::new(1, "ebay", "E-1")).expect("upsert");

        assert!(matches!(
            a.record_purchase(shipment(1, "T-A")).expect("purchase"),
            PurchaseCommit::Committed(_)
        ));
        assert!(matches!(
            b.record_purchase(shipment(1, "T-B")).expect("purchase"),
            PurchaseCommit::AlreadyLabeled(_)
        ));
    }

    #[test]
    fn reimport_through_another_instance_keeps_lease() {
        let td = tempdir().expect("tempdir");
        let importer = FileStore::new(td.path());
        let worker = FileStore::new(td.path());
        importer.upsert_order(Order::new(1, "ebay", "E-1")).expect("upsert");

        let mut incoming = importer.get_order(1).expect("get").expect("order");
        worker
            .try_acquire_leases(&[1], "worker-b", Utc::now())
            .expect("acquire");
        incoming.marketplace_order_id = "E-1-R".into();
        assert!(importer.refresh_order(incoming).expect("refresh"));

        let order = worker.get_order(1).expect("get").expect("order");
        assert!(order.locked);
        assert_eq!(order.lock_holder.as_deref(), Some("worker-b"));
        assert_eq!(order.marketplace_order_id, "E-1-R");
    }

    #[test]
    fn corrupt_snapshot_is_a_backend_error() {
        let td = tempdir().expect("tempdir");
        fs::write(td.path().join(SNAPSHOT_FILE), "{not json").expect("write");
        let store = FileStore::new(td.path());
        assert!(matches!(store.list_orders(), Err(StoreError::Backend(_))));
    }
}
