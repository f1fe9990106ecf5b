use super::PersistentStore;
use crate::{
    error::{AppResult, ErrorReason},
    types::BoundCertRecord,
};
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

const FORMAT_VERSION: u32 = 1;

#[derive(Deserialize)]
struct StoredCerts {
    version: u32,
    #[serde(default)]
    certs: Vec<BoundCertRecord>,
}

#[derive(Serialize)]
struct StoredCertsRef<'a> {
    version: u32,
    certs: Vec<&'a BoundCertRecord>,
}

/// Persists bound certificates as a single JSON document.
///
/// Every `add` and `delete` rewrites the whole file through a temporary file
/// and a rename, so a crash leaves either the old or the new document. The
/// writes use blocking `std::fs` calls on the caller's thread.
///
/// Writes are refused until `load` has read the file successfully, so a
/// document this store cannot parse is never replaced.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    session_only: bool,
    force_keep_session_state: AtomicBool,
    loaded: Arc<AtomicBool>,
    records: Arc<Mutex<BTreeMap<String, BoundCertRecord>>>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            session_only: false,
            force_keep_session_state: AtomicBool::new(false),
            loaded: Default::default(),
            records: Default::default(),
        }
    }

    /// Remove the file when the store is dropped, unless
    /// [`PersistentStore::set_force_keep_session_state`] was called.
    pub fn session_only(mut self, session_only: bool) -> Self {
        self.session_only = session_only;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, records: &BTreeMap<String, BoundCertRecord>) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let document = StoredCertsRef {
            version: FORMAT_VERSION,
            certs: records.values().collect(),
        };
        let data = serde_json::to_vec_pretty(&document)?;

        let mut tmp_path = self.path.clone().into_os_string();
        tmp_path.push(".tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, &self.path)?;

        trace!(
            "Wrote {} bound certificates to {}",
            records.len(),
            self.path.display()
        );
        Ok(())
    }

    fn update<F>(&self, mutate: F) -> AppResult<()>
    where
        F: FnOnce(&mut BTreeMap<String, BoundCertRecord>),
    {
        if !self.loaded.load(Ordering::Acquire) {
            return Err(ErrorReason::NotLoaded(self.path.clone()).into());
        }

        let mut records = self
            .records
            .lock()
            .map_err(|_| ErrorReason::LockPoisoned)?;
        mutate(&mut records);
        self.persist(&records)
    }
}

impl PersistentStore for JsonFileStore {
    fn load(&self) -> BoxFuture<'static, AppResult<Vec<BoundCertRecord>>> {
        let path = self.path.clone();
        let mirror = self.records.clone();
        let loaded = self.loaded.clone();

        async move {
            let result = read_store(path, mirror).await;
            if result.is_ok() {
                loaded.store(true, Ordering::Release);
            }
            result
        }
        .boxed()
    }

    fn add(&self, record: &BoundCertRecord) -> AppResult<()> {
        self.update(|records| {
            records.insert(record.server_identifier.clone(), record.clone());
        })
    }

    fn delete(&self, record: &BoundCertRecord) -> AppResult<()> {
        self.update(|records| {
            records.remove(&record.server_identifier);
        })
    }

    fn set_force_keep_session_state(&self) {
        self.force_keep_session_state.store(true, Ordering::Relaxed);
    }
}

async fn read_store(
    path: PathBuf,
    mirror: Arc<Mutex<BTreeMap<String, BoundCertRecord>>>,
) -> AppResult<Vec<BoundCertRecord>> {
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No certificate store at {}, starting empty", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let stored: StoredCerts = serde_json::from_slice(&data)?;
    if stored.version != FORMAT_VERSION {
        return Err(ErrorReason::UnsupportedVersion(stored.version).into());
    }

    let mut records = mirror.lock().map_err(|_| ErrorReason::LockPoisoned)?;
    for record in &stored.certs {
        records.insert(record.server_identifier.clone(), record.clone());
    }
    drop(records);

    Ok(stored.certs)
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if !self.session_only || self.force_keep_session_state.load(Ordering::Relaxed) {
            return;
        }

        match fs::remove_file(&self.path) {
            Ok(()) => info!("Removed session-only store {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!(
                "Failed to remove session-only store {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        configs::StoreConfig,
        store::{BoundCertStore, CertLookup},
    };
    use chrono::{TimeZone, Utc};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
        std::env::temp_dir().join(format!(
            "{prefix}-{}-{}",
            std::process::id(),
            now.as_nanos()
        ))
    }

    fn record(server: &str, created: i64) -> BoundCertRecord {
        BoundCertRecord::new(
            server,
            Utc.timestamp_opt(created, 0).unwrap(),
            Utc.timestamp_opt(created + 3600, 0).unwrap(),
            format!("key-{server}"),
            format!("cert-{server}"),
        )
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let dir = unique_temp_dir("bcs-missing");
        let store = JsonFileStore::new(dir.join("certs.json"));

        assert!(store.load().await.unwrap().is_empty());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn records_survive_reopening() {
        let dir = unique_temp_dir("bcs-reopen");
        let path = dir.join("certs.json");

        let store = JsonFileStore::new(&path);
        store.load().await.unwrap();
        store.add(&record("a.com", 10)).unwrap();
        store.add(&record("b.com", 20)).unwrap();
        store.delete(&record("a.com", 10)).unwrap();
        drop(store);

        let reopened = JsonFileStore::new(&path);
        let loaded = reopened.load().await.unwrap();
        assert_eq!(loaded, vec![record("b.com", 20)]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn rejects_unknown_versions() {
        let dir = unique_temp_dir("bcs-version");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("certs.json");
        fs::write(&path, br#"{"version": 7, "certs": []}"#).unwrap();

        let err = JsonFileStore::new(&path).load().await.unwrap_err();
        assert!(matches!(err.reason(), ErrorReason::UnsupportedVersion(7)));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn session_only_store_is_removed_on_drop() {
        let dir = unique_temp_dir("bcs-session");
        let path = dir.join("certs.json");

        let store = JsonFileStore::new(&path).session_only(true);
        store.load().await.unwrap();
        store.add(&record("a.com", 10)).unwrap();
        assert!(path.exists());
        drop(store);
        assert!(!path.exists());

        let store = JsonFileStore::new(&path).session_only(true);
        store.load().await.unwrap();
        store.add(&record("a.com", 10)).unwrap();
        store.set_force_keep_session_state();
        drop(store);
        assert!(path.exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn writes_wait_for_a_successful_load() {
        let dir = unique_temp_dir("bcs-unloaded");
        let path = dir.join("certs.json");

        let store = JsonFileStore::new(&path);
        let err = store.add(&record("a.com", 10)).unwrap_err();
        assert!(matches!(err.reason(), ErrorReason::NotLoaded(_)));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unreadable_file_is_never_overwritten() {
        let dir = unique_temp_dir("bcs-unreadable");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("certs.json");
        let original = br#"{"version": 2, "certs": [{"server_identifier": "keep.com"}]}"#;
        fs::write(&path, original).unwrap();

        let mut store = BoundCertStore::with_backing_store(
            Arc::new(JsonFileStore::new(&path)),
            StoreConfig::default(),
        );
        store.wait_for_load().await;
        store.set_record(record("new.com", 10));
        store.delete("new.com").await.unwrap();

        assert_eq!(store.get_count(), 0);
        assert_eq!(fs::read(&path).unwrap(), original.to_vec());

        drop(store);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn bound_cert_store_round_trips_through_the_file() {
        let dir = unique_temp_dir("bcs-end-to-end");
        let path = dir.join("certs.json");

        let seed = JsonFileStore::new(&path);
        seed.load().await.unwrap();
        seed.add(&record("a.com", 10)).unwrap();
        seed.add(&record("b.com", 20)).unwrap();
        drop(seed);

        let mut store = BoundCertStore::with_backing_store(
            Arc::new(JsonFileStore::new(&path)),
            StoreConfig::default(),
        );
        assert_eq!(store.get_count(), 0);
        store.wait_for_load().await;
        assert_eq!(store.get_count(), 2);
        match store.get("a.com") {
            CertLookup::Found(found) => assert_eq!(found, record("a.com", 10)),
            other => panic!("expected a.com to be loaded, got {:?}", other),
        }

        store.set_record(record("c.com", 30));
        store
            .delete_all_created_between(
                Some(Utc.timestamp_opt(15, 0).unwrap()),
                Some(Utc.timestamp_opt(25, 0).unwrap()),
            )
            .await
            .unwrap();
        drop(store);

        let mut loaded = JsonFileStore::new(&path).load().await.unwrap();
        loaded.sort_by(|a, b| a.server_identifier.cmp(&b.server_identifier));
        assert_eq!(loaded, vec![record("a.com", 10), record("c.com", 30)]);

        fs::remove_dir_all(&dir).unwrap();
    }
}
