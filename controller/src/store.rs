use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use heating_common::{
    Admission, BreakerConfig, PersistenceDocument, RelayRecord, ValidationError, Zone, ZoneId,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{} is not a valid persistence document: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode persistence document: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Rejected(#[from] ValidationError),
}

/// JSON-file backed zone store. Every read and write goes through one gate,
/// so whole-document read-modify-write cycles never interleave.
#[derive(Debug, Clone)]
pub struct ZoneStore {
    path: Arc<PathBuf>,
    gate: Arc<Mutex<()>>,
}

impl ZoneStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the whole document once. A corrupt document is logged and
    /// yields no zones rather than failing the caller.
    pub async fn load_all(&self) -> Result<LoadedZones, StoreError> {
        let _guard = self.gate.lock().await;
        match self.read_document().await {
            Ok(document) => Ok(LoadedZones { document }),
            Err(StoreError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "persistence document is corrupt; no zones this cycle");
                Ok(LoadedZones::default())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn get(&self, id: &ZoneId) -> Result<Option<Zone>, StoreError> {
        let _guard = self.gate.lock().await;
        let document = self.read_document().await?;
        find_zone(&document, id)
    }

    /// Replaces the stored record for the zone's id, keeping every other
    /// record as it was on disk.
    pub async fn save(&self, zone: &Zone) -> Result<(), StoreError> {
        let _guard = self.gate.lock().await;
        let mut document = self.read_document().await?;
        document.upsert(&zone.to_record())?;
        self.write_document(&document).await?;
        debug!(zone = %zone.id(), "zone saved");
        Ok(())
    }

    /// Loads one zone, applies `update` and saves it if anything changed,
    /// all under a single hold of the gate. `Ok(None)` when the id is unknown.
    pub async fn modify<F>(&self, id: &ZoneId, update: F) -> Result<Option<Zone>, StoreError>
    where
        F: FnOnce(&mut Zone) -> Result<(), ValidationError>,
    {
        let _guard = self.gate.lock().await;
        let mut document = self.read_document().await?;
        let Some(mut zone) = find_zone(&document, id)? else {
            return Ok(None);
        };

        update(&mut zone)?;
        if zone.is_dirty() {
            document.upsert(&zone.to_record())?;
            self.write_document(&document).await?;
            zone.mark_clean();
            debug!(zone = %id, "zone updated");
        }
        Ok(Some(zone))
    }

    /// Like [`ZoneStore::modify`], but an unknown id, or one whose stored
    /// record no longer validates, is first built with `create`. The flag is
    /// true when the zone was created.
    pub async fn configure<C, F>(
        &self,
        id: &ZoneId,
        create: C,
        update: F,
    ) -> Result<(Zone, bool), StoreError>
    where
        C: FnOnce() -> Result<Zone, ValidationError>,
        F: FnOnce(&mut Zone) -> Result<(), ValidationError>,
    {
        let _guard = self.gate.lock().await;
        let mut document = self.read_document().await?;
        let (mut zone, created) = match find_zone(&document, id) {
            Ok(Some(zone)) => (zone, false),
            Ok(None) => (create()?, true),
            Err(StoreError::Rejected(err)) => {
                warn!(zone = %id, error = %err, "replacing invalid zone record");
                (create()?, true)
            }
            Err(err) => return Err(err),
        };

        update(&mut zone)?;
        if created || zone.is_dirty() {
            document.upsert(&zone.to_record())?;
            self.write_document(&document).await?;
            zone.mark_clean();
            info!(zone = %id, created, "zone configured");
        }
        Ok((zone, created))
    }

    async fn read_document(&self) -> Result<PersistenceDocument, StoreError> {
        let path = self.path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => PersistenceDocument::parse(&text).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(PersistenceDocument::default()),
            Err(source) => Err(StoreError::Read {
                path: path.clone(),
                source,
            }),
        }
    }

    /// Writes to a sibling file and renames it into place, so readers only
    /// ever observe a complete document.
    async fn write_document(&self, document: &PersistenceDocument) -> Result<(), StoreError> {
        let path = self.path.as_ref();
        let write_error = |source| StoreError::Write {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
        }

        let payload = document.to_pretty_string()?;
        let staging = staging_path(path);
        tokio::fs::write(&staging, payload).await.map_err(write_error)?;
        tokio::fs::rename(&staging, path).await.map_err(write_error)?;
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| "persistence.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn find_zone(document: &PersistenceDocument, id: &ZoneId) -> Result<Option<Zone>, StoreError> {
    let Some(index) = document
        .systems
        .iter()
        .position(|raw| raw.get("system_id").is_some_and(|value| id.matches_json(value)))
    else {
        return Ok(None);
    };

    let zone = document
        .record(index)
        .transpose()?
        .map(Zone::from_record)
        .transpose()?;
    Ok(zone)
}

/// The zones of one full document read. Iterating is lazy and can be
/// repeated; records that fail validation are logged and skipped.
#[derive(Debug, Clone, Default)]
pub struct LoadedZones {
    document: PersistenceDocument,
}

impl LoadedZones {
    pub fn len(&self) -> usize {
        self.document.len()
    }

    pub fn is_empty(&self) -> bool {
        self.document.is_empty()
    }

    /// Relays of every record, valid or not.
    pub fn relays(&self) -> impl Iterator<Item = RelayRecord> + '_ {
        self.document.relays()
    }

    pub fn zones(&self) -> impl Iterator<Item = Zone> + '_ {
        self.document.records().enumerate().filter_map(|(index, record)| {
            match record.and_then(Zone::from_record) {
                Ok(zone) => Some(zone),
                Err(err) => {
                    warn!(index, kind = err.kind(), error = %err, "skipping invalid zone record");
                    None
                }
            }
        })
    }

    /// Zones allowed to run at `now`. Zones whose breaker cooldown has
    /// elapsed come back reset and dirty so the re-admission is persisted.
    pub fn admitted<'a>(
        &'a self,
        now: DateTime<Utc>,
        breaker: &'a BreakerConfig,
    ) -> impl Iterator<Item = Zone> + 'a {
        self.zones().filter_map(move |mut zone| match zone.admission(now, breaker) {
            Admission::Active => Some(zone),
            Admission::Readmitted => {
                info!(zone = %zone.id(), "cooldown elapsed; zone re-enabled");
                Some(zone)
            }
            Admission::CoolingDown { remaining } => {
                debug!(zone = %zone.id(), remaining_secs = remaining.as_secs(), "zone disabled; skipping");
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use heating_common::{RelayNode, SensorNode};
    use pretty_assertions::assert_eq;

    fn zone(id: &str) -> Zone {
        Zone::new(
            ZoneId::new(id),
            SensorNode::new(format!("http://sensor-{id}")),
            RelayNode::new(
                format!("http://relay-{id}/off?pin=1"),
                format!("http://relay-{id}/on?pin=1"),
                format!("http://relay-{id}/status?pin=1"),
            ),
        )
        .unwrap()
    }

    fn store(dir: &tempfile::TempDir) -> ZoneStore {
        ZoneStore::new(dir.path().join("persistence.json"))
    }

    fn ids(loaded: &LoadedZones) -> Vec<String> {
        loaded.zones().map(|zone| zone.id().to_string()).collect()
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(&dir).load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_yields_no_zones_but_blocks_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        tokio::fs::write(store.path(), "{ not json").await.unwrap();

        assert!(store.load_all().await.unwrap().is_empty());
        assert!(matches!(
            store.save(&zone("a")).await,
            Err(StoreError::Corrupt { .. })
        ));
        assert_eq!(
            tokio::fs::read_to_string(store.path()).await.unwrap(),
            "{ not json"
        );
    }

    #[tokio::test]
    async fn save_replaces_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let mut first = zone("a");
        store.save(&first).await.unwrap();
        store.save(&zone("b")).await.unwrap();
        first.set_program(true);
        store.save(&first).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(ids(&loaded), vec!["b", "a"]);
        assert!(store.get(&ZoneId::new("a")).await.unwrap().unwrap().program());
    }

    #[tokio::test]
    async fn concurrent_saves_for_different_zones_both_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let saves: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move { store.save(&zone(&n.to_string())).await })
            })
            .collect();
        for save in saves {
            save.await.unwrap().unwrap();
        }

        let mut saved = ids(&store.load_all().await.unwrap());
        saved.sort();
        assert_eq!(saved, vec!["0", "1", "2", "3", "4", "5", "6", "7"]);
    }

    #[tokio::test]
    async fn invalid_record_is_skipped_and_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        tokio::fs::write(
            store.path(),
            r#"{"systems": [{"system_id": 4, "sensor": {"url": ""}}]}"#,
        )
        .await
        .unwrap();

        store.save(&zone("a")).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(ids(&loaded), vec!["a"]);
    }

    #[tokio::test]
    async fn modify_saves_only_when_changed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(&zone("a")).await.unwrap();
        let before = tokio::fs::metadata(store.path()).await.unwrap().modified().unwrap();

        let unchanged = store
            .modify(&ZoneId::new("a"), |zone| {
                zone.set_program(false);
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert!(!unchanged.is_dirty());
        let after = tokio::fs::metadata(store.path()).await.unwrap().modified().unwrap();
        assert_eq!(before, after);

        let updated = store
            .modify(&ZoneId::new("a"), |zone| {
                zone.set_program(true);
                Ok(())
            })
            .await
            .unwrap()
            .unwrap();
        assert!(updated.program());
        assert!(store.get(&ZoneId::new("a")).await.unwrap().unwrap().program());

        assert!(store
            .modify(&ZoneId::new("missing"), |_| Ok(()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn configure_creates_then_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let id = ZoneId::new("a");

        let (created, is_new) = store
            .configure(&id, || Ok(zone("a")), |_| Ok(()))
            .await
            .unwrap();
        assert!(is_new);
        assert!(!created.program());

        let (updated, is_new) = store
            .configure(&id, || Ok(zone("a")), |zone| {
                zone.set_program(true);
                zone.set_sensor(SensorNode::new("http://sensor-new"))?;
                Ok(())
            })
            .await
            .unwrap();
        assert!(!is_new);
        assert!(updated.program());

        let stored = store.get(&id).await.unwrap().unwrap();
        assert_eq!(stored.sensor().url, "http://sensor-new");
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn configure_rejects_invalid_update_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.save(&zone("a")).await.unwrap();

        let result = store
            .configure(&ZoneId::new("a"), || Ok(zone("a")), |zone| {
                zone.set_sensor(SensorNode::new(" ")).map(|_| ())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Rejected(_))));
        let stored = store.get(&ZoneId::new("a")).await.unwrap().unwrap();
        assert_eq!(stored.sensor().url, "http://sensor-a");
    }

    #[tokio::test]
    async fn disabled_zone_is_held_back_until_cooldown() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let breaker = BreakerConfig::default();
        let tripped_at = Utc.timestamp_opt(1_767_600_000, 0).unwrap();

        let mut disabled = zone("a");
        for _ in 0..breaker.max_errors {
            disabled.record_sensor_failure(tripped_at, &breaker);
        }
        store.save(&disabled).await.unwrap();
        store.save(&zone("b")).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        let during: Vec<_> = loaded
            .admitted(tripped_at + chrono::Duration::minutes(5), &breaker)
            .map(|zone| zone.id().to_string())
            .collect();
        assert_eq!(during, vec!["b"]);

        let after: Vec<_> = loaded
            .admitted(tripped_at + chrono::Duration::minutes(15), &breaker)
            .collect();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].breaker().error_count, 0);
        assert!(after[0].is_dirty());
    }
}
