use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::config::MonitorConfig;
use crate::error::StorageError;
use crate::recovery::BackoffPolicy;
use crate::types::ClassifiedEvent;

/// Fraction of the cap kept after trimming synced events.
const TRIM_TARGET_RATIO: f64 = 0.8;

/// Filter for [`EventStore::query`]. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventQuery {
    pub session_id: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_severity: Option<u8>,
}

impl EventQuery {
    pub fn for_session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    pub fn min_severity(mut self, severity: u8) -> Self {
        self.min_severity = Some(severity);
        self
    }

    pub fn matches(&self, event: &ClassifiedEvent) -> bool {
        self.session_id.map_or(true, |id| event.session_id == id)
            && self.from.map_or(true, |from| event.created_at >= from)
            && self.until.map_or(true, |until| event.created_at <= until)
            && self.min_severity.map_or(true, |s| event.severity >= s)
    }
}

/// Persistent event storage. Implementations must be safe to share across tasks.
pub trait EventStore: Send + Sync {
    fn insert(&self, event: &ClassifiedEvent) -> Result<(), StorageError>;
    fn get(&self, id: Uuid) -> Result<Option<ClassifiedEvent>, StorageError>;
    /// Oldest first, at most `limit`.
    fn get_unsynced(&self, limit: usize) -> Result<Vec<ClassifiedEvent>, StorageError>;
    /// Returns how many events changed.
    fn mark_synced(&self, ids: &[Uuid]) -> Result<usize, StorageError>;
    fn count_all(&self) -> Result<usize, StorageError>;
    fn delete_older_than(&self, cutoff: DateTime<Utc>, only_synced: bool) -> Result<usize, StorageError>;
    fn delete_oldest_synced(&self, n: usize) -> Result<usize, StorageError>;
    /// Matching events ordered by creation time.
    fn query(&self, query: &EventQuery) -> Result<Vec<ClassifiedEvent>, StorageError>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MemoryEventStore {
    events: Mutex<Vec<ClassifiedEvent>>,
    #[cfg(test)]
    busy_inserts: std::sync::atomic::AtomicU32,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<ClassifiedEvent>>, StorageError> {
        self.events
            .lock()
            .map_err(|_| StorageError::Corrupted("event store lock poisoned".to_string()))
    }

    /// Make the next `n` inserts fail with `Busy`.
    #[cfg(test)]
    pub fn inject_busy(&self, n: u32) {
        self.busy_inserts.store(n, std::sync::atomic::Ordering::SeqCst);
    }
}

impl EventStore for MemoryEventStore {
    fn insert(&self, event: &ClassifiedEvent) -> Result<(), StorageError> {
        #[cfg(test)]
        {
            use std::sync::atomic::Ordering;
            let busy = self
                .busy_inserts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            if busy.is_ok() {
                return Err(StorageError::Busy("injected".to_string()));
            }
        }

        let mut events = self.lock()?;
        if events.iter().any(|e| e.id == event.id) {
            return Err(StorageError::Duplicate(event.id));
        }
        // Keep creation order so "oldest" is a prefix scan
        let pos = events.partition_point(|e| e.created_at <= event.created_at);
        events.insert(pos, event.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<ClassifiedEvent>, StorageError> {
        Ok(self.lock()?.iter().find(|e| e.id == id).cloned())
    }

    fn get_unsynced(&self, limit: usize) -> Result<Vec<ClassifiedEvent>, StorageError> {
        Ok(self.lock()?.iter().filter(|e| !e.synced).take(limit).cloned().collect())
    }

    fn mark_synced(&self, ids: &[Uuid]) -> Result<usize, StorageError> {
        let mut events = self.lock()?;
        let mut changed = 0;
        for event in events.iter_mut().filter(|e| !e.synced && ids.contains(&e.id)) {
            event.synced = true;
            changed += 1;
        }
        Ok(changed)
    }

    fn count_all(&self) -> Result<usize, StorageError> {
        Ok(self.lock()?.len())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>, only_synced: bool) -> Result<usize, StorageError> {
        let mut events = self.lock()?;
        let before = events.len();
        events.retain(|e| !(e.created_at < cutoff && (e.synced || !only_synced)));
        Ok(before - events.len())
    }

    fn delete_oldest_synced(&self, n: usize) -> Result<usize, StorageError> {
        let mut events = self.lock()?;
        let mut remaining = n;
        events.retain(|e| {
            if remaining > 0 && e.synced {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        Ok(n - remaining)
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<ClassifiedEvent>, StorageError> {
        Ok(self.lock()?.iter().filter(|e| query.matches(e)).cloned().collect())
    }
}

// ─── Repository ──────────────────────────────────────────────────────────────

/// Event store plus the capacity and retention policy.
#[derive(Clone)]
pub struct EventRepository {
    store: Arc<dyn EventStore>,
    max_events: usize,
    retention: chrono::Duration,
    backoff: BackoffPolicy,
}

impl EventRepository {
    pub fn new(store: Arc<dyn EventStore>, max_events: usize, retention: chrono::Duration, backoff: BackoffPolicy) -> Self {
        Self { store, max_events: max_events.max(1), retention, backoff }
    }

    pub fn from_config(store: Arc<dyn EventStore>, config: &MonitorConfig) -> Self {
        Self::new(store, config.max_stored_events(), config.retention(), BackoffPolicy::default())
    }

    /// Persist an event, making room first if the store is at its cap.
    /// Busy stores are retried with backoff.
    pub async fn insert(&self, event: &ClassifiedEvent) -> Result<(), StorageError> {
        self.backoff
            .retry(|| async { self.insert_once(event) }, StorageError::is_transient)
            .await
    }

    fn insert_once(&self, event: &ClassifiedEvent) -> Result<(), StorageError> {
        if self.store.count_all()? >= self.max_events {
            self.cleanup()?;
            let count = self.store.count_all()?;
            if count >= self.max_events {
                return Err(StorageError::Full { count, cap: self.max_events });
            }
        }
        self.store.insert(event)
    }

    /// Drop expired synced events, then trim synced events to 80 % of the cap.
    pub fn cleanup(&self) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - self.retention;
        let expired = self.store.delete_older_than(cutoff, true)?;

        let target = (self.max_events as f64 * TRIM_TARGET_RATIO) as usize;
        let count = self.store.count_all()?;
        let trimmed = if count > target {
            self.store.delete_oldest_synced(count - target)?
        } else {
            0
        };

        log::info!("Storage cleanup removed {} expired and {} synced events", expired, trimmed);
        Ok(expired + trimmed)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<ClassifiedEvent>, StorageError> {
        self.store.get(id)
    }

    pub fn unsynced(&self, limit: usize) -> Result<Vec<ClassifiedEvent>, StorageError> {
        self.store.get_unsynced(limit)
    }

    pub fn mark_synced(&self, ids: &[Uuid]) -> Result<usize, StorageError> {
        self.store.mark_synced(ids)
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        self.store.count_all()
    }

    pub fn query(&self, query: &EventQuery) -> Result<Vec<ClassifiedEvent>, StorageError> {
        self.store.query(query)
    }

    pub fn export(&self, query: &EventQuery) -> Result<EventExport, StorageError> {
        Ok(EventExport::new(self.store.query(query)?))
    }
}

// ─── Export ──────────────────────────────────────────────────────────────────

/// Stored events as handed to the map front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventExport {
    pub exported_at: DateTime<Utc>,
    pub event_count: usize,
    pub events: Vec<ClassifiedEvent>,
}

impl EventExport {
    pub fn new(events: Vec<ClassifiedEvent>) -> Self {
        Self { exported_at: Utc::now(), event_count: events.len(), events }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// GeoJSON FeatureCollection with one point per event.
    pub fn to_geojson(&self) -> serde_json::Value {
        let features: Vec<serde_json::Value> = self
            .events
            .iter()
            .map(|e| {
                serde_json::json!({
                    "type": "Feature",
                    "geometry": { "type": "Point", "coordinates": [e.longitude, e.latitude] },
                    "properties": {
                        "id": e.id,
                        "severity": e.severity,
                        "confidence": e.confidence,
                        "peak_accel_ms2": e.peak_accel_ms2,
                        "created_at": e.created_at,
                    },
                })
            })
            .collect();
        serde_json::json!({ "type": "FeatureCollection", "features": features })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceInfo;

    fn event(days_ago: i64, severity: u8, session_id: Uuid) -> ClassifiedEvent {
        let device = DeviceInfo::default();
        ClassifiedEvent {
            id: Uuid::new_v4(),
            created_at: Utc::now() - chrono::Duration::days(days_ago),
            latitude: 48.137,
            longitude: 11.575,
            gps_accuracy_m: 8.0,
            speed_kmh: 40.0,
            heading_deg: Some(180.0),
            peak_accel_ms2: 9.0,
            impulse_duration_ms: 100,
            severity,
            confidence: 0.89,
            device_model: device.device_model,
            os_version: device.os_version,
            session_id,
            synced: false,
        }
    }

    fn repository(store: Arc<MemoryEventStore>, cap: usize) -> EventRepository {
        EventRepository::new(store, cap, chrono::Duration::days(30), BackoffPolicy::default())
    }

    #[test]
    fn test_round_trip_and_sync_flag() {
        let store = MemoryEventStore::new();
        let original = event(0, 4, Uuid::new_v4());
        store.insert(&original).unwrap();

        assert_eq!(store.get(original.id).unwrap(), Some(original.clone()));
        assert_eq!(store.get_unsynced(10).unwrap().len(), 1);

        assert_eq!(store.mark_synced(&[original.id]).unwrap(), 1);
        assert_eq!(store.mark_synced(&[original.id]).unwrap(), 0);

        let stored = store.get(original.id).unwrap().unwrap();
        assert!(stored.synced);
        assert_eq!(ClassifiedEvent { synced: false, ..stored }, original);
        assert!(store.get_unsynced(10).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_rejected() {
        let store = MemoryEventStore::new();
        let e = event(0, 2, Uuid::new_v4());
        store.insert(&e).unwrap();
        assert_eq!(store.insert(&e), Err(StorageError::Duplicate(e.id)));
    }

    #[test]
    fn test_query_filters() {
        let store = MemoryEventStore::new();
        let session = Uuid::new_v4();
        store.insert(&event(3, 2, session)).unwrap();
        store.insert(&event(1, 5, session)).unwrap();
        store.insert(&event(1, 4, Uuid::new_v4())).unwrap();

        assert_eq!(store.query(&EventQuery::default()).unwrap().len(), 3);
        assert_eq!(store.query(&EventQuery::default().for_session(session)).unwrap().len(), 2);
        assert_eq!(store.query(&EventQuery::default().min_severity(4)).unwrap().len(), 2);

        let recent = EventQuery::default().between(Utc::now() - chrono::Duration::days(2), Utc::now());
        let found = store.query(&recent).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found[0].created_at <= found[1].created_at);
    }

    #[test]
    fn test_delete_older_than_respects_sync() {
        let store = MemoryEventStore::new();
        let old_synced = event(40, 3, Uuid::new_v4());
        let old_unsynced = event(40, 3, Uuid::new_v4());
        store.insert(&old_synced).unwrap();
        store.insert(&old_unsynced).unwrap();
        store.mark_synced(&[old_synced.id]).unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(30);
        assert_eq!(store.delete_older_than(cutoff, true).unwrap(), 1);
        assert!(store.get(old_unsynced.id).unwrap().is_some());
        assert_eq!(store.delete_older_than(cutoff, false).unwrap(), 1);
        assert_eq!(store.count_all().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cap_trims_synced_to_target() {
        let store = Arc::new(MemoryEventStore::new());
        let repo = repository(store.clone(), 10);
        let mut ids = Vec::new();
        for days in (1..=10).rev() {
            let e = event(days, 3, Uuid::new_v4());
            ids.push(e.id);
            repo.insert(&e).await.unwrap();
        }
        repo.mark_synced(&ids).unwrap();

        repo.insert(&event(0, 3, Uuid::new_v4())).await.unwrap();
        assert_eq!(repo.count().unwrap(), 9);
        // Two oldest went
        assert!(repo.get(ids[0]).unwrap().is_none());
        assert!(repo.get(ids[1]).unwrap().is_none());
        assert!(repo.get(ids[2]).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_when_nothing_synced() {
        let store = Arc::new(MemoryEventStore::new());
        let repo = repository(store, 5);
        for _ in 0..5 {
            repo.insert(&event(60, 3, Uuid::new_v4())).await.unwrap();
        }
        let result = repo.insert(&event(0, 3, Uuid::new_v4())).await;
        assert_eq!(result, Err(StorageError::Full { count: 5, cap: 5 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_store_retried() {
        let store = Arc::new(MemoryEventStore::new());
        store.inject_busy(2);
        let repo = repository(store.clone(), 10);
        let e = event(0, 3, Uuid::new_v4());
        repo.insert(&e).await.unwrap();
        assert!(store.get(e.id).unwrap().is_some());

        store.inject_busy(3);
        let result = repo.insert(&event(0, 3, Uuid::new_v4())).await;
        assert!(matches!(result, Err(StorageError::Busy(_))));
    }

    #[test]
    fn test_export_json() {
        let store = Arc::new(MemoryEventStore::new());
        let repo = repository(store.clone(), 10);
        store.insert(&event(0, 4, Uuid::new_v4())).unwrap();

        let export = repo.export(&EventQuery::default()).unwrap();
        assert_eq!(export.event_count, 1);
        let json = export.to_json().unwrap();
        assert!(json.contains("\"severity\": 4"));

        let geo = export.to_geojson();
        assert_eq!(geo["type"], "FeatureCollection");
        assert_eq!(geo["features"][0]["geometry"]["coordinates"][0], 11.575);
    }
}
