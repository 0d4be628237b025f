use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::kafka_consumer::RecvErr;
use serde_json::{json, Value};

use crate::error::{QueueError, StoreError};
use crate::queue_engine::{MessageSink, MessageSource};
use crate::storage::{NormalizeStats, ReportStore};
use crate::types::{Equipment, Fingerprint, Player, ReportRecord};

type Sighting = (i64, i64, bool);
type Location = (i32, i32, i32, i32);

#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub sighting_id: usize,
    pub location_id: usize,
    pub gear_id: usize,
    pub reported_at: DateTime<Utc>,
    pub region_id: i32,
}

#[derive(Default)]
struct MemoryState {
    players: Vec<Player>,
    staging: Vec<ReportRecord>,
    sightings: Vec<Sighting>,
    gear: Vec<Equipment>,
    locations: Vec<Location>,
    reports: Vec<FactRow>,
}

/// A `ReportStore` held in memory, with the same deduplication rules as the
/// Postgres schema. Failures can be injected per operation.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    player_lookups: AtomicUsize,
    fail_lookups: AtomicUsize,
    fail_stage: AtomicUsize,
    fail_normalize: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize, command: &str) -> Result<(), StoreError> {
    let injected = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    match injected {
        true => Err(StoreError::query(command, sqlx::Error::PoolTimedOut)),
        false => Ok(()),
    }
}

// Index of the row equal to `row`, inserting it when missing. The bool is true on insert.
fn find_or_insert<T: PartialEq + Clone>(rows: &mut Vec<T>, row: &T) -> (usize, bool) {
    match rows.iter().position(|existing| existing == row) {
        Some(index) => (index, false),
        None => {
            rows.push(row.clone());
            (rows.len() - 1, true)
        }
    }
}

impl MemoryStore {
    /// The next `n` player or report lookups fail with a transient error.
    pub fn fail_lookups(&self, n: usize) {
        self.fail_lookups.store(n, Ordering::SeqCst);
    }

    /// The next `n` stage attempts fail with a transient error.
    pub fn fail_stage(&self, n: usize) {
        self.fail_stage.store(n, Ordering::SeqCst);
    }

    /// The next `n` normalize attempts fail with a transient error.
    pub fn fail_normalize(&self, n: usize) {
        self.fail_normalize.store(n, Ordering::SeqCst);
    }

    pub fn add_player(&self, name: &str) -> Player {
        let mut state = self.state.lock().unwrap();
        let player = Player::new(state.players.len() as i64 + 1, name);
        state.players.push(player.clone());
        player
    }

    pub fn player_count(&self) -> usize {
        self.state.lock().unwrap().players.len()
    }

    pub fn player_lookups(&self) -> usize {
        self.player_lookups.load(Ordering::SeqCst)
    }

    pub fn staged(&self) -> Vec<ReportRecord> {
        self.state.lock().unwrap().staging.clone()
    }

    pub fn staging_rows(&self) -> usize {
        self.state.lock().unwrap().staging.len()
    }

    pub fn sighting_rows(&self) -> usize {
        self.state.lock().unwrap().sightings.len()
    }

    pub fn gear_rows(&self) -> usize {
        self.state.lock().unwrap().gear.len()
    }

    pub fn location_rows(&self) -> usize {
        self.state.lock().unwrap().locations.len()
    }

    pub fn report_rows(&self) -> usize {
        self.state.lock().unwrap().reports.len()
    }

    pub fn reports(&self) -> Vec<FactRow> {
        self.state.lock().unwrap().reports.clone()
    }
}

#[async_trait]
impl ReportStore for MemoryStore {
    async fn find_player(&self, name: &str) -> Result<Option<Player>, StoreError> {
        take_failure(&self.fail_lookups, "find_player")?;
        self.player_lookups.fetch_add(1, Ordering::SeqCst);

        let state = self.state.lock().unwrap();
        Ok(state.players.iter().find(|p| p.name == name).cloned())
    }

    async fn insert_player(&self, name: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if !state.players.iter().any(|p| p.name == name) {
            let id = state.players.len() as i64 + 1;
            state.players.push(Player::new(id, name));
        }
        Ok(())
    }

    async fn report_exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        take_failure(&self.fail_lookups, "report_exists")?;

        let state = self.state.lock().unwrap();
        Ok(state.reports.iter().any(|report| {
            let (reporting, reported, _) = state.sightings[report.sighting_id];
            reported == fingerprint.reported_id
                && reporting == fingerprint.reporter_id
                && report.region_id == fingerprint.region_id
        }))
    }

    async fn stage(&self, records: &[ReportRecord]) -> Result<u64, StoreError> {
        take_failure(&self.fail_stage, "stage")?;

        let mut state = self.state.lock().unwrap();
        state.staging.extend_from_slice(records);
        Ok(records.len() as u64)
    }

    async fn normalize(&self, records: &[ReportRecord]) -> Result<NormalizeStats, StoreError> {
        take_failure(&self.fail_normalize, "normalize")?;

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut stats = NormalizeStats::default();
        let batch_start = state.reports.len();

        for record in records {
            let sighting = (record.reporter_id, record.reported_id, record.manual_detect);
            let (sighting_id, new) = find_or_insert(&mut state.sightings, &sighting);
            stats.sightings += u64::from(new);

            let (gear_id, new) = find_or_insert(&mut state.gear, &record.equipment);
            stats.gear += u64::from(new);

            let location = (record.region_id, record.x, record.y, record.z);
            let (location_id, new) = find_or_insert(&mut state.locations, &location);
            stats.locations += u64::from(new);

            let existing = state.reports.iter().position(|r| {
                r.sighting_id == sighting_id && r.location_id == location_id && r.gear_id == gear_id
            });
            match existing {
                // Rows written by this batch keep its latest sighting, older rows are left alone
                Some(index) if index >= batch_start => {
                    let row = &mut state.reports[index];
                    if record.timestamp > row.reported_at {
                        row.reported_at = record.timestamp;
                        row.region_id = record.region_id;
                    }
                }
                Some(_) => {}
                None => {
                    state.reports.push(FactRow {
                    sighting_id,
                    location_id,
                    gear_id,
                        reported_at: record.timestamp,
                        region_id: record.region_id,
                    });
                    stats.reports += 1;
                }
            }
        }
        Ok(stats)
    }
}

/// A record with fixed location, time and gear between the given players.
pub fn sample_record(reporter_id: i64, reported_id: i64) -> ReportRecord {
    ReportRecord {
        reporter_id,
        reported_id,
        region_id: 14651,
        x: 3682,
        y: 3837,
        z: 0,
        timestamp: DateTime::from_timestamp(1704223741, 0).unwrap_or_default(),
        manual_detect: false,
        on_members_world: 1,
        on_pvp_world: false,
        world_number: 324,
        equipment: Equipment {
            equip_head_id: Some(13592),
            equip_amulet_id: Some(1712),
            equip_torso_id: Some(1121),
            equip_legs_id: Some(1071),
            equip_boots_id: None,
            equip_cape_id: Some(1052),
            equip_hands_id: None,
            equip_weapon_id: Some(1333),
            equip_shield_id: None,
        },
        equip_ge_value: 0,
    }
}

/// A V1 report between two named players, without `metadata`.
pub fn sample_v1_payload(reporter: &str, reported: &str) -> Value {
    json!({
        "reporter": reporter,
        "reported": reported,
        "region_id": 14651,
        "x_coord": 3682,
        "y_coord": 3837,
        "z_coord": 0,
        "ts": 1704223741,
        "manual_detect": 0,
        "on_members_world": 1,
        "on_pvp_world": 0,
        "world_number": 324,
        "equipment": {
            "equip_head_id": 13592,
            "equip_amulet_id": 1712,
            "equip_torso_id": 1121,
            "equip_legs_id": 1071,
            "equip_boots_id": null,
            "equip_cape_id": 1052,
            "equip_hands_id": null,
            "equip_weapon_id": 1333,
            "equip_shield_id": null
        },
        "equip_ge_value": 0
    })
}

/// A `MessageSource` handing out a fixed list of messages.
pub struct VecSource {
    messages: Mutex<VecDeque<Result<Value, RecvErr>>>,
    commits: AtomicUsize,
}

impl VecSource {
    pub fn new(messages: Vec<Result<Value, RecvErr>>) -> Self {
        Self {
            messages: Mutex::new(messages.into()),
            commits: AtomicUsize::new(0),
        }
    }

    pub fn remaining(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSource for VecSource {
    async fn recv_batch(&self, max: usize, timeout: Duration) -> Vec<Result<Value, RecvErr>> {
        let batch: Vec<_> = {
            let mut messages = self.messages.lock().unwrap();
            let take = max.min(messages.len());
            messages.drain(..take).collect()
        };
        if batch.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        batch
    }

    fn commit(&self) -> Result<(), QueueError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `MessageSink` that records what was published. Failures can be injected per message.
#[derive(Default)]
pub struct RecordingSink {
    published: Mutex<Vec<Value>>,
    fail_next: AtomicUsize,
    publish_attempts: AtomicUsize,
    flushes: AtomicUsize,
}

impl RecordingSink {
    /// The next `n` messages fail to publish.
    pub fn fail_publishes(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<Value> {
        self.published.lock().unwrap().clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn publish(&self, messages: &[Value]) -> Vec<Result<(), QueueError>> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        let mut published = self.published.lock().unwrap();

        messages
            .iter()
            .map(|message| {
                let failed = self
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failed {
                    return Err(QueueError::Closed);
                }
                published.push(message.clone());
                Ok(())
            })
            .collect()
    }

    async fn flush(&self) -> Result<(), QueueError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_sighting_in_a_batch_wins() {
        let store = MemoryStore::default();
        let first = sample_record(1, 2);
        let mut later = first.clone();
        later.timestamp += chrono::Duration::minutes(5);

        store.normalize(&[first.clone(), later.clone()]).await.unwrap();
        assert_eq!(store.reports().len(), 1);
        assert_eq!(store.reports()[0].reported_at, later.timestamp);

        // A fact row from an earlier batch is not touched
        let mut latest = later.clone();
        latest.timestamp += chrono::Duration::minutes(5);
        store.normalize(&[latest]).await.unwrap();
        assert_eq!(store.reports()[0].reported_at, later.timestamp);
    }
}
