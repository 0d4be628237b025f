use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, warn};

use crate::error::{StoreError, WriteError, WritePhase};
use crate::metrics_consts::{
    BATCH_WRITE_TIME, NORMALIZED_ROWS, RECORDS_STAGED, WRITE_ATTEMPT_FAILURES,
};
use crate::types::{Fingerprint, Player, ReportRecord};

/// Rows inserted into each normalized table by one normalization run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeStats {
    pub sightings: u64,
    pub gear: u64,
    pub locations: u64,
    pub reports: u64,
}

impl NormalizeStats {
    pub fn dimensions(&self) -> u64 {
        self.sightings + self.gear + self.locations
    }
}

/// The backing store as seen by the pipeline.
#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn find_player(&self, name: &str) -> Result<Option<Player>, StoreError>;

    /// Creates a player keyed on its normalized name. Inserting a name that
    /// already exists is a no-op.
    async fn insert_player(&self, name: &str) -> Result<(), StoreError>;

    /// Whether a normalized report with this fingerprint exists.
    async fn report_exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError>;

    /// Appends the records to the staging log in one transaction.
    async fn stage(&self, records: &[ReportRecord]) -> Result<u64, StoreError>;

    /// Populates the dimension and fact tables from the records in one
    /// transaction, skipping rows that already exist.
    async fn normalize(&self, records: &[ReportRecord]) -> Result<NormalizeStats, StoreError>;
}

pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;
        Ok(Self::new(pool))
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// Column-wise view of a batch, bound as arrays and expanded with UNNEST
struct ReportColumns {
    reporting_id: Vec<i64>,
    reported_id: Vec<i64>,
    region_id: Vec<i32>,
    x_coord: Vec<i32>,
    y_coord: Vec<i32>,
    z_coord: Vec<i32>,
    reported_at: Vec<DateTime<Utc>>,
    manual_detect: Vec<bool>,
    on_members_world: Vec<i32>,
    on_pvp_world: Vec<bool>,
    world_number: Vec<i32>,
    equip_head_id: Vec<Option<i32>>,
    equip_amulet_id: Vec<Option<i32>>,
    equip_torso_id: Vec<Option<i32>>,
    equip_legs_id: Vec<Option<i32>>,
    equip_boots_id: Vec<Option<i32>>,
    equip_cape_id: Vec<Option<i32>>,
    equip_hands_id: Vec<Option<i32>>,
    equip_weapon_id: Vec<Option<i32>>,
    equip_shield_id: Vec<Option<i32>>,
    equip_ge_value: Vec<i64>,
}

impl From<&[ReportRecord]> for ReportColumns {
    fn from(records: &[ReportRecord]) -> Self {
        let column = |f: fn(&ReportRecord) -> i32| records.iter().map(f).collect::<Vec<_>>();
        let slot =
            |f: fn(&ReportRecord) -> Option<i32>| records.iter().map(f).collect::<Vec<_>>();

        ReportColumns {
            reporting_id: records.iter().map(|r| r.reporter_id).collect(),
            reported_id: records.iter().map(|r| r.reported_id).collect(),
            region_id: column(|r| r.region_id),
            x_coord: column(|r| r.x),
            y_coord: column(|r| r.y),
            z_coord: column(|r| r.z),
            reported_at: records.iter().map(|r| r.timestamp).collect(),
            manual_detect: records.iter().map(|r| r.manual_detect).collect(),
            on_members_world: column(|r| r.on_members_world),
            on_pvp_world: records.iter().map(|r| r.on_pvp_world).collect(),
            world_number: column(|r| r.world_number),
            equip_head_id: slot(|r| r.equipment.equip_head_id),
            equip_amulet_id: slot(|r| r.equipment.equip_amulet_id),
            equip_torso_id: slot(|r| r.equipment.equip_torso_id),
            equip_legs_id: slot(|r| r.equipment.equip_legs_id),
            equip_boots_id: slot(|r| r.equipment.equip_boots_id),
            equip_cape_id: slot(|r| r.equipment.equip_cape_id),
            equip_hands_id: slot(|r| r.equipment.equip_hands_id),
            equip_weapon_id: slot(|r| r.equipment.equip_weapon_id),
            equip_shield_id: slot(|r| r.equipment.equip_shield_id),
            equip_ge_value: records.iter().map(|r| r.equip_ge_value).collect(),
        }
    }
}

const REPORT_COLUMNS: &str = r#"
    reporting_id, reported_id, region_id, x_coord, y_coord, z_coord, reported_at,
    manual_detect, on_members_world, on_pvp_world, world_number,
    equip_head_id, equip_amulet_id, equip_torso_id, equip_legs_id, equip_boots_id,
    equip_cape_id, equip_hands_id, equip_weapon_id, equip_shield_id, equip_ge_value
"#;

const UNNEST_REPORT_COLUMNS: &str = r#"
    SELECT * FROM UNNEST(
        $1::bigint[], $2::bigint[], $3::int[], $4::int[], $5::int[], $6::int[], $7::timestamptz[],
        $8::bool[], $9::int[], $10::bool[], $11::int[],
        $12::int[], $13::int[], $14::int[], $15::int[], $16::int[],
        $17::int[], $18::int[], $19::int[], $20::int[], $21::bigint[]
    )
"#;

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_columns<'q>(query: PgQuery<'q>, columns: &'q ReportColumns) -> PgQuery<'q> {
    query
        .bind(&columns.reporting_id)
        .bind(&columns.reported_id)
        .bind(&columns.region_id)
        .bind(&columns.x_coord)
        .bind(&columns.y_coord)
        .bind(&columns.z_coord)
        .bind(&columns.reported_at)
        .bind(&columns.manual_detect)
        .bind(&columns.on_members_world)
        .bind(&columns.on_pvp_world)
        .bind(&columns.world_number)
        .bind(&columns.equip_head_id)
        .bind(&columns.equip_amulet_id)
        .bind(&columns.equip_torso_id)
        .bind(&columns.equip_legs_id)
        .bind(&columns.equip_boots_id)
        .bind(&columns.equip_cape_id)
        .bind(&columns.equip_hands_id)
        .bind(&columns.equip_weapon_id)
        .bind(&columns.equip_shield_id)
        .bind(&columns.equip_ge_value)
}

const INSERT_SIGHTINGS: &str = r#"
INSERT INTO report_sighting (reporting_id, reported_id, manual_detect)
SELECT DISTINCT b.reporting_id, b.reported_id, b.manual_detect
FROM report_batch b
WHERE NOT EXISTS (
    SELECT 1 FROM report_sighting s
    WHERE s.reporting_id = b.reporting_id
        AND s.reported_id = b.reported_id
        AND s.manual_detect = b.manual_detect
)
ON CONFLICT DO NOTHING
"#;

const INSERT_GEAR: &str = r#"
INSERT INTO report_gear (
    equip_head_id, equip_amulet_id, equip_torso_id, equip_legs_id, equip_boots_id,
    equip_cape_id, equip_hands_id, equip_weapon_id, equip_shield_id
)
SELECT DISTINCT
    b.equip_head_id, b.equip_amulet_id, b.equip_torso_id, b.equip_legs_id, b.equip_boots_id,
    b.equip_cape_id, b.equip_hands_id, b.equip_weapon_id, b.equip_shield_id
FROM report_batch b
WHERE NOT EXISTS (
    SELECT 1 FROM report_gear g
    WHERE g.equip_head_id IS NOT DISTINCT FROM b.equip_head_id
        AND g.equip_amulet_id IS NOT DISTINCT FROM b.equip_amulet_id
        AND g.equip_torso_id IS NOT DISTINCT FROM b.equip_torso_id
        AND g.equip_legs_id IS NOT DISTINCT FROM b.equip_legs_id
        AND g.equip_boots_id IS NOT DISTINCT FROM b.equip_boots_id
        AND g.equip_cape_id IS NOT DISTINCT FROM b.equip_cape_id
        AND g.equip_hands_id IS NOT DISTINCT FROM b.equip_hands_id
        AND g.equip_weapon_id IS NOT DISTINCT FROM b.equip_weapon_id
        AND g.equip_shield_id IS NOT DISTINCT FROM b.equip_shield_id
)
ON CONFLICT DO NOTHING
"#;

const INSERT_LOCATIONS: &str = r#"
INSERT INTO report_location (region_id, x_coord, y_coord, z_coord)
SELECT DISTINCT b.region_id, b.x_coord, b.y_coord, b.z_coord
FROM report_batch b
WHERE NOT EXISTS (
    SELECT 1 FROM report_location l
    WHERE l.region_id = b.region_id
        AND l.x_coord = b.x_coord
        AND l.y_coord = b.y_coord
        AND l.z_coord = b.z_coord
)
ON CONFLICT DO NOTHING
"#;

// One fact row per dimension-key triple; the latest sighting in the batch wins
const INSERT_REPORTS: &str = r#"
INSERT INTO report (
    report_sighting_id, report_location_id, report_gear_id,
    reported_at, on_members_world, on_pvp_world, world_number, region_id
)
SELECT DISTINCT ON (s.report_sighting_id, l.report_location_id, g.report_gear_id)
    s.report_sighting_id, l.report_location_id, g.report_gear_id,
    b.reported_at, b.on_members_world, b.on_pvp_world, b.world_number, b.region_id
FROM report_batch b
JOIN report_sighting s
    ON s.reporting_id = b.reporting_id
    AND s.reported_id = b.reported_id
    AND s.manual_detect = b.manual_detect
JOIN report_location l
    ON l.region_id = b.region_id
    AND l.x_coord = b.x_coord
    AND l.y_coord = b.y_coord
    AND l.z_coord = b.z_coord
JOIN report_gear g
    ON g.equip_head_id IS NOT DISTINCT FROM b.equip_head_id
    AND g.equip_amulet_id IS NOT DISTINCT FROM b.equip_amulet_id
    AND g.equip_torso_id IS NOT DISTINCT FROM b.equip_torso_id
    AND g.equip_legs_id IS NOT DISTINCT FROM b.equip_legs_id
    AND g.equip_boots_id IS NOT DISTINCT FROM b.equip_boots_id
    AND g.equip_cape_id IS NOT DISTINCT FROM b.equip_cape_id
    AND g.equip_hands_id IS NOT DISTINCT FROM b.equip_hands_id
    AND g.equip_weapon_id IS NOT DISTINCT FROM b.equip_weapon_id
    AND g.equip_shield_id IS NOT DISTINCT FROM b.equip_shield_id
WHERE NOT EXISTS (
    SELECT 1 FROM report r
    WHERE r.report_sighting_id = s.report_sighting_id
        AND r.report_location_id = l.report_location_id
        AND r.report_gear_id = g.report_gear_id
)
ORDER BY s.report_sighting_id, l.report_location_id, g.report_gear_id, b.reported_at DESC
ON CONFLICT DO NOTHING
"#;

#[async_trait]
impl ReportStore for PgReportStore {
    async fn find_player(&self, name: &str) -> Result<Option<Player>, StoreError> {
        sqlx::query_as::<_, Player>(
            r#"
SELECT id, name, created_at, updated_at, possible_ban, confirmed_ban,
    confirmed_player, label_id, label_jagex
FROM players
WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::query("find_player", error))
    }

    async fn insert_player(&self, name: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO players (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::query("insert_player", error))?;
        Ok(())
    }

    async fn report_exists(&self, fingerprint: &Fingerprint) -> Result<bool, StoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
SELECT EXISTS (
    SELECT 1 FROM report r
    JOIN report_sighting s ON s.report_sighting_id = r.report_sighting_id
    WHERE s.reported_id = $1
        AND s.reporting_id = $2
        AND r.region_id = $3
)
            "#,
        )
        .bind(fingerprint.reported_id)
        .bind(fingerprint.reporter_id)
        .bind(fingerprint.region_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| StoreError::query("report_exists", error))
    }

    async fn stage(&self, records: &[ReportRecord]) -> Result<u64, StoreError> {
        let columns = ReportColumns::from(records);
        let statement =
            format!("INSERT INTO report_staging ({REPORT_COLUMNS}) {UNNEST_REPORT_COLUMNS}");

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        let staged = bind_columns(sqlx::query(&statement), &columns)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::query("stage", error))?
            .rows_affected();

        tx.commit()
            .await
            .map_err(|error| StoreError::query("commit stage", error))?;
        Ok(staged)
    }

    async fn normalize(&self, records: &[ReportRecord]) -> Result<NormalizeStats, StoreError> {
        let columns = ReportColumns::from(records);

        // Dropping `tx` without committing rolls back, which also drops the
        // transaction-scoped working table.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        sqlx::query(
            r#"
CREATE TEMPORARY TABLE report_batch (
    reporting_id BIGINT NOT NULL,
    reported_id BIGINT NOT NULL,
    region_id INTEGER NOT NULL,
    x_coord INTEGER NOT NULL,
    y_coord INTEGER NOT NULL,
    z_coord INTEGER NOT NULL,
    reported_at TIMESTAMPTZ NOT NULL,
    manual_detect BOOLEAN NOT NULL,
    on_members_world INTEGER,
    on_pvp_world BOOLEAN,
    world_number INTEGER,
    equip_head_id INTEGER,
    equip_amulet_id INTEGER,
    equip_torso_id INTEGER,
    equip_legs_id INTEGER,
    equip_boots_id INTEGER,
    equip_cape_id INTEGER,
    equip_hands_id INTEGER,
    equip_weapon_id INTEGER,
    equip_shield_id INTEGER,
    equip_ge_value BIGINT
) ON COMMIT DROP
            "#,
        )
        .execute(&mut *tx)
        .await
        .map_err(|error| StoreError::query("create report_batch", error))?;

        let load = format!("INSERT INTO report_batch ({REPORT_COLUMNS}) {UNNEST_REPORT_COLUMNS}");
        bind_columns(sqlx::query(&load), &columns)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::query("load report_batch", error))?;

        let mut stats = NormalizeStats::default();
        for (command, statement, count) in [
            ("insert report_sighting", INSERT_SIGHTINGS, &mut stats.sightings),
            ("insert report_gear", INSERT_GEAR, &mut stats.gear),
            ("insert report_location", INSERT_LOCATIONS, &mut stats.locations),
            ("insert report", INSERT_REPORTS, &mut stats.reports),
        ] {
            *count = sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|error| StoreError::query(command, error))?
                .rows_affected();
        }

        tx.commit()
            .await
            .map_err(|error| StoreError::query("commit normalize", error))?;
        Ok(stats)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub staged: u64,
    pub normalized: NormalizeStats,
}

/// Runs the two write phases for a batch.
///
/// Each phase is its own transaction and is attempted up to `max_attempts`
/// times while it fails transiently. A normalize failure leaves the staged
/// rows in place.
pub struct StorageWriter {
    store: Arc<dyn ReportStore>,
    max_attempts: u32,
}

impl StorageWriter {
    pub fn new(store: Arc<dyn ReportStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn write(&self, batch: Vec<ReportRecord>) -> Result<WriteOutcome, WriteError> {
        let write_time = std::time::Instant::now();
        let store = self.store.as_ref();
        let records = batch.as_slice();

        let staged = match self
            .with_attempts(WritePhase::Stage, move || store.stage(records))
            .await
        {
            Ok(staged) => staged,
            Err(error) => {
                return Err(WriteError {
                    phase: WritePhase::Stage,
                    error,
                    batch,
                })
            }
        };
        metrics::counter!(RECORDS_STAGED).increment(staged);

        let normalized = match self
            .with_attempts(WritePhase::Normalize, move || store.normalize(records))
            .await
        {
            Ok(normalized) => normalized,
            Err(error) => {
                return Err(WriteError {
                    phase: WritePhase::Normalize,
                    error,
                    batch,
                })
            }
        };
        for (table, rows) in [
            ("report_sighting", normalized.sightings),
            ("report_gear", normalized.gear),
            ("report_location", normalized.locations),
            ("report", normalized.reports),
        ] {
            metrics::counter!(NORMALIZED_ROWS, "table" => table).increment(rows);
        }
        metrics::histogram!(BATCH_WRITE_TIME).record(write_time.elapsed().as_millis() as f64);

        info!(
            "wrote batch of {} records: {} staged, {} new dimension rows, {} new reports",
            records.len(),
            staged,
            normalized.dimensions(),
            normalized.reports
        );
        Ok(WriteOutcome { staged, normalized })
    }

    async fn with_attempts<T, F, Fut>(&self, phase: WritePhase, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    metrics::counter!(WRITE_ATTEMPT_FAILURES, "phase" => phase.as_str())
                        .increment(1);
                    if !error.is_transient() || attempt >= self.max_attempts {
                        return Err(error);
                    }

                    let jitter = rand::random::<u64>() % 50;
                    warn!(
                        "{} attempt {} of {} failed: {}, retrying in {}ms",
                        phase, attempt, self.max_attempts, error, jitter
                    );
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_record, MemoryStore};

    #[tokio::test]
    async fn writes_both_phases() {
        let store = Arc::new(MemoryStore::default());
        let writer = StorageWriter::new(store.clone(), 3);

        let outcome = writer
            .write(vec![sample_record(1, 2), sample_record(3, 4)])
            .await
            .unwrap();

        assert_eq!(outcome.staged, 2);
        assert_eq!(outcome.normalized.sightings, 2);
        // Same gear and location in both samples
        assert_eq!(outcome.normalized.gear, 1);
        assert_eq!(outcome.normalized.locations, 1);
        assert_eq!(outcome.normalized.reports, 2);
        assert_eq!(store.staging_rows(), 2);
    }

    #[tokio::test]
    async fn normalizing_twice_adds_nothing() {
        let store = Arc::new(MemoryStore::default());
        let writer = StorageWriter::new(store.clone(), 3);
        let batch = vec![sample_record(1, 2), sample_record(3, 4)];

        writer.write(batch.clone()).await.unwrap();
        let second = writer.write(batch).await.unwrap();

        assert_eq!(second.staged, 2);
        assert_eq!(second.normalized, NormalizeStats::default());
        assert_eq!(store.staging_rows(), 4);
        assert_eq!(store.report_rows(), 2);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_in_place() {
        let store = Arc::new(MemoryStore::default());
        store.fail_stage(2);
        let writer = StorageWriter::new(store.clone(), 3);

        let outcome = writer.write(vec![sample_record(1, 2)]).await.unwrap();
        assert_eq!(outcome.staged, 1);
        assert_eq!(store.staging_rows(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_return_the_batch() {
        let store = Arc::new(MemoryStore::default());
        store.fail_stage(3);
        let writer = StorageWriter::new(store.clone(), 3);

        let batch = vec![sample_record(1, 2), sample_record(3, 4)];
        let err = writer.write(batch.clone()).await.unwrap_err();

        assert_eq!(err.phase, WritePhase::Stage);
        assert_eq!(err.batch, batch);
        assert_eq!(store.staging_rows(), 0);
    }

    #[tokio::test]
    async fn normalize_failure_keeps_staged_rows() {
        let store = Arc::new(MemoryStore::default());
        store.fail_normalize(1);
        let writer = StorageWriter::new(store.clone(), 1);

        let err = writer.write(vec![sample_record(1, 2)]).await.unwrap_err();

        assert_eq!(err.phase, WritePhase::Normalize);
        assert_eq!(err.batch.len(), 1);
        assert_eq!(store.staging_rows(), 1);
        assert_eq!(store.sighting_rows(), 0);
        assert_eq!(store.report_rows(), 0);
    }
}
