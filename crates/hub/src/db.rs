use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;

use crate::hardware::{DeviceState, SensorReading};

/// One brain decision as stored.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    pub decided_at: NaiveDateTime,
    pub trigger: String,
    pub growth_stage: String,
    pub output_text: String,
    /// Serialized action outcomes.
    pub actions: serde_json::Value,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WaterDay {
    pub total_ml: f64,
    pub last_at: Option<NaiveDateTime>,
}

/// Storage the control core writes to and reads its startup state from.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn log_sensor_reading(&self, reading: &SensorReading, simulated: bool) -> Result<()>;
    async fn log_device_state(&self, state: &DeviceState, at: NaiveDateTime) -> Result<()>;
    async fn log_decision(&self, record: &DecisionRecord) -> Result<()>;
    async fn log_water_event(&self, at: NaiveDateTime, amount_ml: f64, source: &str) -> Result<()>;
    async fn current_stage(&self) -> Result<Option<String>>;
    async fn set_stage(&self, stage: &str, at: NaiveDateTime) -> Result<()>;
    async fn water_total_for_day(&self, day: NaiveDate) -> Result<WaterDay>;
    /// Newest decisions first.
    async fn recent_decisions(&self, limit: i64) -> Result<Vec<DecisionRecord>>;
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/grow/grow.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every in-memory connection is its own database, so keep exactly one.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        }
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for Db {
    async fn log_sensor_reading(&self, reading: &SensorReading, simulated: bool) -> Result<()> {
        let Some(core) = reading.core() else {
            bail!(
                "refusing to store partial reading (missing {})",
                reading.missing_core_fields().join(", ")
            );
        };
        let probes = serde_json::to_string(&reading.soil_probes)?;
        sqlx::query(
            r#"
            INSERT INTO sensor_readings (
              captured_at, air_temp_c, humidity_pct, vpd_kpa,
              co2_ppm, soil_moisture_pct, soil_probes, leaf_temp_delta_c, simulated
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(reading.captured_at)
        .bind(core.air_temp_c)
        .bind(core.humidity_pct)
        .bind(core.vpd_kpa)
        .bind(reading.co2_ppm)
        .bind(reading.soil_moisture_pct)
        .bind(probes)
        .bind(reading.leaf_temp_delta_c)
        .bind(simulated)
        .execute(&self.pool)
        .await
        .context("log_sensor_reading failed")?;
        Ok(())
    }

    async fn log_device_state(&self, state: &DeviceState, at: NaiveDateTime) -> Result<()> {
        let devices = serde_json::to_string(&state.devices)?;
        sqlx::query(
            r#"
            INSERT INTO device_states (recorded_at, devices, light_brightness)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(at)
        .bind(devices)
        .bind(state.light_brightness.map(i64::from))
        .execute(&self.pool)
        .await
        .context("log_device_state failed")?;
        Ok(())
    }

    async fn log_decision(&self, record: &DecisionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_decisions (
              decided_at, trigger_kind, growth_stage, output_text, actions, tokens_used
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.decided_at)
        .bind(&record.trigger)
        .bind(&record.growth_stage)
        .bind(&record.output_text)
        .bind(record.actions.to_string())
        .bind(i64::try_from(record.tokens_used).unwrap_or(i64::MAX))
        .execute(&self.pool)
        .await
        .context("log_decision failed")?;
        Ok(())
    }

    async fn log_water_event(&self, at: NaiveDateTime, amount_ml: f64, source: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO water_events (ts, day, amount_ml, source)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(at)
        .bind(at.date().format("%Y-%m-%d").to_string())
        .bind(amount_ml)
        .bind(source)
        .execute(&self.pool)
        .await
        .context("log_water_event failed")?;
        Ok(())
    }

    async fn current_stage(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT stage FROM grow_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("current_stage failed")?;
        Ok(match row {
            Some(r) => Some(r.try_get("stage")?),
            None => None,
        })
    }

    async fn set_stage(&self, stage: &str, at: NaiveDateTime) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO grow_state (id, stage, updated_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              stage=excluded.stage,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(stage)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("set_stage failed")?;
        Ok(())
    }

    async fn water_total_for_day(&self, day: NaiveDate) -> Result<WaterDay> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount_ml), 0.0) AS total, MAX(ts) AS last_at
            FROM water_events
            WHERE day = ?
            "#,
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .fetch_one(&self.pool)
        .await
        .context("water_total_for_day failed")?;

        Ok(WaterDay {
            total_ml: row.try_get("total")?,
            last_at: row.try_get("last_at")?,
        })
    }

    async fn recent_decisions(&self, limit: i64) -> Result<Vec<DecisionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT decided_at, trigger_kind, growth_stage, output_text, actions, tokens_used
            FROM ai_decisions
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_decisions failed")?;

        rows.into_iter()
            .map(|r| {
                let actions: String = r.try_get("actions")?;
                let tokens: i64 = r.try_get("tokens_used")?;
                Ok(DecisionRecord {
                    decided_at: r.try_get("decided_at")?,
                    trigger: r.try_get("trigger_kind")?,
                    growth_stage: r.try_get("growth_stage")?,
                    output_text: r.try_get("output_text")?,
                    actions: serde_json::from_str(&actions).context("stored actions are not json")?,
                    tokens_used: tokens.max(0) as u64,
                })
            })
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
