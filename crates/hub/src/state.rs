use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::ControlError;
use crate::hardware::{DeviceState, Provenance, SensorReading};
use crate::orchestrator::breaker::CircuitState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<RuntimeState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Counters and caches the loops publish for status reporting. Each field
/// has a single writing loop.
pub struct RuntimeState {
    pub started_at: Instant,
    pub running: bool,
    pub last_poll: Option<Instant>,
    pub last_reading: Option<SensorReading>,
    pub last_devices: Option<DeviceState>,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub reconnect_attempts: u64,
    pub sources: BTreeMap<String, SourceStats>,
    pub decisions: u64,
    pub decision_failures: u64,
    pub reactive_skipped: u64,
    pub light_corrections: u64,
    pub events: VecDeque<SystemEvent>,
}

/// Per-source reliability.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub provenance: Provenance,
    pub reads_ok: u64,
    pub reads_failed: u64,
    pub timeouts: u64,
    pub skipped_open_circuit: u64,
    pub breaker: CircuitState,
    pub last_ok_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
    /// Share of attempted reads that succeeded, in percent.
    pub reliability_pct: Option<f64>,
}

impl SourceStats {
    fn new(provenance: Provenance) -> Self {
        Self {
            provenance,
            reads_ok: 0,
            reads_failed: 0,
            timeouts: 0,
            skipped_open_circuit: 0,
            breaker: CircuitState::Closed,
            last_ok_at: None,
            last_error: None,
            reliability_pct: None,
        }
    }

    fn refresh_reliability(&mut self) {
        let total = self.reads_ok + self.reads_failed;
        self.reliability_pct = (total > 0).then(|| self.reads_ok as f64 * 100.0 / total as f64);
    }
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: NaiveDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Device,
    Safety,
    Decision,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            running: false,
            last_poll: None,
            last_reading: None,
            last_devices: None,
            consecutive_failures: 0,
            degraded: false,
            reconnect_attempts: 0,
            sources: BTreeMap::new(),
            decisions: 0,
            decision_failures: 0,
            reactive_skipped: 0,
            light_corrections: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    fn source(&mut self, name: &str, provenance: Provenance) -> &mut SourceStats {
        let stats = self
            .sources
            .entry(name.to_string())
            .or_insert_with(|| SourceStats::new(provenance));
        stats.provenance = provenance;
        stats
    }

    pub fn register_source(&mut self, name: &str, provenance: Provenance) {
        self.source(name, provenance);
    }

    /// Names of sources currently served by a simulator.
    pub fn simulated_sources(&self) -> Vec<String> {
        self.sources
            .iter()
            .filter(|(_, s)| s.provenance == Provenance::Simulated)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn record_source_ok(&mut self, name: &str, provenance: Provenance, breaker: CircuitState, at: NaiveDateTime) {
        let s = self.source(name, provenance);
        s.reads_ok += 1;
        s.breaker = breaker;
        s.last_ok_at = Some(at);
        s.refresh_reliability();
    }

    pub fn record_source_failure(
        &mut self,
        name: &str,
        provenance: Provenance,
        breaker: CircuitState,
        err: &ControlError,
    ) {
        let s = self.source(name, provenance);
        s.reads_failed += 1;
        if matches!(err, ControlError::Timeout { .. }) {
            s.timeouts += 1;
        }
        s.breaker = breaker;
        s.last_error = Some(err.to_string());
        s.refresh_reliability();
    }

    pub fn record_source_skipped(&mut self, name: &str, provenance: Provenance, breaker: CircuitState) {
        let s = self.source(name, provenance);
        s.skipped_open_circuit += 1;
        s.breaker = breaker;
    }

    /// A complete reading made it through the cycle.
    pub fn record_reading(&mut self, reading: SensorReading, devices: Option<DeviceState>) {
        let detail = format!(
            "temp={:.1}C rh={:.0}% vpd={:.2}kPa",
            reading.air_temp_c.unwrap_or_default(),
            reading.humidity_pct.unwrap_or_default(),
            reading.vpd_kpa.unwrap_or_default()
        );
        let at = reading.captured_at;
        self.last_poll = Some(Instant::now());
        self.last_reading = Some(reading);
        if devices.is_some() {
            self.last_devices = devices;
        }
        self.push_event(EventKind::Reading, at, detail);
    }

    pub fn record_device(&mut self, at: NaiveDateTime, detail: String) {
        self.push_event(EventKind::Device, at, detail);
    }

    pub fn record_safety(&mut self, at: NaiveDateTime, detail: String) {
        self.push_event(EventKind::Safety, at, detail);
    }

    pub fn record_decision(&mut self, at: NaiveDateTime, detail: String) {
        self.decisions += 1;
        self.push_event(EventKind::Decision, at, detail);
    }

    pub fn record_error(&mut self, at: NaiveDateTime, detail: String) {
        self.push_event(EventKind::Error, at, detail);
    }

    pub fn record_system(&mut self, at: NaiveDateTime, detail: String) {
        self.push_event(EventKind::System, at, detail);
    }

    /// Most recent first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, ts: NaiveDateTime, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent { ts, kind, detail });
    }
}
