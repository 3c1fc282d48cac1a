//! Shared fakes and fixtures for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;

use crate::brain::{Brain, BrainAction, Decision, DecisionRequest, QueryReply, QueryRequest};
use crate::clock::{Clock, ManualClock};
use crate::config::{OrchestratorConfig, PhotoperiodSettings};
use crate::db::{DecisionRecord, Persistence, WaterDay};
use crate::error::{ControlError, ControlResult};
use crate::facade::{PumpSettings, SafeActuator};
use crate::hardware::{Actuator, Device, DeviceState, Provenance, Resolved, Sensor, SensorReading};
use crate::orchestrator::breaker::CircuitBreaker;
use crate::orchestrator::{Orchestrator, OrchestratorParts, SensorSlot};
use crate::photoperiod::{LightDriver, PhotoperiodScheduler};
use crate::safety::{DarkPeriodConfig, SafetyGuardian, SafetyLimits};
use crate::watchdog::Watchdog;

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// `h:m` on the fixture date, 2024-06-01.
pub fn at(h: u32, m: u32) -> NaiveDateTime {
    at_on(1, h, m)
}

/// `h:m` on June `day`, 2024.
pub fn at_on(day: u32, h: u32, m: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, day)
        .unwrap()
        .and_hms_opt(h, m, 0)
        .unwrap()
}

pub fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

/// Wall clock that moves with tokio's (pausable) clock.
pub struct TokioClock {
    base: NaiveDateTime,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn starting_at(base: NaiveDateTime) -> Self {
        Self {
            base,
            started: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> NaiveDateTime {
        let elapsed = chrono::Duration::from_std(self.started.elapsed()).unwrap();
        self.base + elapsed
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

pub fn nominal_reading(captured_at: NaiveDateTime) -> SensorReading {
    SensorReading {
        air_temp_c: Some(25.0),
        humidity_pct: Some(55.0),
        vpd_kpa: Some(1.1),
        co2_ppm: Some(800.0),
        soil_moisture_pct: Some(45.0),
        soil_probes: vec![44.0, 46.0],
        leaf_temp_delta_c: None,
        captured_at,
    }
}

pub enum SensorStep {
    Reading(SensorReading),
    Unavailable,
    Malformed,
    Hang,
}

/// Plays back scripted steps, then repeats a fixed reading.
pub struct FakeSensor {
    script: Mutex<VecDeque<SensorStep>>,
    steady: Mutex<SensorReading>,
    connectable: AtomicBool,
    pub connect_calls: AtomicUsize,
    pub read_calls: AtomicUsize,
}

impl Default for FakeSensor {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            steady: Mutex::new(nominal_reading(at(12, 0))),
            connectable: AtomicBool::new(true),
            connect_calls: AtomicUsize::new(0),
            read_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeSensor {
    pub fn set_connectable(&self, yes: bool) {
        self.connectable.store(yes, Ordering::SeqCst);
    }

    pub fn set_steady(&self, r: SensorReading) {
        *self.steady.lock() = r;
    }

    pub fn push(&self, step: SensorStep) {
        self.script.lock().push_back(step);
    }

    pub fn connects(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sensor for FakeSensor {
    async fn connect(&self) -> bool {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connectable.load(Ordering::SeqCst)
    }

    async fn read_all(&self) -> ControlResult<SensorReading> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().pop_front();
        match step {
            Some(SensorStep::Reading(r)) => Ok(r),
            Some(SensorStep::Unavailable) => Err(ControlError::HardwareUnavailable("fake sensor offline".into())),
            Some(SensorStep::Malformed) => Err(ControlError::MalformedData("fake sensor sent garbage".into())),
            Some(SensorStep::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(ControlError::HardwareUnavailable("fake sensor hung".into()))
            }
            None => Ok(self.steady.lock().clone()),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

pub struct FakeActuator {
    state: Mutex<DeviceState>,
    pub commands: Mutex<Vec<(Device, bool)>>,
    pub brightness: Mutex<Vec<u8>>,
    connect_delay: Mutex<Duration>,
    fail_commands: AtomicBool,
    fail_state: AtomicBool,
}

impl Default for FakeActuator {
    fn default() -> Self {
        Self {
            state: Mutex::new(DeviceState::all_off()),
            commands: Mutex::new(Vec::new()),
            brightness: Mutex::new(Vec::new()),
            connect_delay: Mutex::new(Duration::ZERO),
            fail_commands: AtomicBool::new(false),
            fail_state: AtomicBool::new(false),
        }
    }
}

impl FakeActuator {
    pub fn set_connect_delay(&self, d: Duration) {
        *self.connect_delay.lock() = d;
    }

    pub fn fail_commands(&self, yes: bool) {
        self.fail_commands.store(yes, Ordering::SeqCst);
    }

    pub fn fail_state(&self, yes: bool) {
        self.fail_state.store(yes, Ordering::SeqCst);
    }

    /// Force a device state without recording a command.
    pub fn force(&self, device: Device, on: bool) {
        self.state.lock().set(device, on);
    }

    pub fn is_on(&self, device: Device) -> bool {
        self.state.lock().is_on(device)
    }

    pub fn command_log(&self) -> Vec<(Device, bool)> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl Actuator for FakeActuator {
    async fn connect(&self) -> bool {
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        true
    }

    async fn set_device(&self, device: Device, on: bool) -> ControlResult<()> {
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(ControlError::HardwareUnavailable("fake relay offline".into()));
        }
        self.commands.lock().push((device, on));
        self.state.lock().set(device, on);
        Ok(())
    }

    async fn get_state(&self) -> ControlResult<DeviceState> {
        if self.fail_state.load(Ordering::SeqCst) {
            return Err(ControlError::HardwareUnavailable("fake relay offline".into()));
        }
        Ok(self.state.lock().clone())
    }

    async fn set_brightness(&self, pct: u8) -> ControlResult<()> {
        self.brightness.lock().push(pct);
        self.state.lock().light_brightness = Some(pct);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Brain
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBrain {
    pub actions: Mutex<Vec<BrainAction>>,
    pub requests: Mutex<Vec<DecisionRequest>>,
    pub queries: Mutex<Vec<QueryRequest>>,
    fail: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeBrain {
    pub fn propose(&self, actions: Vec<BrainAction>) {
        *self.actions.lock() = actions;
    }

    pub fn fail(&self, yes: bool) {
        self.fail.store(yes, Ordering::SeqCst);
    }

    pub fn set_delay(&self, d: Duration) {
        *self.delay.lock() = d;
    }

    pub fn decisions(&self) -> usize {
        self.requests.lock().len()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Brain for FakeBrain {
    async fn decide(&self, req: &DecisionRequest) -> Result<Decision> {
        self.requests.lock().push(req.clone());
        self.pause().await;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("brain unreachable");
        }
        Ok(Decision {
            output_text: format!("{} decision", req.trigger.as_str()),
            actions: self.actions.lock().clone(),
            tokens_used: 100,
        })
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryReply> {
        self.queries.lock().push(req.clone());
        self.pause().await;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("brain unreachable");
        }
        Ok(QueryReply {
            output_text: format!("answer to: {}", req.query),
            actions: self.actions.lock().clone(),
            tool_rounds: 2,
        })
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    pub readings: Mutex<Vec<(SensorReading, bool)>>,
    pub device_states: Mutex<Vec<DeviceState>>,
    pub decisions: Mutex<Vec<DecisionRecord>>,
    pub water: Mutex<Vec<(NaiveDateTime, f64, String)>>,
    pub stage: Mutex<Option<String>>,
    fail: AtomicBool,
}

impl MemoryStore {
    pub fn with_stage(stage: &str) -> Self {
        let s = Self::default();
        *s.stage.lock() = Some(stage.to_string());
        s
    }

    pub fn fail(&self, yes: bool) {
        self.fail.store(yes, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("disk full");
        }
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn log_sensor_reading(&self, reading: &SensorReading, simulated: bool) -> Result<()> {
        self.check()?;
        self.readings.lock().push((reading.clone(), simulated));
        Ok(())
    }

    async fn log_device_state(&self, state: &DeviceState, _at: NaiveDateTime) -> Result<()> {
        self.check()?;
        self.device_states.lock().push(state.clone());
        Ok(())
    }

    async fn log_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.check()?;
        self.decisions.lock().push(record.clone());
        Ok(())
    }

    async fn log_water_event(&self, at: NaiveDateTime, amount_ml: f64, source: &str) -> Result<()> {
        self.check()?;
        self.water.lock().push((at, amount_ml, source.to_string()));
        Ok(())
    }

    async fn current_stage(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.stage.lock().clone())
    }

    async fn set_stage(&self, stage: &str, _at: NaiveDateTime) -> Result<()> {
        self.check()?;
        *self.stage.lock() = Some(stage.to_string());
        Ok(())
    }

    async fn water_total_for_day(&self, day: NaiveDate) -> Result<WaterDay> {
        self.check()?;
        let water = self.water.lock();
        let today = water.iter().filter(|(t, _, _)| t.date() == day);
        Ok(WaterDay {
            total_ml: today.clone().map(|(_, ml, _)| ml).sum(),
            last_at: today.map(|(t, _, _)| *t).max(),
        })
    }

    async fn recent_decisions(&self, limit: i64) -> Result<Vec<DecisionRecord>> {
        self.check()?;
        let decisions = self.decisions.lock();
        let take = usize::try_from(limit).unwrap_or(0);
        Ok(decisions.iter().rev().take(take).cloned().collect())
    }
}

// ---------------------------------------------------------------------------
// Orchestrator harness
// ---------------------------------------------------------------------------

/// An orchestrator wired to fakes: one sensor slot named "tent", a fake
/// actuator behind the real safe actuator, a fake brain and an in-memory
/// store. The clock stands still unless a test moves it.
pub struct Harness {
    pub orch: Orchestrator,
    pub guardian: Arc<SafetyGuardian>,
    pub hw: Arc<FakeActuator>,
    pub sensor: Arc<FakeSensor>,
    pub brain: Arc<FakeBrain>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(now: NaiveDateTime) -> Self {
        Self::build(now, OrchestratorConfig::default(), MemoryStore::default(), false)
    }

    pub fn with_config(now: NaiveDateTime, cfg: OrchestratorConfig) -> Self {
        Self::build(now, cfg, MemoryStore::default(), false)
    }

    pub fn with_store(now: NaiveDateTime, store: MemoryStore) -> Self {
        Self::build(now, OrchestratorConfig::default(), store, false)
    }

    /// The "tent" slot starts on its simulated fallback.
    pub fn with_simulated_sensor(now: NaiveDateTime) -> Self {
        Self::build(now, OrchestratorConfig::default(), MemoryStore::default(), true)
    }

    fn build(now: NaiveDateTime, cfg: OrchestratorConfig, store: MemoryStore, simulated: bool) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let dyn_clock = Arc::clone(&clock) as Arc<dyn Clock>;
        let guardian = Arc::new(SafetyGuardian::new(
            SafetyLimits::default(),
            DarkPeriodConfig::default(),
            Arc::clone(&dyn_clock),
        ));
        let hw = Arc::new(FakeActuator::default());
        let actuator = Arc::new(SafeActuator::new(
            Arc::clone(&hw) as Arc<dyn Actuator>,
            Arc::clone(&guardian),
            Arc::clone(&dyn_clock),
            PumpSettings {
                ml_per_sec: 10.0,
                max_run: Duration::from_secs(120),
            },
            Duration::from_secs(cfg.device_timeout_secs),
        ));
        let scheduler = PhotoperiodScheduler::new(
            Arc::clone(&actuator) as Arc<dyn LightDriver>,
            Arc::clone(&dyn_clock),
        );

        let sensor = Arc::new(FakeSensor::default());
        let fallback = Arc::new(FakeSensor::default()) as Arc<dyn Sensor>;
        let active = if simulated {
            Resolved {
                handle: Arc::clone(&fallback),
                provenance: Provenance::Simulated,
            }
        } else {
            Resolved {
                handle: Arc::clone(&sensor) as Arc<dyn Sensor>,
                provenance: Provenance::Real,
            }
        };
        let slot = SensorSlot::new(
            "tent",
            Some(Arc::clone(&sensor) as Arc<dyn Sensor>),
            fallback,
            active,
            CircuitBreaker::new(
                cfg.breaker_failure_threshold,
                Duration::from_secs(cfg.breaker_reset_secs),
            ),
        );

        let brain = Arc::new(FakeBrain::default());
        let store = Arc::new(store);
        let orch = Orchestrator::new(OrchestratorParts {
            config: cfg,
            photoperiods: PhotoperiodSettings::default(),
            base_dark_period: DarkPeriodConfig::default(),
            guardian: Arc::clone(&guardian),
            watchdog: Arc::new(Watchdog::new()),
            scheduler,
            actuator,
            actuator_provenance: Provenance::Real,
            sensors: vec![slot],
            brain: Arc::clone(&brain) as Arc<dyn Brain>,
            store: Arc::clone(&store) as Arc<dyn Persistence>,
            clock: dyn_clock,
        });

        Self {
            orch,
            guardian,
            hw,
            sensor,
            brain,
            store,
            clock,
        }
    }
}
