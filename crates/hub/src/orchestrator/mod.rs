//! Runs the tent: a sensor loop, a scheduled decision loop, a reactive
//! decision loop fed by anomalies, and a light watchdog. All four share one
//! cancellation token and one safe actuator.

pub mod breaker;
mod decisions;
mod light;
mod sensors;

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::brain::Brain;
use crate::clock::Clock;
use crate::config::{is_flowering, secs, OperationMode, OrchestratorConfig, PhotoperiodSettings};
use crate::db::Persistence;
use crate::error::{with_timeout, ControlError, ControlResult};
use crate::facade::SafeActuator;
use crate::hardware::{DeviceState, Provenance, SensorReading};
use crate::photoperiod::{PhotoperiodScheduler, PhotoperiodStatus};
use crate::safety::{DarkPeriodConfig, SafetyGuardian, SafetyStatus};
use crate::state::{RuntimeState, SharedState, SourceStats, SystemEvent};
use crate::watchdog::{ComponentReport, Watchdog};

pub use decisions::{ActionOutcome, AnomalyQueue, AnomalyTrigger, DecisionOutcome, QueryOutcome};
pub use light::LightCheck;
pub use sensors::SensorSlot;

use sensors::SensorBank;

const SENSOR_LOOP: &str = "sensor_loop";
const DECISION_LOOP: &str = "decision_loop";
const REACTIVE_LOOP: &str = "reactive_loop";
const LIGHT_WATCHDOG: &str = "light_watchdog";

/// Everything the orchestrator is wired to. Built by `main` (or a test).
pub struct OrchestratorParts {
    pub config: OrchestratorConfig,
    pub photoperiods: PhotoperiodSettings,
    /// Dark window used outside flowering.
    pub base_dark_period: DarkPeriodConfig,
    pub guardian: Arc<SafetyGuardian>,
    pub watchdog: Arc<Watchdog>,
    pub scheduler: PhotoperiodScheduler,
    pub actuator: Arc<SafeActuator>,
    pub actuator_provenance: Provenance,
    pub sensors: Vec<SensorSlot>,
    pub brain: Arc<dyn Brain>,
    pub store: Arc<dyn Persistence>,
    pub clock: Arc<dyn Clock>,
}

struct Running {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

struct Inner {
    cfg: OrchestratorConfig,
    photoperiods: PhotoperiodSettings,
    base_dark: DarkPeriodConfig,
    guardian: Arc<SafetyGuardian>,
    watchdog: Arc<Watchdog>,
    scheduler: PhotoperiodScheduler,
    actuator: Arc<SafeActuator>,
    actuator_provenance: Provenance,
    brain: Arc<dyn Brain>,
    store: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    bank: tokio::sync::Mutex<SensorBank>,
    state: SharedState,
    anomalies: AnomalyQueue,
    anomaly_rx: parking_lot::Mutex<Option<mpsc::Receiver<AnomalyTrigger>>>,
    /// Serializes brain turns so two decisions never act at once.
    decision_lock: tokio::sync::Mutex<()>,
    running: parking_lot::Mutex<Option<Running>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Intervals {
    pub sensor_secs: u64,
    pub decision_secs: u64,
    pub reactive_cooldown_secs: u64,
    pub light_check_secs: u64,
}

#[derive(Clone, Serialize)]
pub struct HardwareStatus {
    pub actuator: Provenance,
    pub sensors: BTreeMap<String, SourceStats>,
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyStats {
    pub pending: usize,
    pub dropped: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionStats {
    pub total: u64,
    pub failures: u64,
    pub reactive_skipped: u64,
}

#[derive(Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub mode: OperationMode,
    pub uptime_secs: u64,
    pub intervals: Intervals,
    pub last_poll_age_secs: Option<u64>,
    /// No complete reading for three sensor intervals while running.
    pub is_stalled: bool,
    pub hardware: HardwareStatus,
    pub safety: SafetyStatus,
    pub photoperiod: PhotoperiodStatus,
    pub components: Vec<ComponentReport>,
    pub stale_components: Vec<String>,
    pub anomalies: AnomalyStats,
    pub decisions: DecisionStats,
    pub light_corrections: u64,
    pub last_reading: Option<SensorReading>,
    pub last_devices: Option<DeviceState>,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

impl Orchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let cfg = parts.config;
        let (anomalies, rx) = AnomalyQueue::new(cfg.anomaly_queue_capacity);

        let mut state = RuntimeState::new();
        for slot in &parts.sensors {
            state.register_source(slot.name(), slot.provenance());
        }

        let sensor_every = secs(cfg.sensor_interval_secs);
        parts.watchdog.register(SENSOR_LOOP, sensor_every * 3);
        parts.watchdog.register(
            DECISION_LOOP,
            secs(cfg.decision_warmup_secs) + secs(cfg.decision_interval_secs) * 2,
        );
        parts.watchdog.register(REACTIVE_LOOP, secs(cfg.stale_after_secs));
        parts
            .watchdog
            .register(LIGHT_WATCHDOG, secs(cfg.light_check_interval_secs) * 3);

        parts
            .guardian
            .register_emergency_callback(emergency_all_off(Arc::downgrade(&parts.actuator)));

        Self {
            inner: Arc::new(Inner {
                bank: tokio::sync::Mutex::new(SensorBank::new(parts.sensors)),
                photoperiods: parts.photoperiods,
                base_dark: parts.base_dark_period,
                guardian: parts.guardian,
                watchdog: parts.watchdog,
                scheduler: parts.scheduler,
                actuator: parts.actuator,
                actuator_provenance: parts.actuator_provenance,
                brain: parts.brain,
                store: parts.store,
                clock: parts.clock,
                state: Arc::new(tokio::sync::RwLock::new(state)),
                anomalies,
                anomaly_rx: parking_lot::Mutex::new(Some(rx)),
                decision_lock: tokio::sync::Mutex::new(()),
                running: parking_lot::Mutex::new(None),
                cfg,
            }),
        }
    }

    pub fn guardian(&self) -> &Arc<SafetyGuardian> {
        &self.inner.guardian
    }

    /// Restore persisted state, then spawn the four loops. Calling it on a
    /// running orchestrator does nothing.
    pub async fn start(&self) {
        let token = {
            let mut running = self.inner.running.lock();
            if running.is_some() {
                warn!("orchestrator already running");
                return;
            }
            let token = CancellationToken::new();
            *running = Some(Running {
                token: token.clone(),
                handles: Vec::new(),
            });
            token
        };

        self.restore().await;

        let handles = vec![
            tokio::spawn(sensors::run(self.clone(), token.clone())),
            tokio::spawn(decisions::run_scheduled(self.clone(), token.clone())),
            tokio::spawn(decisions::run_reactive(self.clone(), token.clone())),
            tokio::spawn(light::run(self.clone(), token.clone())),
        ];
        match self.inner.running.lock().as_mut() {
            Some(running) => running.handles = handles,
            // stop() raced us; the token is already cancelled.
            None => handles.iter().for_each(JoinHandle::abort),
        }

        let now = self.inner.clock.now();
        let mut st = self.inner.state.write().await;
        st.running = true;
        st.record_system(now, format!("orchestrator started in {:?} mode", self.inner.cfg.mode));
        info!(mode = ?self.inner.cfg.mode, "orchestrator started");
    }

    /// Cancel every loop, wait for them, stop the light schedule and switch
    /// all devices off.
    pub async fn stop(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };
        info!("orchestrator stopping");
        running.token.cancel();
        for handle in running.handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("orchestrator task panicked: {e}");
                }
            }
        }
        self.inner.scheduler.stop();
        if let Err(e) = self.inner.actuator.all_off().await {
            error!("shutdown all-off incomplete: {e}");
        }

        let now = self.inner.clock.now();
        let mut st = self.inner.state.write().await;
        st.running = false;
        st.record_system(now, "orchestrator stopped".into());
        info!("orchestrator stopped");
    }

    /// Stage from the store (seeding the default on first boot), then
    /// today's water total so restarts cannot reset the daily cap.
    async fn restore(&self) {
        let inner = &self.inner;
        let now = inner.clock.now();
        let stage = match self.load_stage().await {
            Ok(Some(stage)) => stage,
            Ok(None) => {
                let stage = inner.cfg.default_stage.clone();
                info!(stage = %stage, "no growth stage stored, seeding default");
                if let Err(e) = self.store_stage(&stage).await {
                    warn!("could not persist default stage: {e}");
                }
                stage
            }
            Err(e) => {
                warn!("could not load growth stage, using default: {e}");
                inner.cfg.default_stage.clone()
            }
        };
        self.apply_stage(&stage, false).await;

        let today = now.date();
        let loaded = with_timeout("load water total", secs(inner.cfg.db_timeout_secs), async {
            inner.store.water_total_for_day(today).await.map_err(ControlError::from)
        })
        .await;
        match loaded {
            Ok(day) => {
                info!(total_ml = day.total_ml, "restored today's water total");
                inner.guardian.restore_water_today(today, day.total_ml, day.last_at);
            }
            Err(e) => warn!("could not restore today's water total: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Growth stage
    // -----------------------------------------------------------------------

    async fn load_stage(&self) -> ControlResult<Option<String>> {
        let inner = &self.inner;
        with_timeout("load growth stage", secs(inner.cfg.db_timeout_secs), async {
            inner.store.current_stage().await.map_err(ControlError::from)
        })
        .await
    }

    async fn store_stage(&self, stage: &str) -> ControlResult<()> {
        let inner = &self.inner;
        let now = inner.clock.now();
        with_timeout("store growth stage", secs(inner.cfg.db_timeout_secs), async {
            inner.store.set_stage(stage, now).await.map_err(ControlError::from)
        })
        .await
    }

    /// Push a stage into the guardian and the light schedule. `gradual`
    /// walks the photoperiod across the configured transition days.
    async fn apply_stage(&self, stage: &str, gradual: bool) {
        let inner = &self.inner;
        inner.guardian.set_growth_stage(stage);
        let dark = if is_flowering(stage) {
            inner.guardian.limits().flowering_dark_period()
        } else {
            inner.base_dark
        };
        inner.guardian.set_dark_period(dark);

        let target = inner.photoperiods.for_stage(stage).clone();
        if gradual && inner.scheduler.config().is_some() {
            inner
                .scheduler
                .transition_to(target, inner.photoperiods.transition_days)
                .await;
        } else {
            inner.scheduler.start(target).await;
        }

        let now = inner.clock.now();
        inner
            .state
            .write()
            .await
            .record_system(now, format!("growth stage is now '{stage}'"));
        info!(stage, gradual, "growth stage applied");
    }

    /// Persist a new stage and apply it. The photoperiod moves gradually.
    pub async fn set_growth_stage(&self, stage: &str) -> ControlResult<()> {
        let stage = stage.trim();
        if stage.is_empty() {
            return Err(ControlError::MalformedData("growth stage must not be empty".into()));
        }
        self.store_stage(stage).await?;
        self.apply_stage(stage, true).await;
        Ok(())
    }

    /// Re-read the stored stage; an operator may have changed it.
    async fn refresh_stage(&self) {
        match self.load_stage().await {
            Ok(Some(stage)) if stage != self.inner.guardian.growth_stage() => {
                info!(stage = %stage, "stored growth stage changed");
                self.apply_stage(&stage, true).await;
            }
            Ok(_) => {}
            Err(e) => warn!("growth stage refresh failed: {e}"),
        }
    }

    // -----------------------------------------------------------------------
    // Kill switch
    // -----------------------------------------------------------------------

    pub async fn activate_kill_switch(&self, reason: &str) {
        self.inner.guardian.activate_kill_switch(reason);
        let now = self.inner.clock.now();
        self.inner
            .state
            .write()
            .await
            .record_safety(now, format!("kill switch engaged: {reason}"));
    }

    /// Returns whether the token matched.
    pub async fn reset_kill_switch(&self, token: &str) -> bool {
        let ok = self.inner.guardian.deactivate_kill_switch(token);
        if ok {
            let now = self.inner.clock.now();
            self.inner
                .state
                .write()
                .await
                .record_safety(now, "kill switch released".into());
        }
        ok
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn get_status(&self) -> OrchestratorStatus {
        let inner = &self.inner;
        let cfg = &inner.cfg;
        let st = inner.state.read().await;

        let last_poll_age = st.last_poll.map(|t| t.elapsed());
        let since_start = st.started_at.elapsed();
        let quiet_for = last_poll_age.unwrap_or(since_start);
        let is_stalled = st.running && quiet_for > secs(cfg.sensor_interval_secs) * 3;

        OrchestratorStatus {
            running: st.running,
            mode: cfg.mode,
            uptime_secs: since_start.as_secs(),
            intervals: Intervals {
                sensor_secs: cfg.sensor_interval_secs,
                decision_secs: cfg.decision_interval_secs,
                reactive_cooldown_secs: cfg.reactive_cooldown_secs,
                light_check_secs: cfg.light_check_interval_secs,
            },
            last_poll_age_secs: last_poll_age.map(|d| d.as_secs()),
            is_stalled,
            hardware: HardwareStatus {
                actuator: inner.actuator_provenance,
                sensors: st.sources.clone(),
                consecutive_failures: st.consecutive_failures,
                degraded: st.degraded,
                reconnect_attempts: st.reconnect_attempts,
            },
            safety: inner.guardian.status(),
            photoperiod: inner.scheduler.status(),
            components: inner.watchdog.snapshot(),
            stale_components: inner.watchdog.get_stale(secs(cfg.stale_after_secs)),
            anomalies: AnomalyStats {
                pending: inner.anomalies.pending(),
                dropped: inner.anomalies.dropped(),
            },
            decisions: DecisionStats {
                total: st.decisions,
                failures: st.decision_failures,
                reactive_skipped: st.reactive_skipped,
            },
            light_corrections: st.light_corrections,
            last_reading: st.last_reading.clone(),
            last_devices: st.last_devices.clone(),
            events: st.recent_events(),
        }
    }
}

/// Guardian callback: switch everything off on a spawned task. Holds the
/// actuator weakly since the actuator holds the guardian.
fn emergency_all_off(actuator: Weak<SafeActuator>) -> crate::safety::EmergencyCallback {
    Arc::new(move |reason: &str| -> anyhow::Result<()> {
        let actuator = actuator
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("actuator already dropped"))?;
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| anyhow::anyhow!("no runtime for emergency shutdown: {e}"))?;
        let reason = reason.to_string();
        handle.spawn(async move {
            match actuator.all_off().await {
                Ok(()) => warn!(reason = %reason, "emergency shutdown complete"),
                Err(e) => error!(reason = %reason, "emergency shutdown incomplete: {e}"),
            }
        });
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Device;
    use crate::testkit::{at, Harness};

    #[tokio::test]
    async fn start_seeds_default_stage_and_photoperiod() {
        let h = Harness::new(at(12, 0));
        h.orch.start().await;
        assert_eq!(h.store.stage.lock().as_deref(), Some("vegetative"));
        assert_eq!(h.guardian.growth_stage(), "vegetative");
        assert!(h.orch.get_status().await.photoperiod.config.is_some());
        // Midday on an 06:00 schedule: the light came on at start.
        assert!(h.hw.is_on(Device::GrowLight));
        h.orch.stop().await;
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_switches_everything_off() {
        let h = Harness::new(at(12, 0));
        h.orch.start().await;
        h.orch.start().await;
        assert!(h.orch.get_status().await.running);

        h.orch.stop().await;
        assert!(Device::ALL.iter().all(|d| !h.hw.is_on(*d)));
        assert!(!h.orch.get_status().await.running);

        // A second stop is a no-op.
        h.orch.stop().await;
    }

    #[tokio::test]
    async fn restart_restores_water_total() {
        let h = Harness::new(at(12, 0));
        h.store.water.lock().push((at(8, 0), 700.0, "scheduled".into()));
        h.orch.start().await;
        assert_eq!(h.guardian.status().water_today_ml, 700.0);
        h.orch.stop().await;
    }

    #[tokio::test]
    async fn stored_flowering_stage_enforces_flowering_dark_window() {
        let h = Harness::with_store(at(12, 0), crate::testkit::MemoryStore::with_stage("flowering"));
        h.orch.start().await;
        let status = h.guardian.status();
        assert_eq!(status.growth_stage, "flowering");
        assert!(status.dark_period.enabled);
        assert_eq!(status.dark_hours, Some(12.0));
        assert!(!h.guardian.can_turn_on_light(at(20, 0)).allowed);
        h.orch.stop().await;
    }

    #[tokio::test]
    async fn set_growth_stage_persists_and_starts_transition() {
        let h = Harness::new(at(12, 0));
        h.orch.start().await;
        h.orch.set_growth_stage("flowering").await.unwrap();
        assert_eq!(h.store.stage.lock().as_deref(), Some("flowering"));
        assert_eq!(h.guardian.growth_stage(), "flowering");
        assert!(h.orch.get_status().await.photoperiod.transition_active);

        assert!(matches!(
            h.orch.set_growth_stage("  ").await,
            Err(ControlError::MalformedData(_))
        ));
        h.orch.stop().await;
    }

    #[tokio::test]
    async fn guardian_shutdown_switches_devices_off() {
        let h = Harness::new(at(12, 0));
        h.hw.force(Device::HeatMat, true);
        h.hw.force(Device::Humidifier, true);
        h.orch.activate_kill_switch("smoke detected").await;

        // The callback spawns the all-off; let it run.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!h.hw.is_on(Device::HeatMat));
        assert!(!h.hw.is_on(Device::Humidifier));
        assert!(h.orch.get_status().await.safety.kill_switch);

        assert!(!h.orch.reset_kill_switch("wrong").await);
        assert!(h.orch.reset_kill_switch(crate::safety::RESUME_CONFIRMATION).await);
        assert!(!h.guardian.is_kill_switch_active());
    }

    #[tokio::test]
    async fn status_reports_sources_and_watchdog_components() {
        let h = Harness::new(at(12, 0));
        let status = h.orch.get_status().await;
        assert!(status.hardware.sensors.contains_key("tent"));
        assert_eq!(status.hardware.actuator, Provenance::Real);
        let names: Vec<_> = status.components.iter().map(|c| c.name.as_str()).collect();
        for n in [SENSOR_LOOP, DECISION_LOOP, REACTIVE_LOOP, LIGHT_WATCHDOG] {
            assert!(names.contains(&n), "{n} not registered");
        }
        assert!(!status.is_stalled);
        assert_eq!(status.anomalies.pending, 0);
    }
}
