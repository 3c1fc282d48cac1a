//! Sensor loop: read every source, merge, persist, then hand the reading to
//! the guardian. Tracks consecutive hardware failures and escalates to a
//! reconnect with exponential backoff, then to degraded polling.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::breaker::CircuitBreaker;
use super::{AnomalyTrigger, Orchestrator, SENSOR_LOOP};
use crate::config::secs;
use crate::error::{with_timeout, ControlError};
use crate::hardware::{probe, Provenance, Resolved, Sensor, SensorReading, MAX_SOIL_PROBES};
use crate::safety::EnvironmentCheck;
use crate::watchdog::ComponentStatus;

/// One named reading source. `primary` is the real device (if configured);
/// `fallback` serves readings while the primary is unreachable.
pub struct SensorSlot {
    name: String,
    primary: Option<Arc<dyn Sensor>>,
    fallback: Arc<dyn Sensor>,
    active: Resolved<Arc<dyn Sensor>>,
    breaker: CircuitBreaker,
}

impl SensorSlot {
    pub fn new(
        name: &str,
        primary: Option<Arc<dyn Sensor>>,
        fallback: Arc<dyn Sensor>,
        active: Resolved<Arc<dyn Sensor>>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            name: name.to_string(),
            primary,
            fallback,
            active,
            breaker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn provenance(&self) -> Provenance {
        self.active.provenance
    }

    fn use_primary(&mut self, primary: Arc<dyn Sensor>) {
        self.active = Resolved {
            handle: primary,
            provenance: Provenance::Real,
        };
        self.breaker.reset();
    }

    fn use_fallback(&mut self) {
        self.active = Resolved {
            handle: Arc::clone(&self.fallback),
            provenance: Provenance::Simulated,
        };
        self.breaker.reset();
    }
}

/// Sensor-loop-owned failure bookkeeping.
pub(super) struct SensorBank {
    pub(super) slots: Vec<SensorSlot>,
    pub(super) cycle: u64,
    pub(super) consecutive_failures: u32,
    pub(super) degraded: bool,
    pub(super) degraded_cycles: u32,
}

impl SensorBank {
    pub(super) fn new(slots: Vec<SensorSlot>) -> Self {
        Self {
            slots,
            cycle: 0,
            consecutive_failures: 0,
            degraded: false,
            degraded_cycles: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(super) enum CycleOutcome {
    Complete { check_ok: bool },
    Partial { missing: Vec<&'static str> },
}

enum SlotRead {
    Ok(SensorReading),
    Failed(ControlError),
    Skipped,
}

/// Timeouts, unreachable hardware and open circuits count toward the
/// reconnect threshold; malformed data does not.
fn is_hardware_failure(e: &ControlError) -> bool {
    matches!(e, ControlError::Timeout { .. } | ControlError::HardwareUnavailable(_))
}

/// `base * 2^(attempt-1)`, capped.
pub(super) fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// First source wins for scalar fields. Probes are concatenated up to the
/// probe limit; soil moisture is the mean of reported values, else of probes.
pub(super) fn merge_readings(readings: &[SensorReading], at: NaiveDateTime) -> SensorReading {
    let mut out = SensorReading::empty(at);
    let mut soil = Vec::new();
    for r in readings {
        out.air_temp_c = out.air_temp_c.or(r.air_temp_c);
        out.humidity_pct = out.humidity_pct.or(r.humidity_pct);
        out.vpd_kpa = out.vpd_kpa.or(r.vpd_kpa);
        out.co2_ppm = out.co2_ppm.or(r.co2_ppm);
        out.leaf_temp_delta_c = out.leaf_temp_delta_c.or(r.leaf_temp_delta_c);
        soil.extend(r.soil_moisture_pct);
        let room = MAX_SOIL_PROBES.saturating_sub(out.soil_probes.len());
        out.soil_probes.extend(r.soil_probes.iter().take(room));
    }
    out.soil_moisture_pct = mean(&soil).or_else(|| mean(&out.soil_probes));
    out
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub(super) async fn run(orch: Orchestrator, token: CancellationToken) {
    let every = secs(orch.inner.cfg.sensor_interval_secs);
    info!(interval_secs = every.as_secs(), "sensor loop started");
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let mut bank = orch.inner.bank.lock().await;
        tokio::select! {
            _ = token.cancelled() => break,
            outcome = orch.sensor_cycle(&mut bank) => debug!(?outcome, "sensor cycle done"),
        }
    }
    info!("sensor loop stopped");
}

impl Orchestrator {
    pub(super) async fn sensor_cycle(&self, bank: &mut SensorBank) -> CycleOutcome {
        let inner = &self.inner;
        let cfg = &inner.cfg;
        bank.cycle += 1;

        if cfg.reprobe_every_cycles > 0 && bank.cycle % cfg.reprobe_every_cycles == 0 {
            self.reprobe(bank).await;
        }

        if bank.degraded {
            bank.degraded_cycles += 1;
            if bank.degraded_cycles >= cfg.degraded_reset_cycles {
                info!(
                    cycles = bank.degraded_cycles,
                    "degraded polling: resetting failure counter for another recovery attempt"
                );
                bank.degraded = false;
                bank.degraded_cycles = 0;
                bank.consecutive_failures = 0;
            }
        }

        // ── Read ──────────────────────────────────────────────────
        let now = inner.clock.now();
        let mut readings = Vec::with_capacity(bank.slots.len());
        let mut failing = Vec::new();
        for (i, slot) in bank.slots.iter_mut().enumerate() {
            match self.read_slot(slot, now).await {
                SlotRead::Ok(r) => readings.push(r),
                SlotRead::Failed(e) if is_hardware_failure(&e) => failing.push(i),
                SlotRead::Failed(_) => {}
                SlotRead::Skipped => failing.push(i),
            }
        }

        // ── Escalate ──────────────────────────────────────────────
        if !failing.is_empty() {
            bank.consecutive_failures += 1;
            warn!(
                failures = bank.consecutive_failures,
                threshold = cfg.reconnect_threshold,
                "sensor cycle had hardware failures"
            );
            if bank.consecutive_failures >= cfg.reconnect_threshold && !bank.degraded {
                if self.reconnect(bank, &failing).await {
                    bank.consecutive_failures = 0;
                } else {
                    warn!("reconnect exhausted, entering degraded polling");
                    bank.degraded = true;
                    bank.degraded_cycles = 0;
                }
            }
        } else if !readings.is_empty() {
            bank.consecutive_failures = 0;
        }
        {
            let mut st = inner.state.write().await;
            st.consecutive_failures = bank.consecutive_failures;
            st.degraded = bank.degraded;
        }

        // ── Validate ──────────────────────────────────────────────
        let merged = merge_readings(&readings, now).with_derived_vpd();
        let Some(core) = merged.core() else {
            let missing = merged.missing_core_fields();
            warn!(?missing, "incomplete reading, skipping persistence and safety checks");
            inner.watchdog.heartbeat(
                SENSOR_LOOP,
                ComponentStatus::Degraded,
                &format!("incomplete reading: missing {}", missing.join(", ")),
            );
            return CycleOutcome::Partial { missing };
        };

        // ── Persist ───────────────────────────────────────────────
        let simulated = bank.slots.iter().any(|s| s.active.is_simulated());
        self.persist_reading(&merged, simulated).await;
        let devices = self.snapshot_devices(now).await;
        inner
            .state
            .write()
            .await
            .record_reading(merged.clone(), devices);

        // ── Check & act ───────────────────────────────────────────
        let check = inner.guardian.check_environment(
            core.air_temp_c,
            core.humidity_pct,
            merged.co2_ppm,
            Some(core.vpd_kpa),
        );
        inner.guardian.note_environment(&check, now);
        if !check.ok {
            self.respond_to_critical(&check, merged, now).await;
        }

        let status = if bank.degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Ok
        };
        inner.watchdog.heartbeat(
            SENSOR_LOOP,
            status,
            &format!("cycle {} ({} source(s))", bank.cycle, readings.len()),
        );
        CycleOutcome::Complete { check_ok: check.ok }
    }

    async fn read_slot(&self, slot: &mut SensorSlot, now: NaiveDateTime) -> SlotRead {
        let inner = &self.inner;
        let provenance = slot.active.provenance;
        if slot.breaker.is_open() {
            debug!(source = %slot.name, "circuit open, skipping read");
            inner
                .state
                .write()
                .await
                .record_source_skipped(&slot.name, provenance, slot.breaker.state());
            return SlotRead::Skipped;
        }

        let what = format!("sensor read ({})", slot.name);
        let result = with_timeout(
            &what,
            secs(inner.cfg.sensor_timeout_secs),
            slot.active.handle.read_all(),
        )
        .await;
        match result {
            Ok(reading) => {
                slot.breaker.record_success();
                inner.state.write().await.record_source_ok(
                    &slot.name,
                    provenance,
                    slot.breaker.state(),
                    now,
                );
                SlotRead::Ok(reading)
            }
            Err(e) => {
                if is_hardware_failure(&e) {
                    slot.breaker.record_failure();
                }
                warn!(source = %slot.name, "sensor read failed: {e}");
                inner.state.write().await.record_source_failure(
                    &slot.name,
                    provenance,
                    slot.breaker.state(),
                    &e,
                );
                SlotRead::Failed(e)
            }
        }
    }

    /// Retry failing slots' real sensors with exponential backoff. Slots
    /// whose primary never comes back are switched to their fallback.
    async fn reconnect(&self, bank: &mut SensorBank, failing: &[usize]) -> bool {
        let inner = &self.inner;
        let cfg = &inner.cfg;
        let connect_timeout = secs(cfg.connect_timeout_secs);
        let base = secs(cfg.reconnect_base_secs);
        let cap = secs(cfg.reconnect_max_secs);

        for attempt in 1..=cfg.max_reconnect_attempts {
            let delay = backoff_delay(attempt, base, cap);
            info!(
                attempt,
                max = cfg.max_reconnect_attempts,
                delay_secs = delay.as_secs(),
                "reconnecting sensors"
            );
            inner.state.write().await.reconnect_attempts += 1;
            sleep(delay).await;

            let mut all_back = true;
            for &i in failing {
                let Some(slot) = bank.slots.get_mut(i) else { continue };
                let Some(primary) = slot.primary.clone() else { continue };
                if probe(&slot.name, connect_timeout, primary.connect()).await {
                    info!(source = %slot.name, attempt, "sensor reconnected");
                    slot.use_primary(primary);
                } else {
                    all_back = false;
                }
            }
            if all_back {
                let now = inner.clock.now();
                inner
                    .state
                    .write()
                    .await
                    .record_system(now, format!("sensors reconnected after {attempt} attempt(s)"));
                return true;
            }
        }

        let now = inner.clock.now();
        let mut st = inner.state.write().await;
        for &i in failing {
            let Some(slot) = bank.slots.get_mut(i) else { continue };
            if slot.primary.is_some() && !slot.active.is_simulated() {
                warn!(source = %slot.name, "real sensor unreachable, switching to simulated readings");
                slot.use_fallback();
                st.register_source(&slot.name, Provenance::Simulated);
            }
        }
        st.record_error(
            now,
            format!("sensor reconnect failed after {} attempt(s)", cfg.max_reconnect_attempts),
        );
        false
    }

    /// Give simulated slots another chance at their real sensor.
    async fn reprobe(&self, bank: &mut SensorBank) {
        let inner = &self.inner;
        let timeout = secs(inner.cfg.connect_timeout_secs);
        for slot in bank.slots.iter_mut().filter(|s| s.active.is_simulated()) {
            let Some(primary) = slot.primary.clone() else { continue };
            if probe(&slot.name, timeout, primary.connect()).await {
                info!(source = %slot.name, "real sensor is back, leaving simulation");
                slot.use_primary(primary);
                let now = inner.clock.now();
                let mut st = inner.state.write().await;
                st.register_source(&slot.name, Provenance::Real);
                st.record_system(now, format!("sensor '{}' back on real hardware", slot.name));
            }
        }
    }

    async fn persist_reading(&self, reading: &SensorReading, simulated: bool) {
        let inner = &self.inner;
        let stored = with_timeout("store sensor reading", secs(inner.cfg.db_timeout_secs), async {
            inner
                .store
                .log_sensor_reading(reading, simulated)
                .await
                .map_err(ControlError::from)
        })
        .await;
        if let Err(e) = stored {
            error!("sensor reading not persisted: {e}");
            inner
                .state
                .write()
                .await
                .record_error(reading.captured_at, format!("reading not persisted: {e}"));
        }
    }

    /// Current device state, persisted alongside the reading.
    async fn snapshot_devices(&self, now: NaiveDateTime) -> Option<crate::hardware::DeviceState> {
        let inner = &self.inner;
        let devices = match inner.actuator.get_state().await {
            Ok(d) => d,
            Err(e) => {
                warn!("device state unavailable: {e}");
                return None;
            }
        };
        let stored = with_timeout("store device state", secs(inner.cfg.db_timeout_secs), async {
            inner
                .store
                .log_device_state(&devices, now)
                .await
                .map_err(ControlError::from)
        })
        .await;
        if let Err(e) = stored {
            error!("device state not persisted: {e}");
        }
        Some(devices)
    }

    /// Emergency actions first, then the anomaly trigger, then the kill
    /// switch if the guardian asked for a shutdown.
    async fn respond_to_critical(&self, check: &EnvironmentCheck, reading: SensorReading, now: NaiveDateTime) {
        let inner = &self.inner;
        warn!(critical = ?check.critical, "critical environment");
        for action in &check.actions {
            match inner.actuator.set_device(action.device, action.on).await {
                Ok(()) => {
                    inner.state.write().await.record_safety(
                        now,
                        format!("emergency: {} {}", action.device, if action.on { "on" } else { "off" }),
                    );
                }
                Err(e) if e.is_safety() => warn!(device = %action.device, "emergency action refused: {e}"),
                Err(e) => error!(device = %action.device, "emergency action failed: {e}"),
            }
        }

        inner.anomalies.offer(AnomalyTrigger {
            at: now,
            critical: check.critical.clone(),
            reading,
        });

        if let Some(reason) = &check.shutdown {
            if !inner.guardian.is_kill_switch_active() {
                self.activate_kill_switch(reason).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::hardware::Device;
    use crate::testkit::{at, nominal_reading, Harness, SensorStep};

    fn partial(at: NaiveDateTime) -> SensorReading {
        SensorReading {
            humidity_pct: None,
            vpd_kpa: None,
            ..nominal_reading(at)
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(60);
        let delays: Vec<u64> = (1..=7).map(|n| backoff_delay(n, base, cap).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(backoff_delay(40, base, cap), cap);
    }

    #[test]
    fn merge_takes_first_scalar_and_averages_soil() {
        let a = SensorReading {
            co2_ppm: None,
            soil_moisture_pct: None,
            soil_probes: vec![40.0, 50.0],
            ..nominal_reading(at(12, 0))
        };
        let b = SensorReading {
            air_temp_c: Some(30.0),
            co2_ppm: Some(900.0),
            soil_moisture_pct: None,
            soil_probes: vec![60.0; 7],
            ..nominal_reading(at(12, 0))
        };
        let merged = merge_readings(&[a, b], at(12, 1));
        assert_eq!(merged.air_temp_c, Some(25.0));
        assert_eq!(merged.co2_ppm, Some(900.0));
        assert_eq!(merged.soil_probes.len(), MAX_SOIL_PROBES);
        let expected = (40.0 + 50.0 + 60.0 * 6.0) / 8.0;
        assert_eq!(merged.soil_moisture_pct, Some(expected));
        assert_eq!(merged.captured_at, at(12, 1));
    }

    #[tokio::test]
    async fn complete_reading_is_persisted_with_device_state() {
        let h = Harness::new(at(12, 0));
        let mut bank = h.orch.inner.bank.lock().await;
        let outcome = h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(outcome, CycleOutcome::Complete { check_ok: true });
        assert_eq!(h.store.readings.lock().len(), 1);
        assert!(!h.store.readings.lock()[0].1, "real source flagged as simulated");
        assert_eq!(h.store.device_states.lock().len(), 1);
        assert!(h.orch.get_status().await.last_reading.is_some());
    }

    #[tokio::test]
    async fn partial_reading_is_not_persisted_or_checked() {
        let h = Harness::new(at(12, 0));
        h.sensor.set_steady(SensorReading {
            air_temp_c: Some(45.0),
            ..partial(at(12, 0))
        });
        let mut bank = h.orch.inner.bank.lock().await;
        let outcome = h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(
            outcome,
            CycleOutcome::Partial {
                missing: vec!["humidity_pct", "vpd_kpa"]
            }
        );
        assert!(h.store.readings.lock().is_empty());
        // 45C would have tripped the kill switch had the check run.
        assert!(!h.guardian.is_kill_switch_active());
    }

    #[tokio::test(start_paused = true)]
    async fn three_timeouts_trigger_reconnect_and_reset_counter() {
        let h = Harness::new(at(12, 0));
        for _ in 0..3 {
            h.sensor.push(SensorStep::Hang);
        }
        let mut bank = h.orch.inner.bank.lock().await;
        h.orch.sensor_cycle(&mut bank).await;
        h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(bank.consecutive_failures, 2);
        assert_eq!(h.sensor.connects(), 0);

        h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(h.sensor.connects(), 1, "reconnect not attempted");
        assert_eq!(bank.consecutive_failures, 0);
        assert!(!bank.degraded);

        let status = h.orch.get_status().await;
        assert_eq!(status.hardware.sensors["tent"].timeouts, 3);
        assert_eq!(status.hardware.reconnect_attempts, 1);

        // Next cycle reads normally again.
        let outcome = h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(outcome, CycleOutcome::Complete { check_ok: true });
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_reconnect_degrades_to_simulation() {
        let cfg = OrchestratorConfig {
            max_reconnect_attempts: 2,
            ..OrchestratorConfig::default()
        };
        let h = Harness::with_config(at(12, 0), cfg);
        h.sensor.set_connectable(false);
        for _ in 0..3 {
            h.sensor.push(SensorStep::Unavailable);
        }
        let mut bank = h.orch.inner.bank.lock().await;
        for _ in 0..3 {
            h.orch.sensor_cycle(&mut bank).await;
        }
        assert!(bank.degraded);
        assert_eq!(h.sensor.connects(), 2);
        assert!(bank.slots[0].active.is_simulated());

        let status = h.orch.get_status().await;
        assert!(status.hardware.degraded);
        assert_eq!(status.hardware.sensors["tent"].provenance, Provenance::Simulated);

        // Fallback readings are flagged as simulated when stored.
        h.orch.sensor_cycle(&mut bank).await;
        assert!(h.store.readings.lock().last().unwrap().1);
    }

    #[tokio::test(start_paused = true)]
    async fn degraded_counter_resets_after_configured_cycles() {
        let cfg = OrchestratorConfig {
            max_reconnect_attempts: 1,
            degraded_reset_cycles: 2,
            ..OrchestratorConfig::default()
        };
        let h = Harness::with_config(at(12, 0), cfg);
        h.sensor.set_connectable(false);
        for _ in 0..3 {
            h.sensor.push(SensorStep::Unavailable);
        }
        let mut bank = h.orch.inner.bank.lock().await;
        for _ in 0..3 {
            h.orch.sensor_cycle(&mut bank).await;
        }
        assert!(bank.degraded);
        h.orch.sensor_cycle(&mut bank).await;
        assert!(bank.degraded);
        h.orch.sensor_cycle(&mut bank).await;
        assert!(!bank.degraded);
        assert_eq!(bank.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reprobe_restores_real_sensor() {
        let cfg = OrchestratorConfig {
            max_reconnect_attempts: 1,
            reprobe_every_cycles: 5,
            ..OrchestratorConfig::default()
        };
        let h = Harness::with_config(at(12, 0), cfg);
        h.sensor.set_connectable(false);
        for _ in 0..3 {
            h.sensor.push(SensorStep::Unavailable);
        }
        let mut bank = h.orch.inner.bank.lock().await;
        for _ in 0..3 {
            h.orch.sensor_cycle(&mut bank).await;
        }
        assert!(bank.slots[0].active.is_simulated());

        h.sensor.set_connectable(true);
        h.orch.sensor_cycle(&mut bank).await;
        assert!(bank.slots[0].active.is_simulated());
        h.orch.sensor_cycle(&mut bank).await;
        assert!(!bank.slots[0].active.is_simulated());
    }

    #[tokio::test]
    async fn malformed_data_does_not_count_toward_reconnect() {
        let h = Harness::new(at(12, 0));
        let mut bank = h.orch.inner.bank.lock().await;
        for _ in 0..3 {
            h.sensor.push(SensorStep::Malformed);
        }
        for _ in 0..3 {
            h.orch.sensor_cycle(&mut bank).await;
        }
        assert_eq!(bank.consecutive_failures, 0);
        assert_eq!(h.sensor.connects(), 0);
    }

    #[tokio::test]
    async fn critical_heat_runs_emergency_actions_and_enqueues_anomaly() {
        let h = Harness::new(at(12, 0));
        h.hw.force(Device::HeatMat, true);
        h.sensor.set_steady(SensorReading {
            air_temp_c: Some(36.0),
            ..nominal_reading(at(12, 0))
        });
        let mut bank = h.orch.inner.bank.lock().await;
        let outcome = h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(outcome, CycleOutcome::Complete { check_ok: false });
        assert!(h.hw.is_on(Device::ExhaustFan));
        assert!(!h.hw.is_on(Device::HeatMat));
        assert_eq!(h.orch.get_status().await.anomalies.pending, 1);
        assert!(!h.guardian.is_kill_switch_active());
        assert!(!h.guardian.status().warnings.is_empty());
    }

    #[tokio::test]
    async fn emergency_temperature_engages_kill_switch() {
        let h = Harness::new(at(12, 0));
        h.sensor.set_steady(SensorReading {
            air_temp_c: Some(41.0),
            ..nominal_reading(at(12, 0))
        });
        let mut bank = h.orch.inner.bank.lock().await;
        h.orch.sensor_cycle(&mut bank).await;
        assert!(h.guardian.is_kill_switch_active());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(Device::ALL.iter().all(|d| !h.hw.is_on(*d)));
    }

    #[tokio::test]
    async fn store_failure_does_not_stop_the_cycle() {
        let h = Harness::new(at(12, 0));
        h.store.fail(true);
        let mut bank = h.orch.inner.bank.lock().await;
        let outcome = h.orch.sensor_cycle(&mut bank).await;
        assert_eq!(outcome, CycleOutcome::Complete { check_ok: true });
        let status = h.orch.get_status().await;
        assert!(status.last_reading.is_some());
        assert!(status.events.iter().any(|e| e.detail.contains("not persisted")));
    }
}
