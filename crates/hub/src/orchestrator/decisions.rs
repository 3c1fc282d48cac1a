//! Brain turns: the scheduled loop, the anomaly-driven reactive loop, manual
//! decisions and operator queries. Every proposed action goes through the
//! safe actuator; in monitor mode actions are only recorded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Orchestrator, DECISION_LOOP, REACTIVE_LOOP};
use crate::brain::{BrainAction, DecisionRequest, DecisionTrigger, QueryRequest};
use crate::config::{secs, OperationMode};
use crate::db::DecisionRecord;
use crate::error::{with_timeout, ControlError, ControlResult};
use crate::hardware::{DeviceState, SensorReading};
use crate::watchdog::ComponentStatus;

// ---------------------------------------------------------------------------
// Anomaly queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct AnomalyTrigger {
    pub at: NaiveDateTime,
    pub critical: Vec<String>,
    pub reading: SensorReading,
}

/// Bounded hand-off from the sensor loop to the reactive loop. Offers never
/// block; when full the newest trigger is dropped and counted.
pub struct AnomalyQueue {
    tx: mpsc::Sender<AnomalyTrigger>,
    capacity: usize,
    dropped: AtomicU64,
}

impl AnomalyQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AnomalyTrigger>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            capacity,
            dropped: AtomicU64::new(0),
        };
        (queue, rx)
    }

    /// Returns whether the trigger was queued.
    pub fn offer(&self, trigger: AnomalyTrigger) -> bool {
        match self.tx.try_send(trigger) {
            Ok(()) => true,
            Err(TrySendError::Full(t)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(at = %t.at, dropped, "anomaly queue full, trigger dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("anomaly queue closed, trigger dropped");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.capacity.saturating_sub(self.tx.capacity())
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action: BrainAction,
    pub executed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub trigger: DecisionTrigger,
    pub output_text: String,
    pub actions_taken: Vec<ActionOutcome>,
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub output_text: String,
    pub actions_taken: Vec<ActionOutcome>,
    pub tool_rounds: u32,
}

fn on_off(on: bool) -> &'static str {
    if on {
        "on"
    } else {
        "off"
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

pub(super) async fn run_scheduled(orch: Orchestrator, token: CancellationToken) {
    let cfg = &orch.inner.cfg;
    let warmup = secs(cfg.decision_warmup_secs);
    let every = secs(cfg.decision_interval_secs);
    info!(
        warmup_secs = warmup.as_secs(),
        interval_secs = every.as_secs(),
        "decision loop started"
    );
    orch.inner
        .watchdog
        .heartbeat(DECISION_LOOP, ComponentStatus::Ok, "warming up");

    tokio::select! {
        _ = token.cancelled() => return,
        _ = sleep(warmup) => {}
    }

    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let turn = tokio::select! {
            _ = token.cancelled() => break,
            r = orch.run_decision(DecisionTrigger::Scheduled, Vec::new()) => r,
        };
        report(&orch, DECISION_LOOP, turn);
    }
    info!("decision loop stopped");
}

pub(super) async fn run_reactive(orch: Orchestrator, token: CancellationToken) {
    let Some(mut rx) = orch.inner.anomaly_rx.lock().take() else {
        error!("anomaly receiver already taken, reactive loop not started");
        return;
    };
    let cfg = &orch.inner.cfg;
    let cooldown = secs(cfg.reactive_cooldown_secs);
    let idle_beat = (secs(cfg.stale_after_secs) / 2).max(Duration::from_secs(1));
    info!(cooldown_secs = cooldown.as_secs(), "reactive loop started");
    orch.inner
        .watchdog
        .heartbeat(REACTIVE_LOOP, ComponentStatus::Ok, "idle");

    let mut last_fired: Option<Instant> = None;
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            r = tokio::time::timeout(idle_beat, rx.recv()) => r,
        };
        let trigger = match next {
            Err(_) => {
                orch.inner
                    .watchdog
                    .heartbeat(REACTIVE_LOOP, ComponentStatus::Ok, "idle");
                continue;
            }
            Ok(None) => break,
            Ok(Some(t)) => t,
        };

        if let Some(last) = last_fired {
            let since = last.elapsed();
            if since < cooldown {
                info!(
                    remaining_secs = (cooldown - since).as_secs(),
                    "reactive decision skipped: cooldown"
                );
                orch.inner.state.write().await.reactive_skipped += 1;
                orch.inner
                    .watchdog
                    .heartbeat(REACTIVE_LOOP, ComponentStatus::Ok, "cooldown");
                continue;
            }
        }
        last_fired = Some(Instant::now());

        warn!(critical = ?trigger.critical, "anomaly, requesting reactive decision");
        let turn = tokio::select! {
            _ = token.cancelled() => break,
            r = orch.run_decision(DecisionTrigger::Anomaly, trigger.critical) => r,
        };
        report(&orch, REACTIVE_LOOP, turn);
    }

    // Hand the receiver back so a restarted orchestrator can reuse it.
    *orch.inner.anomaly_rx.lock() = Some(rx);
    info!("reactive loop stopped");
}

fn report(orch: &Orchestrator, component: &str, turn: ControlResult<DecisionOutcome>) {
    match turn {
        Ok(out) => orch.inner.watchdog.heartbeat(
            component,
            ComponentStatus::Ok,
            &format!("{} action(s) proposed", out.actions_taken.len()),
        ),
        Err(e) => {
            error!(component, "decision failed: {e}");
            orch.inner
                .watchdog
                .heartbeat(component, ComponentStatus::Degraded, &e.to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

impl Orchestrator {
    /// Run one decision outside the schedule.
    pub async fn force_ai_decision(&self) -> ControlResult<DecisionOutcome> {
        self.run_decision(DecisionTrigger::Manual, Vec::new()).await
    }

    /// Stored decisions, newest first.
    pub async fn recent_decisions(&self, limit: u32) -> ControlResult<Vec<DecisionRecord>> {
        let inner = &self.inner;
        with_timeout("load decisions", secs(inner.cfg.db_timeout_secs), async {
            inner
                .store
                .recent_decisions(i64::from(limit))
                .await
                .map_err(ControlError::from)
        })
        .await
    }

    pub(super) async fn run_decision(
        &self,
        trigger: DecisionTrigger,
        anomalies: Vec<String>,
    ) -> ControlResult<DecisionOutcome> {
        let inner = &self.inner;
        let _turn = inner.decision_lock.lock().await;

        if trigger != DecisionTrigger::Anomaly {
            self.refresh_stage().await;
        }
        let now = inner.clock.now();
        let (sensors, devices, simulated_sources) = self.context_snapshot().await;
        let growth_stage = inner.guardian.growth_stage();
        let req = DecisionRequest {
            trigger,
            growth_stage: growth_stage.clone(),
            sensors,
            devices,
            simulated_sources,
            actuator_simulated: inner.actuator_provenance == crate::hardware::Provenance::Simulated,
            anomalies,
            safety: inner.guardian.status(),
        };

        let decided = with_timeout("brain decision", secs(inner.cfg.brain_timeout_secs), async {
            inner.brain.decide(&req).await.map_err(ControlError::from)
        })
        .await;
        let decision = match decided {
            Ok(d) => d,
            Err(e) => {
                let mut st = inner.state.write().await;
                st.decision_failures += 1;
                st.record_error(now, format!("{} decision failed: {e}", trigger.as_str()));
                return Err(e);
            }
        };

        let actions_taken = self.execute_actions(&decision.actions, trigger.as_str()).await;
        let executed = actions_taken.iter().filter(|a| a.executed).count();

        let record = DecisionRecord {
            decided_at: now,
            trigger: trigger.as_str().to_string(),
            growth_stage,
            output_text: decision.output_text.clone(),
            actions: serde_json::to_value(&actions_taken).unwrap_or_default(),
            tokens_used: decision.tokens_used,
        };
        let stored = with_timeout("store decision", secs(inner.cfg.db_timeout_secs), async {
            inner.store.log_decision(&record).await.map_err(ControlError::from)
        })
        .await;
        if let Err(e) = stored {
            error!("decision not persisted: {e}");
        }

        inner.state.write().await.record_decision(
            now,
            format!(
                "{}: {} action(s), {} executed",
                trigger.as_str(),
                actions_taken.len(),
                executed
            ),
        );
        info!(
            trigger = trigger.as_str(),
            proposed = actions_taken.len(),
            executed,
            tokens = decision.tokens_used,
            "decision complete"
        );

        Ok(DecisionOutcome {
            trigger,
            output_text: decision.output_text,
            actions_taken,
            tokens_used: decision.tokens_used,
        })
    }

    /// Answer an operator question. Actions the brain proposes while
    /// answering are executed like decision actions.
    pub async fn handle_interactive_query(
        &self,
        query: &str,
        context: Option<String>,
    ) -> ControlResult<QueryOutcome> {
        let inner = &self.inner;
        if query.trim().is_empty() {
            return Err(ControlError::MalformedData("query must not be empty".into()));
        }
        let _turn = inner.decision_lock.lock().await;

        let (sensors, devices, simulated_sources) = self.context_snapshot().await;
        let req = QueryRequest {
            query: query.to_string(),
            context,
            growth_stage: inner.guardian.growth_stage(),
            sensors,
            devices,
            simulated_sources,
        };
        let reply = with_timeout("brain query", secs(inner.cfg.brain_timeout_secs), async {
            inner.brain.query(&req).await.map_err(ControlError::from)
        })
        .await?;

        let actions_taken = self.execute_actions(&reply.actions, "query").await;
        let now = inner.clock.now();
        inner.state.write().await.record_system(
            now,
            format!("query answered, {} action(s) proposed", actions_taken.len()),
        );
        Ok(QueryOutcome {
            output_text: reply.output_text,
            actions_taken,
            tool_rounds: reply.tool_rounds,
        })
    }

    /// Last reading, a fresh device state (cached on failure) and the
    /// sources whose readings are synthetic.
    async fn context_snapshot(&self) -> (Option<SensorReading>, Option<DeviceState>, Vec<String>) {
        let inner = &self.inner;
        let fresh = match inner.actuator.get_state().await {
            Ok(d) => Some(d),
            Err(e) => {
                warn!("device state unavailable for decision context: {e}");
                None
            }
        };
        let st = inner.state.read().await;
        (
            st.last_reading.clone(),
            fresh.or_else(|| st.last_devices.clone()),
            st.simulated_sources(),
        )
    }

    async fn execute_actions(&self, actions: &[BrainAction], source: &str) -> Vec<ActionOutcome> {
        let inner = &self.inner;
        let mut outcomes = Vec::with_capacity(actions.len());
        for action in actions {
            if inner.cfg.mode == OperationMode::Monitor {
                info!(?action, "monitor mode: action recorded, not executed");
                let detail = match action {
                    BrainAction::Water { amount_ml } => {
                        let verdict = inner.guardian.can_water(*amount_ml, inner.clock.now());
                        format!("monitor mode ({})", verdict.reason)
                    }
                    _ => "monitor mode".into(),
                };
                outcomes.push(ActionOutcome {
                    action: action.clone(),
                    executed: false,
                    detail,
                });
                continue;
            }

            let result = match action {
                BrainAction::SetDevice { device, on } => inner
                    .actuator
                    .set_device(*device, *on)
                    .await
                    .map(|()| format!("{device} {}", on_off(*on))),
                BrainAction::SetLight { on, brightness } => inner
                    .actuator
                    .set_light(*on, *brightness)
                    .await
                    .map(|()| format!("grow_light {}", on_off(*on))),
                BrainAction::Water { amount_ml } => match inner.actuator.water(*amount_ml).await {
                    Ok(receipt) => {
                        self.log_water(receipt.amount_ml, source).await;
                        Ok(format!(
                            "watered {:.0}ml over {:.1}s",
                            receipt.amount_ml, receipt.pump_secs
                        ))
                    }
                    Err(e) => Err(e),
                },
            };

            let now = inner.clock.now();
            let outcome = match result {
                Ok(detail) => {
                    inner
                        .state
                        .write()
                        .await
                        .record_device(now, format!("{source}: {detail}"));
                    ActionOutcome {
                        action: action.clone(),
                        executed: true,
                        detail,
                    }
                }
                Err(e) if e.is_safety() => {
                    warn!(?action, "action blocked by safety: {e}");
                    inner
                        .state
                        .write()
                        .await
                        .record_safety(now, format!("{source} action blocked: {e}"));
                    ActionOutcome {
                        action: action.clone(),
                        executed: false,
                        detail: format!("blocked: {e}"),
                    }
                }
                Err(e) => {
                    error!(?action, "action failed: {e}");
                    ActionOutcome {
                        action: action.clone(),
                        executed: false,
                        detail: format!("failed: {e}"),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn log_water(&self, amount_ml: f64, source: &str) {
        let inner = &self.inner;
        let now = inner.clock.now();
        let stored = with_timeout("store water event", secs(inner.cfg.db_timeout_secs), async {
            inner
                .store
                .log_water_event(now, amount_ml, source)
                .await
                .map_err(ControlError::from)
        })
        .await;
        if let Err(e) = stored {
            error!(amount_ml, "water event not persisted: {e}");
        }
    }
}
