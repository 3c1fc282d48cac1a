//! Light watchdog: compares the grow light against what the photoperiod and
//! the guardian say it should be, and corrects drift. Also reports stale
//! components.

use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Orchestrator, LIGHT_WATCHDOG};
use crate::config::secs;
use crate::hardware::Device;
use crate::watchdog::ComponentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LightCheck {
    NoSchedule,
    InSync,
    Corrected,
    CorrectionFailed,
    StateUnavailable,
}

pub(super) async fn run(orch: Orchestrator, token: CancellationToken) {
    let cfg = &orch.inner.cfg;
    let every = secs(cfg.light_check_interval_secs);
    let stale_after = secs(cfg.stale_after_secs);
    info!(interval_secs = every.as_secs(), "light watchdog started");
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let check = tokio::select! {
            _ = token.cancelled() => break,
            c = orch.check_light() => c,
        };

        let stale = orch.inner.watchdog.get_stale(stale_after);
        if !stale.is_empty() {
            warn!(?stale, "components have gone quiet");
        }

        let status = match check {
            LightCheck::CorrectionFailed | LightCheck::StateUnavailable => ComponentStatus::Degraded,
            _ => ComponentStatus::Ok,
        };
        orch.inner
            .watchdog
            .heartbeat(LIGHT_WATCHDOG, status, &format!("{check:?}"));
    }
    info!("light watchdog stopped");
}

impl Orchestrator {
    /// One comparison of the light against its expected state.
    pub async fn check_light(&self) -> LightCheck {
        let inner = &self.inner;
        let now = inner.clock.now();
        let Some(scheduled) = inner.scheduler.expected_light_on(now) else {
            return LightCheck::NoSchedule;
        };
        let expected = scheduled && inner.guardian.can_turn_on_light(now).allowed;

        let actual = match inner.actuator.get_state().await {
            Ok(state) => state.is_on(Device::GrowLight),
            Err(e) => {
                warn!("light check: device state unavailable: {e}");
                return LightCheck::StateUnavailable;
            }
        };
        if expected == actual {
            return LightCheck::InSync;
        }

        warn!(expected, actual, "grow light out of step with schedule, correcting");
        let brightness = if expected {
            inner.scheduler.config().map(|c| c.intensity_pct)
        } else {
            None
        };
        match inner.actuator.set_light(expected, brightness).await {
            Ok(()) => {
                let mut st = inner.state.write().await;
                st.light_corrections += 1;
                st.record_device(
                    now,
                    format!("light watchdog switched grow light {}", if expected { "on" } else { "off" }),
                );
                LightCheck::Corrected
            }
            Err(e) => {
                error!("light correction failed: {e}");
                LightCheck::CorrectionFailed
            }
        }
    }
}
