//! Photoperiod scheduler: drives the grow light through its daily
//! light/dark cycle.
//!
//! ## State machine
//!
//! ```text
//!            [lights_on time, permit(true)]
//!   Dark ───────────────────────────────────▶ Light
//!    ▲                                          │
//!    └──────────────────────────────────────────┘
//!            [lights_off time, permit(false)]
//! ```
//!
//! The state is never persisted: it is recomputed from the config and the
//! wall clock on every `start`. Each transition asks the injected
//! [`LightDriver`] for permission first and is skipped (state unchanged)
//! when refused. A driver error is logged and the next scheduled
//! transition tries again on its own.
//!
//! Sunset runs `sunset_minutes` ahead of `lights_off` and only dims a light
//! that is already on, so the light is off by the time a dark window opens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{hhmm, Clock};
use crate::safety::{in_window, window_len};

/// A transition that wakes later than this is skipped; the light watchdog
/// reconciles the device instead.
pub const MISFIRE_GRACE: chrono::Duration = chrono::Duration::minutes(5);

/// Upper bound on sunrise/sunset increments.
pub const MAX_RAMP_STEPS: u32 = 30;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

// ---------------------------------------------------------------------------
// Config and derived state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoperiodConfig {
    #[serde(with = "hhmm")]
    pub lights_on: NaiveTime,
    /// Equal to `lights_on` means continuous light.
    #[serde(with = "hhmm")]
    pub lights_off: NaiveTime,
    #[serde(default)]
    pub sunrise_minutes: u32,
    #[serde(default)]
    pub sunset_minutes: u32,
    #[serde(default = "full_intensity")]
    pub intensity_pct: u8,
}

fn full_intensity() -> u8 {
    100
}

fn hm(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap_or(NaiveTime::MIN)
}

impl PhotoperiodConfig {
    /// 18/6 schedule.
    pub fn vegetative() -> Self {
        Self {
            lights_on: hm(6, 0),
            lights_off: hm(0, 0),
            sunrise_minutes: 15,
            sunset_minutes: 15,
            intensity_pct: 100,
        }
    }

    /// 12/12 schedule.
    pub fn flowering() -> Self {
        Self {
            lights_on: hm(6, 0),
            lights_off: hm(18, 0),
            sunrise_minutes: 15,
            sunset_minutes: 15,
            intensity_pct: 100,
        }
    }

    pub fn light_hours(&self) -> f64 {
        if self.lights_on == self.lights_off {
            24.0
        } else {
            window_len(self.lights_on, self.lights_off).num_minutes() as f64 / 60.0
        }
    }
}

pub fn is_light_period(config: &PhotoperiodConfig, t: NaiveTime) -> bool {
    config.lights_on == config.lights_off || in_window(config.lights_on, config.lights_off, t)
}

fn next_occurrence(t: NaiveTime, after: NaiveDateTime) -> NaiveDateTime {
    let today = after.date().and_time(t);
    if today > after {
        today
    } else {
        today + chrono::Duration::days(1)
    }
}

/// Next boundary strictly after `after`, with whether it turns the light on.
/// `None` under continuous light.
pub fn next_transition(config: &PhotoperiodConfig, after: NaiveDateTime) -> Option<(NaiveDateTime, bool)> {
    if config.lights_on == config.lights_off {
        return None;
    }
    let on = next_occurrence(config.lights_on, after);
    let off = next_occurrence(config.lights_off, after);
    if on <= off {
        Some((on, true))
    } else {
        Some((off, false))
    }
}

/// Config for `day` of a `days`-long move from `from` to `to`. The target's
/// on-time anchors the schedule; light hours move linearly.
pub fn interpolate(from: &PhotoperiodConfig, to: &PhotoperiodConfig, day: i64, days: i64) -> PhotoperiodConfig {
    if days <= 0 || day >= days {
        return to.clone();
    }
    let from_h = from.light_hours();
    let to_h = to.light_hours();
    let hours = from_h + (to_h - from_h) * day as f64 / days as f64;
    let minutes = (hours * 60.0).round() as i64;
    let lights_off = to.lights_on + chrono::Duration::minutes(minutes);
    PhotoperiodConfig {
        lights_off,
        ..to.clone()
    }
}

/// Intensity levels and the pause after each, for a ramp of `minutes`.
fn ramp_plan(from: u8, to: u8, minutes: u32) -> Vec<(u8, Duration)> {
    if minutes == 0 {
        return vec![(to, Duration::ZERO)];
    }
    let steps = minutes.min(MAX_RAMP_STEPS).max(1);
    let pause = Duration::from_secs(u64::from(minutes) * 60) / steps;
    (1..=steps)
        .map(|i| {
            let level = f64::from(from) + (f64::from(to) - f64::from(from)) * f64::from(i) / f64::from(steps);
            let pause = if i == steps { Duration::ZERO } else { pause };
            (level.round() as u8, pause)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PhotoperiodState {
    pub is_light_period: bool,
    pub current_intensity: u8,
    pub next_transition: Option<NaiveDateTime>,
    pub next_transition_turns_on: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PhotoperiodStatus {
    pub config: Option<PhotoperiodConfig>,
    pub light_hours: Option<f64>,
    pub state: PhotoperiodState,
    pub transition_active: bool,
}

// ---------------------------------------------------------------------------
// Light driver seam
// ---------------------------------------------------------------------------

/// What the scheduler needs from the outside world: a safety predicate and
/// a way to set the light.
#[async_trait]
pub trait LightDriver: Send + Sync {
    async fn permit(&self, turn_on: bool) -> bool;
    async fn apply(&self, on: bool, intensity_pct: u8) -> anyhow::Result<()>;
    /// Lower the level of a light that is already on.
    async fn dim(&self, intensity_pct: u8) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Inner {
    driver: Arc<dyn LightDriver>,
    clock: Arc<dyn Clock>,
    config: Mutex<Option<PhotoperiodConfig>>,
    state: Mutex<PhotoperiodState>,
    timer: Mutex<Option<CancellationToken>>,
    transition: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct PhotoperiodScheduler {
    inner: Arc<Inner>,
}

impl PhotoperiodScheduler {
    pub fn new(driver: Arc<dyn LightDriver>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                clock,
                config: Mutex::new(None),
                state: Mutex::new(PhotoperiodState::default()),
                timer: Mutex::new(None),
                transition: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> Option<PhotoperiodConfig> {
        self.inner.config.lock().clone()
    }

    pub fn state(&self) -> PhotoperiodState {
        self.inner.state.lock().clone()
    }

    /// What the light should be doing at `now` per the schedule. In the
    /// sunset run-up before lights-off the scheduler's own state wins, since
    /// the light may already be off there.
    pub fn expected_light_on(&self, now: NaiveDateTime) -> Option<bool> {
        let config = self.config()?;
        let sunset = chrono::Duration::minutes(i64::from(config.sunset_minutes));
        let winding_down = matches!(
            next_transition(&config, now),
            Some((at, false)) if at - now <= sunset
        );
        if winding_down {
            return Some(self.inner.state.lock().is_light_period);
        }
        Some(is_light_period(&config, now.time()))
    }

    pub fn status(&self) -> PhotoperiodStatus {
        let config = self.config();
        PhotoperiodStatus {
            light_hours: config.as_ref().map(PhotoperiodConfig::light_hours),
            config,
            state: self.state(),
            transition_active: self.inner.transition.lock().is_some(),
        }
    }

    /// Apply `config` now: drive the light to match the current period and
    /// schedule the following transitions. Cancels any gradual transition.
    pub async fn start(&self, config: PhotoperiodConfig) {
        if let Some(t) = self.inner.transition.lock().take() {
            t.cancel();
        }
        self.start_inner(config).await;
    }

    async fn start_inner(&self, config: PhotoperiodConfig) {
        if let Some(t) = self.inner.timer.lock().take() {
            t.cancel();
        }
        *self.inner.config.lock() = Some(config.clone());

        let now = self.inner.clock.now();
        let light = is_light_period(&config, now.time());
        info!(
            lights_on = %config.lights_on.format("%H:%M"),
            lights_off = %config.lights_off.format("%H:%M"),
            hours = config.light_hours(),
            light,
            "photoperiod started"
        );

        if light {
            self.lights_on(false).await;
        } else {
            self.lights_off(false).await;
        }
        self.refresh_next(now);
        self.spawn_timer(config);
    }

    pub fn stop(&self) {
        if let Some(t) = self.inner.timer.lock().take() {
            t.cancel();
        }
        if let Some(t) = self.inner.transition.lock().take() {
            t.cancel();
        }
    }

    /// Walk light hours from the current config to `target` over `days`,
    /// re-starting once per day with the interpolated schedule.
    pub async fn transition_to(&self, target: PhotoperiodConfig, days: i64) {
        let current = match self.config() {
            Some(c) if days > 0 => c,
            _ => {
                self.start(target).await;
                return;
            }
        };

        let token = CancellationToken::new();
        if let Some(old) = self.inner.transition.lock().replace(token.clone()) {
            old.cancel();
        }
        info!(
            from_hours = current.light_hours(),
            to_hours = target.light_hours(),
            days,
            "photoperiod transition scheduled"
        );

        let this = self.clone();
        tokio::spawn(async move {
            for day in 1..=days {
                if token.is_cancelled() {
                    return;
                }
                let cfg = interpolate(&current, &target, day, days);
                info!(day, days, hours = cfg.light_hours(), "photoperiod transition step");
                this.start_inner(cfg).await;
                if day == days {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(DAY) => {}
                }
            }
            let mut slot = this.inner.transition.lock();
            if slot.as_ref().is_some_and(|t| !t.is_cancelled()) {
                *slot = None;
            }
            info!("photoperiod transition complete");
        });
    }

    fn refresh_next(&self, after: NaiveDateTime) {
        let next = self
            .inner
            .config
            .lock()
            .as_ref()
            .and_then(|c| next_transition(c, after));
        let mut st = self.inner.state.lock();
        st.next_transition = next.map(|(at, _)| at);
        st.next_transition_turns_on = next.map(|(_, on)| on);
    }

    fn spawn_timer(&self, config: PhotoperiodConfig) {
        let token = CancellationToken::new();
        *self.inner.timer.lock() = Some(token.clone());
        let this = self.clone();

        tokio::spawn(async move {
            let mut cursor = this.inner.clock.now();
            loop {
                let now = this.inner.clock.now();
                let from = now.max(cursor);
                let Some((at, turn_on)) = next_transition(&config, from) else {
                    info!("continuous light, no transitions scheduled");
                    return;
                };
                // Sunset starts early so the light is off when the dark period begins.
                let lead = if turn_on {
                    chrono::Duration::zero()
                } else {
                    chrono::Duration::minutes(i64::from(config.sunset_minutes))
                };
                let wait = (at - lead - now).to_std().unwrap_or_default();
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = sleep(wait) => {}
                }
                cursor = at;

                let woke = this.inner.clock.now();
                let late = woke - at;
                if late > MISFIRE_GRACE {
                    warn!(
                        scheduled = %at,
                        late_secs = late.num_seconds(),
                        turn_on,
                        "photoperiod transition missed its grace window, skipping"
                    );
                    this.refresh_next(at);
                    continue;
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = async {
                        if turn_on {
                            this.lights_on(true).await;
                        } else {
                            let secs_left = (at - woke).num_seconds().max(0);
                            let left = ((secs_left + 59) / 60).min(i64::from(config.sunset_minutes));
                            this.switch_off(u32::try_from(left).unwrap_or(0)).await;
                        }
                    } => {}
                }
                this.refresh_next(at);
            }
        });
    }

    /// Returns whether the light ended up on.
    pub(crate) async fn lights_on(&self, ramp: bool) -> bool {
        let inner = &self.inner;
        if !inner.driver.permit(true).await {
            warn!("lights-on transition skipped: safety check refused");
            return false;
        }
        let Some(cfg) = self.config() else {
            return false;
        };
        let minutes = if ramp { cfg.sunrise_minutes } else { 0 };
        for (level, pause) in ramp_plan(0, cfg.intensity_pct, minutes) {
            if let Err(e) = inner.driver.apply(true, level).await {
                error!(level, "lights-on failed: {e:#}");
                return false;
            }
            {
                let mut st = inner.state.lock();
                st.is_light_period = true;
                st.current_intensity = level;
            }
            if !pause.is_zero() {
                sleep(pause).await;
            }
        }
        info!(intensity = cfg.intensity_pct, "lights on");
        true
    }

    /// Returns whether the light ended up off.
    pub(crate) async fn lights_off(&self, ramp: bool) -> bool {
        let minutes = match self.config() {
            Some(cfg) if ramp => cfg.sunset_minutes,
            _ => 0,
        };
        self.switch_off(minutes).await
    }

    /// Dim over `minutes`, then switch off. A failed dimming step cuts the
    /// sunset short; the switch-off still happens.
    async fn switch_off(&self, minutes: u32) -> bool {
        let inner = &self.inner;
        if !inner.driver.permit(false).await {
            warn!("lights-off transition skipped: safety check refused");
            return false;
        }
        let from = inner.state.lock().current_intensity;
        if minutes > 0 && from > 0 {
            let plan = ramp_plan(from, 0, minutes);
            let dimming = plan.len().saturating_sub(1);
            for (level, pause) in plan.into_iter().take(dimming) {
                if let Err(e) = inner.driver.dim(level).await {
                    warn!(level, "sunset step failed, switching off now: {e:#}");
                    break;
                }
                inner.state.lock().current_intensity = level;
                sleep(pause).await;
            }
        }
        if let Err(e) = inner.driver.apply(false, 0).await {
            error!("lights-off failed: {e:#}");
            return false;
        }
        {
            let mut st = inner.state.lock();
            st.is_light_period = false;
            st.current_intensity = 0;
        }
        info!("lights off");
        true
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testkit::{at, at_on, hm, TokioClock};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingDriver {
        refuse: AtomicBool,
        fail: AtomicBool,
        dim_fails: AtomicBool,
        calls: Mutex<Vec<(bool, u8)>>,
        permits: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl LightDriver for RecordingDriver {
        async fn permit(&self, turn_on: bool) -> bool {
            self.permits.lock().push(turn_on);
            !self.refuse.load(Ordering::SeqCst)
        }

        async fn apply(&self, on: bool, intensity_pct: u8) -> anyhow::Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("relay timeout");
            }
            self.calls.lock().push((on, intensity_pct));
            Ok(())
        }

        async fn dim(&self, intensity_pct: u8) -> anyhow::Result<()> {
            if self.dim_fails.load(Ordering::SeqCst) {
                anyhow::bail!("dimmer not responding");
            }
            self.apply(true, intensity_pct).await
        }
    }

    fn scheduler_at(now: NaiveDateTime) -> (PhotoperiodScheduler, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::default());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(now));
        (PhotoperiodScheduler::new(Arc::clone(&driver) as Arc<dyn LightDriver>, clock), driver)
    }

    fn flower() -> PhotoperiodConfig {
        PhotoperiodConfig::flowering()
    }

    // -- Pure helpers -----------------------------------------------------

    #[test]
    fn light_period_same_day_and_overnight() {
        let day = flower();
        assert!(is_light_period(&day, hm(6, 0)));
        assert!(is_light_period(&day, hm(17, 59)));
        assert!(!is_light_period(&day, hm(18, 0)));
        assert!(!is_light_period(&day, hm(3, 0)));

        let night_shift = PhotoperiodConfig {
            lights_on: hm(20, 0),
            lights_off: hm(14, 0),
            ..flower()
        };
        assert!(is_light_period(&night_shift, hm(23, 0)));
        assert!(is_light_period(&night_shift, hm(8, 0)));
        assert!(!is_light_period(&night_shift, hm(16, 0)));
        assert_eq!(night_shift.light_hours(), 18.0);
    }

    #[test]
    fn equal_on_and_off_means_continuous_light() {
        let always = PhotoperiodConfig {
            lights_on: hm(6, 0),
            lights_off: hm(6, 0),
            ..flower()
        };
        assert!(is_light_period(&always, hm(2, 0)));
        assert_eq!(always.light_hours(), 24.0);
        assert!(next_transition(&always, at(12, 0)).is_none());
    }

    #[test]
    fn next_transition_picks_nearest_boundary() {
        assert_eq!(next_transition(&flower(), at(12, 0)), Some((at(18, 0), false)));
        assert_eq!(next_transition(&flower(), at(19, 0)), Some((at_on(2, 6, 0), true)));
        // Exactly on a boundary: the next one, not this one.
        assert_eq!(next_transition(&flower(), at(6, 0)), Some((at(18, 0), false)));
    }

    #[test]
    fn interpolation_moves_light_hours_linearly() {
        let veg = PhotoperiodConfig::vegetative();
        let flo = flower();
        assert_eq!(interpolate(&veg, &flo, 1, 3).light_hours(), 16.0);
        assert_eq!(interpolate(&veg, &flo, 2, 3).light_hours(), 14.0);
        assert_eq!(interpolate(&veg, &flo, 3, 3), flo);
        assert_eq!(interpolate(&veg, &flo, 1, 0), flo);
    }

    #[test]
    fn ramp_is_capped_and_ends_on_target() {
        let plan = ramp_plan(0, 100, 120);
        assert_eq!(plan.len(), MAX_RAMP_STEPS as usize);
        assert_eq!(plan.last().unwrap().0, 100);
        assert!(plan.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(plan[0].1, Duration::from_secs(240));

        let short = ramp_plan(0, 80, 4);
        assert_eq!(short.iter().map(|p| p.0).collect::<Vec<_>>(), vec![20, 40, 60, 80]);
        assert_eq!(ramp_plan(0, 80, 0), vec![(80, Duration::ZERO)]);
    }

    // -- start ------------------------------------------------------------

    #[tokio::test]
    async fn start_inside_light_window_turns_light_on_immediately() {
        let (s, driver) = scheduler_at(at(10, 0));
        s.start(flower()).await;

        assert_eq!(driver.calls.lock().as_slice(), &[(true, 100)]);
        let st = s.state();
        assert!(st.is_light_period);
        assert_eq!(st.current_intensity, 100);
        assert_eq!(st.next_transition, Some(at(18, 0)));
        s.stop();
    }

    #[tokio::test]
    async fn start_inside_dark_window_turns_light_off() {
        let (s, driver) = scheduler_at(at(22, 0));
        s.start(flower()).await;
        assert_eq!(driver.calls.lock().as_slice(), &[(false, 0)]);
        assert!(!s.state().is_light_period);
        assert_eq!(s.expected_light_on(at(22, 0)), Some(false));
        s.stop();
    }

    #[tokio::test]
    async fn start_twice_with_same_config_is_idempotent() {
        let (s, _driver) = scheduler_at(at(10, 0));
        s.start(flower()).await;
        let first = s.state();
        s.start(flower()).await;
        assert_eq!(s.state(), first);
        assert_eq!(s.config(), Some(flower()));
        s.stop();
    }

    #[tokio::test]
    async fn refused_transition_leaves_state_untouched() {
        let (s, driver) = scheduler_at(at(10, 0));
        driver.refuse.store(true, Ordering::SeqCst);
        s.start(flower()).await;

        assert!(driver.calls.lock().is_empty());
        assert_eq!(driver.permits.lock().as_slice(), &[true]);
        assert!(!s.state().is_light_period);
        s.stop();
    }

    #[tokio::test]
    async fn driver_failure_is_contained() {
        let (s, driver) = scheduler_at(at(10, 0));
        driver.fail.store(true, Ordering::SeqCst);
        s.start(flower()).await;
        assert!(!s.state().is_light_period);

        // Recovers on the next attempt.
        driver.fail.store(false, Ordering::SeqCst);
        assert!(s.lights_on(false).await);
        assert!(s.state().is_light_period);
        s.stop();
    }

    // -- ramps ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn sunrise_steps_up_to_target() {
        let (s, driver) = scheduler_at(at(10, 0));
        let cfg = PhotoperiodConfig {
            sunrise_minutes: 5,
            intensity_pct: 50,
            ..flower()
        };
        *s.inner.config.lock() = Some(cfg);
        assert!(s.lights_on(true).await);
        assert_eq!(
            driver.calls.lock().as_slice(),
            &[(true, 10), (true, 20), (true, 30), (true, 40), (true, 50)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sunset_dims_then_switches_off() {
        let (s, driver) = scheduler_at(at(10, 0));
        s.start(PhotoperiodConfig {
            sunset_minutes: 4,
            ..flower()
        })
        .await;
        driver.calls.lock().clear();

        assert!(s.lights_off(true).await);
        assert_eq!(
            driver.calls.lock().as_slice(),
            &[(true, 75), (true, 50), (true, 25), (false, 0)]
        );
        assert_eq!(s.state().current_intensity, 0);
        s.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dimming_still_switches_off() {
        let (s, driver) = scheduler_at(at(10, 0));
        s.start(PhotoperiodConfig {
            sunset_minutes: 4,
            ..flower()
        })
        .await;
        driver.calls.lock().clear();
        driver.dim_fails.store(true, Ordering::SeqCst);

        assert!(s.lights_off(true).await);
        assert_eq!(driver.calls.lock().as_slice(), &[(false, 0)]);
        assert!(!s.state().is_light_period);
        s.stop();
    }

    #[tokio::test]
    async fn sunset_run_up_follows_the_scheduler_state() {
        let (s, _driver) = scheduler_at(at(17, 50));
        *s.inner.config.lock() = Some(flower());
        assert!(s.lights_on(false).await);
        assert_eq!(s.expected_light_on(at(17, 50)), Some(true));

        assert!(s.lights_off(false).await);
        assert_eq!(s.expected_light_on(at(17, 55)), Some(false));
        assert_eq!(s.expected_light_on(at(12, 0)), Some(true));
        assert_eq!(s.expected_light_on(at(19, 0)), Some(false));
    }

    // -- timers -----------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn timer_fires_at_the_configured_boundary() {
        let driver = Arc::new(RecordingDriver::default());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(5, 58)));
        let s = PhotoperiodScheduler::new(Arc::clone(&driver) as Arc<dyn LightDriver>, clock);
        s.start(PhotoperiodConfig {
            sunrise_minutes: 0,
            ..flower()
        })
        .await;
        assert_eq!(driver.calls.lock().as_slice(), &[(false, 0)]);

        sleep(Duration::from_secs(3 * 60)).await;
        assert_eq!(driver.calls.lock().last(), Some(&(true, 100)));
        assert!(s.state().is_light_period);
        assert_eq!(s.state().next_transition, Some(at(18, 0)));
        s.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn sunset_ends_before_lights_off_time() {
        let driver = Arc::new(RecordingDriver::default());
        let clock: Arc<dyn Clock> = Arc::new(TokioClock::starting_at(at(17, 40)));
        let s = PhotoperiodScheduler::new(Arc::clone(&driver) as Arc<dyn LightDriver>, clock);
        s.start(PhotoperiodConfig {
            sunset_minutes: 4,
            ..flower()
        })
        .await;
        assert_eq!(driver.calls.lock().as_slice(), &[(true, 100)]);

        sleep(Duration::from_secs(15 * 60)).await;
        assert_eq!(driver.calls.lock().len(), 1, "sunset began before 17:56");

        // 18:00: dimmed from 17:56 and already off.
        sleep(Duration::from_secs(5 * 60)).await;
        assert_eq!(
            driver.calls.lock().as_slice(),
            &[(true, 100), (true, 75), (true, 50), (true, 25), (false, 0)]
        );
        assert!(!s.state().is_light_period);
        assert_eq!(s.state().next_transition, Some(at_on(2, 6, 0)));
        s.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn wakeup_past_the_grace_window_skips_the_transition() {
        let driver = Arc::new(RecordingDriver::default());
        let clock = Arc::new(ManualClock::new(at(5, 58)));
        let s = PhotoperiodScheduler::new(
            Arc::clone(&driver) as Arc<dyn LightDriver>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        s.start(flower()).await;
        assert_eq!(driver.calls.lock().as_slice(), &[(false, 0)]);

        // Let the timer arm its two-minute wait, then have the wall clock
        // jump well past 06:00 (suspend, NTP step).
        sleep(Duration::from_secs(1)).await;
        clock.set(at(6, 10));
        sleep(Duration::from_secs(3 * 60)).await;

        assert_eq!(driver.calls.lock().as_slice(), &[(false, 0)]);
        assert!(!s.state().is_light_period);
        assert_eq!(s.state().next_transition, Some(at(18, 0)));
        s.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn wakeup_inside_the_grace_window_still_fires() {
        let driver = Arc::new(RecordingDriver::default());
        let clock = Arc::new(ManualClock::new(at(5, 58)));
        let s = PhotoperiodScheduler::new(
            Arc::clone(&driver) as Arc<dyn LightDriver>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        s.start(flower()).await;

        sleep(Duration::from_secs(1)).await;
        clock.set(at(6, 3));
        sleep(Duration::from_secs(3 * 60)).await;

        assert!(driver.calls.lock().len() > 1);
        assert!(s.state().is_light_period);
        s.stop();
    }

    // -- transition_to ----------------------------------------------------

    #[tokio::test]
    async fn transition_without_config_starts_immediately() {
        let (s, driver) = scheduler_at(at(10, 0));
        s.transition_to(flower(), 7).await;
        assert_eq!(s.config(), Some(flower()));
        assert_eq!(driver.calls.lock().len(), 1);
        s.stop();
    }

    #[tokio::test]
    async fn transition_with_zero_days_starts_immediately() {
        let (s, _driver) = scheduler_at(at(10, 0));
        s.start(PhotoperiodConfig::vegetative()).await;
        s.transition_to(flower(), 0).await;
        assert_eq!(s.config(), Some(flower()));
        assert!(!s.status().transition_active);
        s.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn transition_steps_once_per_day() {
        let (s, _driver) = scheduler_at(at(10, 0));
        s.start(PhotoperiodConfig::vegetative()).await;
        s.transition_to(flower(), 3).await;

        sleep(Duration::from_secs(1)).await;
        assert_eq!(s.config().unwrap().light_hours(), 16.0);
        assert!(s.status().transition_active);

        sleep(DAY).await;
        assert_eq!(s.config().unwrap().light_hours(), 14.0);

        sleep(DAY).await;
        assert_eq!(s.config(), Some(flower()));
        assert!(!s.status().transition_active);
        s.stop();
    }
}
