//! Safety guardian: the gate every actuator command and every
//! environmental reading passes through.
//!
//! The guardian is the single writer of [`SafetyState`]. Water checks and
//! the counter update that follows a successful check share one critical
//! section, so concurrent callers can never both squeeze under the daily
//! cap.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::clock::{hhmm, Clock};
use crate::error::{ControlError, ControlResult};
use crate::hardware::Device;

/// Exact string required to release the kill switch.
pub const RESUME_CONFIRMATION: &str = "RESUME-GROW-OPERATIONS";

/// Violation and warning logs keep only the most recent entries.
const LOG_CAPACITY: usize = 100;

// ---------------------------------------------------------------------------
// Limits (configuration)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageWaterLimit {
    pub stage: String,
    pub max_per_event_ml: f64,
    pub max_daily_ml: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyLimits {
    // ── Water ──────────────────────────────────────────────────
    pub max_water_per_event_ml: f64,
    pub max_water_daily_ml: f64,
    pub min_water_interval_minutes: i64,
    /// Stage-keyed caps, matched against the current growth stage.
    pub stage_water: Vec<StageWaterLimit>,

    // ── Temperature (C) ────────────────────────────────────────
    pub temp_critical_low: f64,
    pub temp_warning_low: f64,
    pub temp_warning_high: f64,
    pub temp_critical_high: f64,
    pub temp_emergency_high: f64,

    // ── Humidity (%RH) ─────────────────────────────────────────
    pub humidity_critical_low: f64,
    pub humidity_warning_low: f64,
    pub humidity_warning_high: f64,
    pub humidity_critical_high: f64,

    // ── CO2 (ppm) ──────────────────────────────────────────────
    pub co2_warning_high: f64,
    pub co2_dangerous: f64,
    pub co2_emergency: f64,

    // ── VPD (kPa) ──────────────────────────────────────────────
    pub vpd_critical_low: f64,
    pub vpd_warning_low: f64,
    pub vpd_warning_high: f64,
    pub vpd_critical_high: f64,

    // ── Light envelope for flowering (hour of day) ─────────────
    pub light_on_hour: u32,
    pub light_off_hour: u32,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_water_per_event_ml: 500.0,
            max_water_daily_ml: 1000.0,
            min_water_interval_minutes: 60,
            stage_water: vec![
                StageWaterLimit {
                    stage: "seedling".into(),
                    max_per_event_ml: 100.0,
                    max_daily_ml: 250.0,
                },
                StageWaterLimit {
                    stage: "vegetative".into(),
                    max_per_event_ml: 400.0,
                    max_daily_ml: 1000.0,
                },
                StageWaterLimit {
                    stage: "flowering".into(),
                    max_per_event_ml: 300.0,
                    max_daily_ml: 800.0,
                },
            ],
            temp_critical_low: 15.0,
            temp_warning_low: 18.0,
            temp_warning_high: 30.0,
            temp_critical_high: 35.0,
            temp_emergency_high: 40.0,
            humidity_critical_low: 25.0,
            humidity_warning_low: 35.0,
            humidity_warning_high: 70.0,
            humidity_critical_high: 85.0,
            co2_warning_high: 1500.0,
            co2_dangerous: 2000.0,
            co2_emergency: 5000.0,
            vpd_critical_low: 0.3,
            vpd_warning_low: 0.4,
            vpd_warning_high: 1.6,
            vpd_critical_high: 2.0,
            light_on_hour: 6,
            light_off_hour: 18,
        }
    }
}

impl SafetyLimits {
    /// Caps for `stage`: exact key first, then the first configured key
    /// contained in the stage name, then the defaults.
    pub fn water_caps(&self, stage: &str) -> (f64, f64) {
        let stage = stage.trim().to_ascii_lowercase();
        let exact = self
            .stage_water
            .iter()
            .find(|l| l.stage.to_ascii_lowercase() == stage);
        let matched = exact.or_else(|| {
            self.stage_water
                .iter()
                .find(|l| !l.stage.is_empty() && stage.contains(&l.stage.to_ascii_lowercase()))
        });
        match matched {
            Some(l) => (l.max_per_event_ml, l.max_daily_ml),
            None => (self.max_water_per_event_ml, self.max_water_daily_ml),
        }
    }

    /// Dark window enforced while flowering: lights-off hour to lights-on hour.
    pub fn flowering_dark_period(&self) -> DarkPeriodConfig {
        DarkPeriodConfig {
            enabled: true,
            start: hour(self.light_off_hour),
            end: hour(self.light_on_hour),
        }
    }
}

fn hour(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h % 24, 0, 0).unwrap_or(NaiveTime::MIN)
}

// ---------------------------------------------------------------------------
// Dark period
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DarkPeriodConfig {
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl Default for DarkPeriodConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start: hour(18),
            end: hour(6),
        }
    }
}

impl DarkPeriodConfig {
    /// Window length; `start == end` is an empty window.
    pub fn hours_dark(&self) -> f64 {
        window_len(self.start, self.end).num_minutes() as f64 / 60.0
    }

    /// True if `t` is inside the window, handling windows that span midnight.
    pub fn contains(&self, t: NaiveTime) -> bool {
        in_window(self.start, self.end, t)
    }

    /// Time from `now` until the window ends. Only meaningful inside it.
    pub fn remaining(&self, now: NaiveDateTime) -> Duration {
        let end_today = now.date().and_time(self.end);
        if end_today > now {
            end_today - now
        } else {
            end_today + Duration::days(1) - now
        }
    }
}

/// `[start, end)` on the 24h clock; wraps past midnight when `start > end`.
pub(crate) fn in_window(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    use std::cmp::Ordering;
    match start.cmp(&end) {
        Ordering::Less => start <= t && t < end,
        Ordering::Greater => t >= start || t < end,
        Ordering::Equal => false,
    }
}

pub(crate) fn window_len(start: NaiveTime, end: NaiveTime) -> Duration {
    let d = end - start;
    if d < Duration::zero() {
        d + Duration::days(1)
    } else {
        d
    }
}

fn fmt_duration(d: Duration) -> String {
    let mins = d.num_minutes().max(0);
    format!("{}h {}m", mins / 60, mins % 60)
}

// ---------------------------------------------------------------------------
// Decisions and findings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LightDecision {
    pub allowed: bool,
    pub reason: String,
    /// Minutes until the dark window ends, when that is why we said no.
    pub remaining_dark_minutes: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaterDecision {
    pub allowed: bool,
    pub reason: String,
    pub remaining_today_ml: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EmergencyAction {
    pub device: Device,
    pub on: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnvironmentCheck {
    pub ok: bool,
    pub critical: Vec<String>,
    pub warnings: Vec<String>,
    pub actions: Vec<EmergencyAction>,
    /// Set when a reading is bad enough to warrant the kill switch.
    pub shutdown: Option<String>,
}

impl EnvironmentCheck {
    /// Keeps the first action per device so rules never fight each other.
    fn push_action(&mut self, device: Device, on: bool) {
        if !self.actions.iter().any(|a| a.device == device) {
            self.actions.push(EmergencyAction { device, on });
        }
    }
}

// ---------------------------------------------------------------------------
// Mutable state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SafetyEvent {
    pub at: NaiveDateTime,
    pub message: String,
}

struct SafetyState {
    kill_switch: bool,
    kill_reason: Option<String>,
    kill_at: Option<NaiveDateTime>,
    last_water: Option<NaiveDateTime>,
    water_today_ml: f64,
    water_date: Option<NaiveDate>,
    growth_stage: String,
    dark: DarkPeriodConfig,
    /// Set while the latest environment check wants the light off.
    light_hold: Option<String>,
    violations: VecDeque<SafetyEvent>,
    warnings: VecDeque<SafetyEvent>,
}

impl SafetyState {
    fn roll_over(&mut self, today: NaiveDate) {
        if self.water_date != Some(today) {
            if self.water_date.is_some() {
                info!(%today, previous_ml = self.water_today_ml, "daily water counter reset");
            }
            self.water_date = Some(today);
            self.water_today_ml = 0.0;
        }
    }
}

fn push_bounded(log: &mut VecDeque<SafetyEvent>, at: NaiveDateTime, message: String) {
    if log.len() >= LOG_CAPACITY {
        log.pop_front();
    }
    log.push_back(SafetyEvent { at, message });
}

/// Read-only snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct SafetyStatus {
    pub kill_switch: bool,
    pub kill_reason: Option<String>,
    pub kill_at: Option<NaiveDateTime>,
    pub growth_stage: String,
    pub dark_period: DarkPeriodConfig,
    /// Length of the enforced dark window, when one is enabled.
    pub dark_hours: Option<f64>,
    pub light_hold: Option<String>,
    pub water_today_ml: f64,
    pub water_daily_cap_ml: f64,
    pub last_water: Option<NaiveDateTime>,
    pub violations: Vec<SafetyEvent>,
    pub warnings: Vec<SafetyEvent>,
}

pub type EmergencyCallback = Arc<dyn Fn(&str) -> anyhow::Result<()> + Send + Sync>;

// ---------------------------------------------------------------------------
// Guardian
// ---------------------------------------------------------------------------

pub struct SafetyGuardian {
    limits: SafetyLimits,
    state: Mutex<SafetyState>,
    callbacks: Mutex<Vec<EmergencyCallback>>,
    clock: Arc<dyn Clock>,
}

impl SafetyGuardian {
    pub fn new(limits: SafetyLimits, dark: DarkPeriodConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            limits,
            state: Mutex::new(SafetyState {
                kill_switch: false,
                kill_reason: None,
                kill_at: None,
                last_water: None,
                water_today_ml: 0.0,
                water_date: None,
                growth_stage: "vegetative".into(),
                dark,
                light_hold: None,
                violations: VecDeque::with_capacity(LOG_CAPACITY),
                warnings: VecDeque::with_capacity(LOG_CAPACITY),
            }),
            callbacks: Mutex::new(Vec::new()),
            clock,
        }
    }

    pub fn limits(&self) -> &SafetyLimits {
        &self.limits
    }

    // ── Stage and dark period ─────────────────────────────────────

    pub fn set_growth_stage(&self, stage: &str) {
        let mut st = self.state.lock();
        if st.growth_stage != stage {
            info!(from = %st.growth_stage, to = stage, "growth stage changed");
            st.growth_stage = stage.to_string();
        }
    }

    pub fn growth_stage(&self) -> String {
        self.state.lock().growth_stage.clone()
    }

    pub fn set_dark_period(&self, dark: DarkPeriodConfig) {
        info!(
            enabled = dark.enabled,
            start = %dark.start,
            end = %dark.end,
            "dark period updated"
        );
        self.state.lock().dark = dark;
    }

    // ── Light ─────────────────────────────────────────────────────

    pub fn can_turn_on_light(&self, now: NaiveDateTime) -> LightDecision {
        let st = self.state.lock();
        Self::light_decision(&st, now)
    }

    fn light_decision(st: &SafetyState, now: NaiveDateTime) -> LightDecision {
        if st.kill_switch {
            return LightDecision {
                allowed: false,
                reason: format!(
                    "kill switch active: {}",
                    st.kill_reason.as_deref().unwrap_or("no reason given")
                ),
                remaining_dark_minutes: None,
            };
        }
        if let Some(hold) = &st.light_hold {
            return LightDecision {
                allowed: false,
                reason: format!("environment emergency: {hold}"),
                remaining_dark_minutes: None,
            };
        }
        if st.dark.enabled && st.dark.contains(now.time()) {
            let remaining = st.dark.remaining(now);
            return LightDecision {
                allowed: false,
                reason: format!(
                    "dark period active ({}-{}), {} remaining",
                    st.dark.start.format("%H:%M"),
                    st.dark.end.format("%H:%M"),
                    fmt_duration(remaining)
                ),
                remaining_dark_minutes: Some(remaining.num_minutes()),
            };
        }
        LightDecision {
            allowed: true,
            reason: "light permitted".into(),
            remaining_dark_minutes: None,
        }
    }

    /// Turning off always succeeds. Turning on during the dark window or
    /// under the kill switch fails with a recorded violation.
    pub fn enforce_light_command(&self, turn_on: bool, now: NaiveDateTime) -> ControlResult<()> {
        if !turn_on {
            return Ok(());
        }
        let mut st = self.state.lock();
        let decision = Self::light_decision(&st, now);
        if decision.allowed {
            return Ok(());
        }
        warn!(reason = %decision.reason, "light-on command blocked");
        push_bounded(
            &mut st.violations,
            now,
            format!("light on blocked: {}", decision.reason),
        );
        Err(ControlError::SafetyViolation(decision.reason))
    }

    // ── Water ─────────────────────────────────────────────────────

    pub fn can_water(&self, amount_ml: f64, now: NaiveDateTime) -> WaterDecision {
        let mut st = self.state.lock();
        self.water_decision(&mut st, amount_ml, now)
    }

    fn water_decision(&self, st: &mut SafetyState, amount_ml: f64, now: NaiveDateTime) -> WaterDecision {
        st.roll_over(now.date());
        let (per_event, daily) = self.limits.water_caps(&st.growth_stage);
        let remaining = (daily - st.water_today_ml).max(0.0);
        let deny = |reason: String| WaterDecision {
            allowed: false,
            reason,
            remaining_today_ml: remaining,
        };

        if st.kill_switch {
            return deny(format!(
                "kill switch active: {}",
                st.kill_reason.as_deref().unwrap_or("no reason given")
            ));
        }
        if amount_ml.is_nan() || amount_ml <= 0.0 {
            return deny(format!("invalid water amount {amount_ml}ml"));
        }
        if amount_ml > per_event {
            return deny(format!(
                "{amount_ml:.0}ml exceeds the {per_event:.0}ml per-event limit for stage '{}'",
                st.growth_stage
            ));
        }
        if st.water_today_ml + amount_ml > daily {
            return deny(format!(
                "daily water limit for stage '{}' would be exceeded: {:.0}ml used of {daily:.0}ml, {remaining:.0}ml remaining",
                st.growth_stage, st.water_today_ml
            ));
        }
        if let Some(last) = st.last_water {
            let min_gap = Duration::minutes(self.limits.min_water_interval_minutes);
            let since = now - last;
            if since < min_gap {
                return deny(format!(
                    "last watering was {} ago, minimum interval is {}",
                    fmt_duration(since),
                    fmt_duration(min_gap)
                ));
            }
        }
        WaterDecision {
            allowed: true,
            reason: format!("{amount_ml:.0}ml permitted"),
            remaining_today_ml: remaining - amount_ml,
        }
    }

    /// Check and record a watering in one critical section.
    pub fn enforce_water_command(&self, amount_ml: f64, now: NaiveDateTime) -> ControlResult<()> {
        let mut st = self.state.lock();
        let decision = self.water_decision(&mut st, amount_ml, now);
        if !decision.allowed {
            warn!(amount_ml, reason = %decision.reason, "water command blocked");
            push_bounded(
                &mut st.violations,
                now,
                format!("water blocked: {}", decision.reason),
            );
            return Err(ControlError::SafetyViolation(decision.reason));
        }
        st.last_water = Some(now);
        st.water_today_ml += amount_ml;
        info!(amount_ml, today_ml = st.water_today_ml, "watering approved");
        Ok(())
    }

    /// Seed the counter from persisted history so a restart on the same
    /// calendar day keeps counting where it left off.
    pub fn restore_water_today(&self, date: NaiveDate, total_ml: f64, last_water: Option<NaiveDateTime>) {
        let mut st = self.state.lock();
        st.water_date = Some(date);
        st.water_today_ml = total_ml.max(0.0);
        st.last_water = last_water;
    }

    // ── Environment ───────────────────────────────────────────────

    pub fn check_environment(
        &self,
        temp_c: f64,
        humidity_pct: f64,
        co2_ppm: Option<f64>,
        vpd_kpa: Option<f64>,
    ) -> EnvironmentCheck {
        let l = &self.limits;
        let mut c = EnvironmentCheck::default();

        if temp_c > l.temp_critical_high {
            c.critical.push(format!(
                "temperature {temp_c:.1}C above critical {:.1}C",
                l.temp_critical_high
            ));
            c.push_action(Device::ExhaustFan, true);
            c.push_action(Device::GrowLight, false);
            c.push_action(Device::HeatMat, false);
        } else if temp_c > l.temp_warning_high {
            c.warnings.push(format!("temperature {temp_c:.1}C above {:.1}C", l.temp_warning_high));
        } else if temp_c < l.temp_critical_low {
            c.critical.push(format!(
                "temperature {temp_c:.1}C below critical {:.1}C",
                l.temp_critical_low
            ));
            c.push_action(Device::HeatMat, true);
            c.push_action(Device::ExhaustFan, false);
        } else if temp_c < l.temp_warning_low {
            c.warnings.push(format!("temperature {temp_c:.1}C below {:.1}C", l.temp_warning_low));
        }
        if temp_c >= l.temp_emergency_high {
            c.shutdown = Some(format!("temperature {temp_c:.1}C reached emergency level"));
        }

        if humidity_pct > l.humidity_critical_high {
            c.critical.push(format!(
                "humidity {humidity_pct:.0}% above critical {:.0}%",
                l.humidity_critical_high
            ));
            c.push_action(Device::ExhaustFan, true);
            c.push_action(Device::Dehumidifier, true);
            c.push_action(Device::Humidifier, false);
        } else if humidity_pct > l.humidity_warning_high {
            c.warnings.push(format!("humidity {humidity_pct:.0}% above {:.0}%", l.humidity_warning_high));
        } else if humidity_pct < l.humidity_critical_low {
            c.critical.push(format!(
                "humidity {humidity_pct:.0}% below critical {:.0}%",
                l.humidity_critical_low
            ));
            c.push_action(Device::Humidifier, true);
            c.push_action(Device::Dehumidifier, false);
        } else if humidity_pct < l.humidity_warning_low {
            c.warnings.push(format!("humidity {humidity_pct:.0}% below {:.0}%", l.humidity_warning_low));
        }

        if let Some(co2) = co2_ppm {
            if co2 > l.co2_dangerous {
                c.critical.push(format!("CO2 {co2:.0}ppm above dangerous {:.0}ppm", l.co2_dangerous));
                c.push_action(Device::ExhaustFan, true);
                c.push_action(Device::Co2Solenoid, false);
            } else if co2 > l.co2_warning_high {
                c.warnings.push(format!("CO2 {co2:.0}ppm above {:.0}ppm", l.co2_warning_high));
            }
            if co2 >= l.co2_emergency {
                let reason = format!("CO2 {co2:.0}ppm reached emergency level");
                c.shutdown.get_or_insert(reason);
            }
        }

        if let Some(vpd) = vpd_kpa {
            if vpd > l.vpd_critical_high {
                c.critical.push(format!("VPD {vpd:.2}kPa above critical {:.2}kPa", l.vpd_critical_high));
                c.push_action(Device::Humidifier, true);
            } else if vpd > l.vpd_warning_high {
                c.warnings.push(format!("VPD {vpd:.2}kPa above {:.2}kPa", l.vpd_warning_high));
            } else if vpd < l.vpd_critical_low {
                c.critical.push(format!("VPD {vpd:.2}kPa below critical {:.2}kPa", l.vpd_critical_low));
                c.push_action(Device::Dehumidifier, true);
            } else if vpd < l.vpd_warning_low {
                c.warnings.push(format!("VPD {vpd:.2}kPa below {:.2}kPa", l.vpd_warning_low));
            }
        }

        c.ok = c.critical.is_empty();
        c
    }

    /// Record a check's findings and update the emergency light hold. The
    /// hold lasts until a check no longer asks for the light to go off.
    pub fn note_environment(&self, check: &EnvironmentCheck, now: NaiveDateTime) {
        let mut st = self.state.lock();
        let hold = check
            .actions
            .iter()
            .any(|a| a.device == Device::GrowLight && !a.on)
            .then(|| check.critical.join("; "));
        match (&st.light_hold, &hold) {
            (None, Some(reason)) => warn!(%reason, "grow light held off by environment emergency"),
            (Some(_), None) => info!("environment recovered, grow light hold released"),
            _ => {}
        }
        st.light_hold = hold;
        for msg in &check.critical {
            push_bounded(&mut st.warnings, now, format!("CRITICAL: {msg}"));
        }
        for msg in &check.warnings {
            push_bounded(&mut st.warnings, now, msg.clone());
        }
    }

    // ── Kill switch ───────────────────────────────────────────────

    pub fn register_emergency_callback(&self, cb: EmergencyCallback) {
        self.callbacks.lock().push(cb);
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.state.lock().kill_switch
    }

    /// `Some(reason)` while the kill switch is engaged.
    pub fn kill_switch_reason(&self) -> Option<String> {
        let st = self.state.lock();
        st.kill_switch
            .then(|| st.kill_reason.clone().unwrap_or_else(|| "no reason given".into()))
    }

    /// Engage the kill switch and run every emergency callback. A failing
    /// or panicking callback is logged and the rest still run.
    pub fn activate_kill_switch(&self, reason: &str) {
        let now = self.clock.now();
        {
            let mut st = self.state.lock();
            st.kill_switch = true;
            st.kill_reason = Some(reason.to_string());
            st.kill_at = Some(now);
            push_bounded(&mut st.violations, now, format!("kill switch activated: {reason}"));
        }
        error!(reason, "KILL SWITCH ACTIVATED");

        let callbacks: Vec<EmergencyCallback> = self.callbacks.lock().clone();
        for (i, cb) in callbacks.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| cb(reason))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(callback = i, "emergency callback failed: {e:#}"),
                Err(_) => error!(callback = i, "emergency callback panicked"),
            }
        }
    }

    /// Release the kill switch. Only the exact confirmation string works;
    /// anything else leaves state untouched.
    pub fn deactivate_kill_switch(&self, auth_token: &str) -> bool {
        if auth_token != RESUME_CONFIRMATION {
            warn!("kill switch release refused");
            return false;
        }
        let mut st = self.state.lock();
        st.kill_switch = false;
        st.kill_reason = None;
        st.kill_at = None;
        info!("kill switch released");
        true
    }

    // ── Status ────────────────────────────────────────────────────

    pub fn status(&self) -> SafetyStatus {
        let today = self.clock.now().date();
        let st = self.state.lock();
        let water_today_ml = if st.water_date == Some(today) {
            st.water_today_ml
        } else {
            0.0
        };
        SafetyStatus {
            kill_switch: st.kill_switch,
            kill_reason: st.kill_reason.clone(),
            kill_at: st.kill_at,
            growth_stage: st.growth_stage.clone(),
            dark_period: st.dark,
            dark_hours: st.dark.enabled.then(|| st.dark.hours_dark()),
            light_hold: st.light_hold.clone(),
            water_today_ml,
            water_daily_cap_ml: self.limits.water_caps(&st.growth_stage).1,
            last_water: st.last_water,
            violations: st.violations.iter().cloned().collect(),
            warnings: st.warnings.iter().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
