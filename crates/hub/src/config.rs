//! TOML config file loading and validation. Every section is optional; an
//! empty file yields a simulated tent with the default limits.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::photoperiod::{is_light_period, PhotoperiodConfig};
use crate::safety::{DarkPeriodConfig, SafetyLimits};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub safety: SafetyLimits,
    pub dark_period: DarkPeriodConfig,
    pub photoperiod: PhotoperiodSettings,
    pub hardware: HardwareConfig,
    pub brain: BrainConfig,
}

/// Whether brain actions are carried out or only recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[default]
    Auto,
    Monitor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub mode: OperationMode,
    /// Stage written to the store on first boot.
    pub default_stage: String,

    // ── Cadence ────────────────────────────────────────────────
    pub sensor_interval_secs: u64,
    pub decision_interval_secs: u64,
    pub decision_warmup_secs: u64,
    pub reactive_cooldown_secs: u64,
    pub light_check_interval_secs: u64,

    // ── Per-call timeouts ──────────────────────────────────────
    pub sensor_timeout_secs: u64,
    pub device_timeout_secs: u64,
    pub db_timeout_secs: u64,
    pub brain_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    // ── Failure handling ───────────────────────────────────────
    pub reconnect_threshold: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_secs: u64,
    pub reconnect_max_secs: u64,
    pub degraded_reset_cycles: u32,
    pub reprobe_every_cycles: u64,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_secs: u64,
    pub stale_after_secs: u64,
    pub anomaly_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            mode: OperationMode::Auto,
            default_stage: "vegetative".into(),
            sensor_interval_secs: 60,
            decision_interval_secs: 30 * 60,
            decision_warmup_secs: 120,
            reactive_cooldown_secs: 10 * 60,
            light_check_interval_secs: 5 * 60,
            sensor_timeout_secs: 10,
            device_timeout_secs: 5,
            db_timeout_secs: 5,
            brain_timeout_secs: 120,
            connect_timeout_secs: 10,
            reconnect_threshold: 3,
            max_reconnect_attempts: 5,
            reconnect_base_secs: 2,
            reconnect_max_secs: 60,
            degraded_reset_cycles: 10,
            reprobe_every_cycles: 30,
            breaker_failure_threshold: 3,
            breaker_reset_secs: 120,
            stale_after_secs: 15 * 60,
            anomaly_queue_capacity: 5,
        }
    }
}

pub fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhotoperiodSettings {
    pub vegetative: PhotoperiodConfig,
    pub flowering: PhotoperiodConfig,
    /// Days to walk light hours across when the stage changes.
    pub transition_days: i64,
}

impl Default for PhotoperiodSettings {
    fn default() -> Self {
        Self {
            vegetative: PhotoperiodConfig::vegetative(),
            flowering: PhotoperiodConfig::flowering(),
            transition_days: 7,
        }
    }
}

impl PhotoperiodSettings {
    pub fn for_stage(&self, stage: &str) -> &PhotoperiodConfig {
        if is_flowering(stage) {
            &self.flowering
        } else {
            &self.vegetative
        }
    }
}

pub fn is_flowering(stage: &str) -> bool {
    stage.to_ascii_lowercase().contains("flower")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorBackend {
    Mqtt,
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "grow-hub".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSourceConfig {
    pub name: String,
    pub node_id: String,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
}

fn default_max_age_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub mqtt: MqttConfig,
    pub sensors: Vec<SensorSourceConfig>,
    pub actuator: ActuatorBackend,
    pub sim_soil_probes: usize,
    pub pump_ml_per_sec: f64,
    pub max_pump_secs: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConfig::default(),
            sensors: Vec::new(),
            actuator: ActuatorBackend::Simulated,
            sim_soil_probes: 2,
            pump_ml_per_sec: 5.0,
            max_pump_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrainConfig {
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token, if any.
    pub api_key_env: String,
}

impl Default for BrainConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "GROW_BRAIN_API_KEY".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_orchestrator(&mut errors);
        self.validate_safety(&mut errors);
        self.validate_photoperiod(&mut errors);
        self.validate_hardware(&mut errors);
        self.validate_brain(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_orchestrator(&self, errors: &mut Vec<String>) {
        let o = &self.orchestrator;

        if o.default_stage.trim().is_empty() {
            errors.push("orchestrator: default_stage is empty".into());
        }

        // ── Durations (all must be positive) ────────────────
        for (name, v) in [
            ("sensor_interval_secs", o.sensor_interval_secs),
            ("decision_interval_secs", o.decision_interval_secs),
            ("light_check_interval_secs", o.light_check_interval_secs),
            ("sensor_timeout_secs", o.sensor_timeout_secs),
            ("device_timeout_secs", o.device_timeout_secs),
            ("db_timeout_secs", o.db_timeout_secs),
            ("brain_timeout_secs", o.brain_timeout_secs),
            ("connect_timeout_secs", o.connect_timeout_secs),
            ("reconnect_base_secs", o.reconnect_base_secs),
            ("stale_after_secs", o.stale_after_secs),
        ] {
            if v == 0 {
                errors.push(format!("orchestrator: {name} must be positive"));
            }
        }

        if o.sensor_timeout_secs >= o.sensor_interval_secs && o.sensor_interval_secs > 0 {
            errors.push(format!(
                "orchestrator: sensor_timeout_secs ({}) must be shorter than sensor_interval_secs ({})",
                o.sensor_timeout_secs, o.sensor_interval_secs
            ));
        }
        if o.reconnect_base_secs > o.reconnect_max_secs {
            errors.push(format!(
                "orchestrator: reconnect_base_secs ({}) exceeds reconnect_max_secs ({})",
                o.reconnect_base_secs, o.reconnect_max_secs
            ));
        }

        // ── Counters (all must be at least 1) ───────────────
        for (name, v) in [
            ("reconnect_threshold", u64::from(o.reconnect_threshold)),
            ("max_reconnect_attempts", u64::from(o.max_reconnect_attempts)),
            ("degraded_reset_cycles", u64::from(o.degraded_reset_cycles)),
            ("reprobe_every_cycles", o.reprobe_every_cycles),
            ("breaker_failure_threshold", u64::from(o.breaker_failure_threshold)),
            ("anomaly_queue_capacity", o.anomaly_queue_capacity as u64),
        ] {
            if v == 0 {
                errors.push(format!("orchestrator: {name} must be at least 1"));
            }
        }
    }

    fn validate_safety(&self, errors: &mut Vec<String>) {
        let s = &self.safety;

        // ── Threshold ladders ───────────────────────────────
        let ladders: [(&str, &[(&str, f64)]); 4] = [
            (
                "temperature",
                &[
                    ("temp_critical_low", s.temp_critical_low),
                    ("temp_warning_low", s.temp_warning_low),
                    ("temp_warning_high", s.temp_warning_high),
                    ("temp_critical_high", s.temp_critical_high),
                    ("temp_emergency_high", s.temp_emergency_high),
                ],
            ),
            (
                "humidity",
                &[
                    ("humidity_critical_low", s.humidity_critical_low),
                    ("humidity_warning_low", s.humidity_warning_low),
                    ("humidity_warning_high", s.humidity_warning_high),
                    ("humidity_critical_high", s.humidity_critical_high),
                ],
            ),
            (
                "co2",
                &[
                    ("co2_warning_high", s.co2_warning_high),
                    ("co2_dangerous", s.co2_dangerous),
                    ("co2_emergency", s.co2_emergency),
                ],
            ),
            (
                "vpd",
                &[
                    ("vpd_critical_low", s.vpd_critical_low),
                    ("vpd_warning_low", s.vpd_warning_low),
                    ("vpd_warning_high", s.vpd_warning_high),
                    ("vpd_critical_high", s.vpd_critical_high),
                ],
            ),
        ];
        for (what, ladder) in ladders {
            for pair in ladder.windows(2) {
                let ((lo_name, lo), (hi_name, hi)) = (pair[0], pair[1]);
                if lo >= hi {
                    errors.push(format!(
                        "safety: {what} thresholds out of order: {lo_name} ({lo}) must be below {hi_name} ({hi})"
                    ));
                }
            }
        }

        // ── Light envelope ──────────────────────────────────
        for (name, h) in [("light_on_hour", s.light_on_hour), ("light_off_hour", s.light_off_hour)] {
            if h >= 24 {
                errors.push(format!("safety: {name} {h} out of range [0, 23]"));
            }
        }

        // ── Water ───────────────────────────────────────────
        if s.max_water_per_event_ml <= 0.0 || s.max_water_daily_ml <= 0.0 {
            errors.push("safety: default water caps must be positive".into());
        }
        if s.min_water_interval_minutes < 0 {
            errors.push(format!(
                "safety: min_water_interval_minutes must not be negative, got {}",
                s.min_water_interval_minutes
            ));
        }

        let mut seen: HashSet<String> = HashSet::new();
        for (i, l) in s.stage_water.iter().enumerate() {
            let key = l.stage.trim().to_ascii_lowercase();
            let ctx = if key.is_empty() {
                format!("safety.stage_water[{i}]")
            } else {
                format!("stage '{}'", l.stage)
            };
            if key.is_empty() {
                errors.push(format!("{ctx}: stage is empty"));
            } else if !seen.insert(key) {
                errors.push(format!("{ctx}: duplicate stage"));
            }
            if l.max_per_event_ml <= 0.0 || l.max_daily_ml <= 0.0 {
                errors.push(format!("{ctx}: water caps must be positive"));
            } else if l.max_per_event_ml > l.max_daily_ml {
                errors.push(format!(
                    "{ctx}: max_per_event_ml ({}) exceeds max_daily_ml ({})",
                    l.max_per_event_ml, l.max_daily_ml
                ));
            }
        }
    }

    fn validate_photoperiod(&self, errors: &mut Vec<String>) {
        let p = &self.photoperiod;
        for (name, cfg) in [("vegetative", &p.vegetative), ("flowering", &p.flowering)] {
            if cfg.intensity_pct == 0 || cfg.intensity_pct > 100 {
                errors.push(format!(
                    "photoperiod.{name}: intensity_pct {} out of range [1, 100]",
                    cfg.intensity_pct
                ));
            }
            let light_minutes = (cfg.light_hours() * 60.0) as u32;
            if cfg.sunrise_minutes + cfg.sunset_minutes > light_minutes {
                errors.push(format!(
                    "photoperiod.{name}: sunrise + sunset ({} min) longer than the light period ({light_minutes} min)",
                    cfg.sunrise_minutes + cfg.sunset_minutes
                ));
            }
        }
        if p.transition_days < 0 {
            errors.push(format!(
                "photoperiod: transition_days must not be negative, got {}",
                p.transition_days
            ));
        }

        // The flowering schedule must never ask for light inside the
        // enforced flowering dark window.
        let dark = self.safety.flowering_dark_period();
        let overlap = (0..24 * 60)
            .step_by(15)
            .filter_map(|m| chrono::NaiveTime::from_num_seconds_from_midnight_opt(m * 60, 0))
            .find(|t| is_light_period(&p.flowering, *t) && dark.contains(*t));
        if let Some(t) = overlap {
            errors.push(format!(
                "photoperiod.flowering: light period overlaps the flowering dark window at {}",
                t.format("%H:%M")
            ));
        }
    }

    fn validate_hardware(&self, errors: &mut Vec<String>) {
        let h = &self.hardware;
        let mut seen: HashSet<&str> = HashSet::new();

        for (i, s) in h.sensors.iter().enumerate() {
            let ctx = if s.name.is_empty() {
                format!("hardware.sensors[{i}]")
            } else {
                format!("sensor '{}'", s.name)
            };
            if s.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            } else if !seen.insert(&s.name) {
                errors.push(format!("{ctx}: duplicate name"));
            }
            if s.node_id.trim().is_empty() {
                errors.push(format!("{ctx}: node_id is empty"));
            }
            if s.max_age_secs == 0 {
                errors.push(format!("{ctx}: max_age_secs must be positive"));
            }
        }

        let needs_mqtt = !h.sensors.is_empty() || h.actuator == ActuatorBackend::Mqtt;
        if needs_mqtt && !h.mqtt.enabled {
            errors.push("hardware: mqtt sensors or actuator configured but hardware.mqtt.enabled is false".into());
        }
        if h.mqtt.enabled && h.mqtt.port == 0 {
            errors.push("hardware.mqtt: port must be non-zero".into());
        }
        if h.pump_ml_per_sec <= 0.0 {
            errors.push(format!(
                "hardware: pump_ml_per_sec must be positive, got {}",
                h.pump_ml_per_sec
            ));
        }
        if h.max_pump_secs == 0 {
            errors.push("hardware: max_pump_secs must be positive".into());
        }
    }

    fn validate_brain(&self, errors: &mut Vec<String>) {
        if let Some(url) = &self.brain.endpoint {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("brain: endpoint '{url}' must be an http(s) url"));
            }
        }
    }

    /// Apply `MQTT_HOST` / `MQTT_PORT` style overrides from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("MQTT_HOST") {
            self.hardware.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT").and_then(|p| p.parse().ok()) {
            self.hardware.mqtt.port = port;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_env(|k| std::env::var(k).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
