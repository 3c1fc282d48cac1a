//! Hardware capability traits, the data they exchange, and the
//! real-or-simulated resolution step used at startup.

pub(crate) mod mqtt;
pub(crate) mod sim;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ControlResult;

/// Upper bound on soil probes carried by a single reading.
pub const MAX_SOIL_PROBES: usize = 8;

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    GrowLight,
    HeatMat,
    CirculationFan,
    ExhaustFan,
    WaterPump,
    Humidifier,
    Dehumidifier,
    Co2Solenoid,
}

impl Device {
    pub const ALL: [Device; 8] = [
        Device::GrowLight,
        Device::HeatMat,
        Device::CirculationFan,
        Device::ExhaustFan,
        Device::WaterPump,
        Device::Humidifier,
        Device::Dehumidifier,
        Device::Co2Solenoid,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Device::GrowLight => "grow_light",
            Device::HeatMat => "heat_mat",
            Device::CirculationFan => "circulation_fan",
            Device::ExhaustFan => "exhaust_fan",
            Device::WaterPump => "water_pump",
            Device::Humidifier => "humidifier",
            Device::Dehumidifier => "dehumidifier",
            Device::Co2Solenoid => "co2_solenoid",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Device::ALL
            .into_iter()
            .find(|d| d.as_str() == wanted)
            .ok_or_else(|| format!("unknown device '{s}'"))
    }
}

/// On/off state per device as reported by hardware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub devices: BTreeMap<Device, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_brightness: Option<u8>,
}

impl DeviceState {
    pub fn all_off() -> Self {
        Self {
            devices: Device::ALL.into_iter().map(|d| (d, false)).collect(),
            light_brightness: None,
        }
    }

    /// Unknown devices read as off.
    pub fn is_on(&self, device: Device) -> bool {
        self.devices.get(&device).copied().unwrap_or(false)
    }

    pub fn set(&mut self, device: Device, on: bool) {
        self.devices.insert(device, on);
    }
}

// ---------------------------------------------------------------------------
// Sensor readings
// ---------------------------------------------------------------------------

/// One poll cycle's worth of environmental data. Every measured field is
/// optional so partial sources can be merged; a reading missing any core
/// field (temperature, humidity, VPD) is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub air_temp_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub vpd_kpa: Option<f64>,
    pub co2_ppm: Option<f64>,
    pub soil_moisture_pct: Option<f64>,
    #[serde(default)]
    pub soil_probes: Vec<f64>,
    pub leaf_temp_delta_c: Option<f64>,
    pub captured_at: NaiveDateTime,
}

/// The fields every safety check needs, guaranteed present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreReading {
    pub air_temp_c: f64,
    pub humidity_pct: f64,
    pub vpd_kpa: f64,
}

impl SensorReading {
    pub fn empty(captured_at: NaiveDateTime) -> Self {
        Self {
            air_temp_c: None,
            humidity_pct: None,
            vpd_kpa: None,
            co2_ppm: None,
            soil_moisture_pct: None,
            soil_probes: Vec::new(),
            leaf_temp_delta_c: None,
            captured_at,
        }
    }

    pub fn missing_core_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.air_temp_c.is_none() {
            missing.push("air_temp_c");
        }
        if self.humidity_pct.is_none() {
            missing.push("humidity_pct");
        }
        if self.vpd_kpa.is_none() {
            missing.push("vpd_kpa");
        }
        missing
    }

    pub fn core(&self) -> Option<CoreReading> {
        Some(CoreReading {
            air_temp_c: self.air_temp_c?,
            humidity_pct: self.humidity_pct?,
            vpd_kpa: self.vpd_kpa?,
        })
    }

    /// Fill in VPD from temperature and humidity when the source omitted it.
    pub fn with_derived_vpd(mut self) -> Self {
        if self.vpd_kpa.is_none() {
            if let (Some(t), Some(rh)) = (self.air_temp_c, self.humidity_pct) {
                self.vpd_kpa = Some(vpd_kpa(t, rh, self.leaf_temp_delta_c.unwrap_or(0.0)));
            }
        }
        self
    }
}

/// Saturation vapour pressure in kPa (Tetens).
fn svp_kpa(temp_c: f64) -> f64 {
    0.6108 * ((17.27 * temp_c) / (temp_c + 237.3)).exp()
}

/// Leaf vapour pressure deficit in kPa, clamped at zero.
pub fn vpd_kpa(air_temp_c: f64, humidity_pct: f64, leaf_delta_c: f64) -> f64 {
    let leaf = svp_kpa(air_temp_c + leaf_delta_c);
    let air = svp_kpa(air_temp_c) * humidity_pct.clamp(0.0, 100.0) / 100.0;
    ((leaf - air) * 1000.0).round().max(0.0) / 1000.0
}

// ---------------------------------------------------------------------------
// Capabilities
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Sensor: Send + Sync {
    async fn connect(&self) -> bool;
    async fn read_all(&self) -> ControlResult<SensorReading>;
}

#[async_trait]
pub trait Actuator: Send + Sync {
    async fn connect(&self) -> bool;
    async fn set_device(&self, device: Device, on: bool) -> ControlResult<()>;
    async fn get_state(&self) -> ControlResult<DeviceState>;

    /// Dimmable lights override this; switch-only hardware ignores it.
    async fn set_brightness(&self, _pct: u8) -> ControlResult<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Real-or-simulated resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Real,
    Simulated,
}

#[derive(Clone)]
pub struct Resolved<T> {
    pub handle: T,
    pub provenance: Provenance,
}

impl<T> Resolved<T> {
    pub fn is_simulated(&self) -> bool {
        self.provenance == Provenance::Simulated
    }
}

pub(crate) async fn probe<F>(what: &str, timeout: Duration, connect: F) -> bool
where
    F: std::future::Future<Output = bool>,
{
    match tokio::time::timeout(timeout, connect).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(what, "hardware refused connection");
            false
        }
        Err(_) => {
            warn!(what, ?timeout, "hardware connect timed out");
            false
        }
    }
}

pub async fn resolve_sensor(
    name: &str,
    candidate: Option<Arc<dyn Sensor>>,
    timeout: Duration,
    fallback: impl FnOnce() -> Arc<dyn Sensor>,
) -> Resolved<Arc<dyn Sensor>> {
    if let Some(real) = candidate {
        if probe(name, timeout, real.connect()).await {
            info!(source = name, "sensor connected");
            return Resolved {
                handle: real,
                provenance: Provenance::Real,
            };
        }
    }
    warn!(source = name, "sensor unavailable, using simulated readings");
    Resolved {
        handle: fallback(),
        provenance: Provenance::Simulated,
    }
}

pub async fn resolve_actuator(
    candidate: Option<Arc<dyn Actuator>>,
    timeout: Duration,
    fallback: impl FnOnce() -> Arc<dyn Actuator>,
) -> Resolved<Arc<dyn Actuator>> {
    if let Some(real) = candidate {
        if probe("actuator", timeout, real.connect()).await {
            info!("actuator connected");
            return Resolved {
                handle: real,
                provenance: Provenance::Real,
            };
        }
    }
    warn!("actuator unavailable, commands go to simulated devices");
    Resolved {
        handle: fallback(),
        provenance: Provenance::Simulated,
    }
}
