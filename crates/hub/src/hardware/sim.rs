//! Simulated tent hardware, substituted when real devices cannot be
//! reached at startup.
//!
//! The sensor models the tent as a handful of random walks with mean
//! reversion, nudged by whatever the (simulated) devices are doing:
//! - light on warms the tent and dries the air
//! - exhaust pulls temperature, humidity and CO2 toward ambient
//! - humidifier / dehumidifier move humidity
//! - pump raises soil moisture, which otherwise dries slowly

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    Actuator, Device, DeviceState, SensorReading, Sensor, MAX_SOIL_PROBES,
};
use crate::clock::Clock;
use crate::error::ControlResult;

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Simulated sensor
// ---------------------------------------------------------------------------

struct Climate {
    temp_c: f64,
    humidity_pct: f64,
    co2_ppm: f64,
    probes: Vec<f64>,
}

/// Ambient conditions the walks revert toward.
const AMBIENT_TEMP_C: f64 = 22.0;
const AMBIENT_HUMIDITY_PCT: f64 = 55.0;
const AMBIENT_CO2_PPM: f64 = 420.0;

pub struct SimulatedSensor {
    climate: Mutex<Climate>,
    devices: Option<Arc<dyn Actuator>>,
    clock: Arc<dyn Clock>,
}

impl SimulatedSensor {
    /// `devices` lets the simulation react to commanded device state; pass
    /// the simulated actuator so both halves tell a consistent story.
    pub fn new(probe_count: usize, devices: Option<Arc<dyn Actuator>>, clock: Arc<dyn Clock>) -> Self {
        let probes = (0..probe_count.clamp(1, MAX_SOIL_PROBES))
            .map(|_| gaussian(45.0, 3.0).clamp(0.0, 100.0))
            .collect();
        Self {
            climate: Mutex::new(Climate {
                temp_c: AMBIENT_TEMP_C + 2.0,
                humidity_pct: AMBIENT_HUMIDITY_PCT,
                co2_ppm: AMBIENT_CO2_PPM + 100.0,
                probes,
            }),
            devices,
            clock,
        }
    }

    fn step(c: &mut Climate, devices: &DeviceState) {
        let on = |d| devices.is_on(d);

        let mut temp_push = 0.0;
        let mut hum_push = 0.0;
        let mut co2_push = 0.0;
        if on(Device::GrowLight) {
            temp_push += 0.4;
            hum_push -= 0.3;
        }
        if on(Device::HeatMat) {
            temp_push += 0.15;
        }
        if on(Device::ExhaustFan) {
            temp_push -= 0.3;
            hum_push -= 0.5;
            co2_push -= 40.0;
        }
        if on(Device::Humidifier) {
            hum_push += 1.2;
        }
        if on(Device::Dehumidifier) {
            hum_push -= 1.2;
        }
        if on(Device::Co2Solenoid) {
            co2_push += 60.0;
        }

        c.temp_c += 0.05 * (AMBIENT_TEMP_C - c.temp_c) + temp_push + gaussian(0.0, 0.1);
        c.humidity_pct += 0.05 * (AMBIENT_HUMIDITY_PCT - c.humidity_pct) + hum_push + gaussian(0.0, 0.4);
        c.co2_ppm += 0.05 * (AMBIENT_CO2_PPM - c.co2_ppm) + co2_push + gaussian(0.0, 8.0);

        c.temp_c = c.temp_c.clamp(5.0, 45.0);
        c.humidity_pct = c.humidity_pct.clamp(5.0, 99.0);
        c.co2_ppm = c.co2_ppm.clamp(300.0, 5000.0);

        let watering = on(Device::WaterPump);
        for p in &mut c.probes {
            let drift = if watering { 3.0 } else { -0.05 };
            *p = (*p + drift + gaussian(0.0, 0.2)).clamp(0.0, 100.0);
        }
    }
}

#[async_trait]
impl Sensor for SimulatedSensor {
    async fn connect(&self) -> bool {
        true
    }

    async fn read_all(&self) -> ControlResult<SensorReading> {
        let devices = match &self.devices {
            Some(a) => a.get_state().await.unwrap_or_default(),
            None => DeviceState::default(),
        };

        let mut c = self.climate.lock();
        Self::step(&mut c, &devices);

        let avg = c.probes.iter().sum::<f64>() / c.probes.len() as f64;
        let reading = SensorReading {
            air_temp_c: Some(round1(c.temp_c)),
            humidity_pct: Some(round1(c.humidity_pct)),
            vpd_kpa: None,
            co2_ppm: Some(c.co2_ppm.round()),
            soil_moisture_pct: Some(round1(avg)),
            soil_probes: c.probes.iter().copied().map(round1).collect(),
            leaf_temp_delta_c: Some(-1.5),
            captured_at: self.clock.now(),
        }
        .with_derived_vpd();
        debug!(temp = ?reading.air_temp_c, rh = ?reading.humidity_pct, "simulated reading");
        Ok(reading)
    }
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

// ---------------------------------------------------------------------------
// Simulated actuator
// ---------------------------------------------------------------------------

/// In-memory device board: accepts every command and reports it back.
pub struct SimulatedActuator {
    state: Mutex<DeviceState>,
}

impl SimulatedActuator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState::all_off()),
        }
    }
}

impl Default for SimulatedActuator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Actuator for SimulatedActuator {
    async fn connect(&self) -> bool {
        true
    }

    async fn set_device(&self, device: Device, on: bool) -> ControlResult<()> {
        debug!(%device, on, "[sim] device set");
        self.state.lock().set(device, on);
        Ok(())
    }

    async fn get_state(&self) -> ControlResult<DeviceState> {
        Ok(self.state.lock().clone())
    }

    async fn set_brightness(&self, pct: u8) -> ControlResult<()> {
        self.state.lock().light_brightness = Some(pct.min(100));
        Ok(())
    }
}
