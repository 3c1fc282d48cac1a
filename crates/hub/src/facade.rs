//! The only path from decision-making code to hardware. Every state change
//! is checked with the safety guardian before it reaches the actuator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::error::{with_timeout, ControlError, ControlResult};
use crate::hardware::{Actuator, Device, DeviceState};
use crate::photoperiod::LightDriver;
use crate::safety::SafetyGuardian;

#[derive(Debug, Clone, Serialize)]
pub struct PumpSettings {
    pub ml_per_sec: f64,
    /// Hard ceiling on a single pump run regardless of the requested amount.
    pub max_run: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WaterReceipt {
    pub amount_ml: f64,
    pub pump_secs: f64,
}

pub struct SafeActuator {
    inner: Arc<dyn Actuator>,
    guardian: Arc<SafetyGuardian>,
    clock: Arc<dyn Clock>,
    pump: PumpSettings,
    command_timeout: Duration,
}

impl SafeActuator {
    pub fn new(
        inner: Arc<dyn Actuator>,
        guardian: Arc<SafetyGuardian>,
        clock: Arc<dyn Clock>,
        pump: PumpSettings,
        command_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            guardian,
            clock,
            pump,
            command_timeout,
        }
    }

    pub fn guardian(&self) -> &Arc<SafetyGuardian> {
        &self.guardian
    }

    async fn forward(&self, device: Device, on: bool) -> ControlResult<()> {
        with_timeout(
            &format!("set {device}"),
            self.command_timeout,
            self.inner.set_device(device, on),
        )
        .await
    }

    /// Switching off is always forwarded. Switching on is checked: the light
    /// against the dark window and kill switch, the pump is refused outright
    /// (use [`SafeActuator::water`]), everything else against the kill switch.
    pub async fn set_device(&self, device: Device, on: bool) -> ControlResult<()> {
        if on {
            match device {
                Device::GrowLight => self.guardian.enforce_light_command(true, self.clock.now())?,
                Device::WaterPump => {
                    warn!("direct pump-on refused");
                    return Err(ControlError::SafetyViolation(
                        "water pump can only run through a metered watering".into(),
                    ));
                }
                _ => {
                    if let Some(reason) = self.guardian.kill_switch_reason() {
                        warn!(device = %device, "device-on refused: kill switch active");
                        return Err(ControlError::SafetyViolation(format!(
                            "kill switch active: {reason}"
                        )));
                    }
                }
            }
        }
        self.forward(device, on).await?;
        info!(device = %device, on, "device set");
        Ok(())
    }

    pub async fn set_light(&self, on: bool, brightness: Option<u8>) -> ControlResult<()> {
        self.set_device(Device::GrowLight, on).await?;
        if let (true, Some(pct)) = (on, brightness) {
            with_timeout(
                "set light brightness",
                self.command_timeout,
                self.inner.set_brightness(pct.min(100)),
            )
            .await?;
        }
        Ok(())
    }

    /// Lower the brightness of a light that is already on. Never switches
    /// the light on, so it stays allowed inside the dark window.
    pub async fn dim_light(&self, brightness: u8) -> ControlResult<()> {
        let state = self.get_state().await?;
        if !state.is_on(Device::GrowLight) {
            return Ok(());
        }
        let pct = brightness.min(100);
        if let Some(current) = state.light_brightness.filter(|current| pct > *current) {
            return Err(ControlError::SafetyViolation(format!(
                "dimming cannot raise brightness ({current}% to {pct}%)"
            )));
        }
        with_timeout("dim light", self.command_timeout, self.inner.set_brightness(pct)).await
    }

    /// Deliver `amount_ml` by running the pump for the matching time. The
    /// amount counts toward today's total once the guardian approves it.
    pub async fn water(&self, amount_ml: f64) -> ControlResult<WaterReceipt> {
        if self.pump.ml_per_sec <= 0.0 {
            return Err(ControlError::HardwareUnavailable(
                "pump flow rate is not configured".into(),
            ));
        }
        self.guardian.enforce_water_command(amount_ml, self.clock.now())?;

        let secs = (amount_ml / self.pump.ml_per_sec).min(self.pump.max_run.as_secs_f64());
        let run = Duration::from_secs_f64(secs.max(0.0));

        if let Err(e) = self.forward(Device::WaterPump, true).await {
            error!("pump start failed: {e}");
            self.pump_off().await;
            return Err(e);
        }
        info!(amount_ml, pump_secs = secs, "watering");
        tokio::time::sleep(run).await;

        if !self.pump_off().await {
            return Err(ControlError::HardwareUnavailable(
                "pump did not confirm off after watering".into(),
            ));
        }
        Ok(WaterReceipt {
            amount_ml,
            pump_secs: secs,
        })
    }

    /// Two attempts; returns whether the pump confirmed off.
    async fn pump_off(&self) -> bool {
        for attempt in 1..=2 {
            match self.forward(Device::WaterPump, false).await {
                Ok(()) => return true,
                Err(e) => error!(attempt, "pump off failed: {e}"),
            }
        }
        false
    }

    /// Switch every device off, pump first. Tries all of them and reports
    /// the first failure.
    pub async fn all_off(&self) -> ControlResult<()> {
        let mut first_err = None;
        let order = std::iter::once(Device::WaterPump)
            .chain(Device::ALL.into_iter().filter(|d| *d != Device::WaterPump));
        for device in order {
            if let Err(e) = self.forward(device, false).await {
                error!(device = %device, "all-off failed for device: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("all devices off");
                Ok(())
            }
        }
    }

    pub async fn get_state(&self) -> ControlResult<DeviceState> {
        with_timeout("device state query", self.command_timeout, self.inner.get_state()).await
    }
}

#[async_trait]
impl LightDriver for SafeActuator {
    async fn permit(&self, turn_on: bool) -> bool {
        if !turn_on {
            return true;
        }
        let decision = self.guardian.can_turn_on_light(self.clock.now());
        if !decision.allowed {
            warn!(reason = %decision.reason, "scheduled light-on not permitted");
        }
        decision.allowed
    }

    async fn apply(&self, on: bool, intensity_pct: u8) -> anyhow::Result<()> {
        self.set_light(on, on.then_some(intensity_pct)).await?;
        Ok(())
    }

    async fn dim(&self, intensity_pct: u8) -> anyhow::Result<()> {
        self.dim_light(intensity_pct).await?;
        Ok(())
    }
}
