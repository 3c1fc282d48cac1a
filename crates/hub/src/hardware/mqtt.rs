//! Generic MQTT bridge to tent hardware.
//!
//! Sensor nodes publish JSON telemetry on `tele/<node_id>/reading`; the
//! relay node listens on `device/<name>/set` (`ON`/`OFF`) and
//! `device/grow_light/brightness`, and echoes confirmed state on
//! `device/<name>/state`. One broker connection is shared by every
//! sensor source and the actuator.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use super::{Actuator, Device, DeviceState, Sensor, SensorReading, MAX_SOIL_PROBES};
use crate::clock::Clock;
use crate::error::{ControlError, ControlResult};

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ReadingMsg {
    /// Unix seconds at the node.
    #[serde(default)]
    pub(crate) ts: Option<i64>,
    pub(crate) temperature: Option<f64>,
    pub(crate) humidity: Option<f64>,
    pub(crate) vpd: Option<f64>,
    pub(crate) co2: Option<f64>,
    pub(crate) soil_moisture: Option<f64>,
    #[serde(default)]
    pub(crate) soil_probes: Vec<f64>,
    pub(crate) leaf_temp_delta: Option<f64>,
}

impl ReadingMsg {
    fn into_reading(self, fallback_ts: NaiveDateTime) -> SensorReading {
        let captured_at = self
            .ts
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .map(|dt| dt.with_timezone(&chrono::Local).naive_local())
            .unwrap_or(fallback_ts);
        let mut probes = self.soil_probes;
        probes.truncate(MAX_SOIL_PROBES);
        SensorReading {
            air_temp_c: self.temperature,
            humidity_pct: self.humidity,
            vpd_kpa: self.vpd,
            co2_ppm: self.co2,
            soil_moisture_pct: self.soil_moisture,
            soil_probes: probes,
            leaf_temp_delta_c: self.leaf_temp_delta,
            captured_at,
        }
        .with_derived_vpd()
    }
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Extract the device from "device/<name>/state".
pub(crate) fn extract_state_device(topic: &str) -> Option<Device> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "device" && parts[2] == "state" {
        parts[1].parse().ok()
    } else {
        None
    }
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub(crate) fn parse_switch_payload(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown switch payload '{s}'")),
    }
}

fn set_topic(device: Device) -> String {
    format!("device/{device}/set")
}

/// How long a switch command waits for the relay node's state echo.
const STATE_ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// Wait until the device cache shows `device` at `on`. The cache only moves
/// on a `device/<name>/state` echo, so this is the hardware's confirmation.
async fn await_echo(
    mut rx: watch::Receiver<DeviceState>,
    device: Device,
    on: bool,
    limit: Duration,
) -> ControlResult<()> {
    let outcome = timeout(limit, rx.wait_for(|d| d.is_on(device) == on))
        .await
        .map(|r| r.is_ok());
    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => Err(ControlError::HardwareUnavailable("mqtt event loop stopped".into())),
        Err(_) => Err(ControlError::HardwareUnavailable(format!(
            "{device} did not confirm {} within {}s",
            if on { "ON" } else { "OFF" },
            limit.as_secs()
        ))),
    }
}

// ---------------------------------------------------------------------------
// Shared connection
// ---------------------------------------------------------------------------

struct NodeSample {
    received: Instant,
    msg: ReadingMsg,
}

pub struct MqttBus {
    client: AsyncClient,
    connected: watch::Receiver<bool>,
    latest: Arc<Mutex<HashMap<String, NodeSample>>>,
    devices: Arc<watch::Sender<DeviceState>>,
}

impl MqttBus {
    /// Create the client and spawn its event loop. The loop reconnects on
    /// its own; `connect()` on the sources just waits for the ConnAck.
    pub fn spawn(client_id: &str, host: &str, port: u16) -> Arc<Self> {
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        let (client, mut eventloop) = AsyncClient::new(opts, 20);

        let (tx, rx) = watch::channel(false);
        let latest: Arc<Mutex<HashMap<String, NodeSample>>> = Arc::default();
        let (devices, _) = watch::channel(DeviceState::all_off());
        let devices = Arc::new(devices);

        let bus = Arc::new(Self {
            client: client.clone(),
            connected: rx,
            latest: Arc::clone(&latest),
            devices: Arc::clone(&devices),
        });

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        // Subscriptions do not survive a clean-session reconnect.
                        for topic in ["tele/+/reading", "device/+/state"] {
                            if let Err(e) = client.subscribe(topic, QoS::AtLeastOnce).await {
                                error!(topic, "mqtt subscribe failed: {e}");
                            }
                        }
                        tx.send_replace(true);
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        handle_publish(&p.topic, &p.payload, &latest, &devices);
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("mqtt disconnected");
                        tx.send_replace(false);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt error: {e}. reconnecting...");
                        tx.send_replace(false);
                        sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        bus
    }

    async fn wait_connected(&self) -> bool {
        let mut rx = self.connected.clone();
        let ok = rx.wait_for(|c| *c).await.is_ok();
        ok
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

fn handle_publish(
    topic: &str,
    payload: &[u8],
    latest: &Mutex<HashMap<String, NodeSample>>,
    devices: &watch::Sender<DeviceState>,
) {
    if let Some(node_id) = extract_node_id(topic) {
        match serde_json::from_slice::<ReadingMsg>(payload) {
            Ok(msg) => {
                debug!(node = node_id, "telemetry received");
                latest.lock().insert(
                    node_id.to_string(),
                    NodeSample {
                        received: Instant::now(),
                        msg,
                    },
                );
            }
            Err(e) => warn!(topic, "bad telemetry json: {e}"),
        }
    } else if let Some(device) = extract_state_device(topic) {
        match parse_switch_payload(payload) {
            Ok(on) => {
                debug!(device = %device, on, "state echo received");
                devices.send_modify(|d| d.set(device, on));
            }
            Err(msg) => warn!(topic, "{msg}"),
        }
    } else {
        debug!(topic, "unhandled topic");
    }
}

// ---------------------------------------------------------------------------
// Sensor source: one telemetry node
// ---------------------------------------------------------------------------

pub struct MqttSensor {
    bus: Arc<MqttBus>,
    node_id: String,
    max_age: Duration,
    clock: Arc<dyn Clock>,
}

impl MqttSensor {
    pub fn new(bus: Arc<MqttBus>, node_id: &str, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            node_id: node_id.to_string(),
            max_age,
            clock,
        }
    }
}

#[async_trait]
impl Sensor for MqttSensor {
    async fn connect(&self) -> bool {
        self.bus.wait_connected().await
    }

    async fn read_all(&self) -> ControlResult<SensorReading> {
        if !self.bus.is_connected() {
            return Err(ControlError::HardwareUnavailable("mqtt broker not connected".into()));
        }
        let latest = self.bus.latest.lock();
        let sample = latest.get(&self.node_id).ok_or_else(|| {
            ControlError::HardwareUnavailable(format!("no telemetry from node '{}'", self.node_id))
        })?;
        let age = sample.received.elapsed();
        if age > self.max_age {
            return Err(ControlError::HardwareUnavailable(format!(
                "telemetry from node '{}' is {}s old",
                self.node_id,
                age.as_secs()
            )));
        }
        Ok(sample.msg.clone().into_reading(self.clock.now()))
    }
}

// ---------------------------------------------------------------------------
// Actuator: relay node
// ---------------------------------------------------------------------------

pub struct MqttActuator {
    bus: Arc<MqttBus>,
}

impl MqttActuator {
    pub fn new(bus: Arc<MqttBus>) -> Self {
        Self { bus }
    }

    async fn publish(&self, topic: String, payload: Vec<u8>) -> ControlResult<()> {
        self.bus
            .client
            .publish(topic.as_str(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ControlError::HardwareUnavailable(format!("publish {topic} failed: {e}")))
    }
}

#[async_trait]
impl Actuator for MqttActuator {
    async fn connect(&self) -> bool {
        self.bus.wait_connected().await
    }

    async fn set_device(&self, device: Device, on: bool) -> ControlResult<()> {
        let payload = if on { b"ON".to_vec() } else { b"OFF".to_vec() };
        let echo = self.bus.devices.subscribe();
        self.publish(set_topic(device), payload).await?;
        await_echo(echo, device, on, STATE_ECHO_TIMEOUT).await
    }

    async fn get_state(&self) -> ControlResult<DeviceState> {
        if !self.bus.is_connected() {
            return Err(ControlError::HardwareUnavailable("mqtt broker not connected".into()));
        }
        Ok(self.bus.devices.borrow().clone())
    }

    async fn set_brightness(&self, pct: u8) -> ControlResult<()> {
        let pct = pct.min(100);
        self.publish(
            format!("device/{}/brightness", Device::GrowLight),
            pct.to_string().into_bytes(),
        )
        .await?;
        // Nodes do not echo brightness; the cache keeps the commanded level.
        self.bus.devices.send_modify(|d| d.light_brightness = Some(pct));
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
