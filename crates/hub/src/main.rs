mod brain;
mod clock;
mod config;
mod db;
mod error;
mod facade;
mod hardware;
mod orchestrator;
mod photoperiod;
mod safety;
mod state;
mod watchdog;
mod web;

#[cfg(test)]
mod testkit;

use anyhow::Result;
use std::{env, sync::Arc, time::Duration};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use brain::{Brain, HttpBrain, IdleBrain};
use clock::{Clock, SystemClock};
use config::{secs, ActuatorBackend, Config};
use db::{Db, Persistence};
use facade::{PumpSettings, SafeActuator};
use hardware::mqtt::{MqttActuator, MqttBus, MqttSensor};
use hardware::sim::{SimulatedActuator, SimulatedSensor};
use hardware::{resolve_actuator, resolve_sensor, Actuator, Sensor};
use orchestrator::breaker::CircuitBreaker;
use orchestrator::{Orchestrator, OrchestratorParts, SensorSlot};
use photoperiod::{LightDriver, PhotoperiodScheduler};
use safety::SafetyGuardian;
use watchdog::Watchdog;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("grow_hub=info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:grow.db?mode=rwc".to_string());

    let cfg = config::load(&config_path)?;
    info!(path = %config_path, mode = ?cfg.orchestrator.mode, "config loaded");

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    info!("db ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let orch_cfg = &cfg.orchestrator;
    let connect_timeout = secs(orch_cfg.connect_timeout_secs);

    // ── Hardware ────────────────────────────────────────────────────
    let bus = cfg.hardware.mqtt.enabled.then(|| {
        let m = &cfg.hardware.mqtt;
        MqttBus::spawn(&m.client_id, &m.host, m.port)
    });

    let actuator_candidate: Option<Arc<dyn Actuator>> = match (cfg.hardware.actuator, &bus) {
        (ActuatorBackend::Mqtt, Some(bus)) => Some(Arc::new(MqttActuator::new(Arc::clone(bus)))),
        _ => None,
    };
    let actuator = resolve_actuator(actuator_candidate, connect_timeout, || {
        Arc::new(SimulatedActuator::new()) as Arc<dyn Actuator>
    })
    .await;

    let sensors = build_sensor_slots(&cfg, bus.as_ref(), &actuator.handle, &clock).await;

    // ── Safety, light schedule, actuation ───────────────────────────
    let guardian = Arc::new(SafetyGuardian::new(
        cfg.safety.clone(),
        cfg.dark_period,
        Arc::clone(&clock),
    ));
    let facade = Arc::new(SafeActuator::new(
        Arc::clone(&actuator.handle),
        Arc::clone(&guardian),
        Arc::clone(&clock),
        PumpSettings {
            ml_per_sec: cfg.hardware.pump_ml_per_sec,
            max_run: Duration::from_secs(cfg.hardware.max_pump_secs),
        },
        secs(orch_cfg.device_timeout_secs),
    ));
    if let Err(e) = facade.all_off().await {
        warn!("startup all-off incomplete: {e}");
    }
    let scheduler = PhotoperiodScheduler::new(
        Arc::clone(&facade) as Arc<dyn LightDriver>,
        Arc::clone(&clock),
    );

    // ── Brain ───────────────────────────────────────────────────────
    let brain: Arc<dyn Brain> = match &cfg.brain.endpoint {
        Some(endpoint) => {
            let key = env::var(&cfg.brain.api_key_env).ok();
            info!(%endpoint, authenticated = key.is_some(), "decision engine configured");
            Arc::new(HttpBrain::new(endpoint, key, secs(orch_cfg.brain_timeout_secs))?)
        }
        None => {
            warn!("no decision engine configured, decisions will be no-ops");
            Arc::new(IdleBrain)
        }
    };

    // ── Orchestrator ────────────────────────────────────────────────
    let orch = Orchestrator::new(OrchestratorParts {
        config: cfg.orchestrator.clone(),
        photoperiods: cfg.photoperiod.clone(),
        base_dark_period: cfg.dark_period,
        guardian,
        watchdog: Arc::new(Watchdog::new()),
        scheduler,
        actuator: facade,
        actuator_provenance: actuator.provenance,
        sensors,
        brain,
        store: Arc::new(db) as Arc<dyn Persistence>,
        clock,
    });
    orch.start().await;

    // ── Web server ──────────────────────────────────────────────────
    let web_orch = orch.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_orch).await {
            error!("web server stopped: {e:#}");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    orch.stop().await;
    Ok(())
}

/// One slot per configured MQTT source, each with its own simulated
/// fallback. Without configured sources the tent is fully simulated.
async fn build_sensor_slots(
    cfg: &Config,
    bus: Option<&Arc<MqttBus>>,
    devices: &Arc<dyn Actuator>,
    clock: &Arc<dyn Clock>,
) -> Vec<SensorSlot> {
    let orch_cfg = &cfg.orchestrator;
    let connect_timeout = secs(orch_cfg.connect_timeout_secs);
    let breaker = || {
        CircuitBreaker::new(
            orch_cfg.breaker_failure_threshold,
            secs(orch_cfg.breaker_reset_secs),
        )
    };
    let simulator = || -> Arc<dyn Sensor> {
        Arc::new(SimulatedSensor::new(
            cfg.hardware.sim_soil_probes,
            Some(Arc::clone(devices)),
            Arc::clone(clock),
        ))
    };

    if cfg.hardware.sensors.is_empty() {
        let fallback = simulator();
        let active = resolve_sensor("tent", None, connect_timeout, || Arc::clone(&fallback)).await;
        return vec![SensorSlot::new("tent", None, fallback, active, breaker())];
    }

    let mut slots = Vec::with_capacity(cfg.hardware.sensors.len());
    for source in &cfg.hardware.sensors {
        let primary: Option<Arc<dyn Sensor>> = bus.map(|bus| {
            Arc::new(MqttSensor::new(
                Arc::clone(bus),
                &source.node_id,
                Duration::from_secs(source.max_age_secs),
                Arc::clone(clock),
            )) as Arc<dyn Sensor>
        });
        let fallback = simulator();
        let active = resolve_sensor(&source.name, primary.clone(), connect_timeout, || {
            Arc::clone(&fallback)
        })
        .await;
        slots.push(SensorSlot::new(&source.name, primary, fallback, active, breaker()));
    }
    slots
}
