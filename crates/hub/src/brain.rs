//! Boundary to the external decision process. The brain only proposes
//! actions; the orchestrator executes them through the safe actuator.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::hardware::{Device, DeviceState, SensorReading};
use crate::safety::SafetyStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BrainAction {
    SetDevice {
        device: Device,
        on: bool,
    },
    SetLight {
        on: bool,
        #[serde(default)]
        brightness: Option<u8>,
    },
    Water {
        amount_ml: f64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionTrigger {
    Scheduled,
    Anomaly,
    Manual,
}

impl DecisionTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionTrigger::Scheduled => "scheduled",
            DecisionTrigger::Anomaly => "anomaly",
            DecisionTrigger::Manual => "manual",
        }
    }
}

/// Everything the brain gets to see for one decision.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRequest {
    pub trigger: DecisionTrigger,
    pub growth_stage: String,
    pub sensors: Option<SensorReading>,
    pub devices: Option<DeviceState>,
    /// Sources currently served by simulators; their readings are synthetic.
    pub simulated_sources: Vec<String>,
    pub actuator_simulated: bool,
    pub anomalies: Vec<String>,
    pub safety: SafetyStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub output_text: String,
    #[serde(default)]
    pub actions: Vec<BrainAction>,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub query: String,
    pub context: Option<String>,
    pub growth_stage: String,
    pub sensors: Option<SensorReading>,
    pub devices: Option<DeviceState>,
    pub simulated_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryReply {
    pub output_text: String,
    #[serde(default)]
    pub actions: Vec<BrainAction>,
    #[serde(default)]
    pub tool_rounds: u32,
}

#[async_trait]
pub trait Brain: Send + Sync {
    async fn decide(&self, req: &DecisionRequest) -> Result<Decision>;
    async fn query(&self, req: &QueryRequest) -> Result<QueryReply>;
}

// ---------------------------------------------------------------------------
// HTTP brain
// ---------------------------------------------------------------------------

/// Posts requests as JSON to `<endpoint>/decide` and `<endpoint>/query`.
pub struct HttpBrain {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpBrain {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build brain http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<Req: Serialize + ?Sized, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp> {
        let url = format!("{}/{path}", self.endpoint);
        debug!(%url, "brain request");
        let mut req = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("brain request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("brain at {url} returned an error status"))?;
        resp.json()
            .await
            .with_context(|| format!("brain at {url} returned malformed json"))
    }
}

#[async_trait]
impl Brain for HttpBrain {
    async fn decide(&self, req: &DecisionRequest) -> Result<Decision> {
        self.post("decide", req).await
    }

    async fn query(&self, req: &QueryRequest) -> Result<QueryReply> {
        self.post("query", req).await
    }
}

// ---------------------------------------------------------------------------
// Idle brain
// ---------------------------------------------------------------------------

/// Stand-in when no brain is configured: never proposes anything.
#[derive(Debug, Default)]
pub struct IdleBrain;

#[async_trait]
impl Brain for IdleBrain {
    async fn decide(&self, req: &DecisionRequest) -> Result<Decision> {
        Ok(Decision {
            output_text: format!(
                "no decision engine configured; {} decision skipped",
                req.trigger.as_str()
            ),
            actions: Vec::new(),
            tokens_used: 0,
        })
    }

    async fn query(&self, _req: &QueryRequest) -> Result<QueryReply> {
        Ok(QueryReply {
            output_text: "no decision engine configured".into(),
            actions: Vec::new(),
            tool_rounds: 0,
        })
    }
}
