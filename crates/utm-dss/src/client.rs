//! DSS HTTP client: operational-intent CRUD and peer-USS notification.
//!
//! Method-per-endpoint, auth header resolved per call from the token cache,
//! and reqwest transport failures mapped onto the typed [`DssError`]
//! taxonomy instead of surfacing as bare `anyhow::Error`.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::time::timeout;

use utm_core::{FlightState, Volume};

use crate::errors::DssError;
use crate::token_cache::{TokenCache, TokenType};

const DSS_CALL_DEADLINE: Duration = Duration::from_secs(10);
const PEER_USS_CALL_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DssReference {
    pub id: String,
    pub manager: String,
    pub uss_availability: String,
    pub version: u32,
    pub ovn: String,
    pub uss_base_url: String,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationalIntentSubmission {
    pub status: String,
    pub http_code: u16,
    pub opint_id: String,
    pub dss_reference: DssReference,
    pub subscribers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SubmitOperationalIntentRequest<'a> {
    state: &'a str,
    priority: u8,
    volumes: Vec<VolumeWire>,
    off_nominal_volumes: Vec<VolumeWire>,
}

#[derive(Debug, Serialize)]
struct UpdateOperationalIntentRequest<'a> {
    state: &'a str,
    ovn: &'a str,
    subscription_id: Option<&'a str>,
    volumes: Vec<VolumeWire>,
}

#[derive(Debug, Serialize)]
struct VolumeWire {
    ring: Vec<[f64; 2]>,
    altitude_lower_m: f64,
    altitude_upper_m: f64,
    start: chrono::DateTime<chrono::Utc>,
    end: chrono::DateTime<chrono::Utc>,
}

impl From<&Volume> for VolumeWire {
    fn from(v: &Volume) -> Self {
        VolumeWire {
            ring: v.ring(),
            altitude_lower_m: v.altitude_lower_m,
            altitude_upper_m: v.altitude_upper_m,
            start: v.start,
            end: v.end,
        }
    }
}

/// Best-effort notification payload sent to a peer USS after a transition.
#[derive(Debug, Clone, Serialize)]
pub struct PeerNotificationPayload {
    pub reference: DssReference,
    pub details: PeerNotificationDetails,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerNotificationDetails {
    pub volumes: Vec<[f64; 2]>,
    pub priority: u8,
    pub off_nominal_volumes: Vec<[f64; 2]>,
}

pub struct DssClient {
    client: Client,
    base_url: String,
    self_base_url: String,
    token_cache: Arc<TokenCache>,
}

fn state_wire_name(state: FlightState) -> &'static str {
    match state {
        FlightState::NotSubmitted => "not_submitted",
        FlightState::Accepted => "accepted",
        FlightState::Activated => "activated",
        FlightState::Nonconforming => "nonconforming",
        FlightState::Contingent => "contingent",
        FlightState::Ended => "ended",
        FlightState::Withdrawn => "withdrawn",
        FlightState::Cancelled => "cancelled",
        FlightState::Rejected => "rejected",
        FlightState::Invalid => "invalid",
    }
}

impl DssClient {
    pub fn new(base_url: impl Into<String>, self_base_url: impl Into<String>, token_cache: Arc<TokenCache>) -> Self {
        Self {
            client: Client::builder()
                .timeout(DSS_CALL_DEADLINE)
                .build()
                .expect("failed to build DSS HTTP client"),
            base_url: base_url.into(),
            self_base_url: self_base_url.into(),
            token_cache,
        }
    }

    async fn auth_header(&self, audience: &str, token_type: TokenType) -> Result<String, DssError> {
        let token = self.token_cache.get_cached_credentials(audience, token_type).await?;
        Ok(format!("Bearer {token}"))
    }

    /// `getCachedCredentials(audience, token_type)` from the DSS Client
    /// contract, exposed for callers (e.g. peer-USS notification) that need
    /// a bearer token without going through an operational-intent call.
    pub async fn get_cached_credentials(&self, audience: &str, token_type: TokenType) -> Result<String, DssError> {
        self.token_cache.get_cached_credentials(audience, token_type).await
    }

    pub async fn submit_operational_intent(
        &self,
        state: FlightState,
        volumes: &[Volume],
        off_nominal_volumes: &[Volume],
        priority: u8,
    ) -> Result<OperationalIntentSubmission, DssError> {
        let url = format!("{}/dss/v1/operational_intent_references", self.base_url);
        let auth = self.auth_header(&self.base_url, TokenType::Scd).await?;

        let request = SubmitOperationalIntentRequest {
            state: state_wire_name(state),
            priority,
            volumes: volumes.iter().map(VolumeWire::from).collect(),
            off_nominal_volumes: off_nominal_volumes.iter().map(VolumeWire::from).collect(),
        };

        let response = timeout(
            DSS_CALL_DEADLINE,
            self.client
                .post(&url)
                .header("Authorization", auth)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| DssError::Timeout)?
        .map_err(|e| DssError::Unreachable(e.to_string()))?;

        self.parse_submission(response).await
    }

    pub async fn update_operational_intent(
        &self,
        opint_id: &str,
        new_state: FlightState,
        new_volumes: &[Volume],
        ovn: &str,
        subscription_id: Option<&str>,
    ) -> Result<OperationalIntentSubmission, DssError> {
        let url = format!("{}/dss/v1/operational_intent_references/{opint_id}", self.base_url);
        let auth = self.auth_header(&self.base_url, TokenType::Scd).await?;

        let request = UpdateOperationalIntentRequest {
            state: state_wire_name(new_state),
            ovn,
            subscription_id,
            volumes: new_volumes.iter().map(VolumeWire::from).collect(),
        };

        let response = timeout(
            DSS_CALL_DEADLINE,
            self.client
                .put(&url)
                .header("Authorization", auth)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| DssError::Timeout)?
        .map_err(|e| DssError::Unreachable(e.to_string()))?;

        self.parse_submission(response).await
    }

    async fn parse_submission(&self, response: reqwest::Response) -> Result<OperationalIntentSubmission, DssError> {
        let status = response.status();

        if status == StatusCode::CONFLICT {
            return Err(DssError::Conflict);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DssError::Auth(format!("DSS returned {status}")));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(DssError::Client {
                code: status.as_u16(),
                message: body,
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DssError::Client {
                code: status.as_u16(),
                message: body,
            });
        }

        let mut submission: OperationalIntentSubmission = response
            .json()
            .await
            .map_err(|e| DssError::Client {
                code: status.as_u16(),
                message: format!("malformed DSS response: {e}"),
            })?;

        // The local USS base URL is filtered from the subscriber list: peers
        // never need to be notified of their own change.
        submission
            .subscribers
            .retain(|subscriber| subscriber != &self.self_base_url);

        Ok(submission)
    }

    /// Best-effort notification to a peer USS. Never blocks state
    /// progression beyond the bounded peer-USS deadline; callers log and
    /// discard errors rather than retrying indefinitely.
    pub async fn notify_peer_uss(
        &self,
        base_url: &str,
        payload: &PeerNotificationPayload,
        audience: &str,
    ) -> Result<(), DssError> {
        let auth = self.auth_header(audience, TokenType::Scd).await?;
        let url = format!("{base_url}/uss/v1/operational_intents/notify");

        let response = timeout(
            PEER_USS_CALL_DEADLINE,
            self.client.post(&url).header("Authorization", auth).json(payload).send(),
        )
        .await
        .map_err(|_| DssError::Timeout)?
        .map_err(|e| DssError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DssError::Client {
                code: response.status().as_u16(),
                message: "peer USS notification rejected".into(),
            });
        }

        Ok(())
    }

    /// `GET /uss/v1/operational_intents/{id}` on a peer USS; 404 is not an
    /// error, it means the peer doesn't know this intent.
    pub async fn fetch_peer_operational_intent_details(
        &self,
        base_url: &str,
        opint_id: &str,
        audience: &str,
    ) -> Result<Option<serde_json::Value>, DssError> {
        let auth = self.auth_header(audience, TokenType::Scd).await?;
        let url = format!("{base_url}/uss/v1/operational_intents/{opint_id}");

        let response = timeout(
            PEER_USS_CALL_DEADLINE,
            self.client.get(&url).header("Authorization", auth).send(),
        )
        .await
        .map_err(|_| DssError::Timeout)?
        .map_err(|e| DssError::Unreachable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DssError::Client {
                code: response.status().as_u16(),
                message: "peer USS details lookup failed".into(),
            });
        }

        let body = response.json().await.map_err(|e| DssError::Client {
            code: 0,
            message: format!("malformed peer USS response: {e}"),
        })?;
        Ok(Some(body))
    }
}
