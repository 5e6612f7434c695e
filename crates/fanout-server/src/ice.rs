//! Traversal server lookup
//!
//! Credentials come from an HTTP endpoint when one is configured. Any failure
//! or a slow answer falls back to the static list from configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::config::Config;

const CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CredentialRequest<'a> {
    call_type: &'a str,
    #[serde(rename = "requestID")]
    request_id: &'a str,
}

#[derive(Deserialize)]
struct CredentialResponse {
    #[serde(default)]
    data: Vec<Credential>,
}

#[derive(Deserialize)]
struct Credential {
    urls: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

pub struct IceServerProvider {
    client: reqwest::Client,
    turn_url: Option<String>,
    fallback: Vec<RTCIceServer>,
    timeout: Duration,
}

impl IceServerProvider {
    pub fn new(turn_url: Option<String>, fallback: Vec<RTCIceServer>) -> Self {
        Self {
            client: reqwest::Client::new(),
            turn_url,
            fallback,
            timeout: CREDENTIAL_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut fallback: Vec<RTCIceServer> = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        fallback.extend(config.turn_servers.iter().map(|turn| RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        }));

        Self::new(config.turn_url.clone(), fallback)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fallback(&self) -> &[RTCIceServer] {
        &self.fallback
    }

    /// Servers for one new connection
    pub async fn fetch(&self, call_type: &str, request_id: &str) -> Vec<RTCIceServer> {
        let Some(url) = &self.turn_url else {
            return self.fallback.clone();
        };

        match tokio::time::timeout(self.timeout, self.request(url, call_type, request_id)).await {
            Ok(Ok(servers)) if !servers.is_empty() => servers,
            Ok(Ok(_)) => {
                tracing::warn!("Credential endpoint returned no servers, using static list");
                self.fallback.clone()
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to fetch relay credentials: {}", e);
                self.fallback.clone()
            }
            Err(_) => {
                tracing::warn!("Relay credential request timed out after {:?}", self.timeout);
                self.fallback.clone()
            }
        }
    }

    async fn request(
        &self,
        url: &str,
        call_type: &str,
        request_id: &str,
    ) -> anyhow::Result<Vec<RTCIceServer>> {
        let response: CredentialResponse = self
            .client
            .post(url)
            .json(&CredentialRequest {
                call_type,
                request_id,
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response
            .data
            .into_iter()
            .map(|c| RTCIceServer {
                urls: vec![c.urls],
                username: c.username,
                credential: c.password,
                ..Default::default()
            })
            .collect())
    }
}
