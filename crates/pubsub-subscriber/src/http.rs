//! HTTP long-poll [`Transport`] over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::protocol::{classify_status, decode_publish, decode_subscribe};
use crate::transport::{LongPollRequest, LongPollResponse, Transport, TransportError};
use crate::types::{Error, Timetoken};

const DEFAULT_ORIGIN: &str = "ps.pndsn.com";
/// Timeout for leave and publish requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("pubsub-subscriber-rust/", env!("CARGO_PKG_VERSION"));

/// Connection settings for [`HttpTransport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Host (and optional port) of the backend.
    pub origin: String,
    /// Use https.
    pub secure: bool,
    pub subscribe_key: String,
    /// Required only for `publish`.
    pub publish_key: Option<String>,
    /// Client identity reported to presence.
    pub uuid: String,
    /// Presence timeout in seconds sent as `heartbeat`.
    pub presence_timeout: Option<u32>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            secure: true,
            subscribe_key: String::new(),
            publish_key: None,
            uuid: format!("pn-{}", uuid::Uuid::new_v4()),
            presence_timeout: None,
        }
    }
}

/// Reference transport speaking the backend's JSON long-poll protocol.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base: Url,
    config: HttpConfig,
}

impl HttpTransport {
    pub fn new(config: HttpConfig) -> Result<Self, Error> {
        if config.subscribe_key.is_empty() {
            return Err(Error::Config("subscribe_key is required".to_string()));
        }
        let scheme = if config.secure { "https" } else { "http" };
        let base = Url::parse(&format!("{scheme}://{}/", config.origin))?;
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { http, base, config })
    }

    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Network(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, url: Url, timeout: Duration) -> Result<String, TransportError> {
        let resp = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        let status = resp.status();
        let body = resp.text().await.map_err(map_reqwest)?;
        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), %body, "Request failed");
            return Err(classify_status(status.as_u16(), &body));
        }
        Ok(body)
    }
}

fn map_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(e.to_string())
    }
}

/// Comma-joined names; `,` stands for "no channels" (group-only requests).
fn join_names(names: &[String]) -> String {
    if names.is_empty() {
        ",".to_string()
    } else {
        names.join(",")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn long_poll(
        &self,
        request: &LongPollRequest,
    ) -> Result<LongPollResponse, TransportError> {
        let channels = join_names(&request.wire_channels());
        let groups = request.wire_groups();
        let mut url = self.url(&["v2", "subscribe", &self.config.subscribe_key, &channels, "0"])?;
        {
            let mut q = url.query_pairs_mut();
            match request.cursor {
                Some(cursor) => {
                    q.append_pair("tt", &cursor.timetoken.to_string());
                    q.append_pair("tr", &cursor.region.to_string());
                }
                None => {
                    q.append_pair("tt", "0");
                }
            }
            q.append_pair("uuid", &self.config.uuid);
            if !groups.is_empty() {
                q.append_pair("channel-group", &groups.join(","));
            }
            if let Some(heartbeat) = self.config.presence_timeout {
                q.append_pair("heartbeat", &heartbeat.to_string());
            }
        }
        tracing::trace!(%channels, ?groups, handshake = request.is_handshake(), "Long-poll");
        let body = self.get(url, request.timeout).await?;
        decode_subscribe(&body)
    }

    async fn leave(&self, channels: &[String], groups: &[String]) -> Result<(), TransportError> {
        let names = join_names(channels);
        let mut url = self.url(&[
            "v2",
            "presence",
            "sub-key",
            &self.config.subscribe_key,
            "channel",
            &names,
            "leave",
        ])?;
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("uuid", &self.config.uuid);
            if !groups.is_empty() {
                q.append_pair("channel-group", &groups.join(","));
            }
        }
        self.get(url, REQUEST_TIMEOUT).await?;
        Ok(())
    }

    async fn publish(
        &self,
        channel: &str,
        payload: &serde_json::Value,
    ) -> Result<Timetoken, TransportError> {
        let Some(publish_key) = self.config.publish_key.as_deref() else {
            return Err(TransportError::Rejected {
                status: 0,
                message: "publish_key is not configured".to_string(),
            });
        };
        let body =
            serde_json::to_string(payload).map_err(|e| TransportError::Decode(e.to_string()))?;
        let mut url = self.url(&[
            "publish",
            publish_key,
            &self.config.subscribe_key,
            "0",
            channel,
            "0",
            &body,
        ])?;
        url.query_pairs_mut().append_pair("uuid", &self.config.uuid);
        let ack = self.get(url, REQUEST_TIMEOUT).await?;
        decode_publish(&ack)
    }
}
