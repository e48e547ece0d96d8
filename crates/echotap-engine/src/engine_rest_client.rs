//! REST client for the engine's control surface.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::engine_contract::{
    ChannelLookup, EngineControlPlane, EngineError, ExternalMediaRequest,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ERROR_BODY_LIMIT: usize = 400;

#[derive(Debug, Clone, Deserialize)]
struct ChannelObject {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BridgeObject {
    id: String,
}

/// Basic-auth REST client against `http://{engine}/ari`.
#[derive(Clone)]
pub struct EngineRestClient {
    http: reqwest::Client,
    api_base: String,
    username: String,
    password: String,
}

impl EngineRestClient {
    pub fn new(engine_url: &str, username: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to create engine rest client")?;
        Ok(Self {
            http,
            api_base: format!("http://{}/ari", engine_url.trim_end_matches('/')),
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, EngineError> {
        builder
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(EngineError::from)
    }

    /// Sends the request and maps any non-success status onto the error
    /// taxonomy.
    async fn dispatch(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, EngineError> {
        let response = self.send(builder).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(error_for(response).await)
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        operation: &str,
    ) -> Result<T, EngineError> {
        response
            .json::<T>()
            .await
            .map_err(|error| EngineError::Protocol(format!("failed to decode {operation}: {error}")))
    }
}

#[async_trait]
impl EngineControlPlane for EngineRestClient {
    async fn answer(&self, channel_id: &str) -> Result<(), EngineError> {
        self.dispatch(self.http.post(self.url(&format!("/channels/{channel_id}/answer"))))
            .await?;
        Ok(())
    }

    async fn create_bridge(&self) -> Result<String, EngineError> {
        let response = self
            .dispatch(
                self.http
                    .post(self.url("/bridges"))
                    .json(&json!({"type": "mixing"})),
            )
            .await?;
        let bridge: BridgeObject = self.decode(response, "bridge").await?;
        Ok(bridge.id)
    }

    async fn create_external_media(
        &self,
        request: &ExternalMediaRequest,
    ) -> Result<String, EngineError> {
        // The engine has two incompatible conventions for this endpoint.
        // Query parameters are what current versions accept; a 4xx from an
        // engine expecting the JSON-body convention gets one retry in that
        // shape.
        let url = self.url("/channels/externalMedia");
        let query = [
            ("app", request.app.as_str()),
            ("external_host", request.external_host.as_str()),
            ("format", request.format.as_str()),
            ("direction", request.direction.as_str()),
            ("encapsulation", request.encapsulation.as_str()),
            ("channelId", request.mirror_channel_id.as_str()),
        ];
        let response = self.send(self.http.post(&url).query(&query)).await?;
        let response = if response.status().is_success() {
            response
        } else if response.status().is_client_error() {
            debug!(
                status = response.status().as_u16(),
                "external media query convention rejected, retrying with json body"
            );
            let body = json!({
                "app": request.app,
                "external_host": request.external_host,
                "format": request.format,
                "direction": request.direction,
                "encapsulation": request.encapsulation,
                "channelId": request.mirror_channel_id,
            });
            self.dispatch(self.http.post(&url).json(&body)).await?
        } else {
            return Err(error_for(response).await);
        };
        let channel: ChannelObject = self.decode(response, "external media channel").await?;
        Ok(channel.id)
    }

    async fn add_to_bridge(&self, bridge_id: &str, channel_id: &str) -> Result<(), EngineError> {
        self.dispatch(
            self.http
                .post(self.url(&format!("/bridges/{bridge_id}/addChannel")))
                .json(&json!({"channel": channel_id})),
        )
        .await?;
        Ok(())
    }

    async fn hangup(&self, channel_id: &str) -> Result<(), EngineError> {
        self.dispatch(self.http.delete(self.url(&format!("/channels/{channel_id}"))))
            .await?;
        Ok(())
    }

    async fn destroy_bridge(&self, bridge_id: &str) -> Result<(), EngineError> {
        self.dispatch(self.http.delete(self.url(&format!("/bridges/{bridge_id}"))))
            .await?;
        Ok(())
    }

    async fn lookup(&self, channel_id: &str) -> Result<ChannelLookup, EngineError> {
        match self
            .dispatch(self.http.get(self.url(&format!("/channels/{channel_id}"))))
            .await
        {
            Ok(_) => Ok(ChannelLookup::Exists),
            Err(EngineError::NotFound) => Ok(ChannelLookup::NotFound),
            Err(error) => Err(error),
        }
    }

    async fn list_channels(&self) -> Result<Vec<String>, EngineError> {
        let response = self.dispatch(self.http.get(self.url("/channels"))).await?;
        let channels: Vec<ChannelObject> = self.decode(response, "channel list").await?;
        Ok(channels.into_iter().map(|channel| channel.id).collect())
    }
}

async fn error_for(response: reqwest::Response) -> EngineError {
    let status = response.status();
    match status.as_u16() {
        404 => EngineError::NotFound,
        401 | 403 => EngineError::Auth,
        code => {
            let body = response.text().await.unwrap_or_default();
            EngineError::Protocol(format!(
                "engine returned status {code}: {}",
                truncate_for_error(&body, ERROR_BODY_LIMIT)
            ))
        }
    }
}

fn truncate_for_error(body: &str, limit: usize) -> &str {
    let mut end = body.len().min(limit);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}
