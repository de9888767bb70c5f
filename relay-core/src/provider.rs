use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing api token at {0}")]
    MissingToken(PathBuf),
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("broadcast provider is not configured")]
    Disabled,
}

/// Request to create a remote broadcast resource.
#[derive(Debug, Clone)]
pub struct BroadcastSpec {
    pub title: String,
    pub description: String,
    pub privacy: String,
    /// None means "go live as soon as the encoder connects".
    pub scheduled_start: Option<DateTime<FixedOffset>>,
    pub channel: String,
}

/// What the core keeps from a created broadcast: the opaque ref used for
/// lifecycle transitions and the ingest key the encoder pushes to.
#[derive(Debug, Clone)]
pub struct BroadcastResource {
    pub broadcast_ref: String,
    pub ingest_key: String,
}

/// Side-channel to the remote broadcast service. Every call is fallible and
/// network-bound; callers must never let a failure here roll back local
/// stream state.
#[async_trait]
pub trait BroadcastProvider: Send + Sync {
    async fn create_broadcast(&self, spec: &BroadcastSpec)
        -> Result<BroadcastResource, ProviderError>;
    async fn go_live(&self, broadcast_ref: &str, channel: &str) -> Result<(), ProviderError>;
    async fn complete(&self, broadcast_ref: &str, channel: &str) -> Result<(), ProviderError>;
}

/// Stand-in when no provider is configured. Lifecycle transitions are
/// no-ops so local streaming is never blocked; creating a broadcast is the
/// one thing that genuinely needs a real provider.
#[derive(Debug, Default)]
pub struct NullBroadcastProvider;

#[async_trait]
impl BroadcastProvider for NullBroadcastProvider {
    async fn create_broadcast(
        &self,
        _spec: &BroadcastSpec,
    ) -> Result<BroadcastResource, ProviderError> {
        Err(ProviderError::Disabled)
    }

    async fn go_live(&self, broadcast_ref: &str, _channel: &str) -> Result<(), ProviderError> {
        debug!(broadcast_ref, "null provider, go-live skipped");
        Ok(())
    }

    async fn complete(&self, broadcast_ref: &str, _channel: &str) -> Result<(), ProviderError> {
        debug!(broadcast_ref, "null provider, completion skipped");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenFile {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct CreateBroadcastResponse {
    id: String,
    stream_key: String,
}

/// HTTP client for the broadcast service. Credentials are selected per
/// channel: `<tokens_dir>/<channel>.json` holds the bearer token for that
/// channel's account.
pub struct HttpBroadcastProvider {
    client: Client,
    api_base: String,
    tokens_dir: PathBuf,
}

impl HttpBroadcastProvider {
    pub fn new(
        api_base: impl Into<String>,
        tokens_dir: impl Into<PathBuf>,
        request_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            tokens_dir: tokens_dir.into(),
        })
    }

    fn token_for(&self, channel: &str) -> Result<String, ProviderError> {
        let path = self.tokens_dir.join(format!("{channel}.json"));
        if !path.exists() {
            return Err(ProviderError::MissingToken(path));
        }
        let raw = std::fs::read_to_string(&path)?;
        let token: TokenFile = serde_json::from_str(&raw)
            .map_err(|error| ProviderError::Malformed(error.to_string()))?;
        Ok(token.access_token)
    }

    async fn transition(
        &self,
        broadcast_ref: &str,
        channel: &str,
        status: &str,
    ) -> Result<(), ProviderError> {
        let token = self.token_for(channel)?;
        let url = format!("{}/broadcasts/{}/transition", self.api_base, broadcast_ref);
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .json(&serde_json::json!({ "status": status }))
            .send()
            .await?;
        Self::ensure_success(response).await?;
        debug!(broadcast_ref, status, "broadcast transition accepted");
        Ok(())
    }

    async fn ensure_success(response: reqwest::Response) -> Result<(), ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_else(|_| String::new());
        Err(ProviderError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl BroadcastProvider for HttpBroadcastProvider {
    async fn create_broadcast(
        &self,
        spec: &BroadcastSpec,
    ) -> Result<BroadcastResource, ProviderError> {
        let token = self.token_for(&spec.channel)?;
        let body = serde_json::json!({
            "title": spec.title,
            "description": spec.description,
            "privacy": spec.privacy,
            "scheduled_start": spec.scheduled_start.map(|t| t.to_rfc3339()),
            "immediate": spec.scheduled_start.is_none(),
        });
        let response = self
            .client
            .post(format!("{}/broadcasts", self.api_base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_else(|_| String::new());
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let payload: CreateBroadcastResponse = response.json().await?;

        // Immediate broadcasts are warmed to `testing` right away so a later
        // go-live only has one hop left. Binding settles server-side first.
        if spec.scheduled_start.is_none() {
            sleep(Duration::from_secs(2)).await;
            if let Err(error) = self.transition(&payload.id, &spec.channel, "testing").await {
                debug!(%error, broadcast_ref = %payload.id, "testing transition after create failed");
            }
        }

        info!(broadcast_ref = %payload.id, channel = %spec.channel, "broadcast created");
        Ok(BroadcastResource {
            broadcast_ref: payload.id,
            ingest_key: payload.stream_key,
        })
    }

    async fn go_live(&self, broadcast_ref: &str, channel: &str) -> Result<(), ProviderError> {
        // A broadcast still in `ready` needs the testing hop first; if it is
        // already testing the hop is rejected, which is fine.
        match self.transition(broadcast_ref, channel, "testing").await {
            Ok(()) => sleep(Duration::from_secs(3)).await,
            Err(error) => debug!(%error, broadcast_ref, "testing transition skipped"),
        }
        self.transition(broadcast_ref, channel, "live").await
    }

    async fn complete(&self, broadcast_ref: &str, channel: &str) -> Result<(), ProviderError> {
        self.transition(broadcast_ref, channel, "complete").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn token_lookup_per_channel() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("gaming.json"),
            r#"{"access_token": "tok-123"}"#,
        )
        .unwrap();
        let provider = HttpBroadcastProvider::new(
            "https://api.example.com/v1",
            dir.path(),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(provider.token_for("gaming").unwrap(), "tok-123");
        assert!(matches!(
            provider.token_for("default"),
            Err(ProviderError::MissingToken(_))
        ));
    }

    #[test]
    fn corrupt_token_file_is_malformed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("default.json"), "not json").unwrap();
        let provider = HttpBroadcastProvider::new(
            "https://api.example.com/v1",
            dir.path(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(matches!(
            provider.token_for("default"),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn null_provider_never_blocks_lifecycle() {
        let provider = NullBroadcastProvider;
        assert!(provider.go_live("bc-1", "default").await.is_ok());
        assert!(provider.complete("bc-1", "default").await.is_ok());
        assert!(matches!(
            provider
                .create_broadcast(&BroadcastSpec {
                    title: "t".into(),
                    description: String::new(),
                    privacy: "public".into(),
                    scheduled_start: None,
                    channel: "default".into(),
                })
                .await,
            Err(ProviderError::Disabled)
        ));
    }
}
