//! Client side of the three-phase resumption protocol: probe, per-chunk
//! upload, commit, and best-effort abort.

use crate::error::CoreError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub commit_timeout: Duration,
}

#[derive(Debug, Serialize)]
struct ProbeRequest<'a> {
    hash: &'a str,
    #[serde(rename = "fileName")]
    file_name: &'a str,
    #[serde(rename = "fileSize")]
    file_size: u64,
    #[serde(rename = "fileType")]
    file_type: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProbeResponseWire {
    Exists {
        exists: bool,
        url: String,
    },
    Partial {
        exists: bool,
        #[serde(rename = "uploadedChunks", default)]
        uploaded_chunks: Vec<u32>,
    },
}

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// File already present server-side; upload is complete.
    Done { url: String },
    /// Zero or more chunk indices already accepted by the server.
    Partial { uploaded_chunks: Vec<u32> },
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    hash: &'a str,
    #[serde(rename = "fileName")]
    file_name: &'a str,
    #[serde(rename = "totalChunks")]
    total_chunks: u32,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    url: String,
}

#[derive(Debug, Serialize)]
struct AbortRequest<'a> {
    hash: &'a str,
}

/// Thin HTTP client over the upload wire contract. Each call returns a
/// classified [`CoreError`] on failure so [`crate::retry::RetryPolicy`]
/// can decide whether to retry without re-deriving the classification.
pub struct ProtocolClient {
    http: Client,
    config: ProtocolConfig,
}

impl ProtocolClient {
    pub fn new(config: ProtocolConfig) -> Result<Self, CoreError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(CoreError::from)?;
        Ok(Self { http, config })
    }

    /// Any non-2xx is tolerated as "no prior state" per the wire contract:
    /// the upload proceeds as if the server reported nothing, but the
    /// underlying error is logged so operators can tell a fresh file apart
    /// from a probe endpoint that is simply down.
    pub async fn probe(
        &self,
        hash: &str,
        file_name: &str,
        file_size: u64,
        file_type: &str,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let url = format!("{}/check", self.config.base_url);
        let body = ProbeRequest {
            hash,
            file_name,
            file_size,
            file_type,
        };

        let result = tokio::select! {
            r = self.http.post(&url).json(&body).send() => r,
            _ = cancel.cancelled() => {
                return ProbeOutcome::Partial { uploaded_chunks: Vec::new() };
            }
        };

        match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<ProbeResponseWire>().await {
                    Ok(ProbeResponseWire::Exists { exists: true, url }) => ProbeOutcome::Done { url },
                    Ok(ProbeResponseWire::Partial { uploaded_chunks, .. }) => {
                        ProbeOutcome::Partial { uploaded_chunks }
                    }
                    Ok(ProbeResponseWire::Exists { exists: false, .. }) => {
                        ProbeOutcome::Partial { uploaded_chunks: Vec::new() }
                    }
                    Err(err) => {
                        warn!(error = %err, "probe response did not match wire contract");
                        ProbeOutcome::Partial { uploaded_chunks: Vec::new() }
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "probe endpoint returned error, assuming new file");
                ProbeOutcome::Partial { uploaded_chunks: Vec::new() }
            }
            Err(err) => {
                warn!(error = %err, "probe endpoint unreachable, assuming new file");
                ProbeOutcome::Partial { uploaded_chunks: Vec::new() }
            }
        }
    }

    pub async fn upload_chunk(
        &self,
        hash: &str,
        index: u32,
        total: u32,
        bytes: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let url = format!("{}/chunk", self.config.base_url);
        let part = reqwest::multipart::Part::bytes(bytes).file_name("chunk");
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("hash", hash.to_string())
            .text("index", index.to_string())
            .text("total", total.to_string());

        let result = tokio::select! {
            r = self.http.post(&url).multipart(form).send() => r,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        let response = result.map_err(CoreError::from)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(CoreError::from(
                response.error_for_status().unwrap_err(),
            ))
        }
    }

    pub async fn commit(
        &self,
        hash: &str,
        file_name: &str,
        total_chunks: u32,
        cancel: &CancellationToken,
    ) -> Result<String, CoreError> {
        let url = format!("{}/merge", self.config.base_url);
        let body = CommitRequest {
            hash,
            file_name,
            total_chunks,
        };

        let result = tokio::select! {
            r = self.http
                .post(&url)
                .timeout(self.config.commit_timeout)
                .json(&body)
                .send() => r,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        let response = result.map_err(CoreError::from)?;
        if response.status().is_success() {
            let parsed: CommitResponse = response
                .json()
                .await
                .map_err(|err| CoreError::ProtocolViolation(format!("commit response malformed: {err}")))?;
            Ok(parsed.url)
        } else {
            Err(CoreError::from(response.error_for_status().unwrap_err()))
        }
    }

    /// Best-effort; the caller ignores failures per the wire contract.
    pub async fn abort(&self, hash: &str) {
        let url = format!("{}/abort", self.config.base_url);
        let body = AbortRequest { hash };
        if let Err(err) = self.http.post(&url).json(&body).send().await {
            warn!(error = %err, "abort request failed, ignoring");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> ProtocolClient {
        ProtocolClient::new(ProtocolConfig {
            base_url: server.uri(),
            request_timeout: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn probe_reports_existing_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "exists": true,
                "url": "https://cdn.example/x"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let outcome = client.probe("abc", "f.bin", 10, "application/octet-stream", &cancel).await;
        assert!(matches!(outcome, ProbeOutcome::Done { url } if url == "https://cdn.example/x"));
    }

    #[tokio::test]
    async fn probe_failure_is_tolerated_as_new_file() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let outcome = client.probe("abc", "f.bin", 10, "application/octet-stream", &cancel).await;
        assert!(matches!(outcome, ProbeOutcome::Partial { uploaded_chunks } if uploaded_chunks.is_empty()));
    }

    #[tokio::test]
    async fn chunk_upload_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chunk"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let result = client.upload_chunk("abc", 0, 3, vec![1, 2, 3], &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn chunk_upload_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chunk"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let result = client.upload_chunk("abc", 0, 3, vec![1], &cancel).await;
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn commit_returns_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/merge"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "https://cdn.example/done"
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let cancel = CancellationToken::new();
        let url = client.commit("abc", "f.bin", 3, &cancel).await.unwrap();
        assert_eq!(url, "https://cdn.example/done");
    }
}
