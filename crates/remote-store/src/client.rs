//! HTTP document store client.
//!
//! Speaks a small REST surface: `GET /v1/{collection}/{id}`,
//! `GET /v1/{collection}?ownerId=…&includeShared=…`, and `POST /v1/commit`
//! for atomic multi-document writes. The change feed is polling-based; the
//! backend exposes no push channel, so the feed re-reads the scoped result
//! set and emits a snapshot whenever it differs from the last one delivered.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fintrack_core::store::{
    ChangeFeed, ChangeSnapshot, Collection, Document, DocumentBody, DocumentStore, OwnerScope,
    WriteOp,
};
use fintrack_core::{Error, Result};

use crate::error::{RemoteStoreError, Result as ApiResult};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;
/// Interval between change-feed polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Environment variable carrying the API base URL.
pub const API_URL_ENV: &str = "FINTRACK_API_URL";

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    #[serde(default)]
    #[allow(dead_code)]
    applied: usize,
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum CommitOpDto<'a> {
    #[serde(rename_all = "camelCase")]
    Insert {
        collection: Collection,
        id: &'a str,
        body: &'a DocumentBody,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        collection: Collection,
        id: &'a str,
        patch: &'a DocumentBody,
        #[serde(skip_serializing_if = "Option::is_none")]
        expect_version: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        collection: Collection,
        id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        expect_version: Option<i64>,
    },
}

impl<'a> From<&'a WriteOp> for CommitOpDto<'a> {
    fn from(op: &'a WriteOp) -> Self {
        match op {
            WriteOp::Insert {
                collection,
                id,
                body,
            } => CommitOpDto::Insert {
                collection: *collection,
                id,
                body,
            },
            WriteOp::Update {
                collection,
                id,
                patch,
                expect_version,
            } => CommitOpDto::Update {
                collection: *collection,
                id,
                patch,
                expect_version: *expect_version,
            },
            WriteOp::Delete {
                collection,
                id,
                expect_version,
            } => CommitOpDto::Delete {
                collection: *collection,
                id,
                expect_version: *expect_version,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    ops: Vec<CommitOpDto<'a>>,
}

/// Client for the remote document-database REST API.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl HttpDocumentStore {
    /// Create a new client for `base_url` (e.g. "https://api.fintrack.app").
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: None,
        }
    }

    /// Attach the bearer token sent with every request.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Build a client from [`API_URL_ENV`]; `None` when unset or blank.
    pub fn from_env() -> Option<Self> {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(|url| Self::new(&url))
    }

    fn headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.access_token {
            let auth_value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| RemoteStoreError::auth("Invalid access token format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }
        Ok(headers)
    }

    fn log_response(status: reqwest::StatusCode, body: &str) {
        if status.is_success() {
            debug!("API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("API response error ({}): {}", status, preview);
    }

    /// Parse a JSON response body.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> ApiResult<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                return Err(RemoteStoreError::api(
                    status.as_u16(),
                    format!("{}: {}", error.code, error.message),
                ));
            }
            return Err(RemoteStoreError::api(
                status.as_u16(),
                format!("Request failed: {}", body),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            RemoteStoreError::api(status.as_u16(), format!("Failed to parse response: {}", e))
        })
    }

    async fn fetch_documents(
        &self,
        collection: Collection,
        scope: &OwnerScope,
    ) -> ApiResult<Vec<Document>> {
        let url = format!("{}/v1/{}", self.base_url, collection);
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .query(&[
                ("ownerId", scope.owner_id.as_str()),
                (
                    "includeShared",
                    if scope.include_shared { "true" } else { "false" },
                ),
            ])
            .send()
            .await?;
        Self::parse_response(response).await
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        let url = format!("{}/v1/{}/{}", self.base_url, collection, id);
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(RemoteStoreError::from)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let document = Self::parse_response::<Document>(response).await?;
        Ok(Some(document))
    }

    async fn list_by_owner(
        &self,
        collection: Collection,
        scope: &OwnerScope,
    ) -> Result<Vec<Document>> {
        Ok(self.fetch_documents(collection, scope).await?)
    }

    async fn commit(&self, ops: Vec<WriteOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let request = CommitRequest {
            ops: ops.iter().map(CommitOpDto::from).collect(),
        };
        let url = format!("{}/v1/commit", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(RemoteStoreError::from)?;

        match Self::parse_response::<CommitResponse>(response).await {
            Ok(_) => Ok(()),
            // Attribute a missing document to the first targeted op so the
            // caller gets a typed not-found instead of a bare status code.
            Err(err) if err.status_code() == Some(404) => {
                let target = ops.iter().find_map(|op| match op {
                    WriteOp::Update { collection, id, .. }
                    | WriteOp::Delete { collection, id, .. } => Some((*collection, id.clone())),
                    WriteOp::Insert { .. } => None,
                });
                match target {
                    Some((collection, id)) => Err(Error::not_found(collection.as_str(), id)),
                    None => Err(Error::from(err)),
                }
            }
            Err(err) => Err(Error::from(err)),
        }
    }

    async fn subscribe(&self, collection: Collection, scope: &OwnerScope) -> Result<ChangeFeed> {
        let initial = self.fetch_documents(collection, scope).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut version: u64 = 1;
        let _ = sender.send(ChangeSnapshot {
            collection,
            version,
            documents: initial.clone(),
        });

        let client = self.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let mut last = initial;
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                if sender.is_closed() {
                    break;
                }
                match client.fetch_documents(collection, &scope).await {
                    Ok(documents) => {
                        if documents != last {
                            version += 1;
                            let snapshot = ChangeSnapshot {
                                collection,
                                version,
                                documents: documents.clone(),
                            };
                            if sender.send(snapshot).is_err() {
                                break;
                            }
                            last = documents;
                        }
                    }
                    // Poll failures are transient by definition here; the
                    // next tick retries and the cache layer serves fallback.
                    Err(e) => debug!("{collection} change-feed poll failed: {e}"),
                }
            }
            debug!("{collection} change-feed poll loop ended");
        });
        Ok(ChangeFeed { receiver })
    }
}
