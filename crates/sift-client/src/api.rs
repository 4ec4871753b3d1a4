//! HTTP client for the Sift API.
//!
//! Wraps `reqwest` with bearer-token injection, a pre-flight refresh when
//! the access token is stale, and exactly one refresh-and-retry cycle on a
//! 401 response. Refreshes are single-flight: concurrent callers share one
//! in-flight refresh through the token manager.
//!
//! Retry policy for transient failures lives in callers (the uploader);
//! this layer surfaces transport errors without retrying them.

use std::future::Future;
use std::sync::Arc;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use sift_core::models::{
    DeleteRequest, DeleteResponse, FacetsRequest, FacetsResponse, JobStatus, QueryRequest,
    QueryResponse, TokenRefreshRequest, TokenRefreshResponse,
};
use sift_core::{ClientConfig, ClientError};

use crate::notify::{Notifier, NotifyLevel, TracingNotifier};
use crate::token::TokenManager;

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    tokens: Arc<TokenManager>,
    notifier: Arc<dyn Notifier>,
}

impl ApiClient {
    pub fn new(config: ClientConfig, tokens: Arc<TokenManager>) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ClientError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            tokens,
            notifier: Arc::new(TracingNotifier),
        })
    }

    /// Replace the default tracing notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// WebSocket URL for a status stream, with the access token as a query
    /// parameter (duplex connections cannot carry a bearer header from a
    /// browser, and the server accepts either).
    pub fn ws_url(&self, path: &str) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", self.base_url)
        };
        match self.tokens.access_token() {
            Some(token) => format!("{}{}?token={}", base, path, token),
            None => format!("{}{}", base, path),
        }
    }

    fn map_transport(err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout(err.to_string())
        } else {
            ClientError::Network(err.to_string())
        }
    }

    /// Refresh the token pair if the access token looks stale. No-op when
    /// there is nothing to refresh with.
    async fn ensure_fresh_token(&self) -> Result<(), ClientError> {
        if self.tokens.is_access_token_expired() && self.tokens.refresh_token().is_some() {
            self.refresh_tokens().await?;
        }
        Ok(())
    }

    /// Single-flight token refresh. On failure the session is cleared and
    /// the caller gets `Unauthorized`; the user is told to sign in again.
    pub async fn refresh_tokens(&self) -> Result<(), ClientError> {
        let observed = self.tokens.access_token();
        let url = self.build_url("/token/refresh");
        let client = self.client.clone();
        let result = self
            .tokens
            .refresh_with(observed.as_deref(), |refresh_token| async move {
                let response = client
                    .post(&url)
                    .json(&TokenRefreshRequest { refresh_token })
                    .send()
                    .await
                    .map_err(Self::map_transport)?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(ClientError::from_status(status.as_u16(), body));
                }
                let body: TokenRefreshResponse = response
                    .json()
                    .await
                    .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
                Ok((body.access_token, body.refresh_token))
            })
            .await;

        if let Err(err) = result {
            tracing::warn!(error = %err, "Token refresh failed; clearing session");
            self.tokens.clear();
            self.notifier
                .notify(
                    NotifyLevel::Error,
                    "Your session has expired. Please sign in again.",
                )
                .await;
            return Err(ClientError::Unauthorized(format!(
                "token refresh failed: {}",
                err
            )));
        }
        Ok(())
    }

    async fn send_authed<F>(&self, build: &F) -> Result<Response, ClientError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        let mut request = build(&self.client);
        if let Some(token) = self.tokens.access_token() {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(Self::map_transport)
    }

    /// Run a request with the standard auth flow: pre-flight refresh if
    /// stale, then at most one refresh-and-retry on 401.
    async fn execute<F>(&self, build: F) -> Result<Response, ClientError>
    where
        F: Fn(&Client) -> reqwest::RequestBuilder,
    {
        self.ensure_fresh_token().await?;
        let response = self.send_authed(&build).await?;
        if response.status() == StatusCode::UNAUTHORIZED && self.tokens.refresh_token().is_some() {
            self.refresh_tokens().await?;
            let response = self.send_authed(&build).await?;
            return self.check_status(response).await;
        }
        self.check_status(response).await
    }

    /// Convert non-2xx responses into `ClientError`, notifying the user for
    /// the auth/missing classes.
    async fn check_status(&self, response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        let err = ClientError::from_status(status.as_u16(), body);
        if matches!(
            err,
            ClientError::Unauthorized(_) | ClientError::Forbidden(_) | ClientError::NotFound(_)
        ) {
            self.notifier
                .notify(NotifyLevel::Error, &err.user_message())
                .await;
        }
        Err(err)
    }

    async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
        response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(format!("Failed to parse response: {}", e)))
    }

    /// GET request, deserializing the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.build_url(path);
        let response = self.execute(|c| c.get(&url)).await?;
        Self::parse_json(response).await
    }

    /// POST a JSON body and deserialize the response.
    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let url = self.build_url(path);
        let response = self.execute(|c| c.post(&url).json(body)).await?;
        Self::parse_json(response).await
    }

    /// DELETE request, deserializing the JSON response.
    pub async fn delete_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.build_url(path);
        let response = self.execute(|c| c.delete(&url)).await?;
        Self::parse_json(response).await
    }

    /// POST a JSON body and return the raw streaming response after the
    /// status check. Used by the export pipeline.
    pub async fn post_stream<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ClientError> {
        let url = self.build_url(path);
        self.execute(|c| c.post(&url).json(body)).await
    }

    /// POST a multipart form. Multipart bodies are not replayable, so the
    /// caller supplies a factory and the 401 retry rebuilds the form.
    pub async fn post_multipart<T, F, Fut>(
        &self,
        path: &str,
        make_form: F,
    ) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::multipart::Form, ClientError>>,
    {
        self.ensure_fresh_token().await?;
        let url = self.build_url(path);

        let form = make_form().await?;
        let mut request = self.client.post(&url).multipart(form);
        if let Some(token) = self.tokens.access_token() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(Self::map_transport)?;

        let response = if response.status() == StatusCode::UNAUTHORIZED
            && self.tokens.refresh_token().is_some()
        {
            self.refresh_tokens().await?;
            let form = make_form().await?;
            let mut request = self.client.post(&url).multipart(form);
            if let Some(token) = self.tokens.access_token() {
                request = request.bearer_auth(token);
            }
            request.send().await.map_err(Self::map_transport)?
        } else {
            response
        };

        let response = self.check_status(response).await?;
        Self::parse_json(response).await
    }
}

/// Domain operations.
impl ApiClient {
    /// Paginated dataset query; filters are handed to the backend verbatim.
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse, ClientError> {
        self.post_json("/query", request).await
    }

    /// Distinct values with occurrence counts for one column.
    pub async fn facets(&self, request: &FacetsRequest) -> Result<FacetsResponse, ClientError> {
        self.post_json("/facets", request).await
    }

    /// Current ingestion status snapshot for a job.
    pub async fn job_status(&self, job_id: &str) -> Result<JobStatus, ClientError> {
        self.get(&format!("/status/{}", job_id)).await
    }

    /// Delete one uploaded file's rows. With `dry_run` the server reports
    /// the match count without deleting.
    pub async fn delete_file(
        &self,
        file_id: &str,
        dry_run: bool,
    ) -> Result<DeleteResponse, ClientError> {
        self.delete_json(&format!("/files/{}?dry_run={}", file_id, dry_run))
            .await
    }

    /// Bulk delete by filter. A confirm call with `expected_min`/
    /// `expected_max` guards fails with `Conflict` if the dataset changed
    /// since the dry run.
    pub async fn bulk_delete(&self, request: &DeleteRequest) -> Result<DeleteResponse, ClientError> {
        self.post_json("/delete", request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{json_response, spawn_stub_server};
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    use sift_core::Filters;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn client() -> ApiClient {
        let config = ClientConfig {
            base_url: "https://api.example.com/".to_string(),
            ..ClientConfig::default()
        };
        ApiClient::new(config, Arc::new(TokenManager::new())).unwrap()
    }

    #[test]
    fn build_url_strips_trailing_slash() {
        let api = client();
        assert_eq!(api.base_url(), "https://api.example.com");
        assert_eq!(api.build_url("/query"), "https://api.example.com/query");
    }

    #[test]
    fn ws_url_swaps_scheme() {
        let api = client();
        assert_eq!(
            api.ws_url("/ws/status/j1"),
            "wss://api.example.com/ws/status/j1"
        );
    }

    #[test]
    fn ws_url_carries_token_when_present() {
        let api = client();
        api.tokens().set_tokens("tok", "ref");
        assert_eq!(
            api.ws_url("/ws/status/j1"),
            "wss://api.example.com/ws/status/j1?token=tok"
        );
    }

    fn make_jwt(exp: i64) -> String {
        let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("{}.{}.sig", header, payload)
    }

    fn query_request() -> QueryRequest {
        QueryRequest {
            filters: Filters::new(),
            fields: None,
            limit: 10,
            offset: 0,
        }
    }

    #[tokio::test]
    async fn rejected_request_refreshes_once_and_retries_once() {
        let query_calls = Arc::new(AtomicUsize::new(0));
        let refresh_calls = Arc::new(AtomicUsize::new(0));
        // Fresh by its exp claim, but the server no longer accepts it.
        let stale = make_jwt(chrono::Utc::now().timestamp() + 3600);
        let renewed = make_jwt(chrono::Utc::now().timestamp() + 7200);

        let (qc, rc, accepted) = (query_calls.clone(), refresh_calls.clone(), renewed.clone());
        let base = spawn_stub_server(move |path, bearer| match path {
            "/query" => {
                qc.fetch_add(1, Ordering::SeqCst);
                if bearer == Some(accepted.as_str()) {
                    json_response("200 OK", r#"{"rows": [], "total": 0}"#)
                } else {
                    json_response("401 Unauthorized", r#"{"detail": "token revoked"}"#)
                }
            }
            "/token/refresh" => {
                rc.fetch_add(1, Ordering::SeqCst);
                json_response(
                    "200 OK",
                    &format!(
                        r#"{{"access_token": "{}", "refresh_token": "r2"}}"#,
                        accepted
                    ),
                )
            }
            _ => json_response("404 Not Found", "{}"),
        });

        let config = ClientConfig {
            base_url: base,
            ..ClientConfig::default()
        };
        let tokens = Arc::new(TokenManager::new());
        tokens.set_tokens(&stale, "r1");
        let api = ApiClient::new(config, tokens).unwrap();

        let response = api.query(&query_request()).await.unwrap();
        assert_eq!(response.total, 0);
        assert_eq!(query_calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.tokens().access_token().as_deref(), Some(renewed.as_str()));
    }

    #[tokio::test]
    async fn repeated_rejection_refreshes_and_retries_no_more_than_once() {
        let query_calls = Arc::new(AtomicUsize::new(0));
        let refresh_calls = Arc::new(AtomicUsize::new(0));
        let access = make_jwt(chrono::Utc::now().timestamp() + 3600);
        let renewed = make_jwt(chrono::Utc::now().timestamp() + 7200);

        let (qc, rc) = (query_calls.clone(), refresh_calls.clone());
        let base = spawn_stub_server(move |path, _| match path {
            "/query" => {
                qc.fetch_add(1, Ordering::SeqCst);
                json_response("401 Unauthorized", r#"{"detail": "nope"}"#)
            }
            "/token/refresh" => {
                rc.fetch_add(1, Ordering::SeqCst);
                json_response(
                    "200 OK",
                    &format!(
                        r#"{{"access_token": "{}", "refresh_token": "r2"}}"#,
                        renewed
                    ),
                )
            }
            _ => json_response("404 Not Found", "{}"),
        });

        let config = ClientConfig {
            base_url: base,
            ..ClientConfig::default()
        };
        let tokens = Arc::new(TokenManager::new());
        tokens.set_tokens(&access, "r1");
        let api = ApiClient::new(config, tokens).unwrap();

        let result = api.query(&query_request()).await;
        assert!(matches!(result, Err(ClientError::Unauthorized(_))));
        // One original attempt plus exactly one post-refresh retry.
        assert_eq!(query_calls.load(Ordering::SeqCst), 2);
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn plain_http_becomes_ws() {
        let config = ClientConfig {
            base_url: "http://localhost:8000".to_string(),
            ..ClientConfig::default()
        };
        let api = ApiClient::new(config, Arc::new(TokenManager::new())).unwrap();
        assert_eq!(api.ws_url("/ws/status/x"), "ws://localhost:8000/ws/status/x");
    }
}
