mod endpoints;
pub mod scripted;
mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::storage::{AUTH_TOKEN_KEY, ClientStorage};

pub use endpoints::message_id_text;
pub use transport::ReqwestTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json_body(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub status_text: String,
    pub body: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No response reached the client.
    #[error("{0}")]
    Unreachable(String),

    /// A status line arrived but the body could not be read.
    #[error("failed reading response body: {message}")]
    Body { status: u16, message: String },
}

impl From<TransportError> for ApiError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unreachable(message) => Self::Network { message },
            TransportError::Body { status, message } => Self::Decode { status, message },
        }
    }
}

/// One HTTP exchange. Production uses `ReqwestTransport`; tests script replies.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Authenticated JSON client for the remote task API.
///
/// The bearer token is read from client storage on every request, so a token
/// written by the session store is picked up by the very next call.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn ClientStorage>,
    cancel: Option<CancellationToken>,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("scoped", &self.cancel.is_some())
            .finish()
    }
}

impl ApiClient {
    pub fn new(
        base_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        storage: Arc<dyn ClientStorage>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            transport,
            storage,
            cancel: None,
        }
    }

    pub fn with_reqwest(
        base_url: impl Into<String>,
        timeout: Duration,
        storage: Arc<dyn ClientStorage>,
    ) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(timeout)?;
        Ok(Self::new(base_url, Arc::new(transport), storage))
    }

    /// A copy whose requests resolve to `ApiError::Cancelled` once `token`
    /// is cancelled.
    pub fn scoped(&self, token: CancellationToken) -> Self {
        Self {
            cancel: Some(token),
            ..self.clone()
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn storage(&self) -> &Arc<dyn ClientStorage> {
        &self.storage
    }

    pub fn bearer_token(&self) -> Option<String> {
        self.storage
            .get(AUTH_TOKEN_KEY)
            .filter(|token| !token.trim().is_empty())
    }

    #[tracing::instrument(skip(self, body))]
    pub async fn request(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        self.exchange(method, path, body).await.map(|(_, value)| value)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.typed(HttpMethod::Get, path, None).await
    }

    /// GET with query parameters; `None` values are left out.
    pub async fn get_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, Option<String>)],
    ) -> Result<T, ApiError> {
        let query = params
            .iter()
            .filter_map(|(key, value)| {
                value.as_ref().map(|value| {
                    format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(value)
                    )
                })
            })
            .collect::<Vec<_>>()
            .join("&");

        if query.is_empty() {
            self.get(path).await
        } else {
            self.get(&format!("{path}?{query}")).await
        }
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.typed(HttpMethod::Post, path, Some(encode(body)?)).await
    }

    pub async fn put<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.typed(HttpMethod::Put, path, Some(encode(body)?)).await
    }

    pub async fn patch<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        self.typed(HttpMethod::Patch, path, Some(encode(body)?)).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ApiError> {
        self.exchange(HttpMethod::Delete, path, None).await.map(|_| ())
    }

    async fn typed<T: DeserializeOwned>(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ApiError> {
        let (status, value) = self.exchange(method, path, body).await?;
        serde_json::from_value(value).map_err(|err| ApiError::Decode {
            status,
            message: err.to_string(),
        })
    }

    async fn exchange(
        &self,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<(u16, Value), ApiError> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        if let Some(token) = self.bearer_token() {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }

        let body = body
            .map(|value| serde_json::to_string(&value))
            .transpose()
            .map_err(|err| ApiError::Encode {
                message: err.to_string(),
            })?;

        let request = HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            headers,
            body,
        };

        let sent = self.transport.send(request);
        let outcome = match &self.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(%method, path, "request cancelled");
                        return Err(ApiError::Cancelled);
                    }
                    outcome = sent => outcome,
                }
            }
            None => sent.await,
        };

        let response = outcome.map_err(|err| {
            warn!(%method, path, error = %err, "request failed in transport");
            ApiError::from(err)
        })?;

        let status = response.status;
        debug!(%method, path, status, "response received");
        interpret_response(response).map(|value| (status, value))
    }
}

fn encode<B: Serialize + ?Sized>(body: &B) -> Result<Value, ApiError> {
    serde_json::to_value(body).map_err(|err| ApiError::Encode {
        message: err.to_string(),
    })
}

/// Maps a raw response to the JSON the caller sees: errors normalized,
/// empty bodies as `{}`, and a `{data, message}` envelope unwrapped.
pub fn interpret_response(response: HttpResponse) -> Result<Value, ApiError> {
    let status = response.status;
    if !(200..300).contains(&status) {
        return Err(error_from_response(response));
    }

    if status == 204 || response.body.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let parsed: Value = serde_json::from_str(&response.body).map_err(|err| ApiError::Decode {
        status,
        message: err.to_string(),
    })?;

    Ok(unwrap_envelope(parsed))
}

fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map) => match map.remove("data") {
            Some(data) => data,
            None => Value::Object(map),
        },
        other => other,
    }
}

fn error_from_response(response: HttpResponse) -> ApiError {
    let fallback = format!(
        "HTTP Error: {} {}",
        response.status, response.status_text
    )
    .trim_end()
    .to_string();

    let parsed = serde_json::from_str::<Value>(&response.body).ok();
    let message = parsed
        .as_ref()
        .and_then(|value| {
            string_field(value, "message").or_else(|| string_field(value, "detail"))
        })
        .unwrap_or(fallback);
    let code = parsed
        .as_ref()
        .and_then(|value| string_field(value, "code").or_else(|| string_field(value, "error_code")));

    let body = match parsed {
        Some(value) => Some(value),
        None if response.body.trim().is_empty() => None,
        None => Some(Value::String(response.body)),
    };

    ApiError::Http {
        status: response.status,
        message,
        code,
        body,
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
