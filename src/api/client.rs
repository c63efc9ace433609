use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::TransportError;
use crate::config::ApiConfig;
use crate::resources::{ListFilter, ResourceKind};

use super::ResourceApi;

/// HTTP client for the dashboard resource API.
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base_url: Url,
}

impl ApiClient {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid API url {}: {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("API url {} cannot be used as a base", config.url));
    }

    let mut headers = HeaderMap::new();
    if let Some(token) = token {
      let value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid API token: {}", e))?;
      headers.insert(AUTHORIZATION, value);
    }

    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { http, base_url })
  }

  /// Base URL with `segments` appended as path segments.
  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  fn list_url(&self, kind: ResourceKind, filter: &ListFilter) -> Url {
    let mut url = self.endpoint(&[kind.path()]);
    let pairs = filter.to_params().to_query_pairs();
    if !pairs.is_empty() {
      url.query_pairs_mut().extend_pairs(pairs);
    }
    url
  }

  fn item_url(&self, kind: ResourceKind, id: u64) -> Url {
    self.endpoint(&[kind.path(), &id.to_string()])
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    debug!(%method, %url, "request");
    self.http.request(method, url)
  }

  async fn send(&self, request: RequestBuilder) -> Result<Value, TransportError> {
    let response = request.send().await.map_err(transport_error)?;
    read_json(response).await
  }
}

impl ResourceApi for ApiClient {
  async fn list(&self, kind: ResourceKind, filter: &ListFilter) -> Result<Value, TransportError> {
    self
      .send(self.request(Method::GET, self.list_url(kind, filter)))
      .await
  }

  async fn get_one(&self, kind: ResourceKind, id: u64) -> Result<Value, TransportError> {
    self
      .send(self.request(Method::GET, self.item_url(kind, id)))
      .await
  }

  async fn stats(&self, kind: ResourceKind) -> Result<Value, TransportError> {
    let url = self.endpoint(&[kind.path(), "stats"]);
    self.send(self.request(Method::GET, url)).await
  }

  async fn create(&self, kind: ResourceKind, body: &Value) -> Result<Value, TransportError> {
    let url = self.endpoint(&[kind.path()]);
    self.send(self.request(Method::POST, url).json(body)).await
  }

  async fn update(&self, kind: ResourceKind, id: u64, changes: &Value) -> Result<Value, TransportError> {
    self
      .send(self.request(Method::PATCH, self.item_url(kind, id)).json(changes))
      .await
  }

  async fn delete(&self, kind: ResourceKind, id: u64) -> Result<Value, TransportError> {
    self
      .send(self.request(Method::DELETE, self.item_url(kind, id)))
      .await
  }
}

fn transport_error(err: reqwest::Error) -> TransportError {
  if err.is_timeout() {
    TransportError::Timeout
  } else if err.is_decode() {
    TransportError::Decode(err.to_string())
  } else {
    TransportError::Network(err.to_string())
  }
}

async fn read_json(response: Response) -> Result<Value, TransportError> {
  let status = response.status();
  let body = response.bytes().await.map_err(transport_error)?;

  if !status.is_success() {
    return Err(TransportError::Status {
      status: status.as_u16(),
      message: error_message(&body),
    });
  }
  if body.is_empty() {
    // 204 No Content and friends
    return Ok(Value::Null);
  }
  serde_json::from_slice(&body).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Best-effort human message from an error body.
fn error_message(body: &[u8]) -> String {
  if let Ok(json) = serde_json::from_slice::<Value>(body) {
    for field in ["message", "error", "detail"] {
      if let Some(message) = json.get(field).and_then(Value::as_str) {
        return message.to_string();
      }
    }
  }
  let text = String::from_utf8_lossy(body);
  let text = text.trim();
  if text.is_empty() {
    return "no response body".to_string();
  }
  text.chars().take(200).collect()
}
