//! PostgREST client.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::{RemoteBackend, RemoteError};
use crate::auth::AuthProvider;
use crate::config::BackendConfig;
use crate::registry::{ConflictKey, Table};

/// REST client for a PostgREST-style backend (`{url}/rest/v1/{table}`).
#[derive(Clone)]
pub struct RestBackend {
  client: reqwest::Client,
  base: Option<Url>,
  api_key: String,
  auth: Arc<dyn AuthProvider>,
}

impl RestBackend {
  pub fn new(config: &BackendConfig, auth: Arc<dyn AuthProvider>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let base = match config.url.as_deref() {
      Some(raw) if !raw.trim().is_empty() => {
        let mut raw = raw.trim().to_string();
        if !raw.ends_with('/') {
          raw.push('/');
        }
        let url = Url::parse(&raw)
          .and_then(|u| u.join("rest/v1/"))
          .map_err(|e| eyre!("Invalid backend url {}: {}", raw, e))?;
        Some(url)
      }
      _ => None,
    };

    Ok(Self {
      client,
      base,
      api_key: config.api_key.clone().unwrap_or_default(),
      auth,
    })
  }

  fn base(&self) -> Result<&Url, RemoteError> {
    self.base.as_ref().ok_or(RemoteError::NotConfigured)
  }

  fn table_url(&self, table: Table) -> Result<Url, RemoteError> {
    self
      .base()?
      .join(table.remote_name())
      .map_err(|e| RemoteError::Transport(format!("bad table url: {}", e)))
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let token = self
      .auth
      .access_token()
      .unwrap_or_else(|| self.api_key.clone());

    self
      .client
      .request(method, url)
      .header("apikey", &self.api_key)
      .bearer_auth(token)
  }

  async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, RemoteError> {
    let response = request
      .send()
      .await
      .map_err(|e| RemoteError::Transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let message = response
      .text()
      .await
      .unwrap_or_else(|_| status.canonical_reason().unwrap_or("").to_string());
    Err(RemoteError::Rejected {
      status: status.as_u16(),
      message,
    })
  }
}

#[async_trait]
impl RemoteBackend for RestBackend {
  async fn select(&self, table: Table, owner_id: &str) -> Result<Vec<Value>, RemoteError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair("owner_id", &format!("eq.{}", owner_id))
      .append_pair("order", "updated_at.desc");

    let response = self.send(self.request(Method::GET, url)).await?;
    response
      .json::<Vec<Value>>()
      .await
      .map_err(|e| RemoteError::Transport(format!("failed to decode rows: {}", e)))
  }

  async fn insert(&self, table: Table, rows: &Value) -> Result<(), RemoteError> {
    let url = self.table_url(table)?;
    let request = self
      .request(Method::POST, url)
      .header("Prefer", "return=minimal")
      .json(rows);
    self.send(request).await.map(|_| ())
  }

  async fn update(&self, table: Table, id: &str, row: &Value) -> Result<(), RemoteError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id));

    let request = self
      .request(Method::PATCH, url)
      .header("Prefer", "return=minimal")
      .json(row);
    self.send(request).await.map(|_| ())
  }

  async fn upsert(
    &self,
    table: Table,
    rows: &Value,
    on_conflict: ConflictKey,
  ) -> Result<(), RemoteError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("on_conflict", on_conflict.column());

    let request = self
      .request(Method::POST, url)
      .header("Prefer", "resolution=merge-duplicates,return=minimal")
      .json(rows);
    self.send(request).await.map(|_| ())
  }

  async fn delete(&self, table: Table, id: &str) -> Result<(), RemoteError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("id", &format!("eq.{}", id));

    self
      .send(self.request(Method::DELETE, url))
      .await
      .map(|_| ())
  }

  async fn ping(&self) -> Result<(), RemoteError> {
    let url = self.base()?.clone();
    match self.send(self.request(Method::GET, url)).await {
      Ok(_) => Ok(()),
      // Reachable but the root listing is not exposed to this key
      Err(RemoteError::Rejected { status, .. })
        if status == StatusCode::UNAUTHORIZED.as_u16() || status == StatusCode::NOT_FOUND.as_u16() =>
      {
        Ok(())
      }
      Err(e) => Err(e),
    }
  }
}
