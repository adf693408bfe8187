//! REST API client for the notification service
//!
//! The service derives the user or shop from the bearer token, so the identity
//! only selects which endpoint family is called.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::credentials::CredentialProvider;
use crate::error::NotifyError;
use crate::normalize::from_value;
use crate::types::{Identity, IdentityKind, NotificationRecord};

/// Operations on the notification service, keyed by identity.
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// Full current list for the identity.
    async fn list(&self, identity: &Identity) -> Result<Vec<NotificationRecord>, NotifyError>;

    async fn mark_read(&self, identity: &Identity, id: &str) -> Result<(), NotifyError>;

    async fn mark_all_read(&self, identity: &Identity) -> Result<(), NotifyError>;

    async fn delete(&self, identity: &Identity, id: &str) -> Result<(), NotifyError>;

    async fn delete_all(&self, identity: &Identity) -> Result<(), NotifyError>;
}

/// HTTP implementation over reqwest.
pub struct HttpNotificationApi {
    client: Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpNotificationApi {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path);
        debug!(method = %method, url = %url, "Notification API request");
        let builder = self.client.request(method, url);
        match self.credentials.bearer_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<reqwest::Response, NotifyError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(NotifyError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn execute(&self, method: Method, path: &str) -> Result<(), NotifyError> {
        self.send(self.request(method, path)).await?;
        Ok(())
    }
}

fn by_kind(identity: &Identity, user: &'static str, shop: &'static str) -> &'static str {
    match identity.kind {
        IdentityKind::Customer => user,
        IdentityKind::Shop => shop,
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn list(&self, identity: &Identity) -> Result<Vec<NotificationRecord>, NotifyError> {
        let path = by_kind(identity, "getAllByUserId", "getAllByShopId");
        let response = self.send(self.request(Method::GET, path)).await?;
        let text = response.text().await?;
        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)?
        };

        let items = match body {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(NotifyError::Protocol(format!(
                    "Expected a JSON array, got: {}",
                    other
                )))
            }
        };

        let arrival = Utc::now();
        let mut records = Vec::with_capacity(items.len());
        for item in &items {
            match from_value(item, arrival) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    identity = %identity,
                    error = %e,
                    "Skipping malformed notification"
                ),
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(identity = %identity, count = records.len(), "Fetched notifications");
        Ok(records)
    }

    async fn mark_read(&self, _identity: &Identity, id: &str) -> Result<(), NotifyError> {
        let path = format!("markAsRead/{}", urlencoding::encode(id));
        self.execute(Method::PUT, &path).await
    }

    async fn mark_all_read(&self, identity: &Identity) -> Result<(), NotifyError> {
        let path = by_kind(identity, "markAllAsReadByUserId", "markAllAsReadByShopId");
        self.execute(Method::PUT, path).await
    }

    async fn delete(&self, _identity: &Identity, id: &str) -> Result<(), NotifyError> {
        let path = format!("delete/{}", urlencoding::encode(id));
        self.execute(Method::DELETE, &path).await
    }

    async fn delete_all(&self, identity: &Identity) -> Result<(), NotifyError> {
        let path = by_kind(identity, "deleteAllByUserId", "deleteAllByShopId");
        self.execute(Method::DELETE, path).await
    }
}
