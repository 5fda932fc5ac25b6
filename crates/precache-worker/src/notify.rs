//! Push notifications and the callback relay.
//!
//! A push payload is displayed through the [`NotificationCenter`]; display,
//! click and close are each reported to a remote callback endpoint as
//!
//! ```text
//! POST <callback_endpoint>
//! Authorization: Bearer <data.jwt>
//! { "type": "received" | "clicked" | "closed", "tag": ..., "data": {...} }
//! ```
//!
//! with `jwt` removed from `data` first.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::HeaderValue;
use precache_common::{retry_with_backoff_if, RetryConfig};
use precache_net::{Fetcher, NetError, Request};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

use crate::clients::{ClientId, ClientMatchOptions, ClientType, Clients};
use crate::error::{PrecacheError, PrecacheResult};
use crate::WorkerId;

/// Field of `data` that carries the callback credential.
const JWT_FIELD: &str = "jwt";

/// Unique identifier for a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(u64);

impl NotificationId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Body of a push message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub data: Option<Map<String, JsonValue>>,
}

impl PushPayload {
    pub fn from_slice(bytes: &[u8]) -> PrecacheResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A notification currently on screen.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub id: NotificationId,
    pub title: String,
    pub body: Option<String>,
    pub tag: Option<String>,
    pub icon: Option<String>,
    pub data: Option<Map<String, JsonValue>>,
}

impl Notification {
    /// Target URL carried in `data.url`.
    pub fn target_url(&self) -> Option<&str> {
        self.data.as_ref()?.get("url")?.as_str()
    }
}

/// Displayed notifications.
#[derive(Debug, Default)]
pub struct NotificationCenter {
    shown: HashMap<NotificationId, Notification>,
}

impl NotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Display a payload. A notification with the same tag is replaced.
    pub fn show(&mut self, payload: PushPayload) -> NotificationId {
        if let Some(ref tag) = payload.tag {
            self.shown.retain(|_, n| n.tag.as_ref() != Some(tag));
        }

        let id = NotificationId::new();
        self.shown.insert(
            id,
            Notification {
                id,
                title: payload.title,
                body: payload.body,
                tag: payload.tag,
                icon: payload.icon,
                data: payload.data,
            },
        );
        id
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.shown.get(&id)
    }

    pub fn close(&mut self, id: NotificationId) -> Option<Notification> {
        self.shown.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.shown.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shown.is_empty()
    }
}

/// Kind of callback sent to the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallbackType {
    Received,
    Clicked,
    Closed,
}

/// JSON document posted to the callback endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(rename = "type")]
    pub kind: CallbackType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, JsonValue>>,
}

impl CallbackBody {
    /// Build a body, moving `data.jwt` out into the returned credential.
    ///
    /// `data` is omitted when nothing but the credential was in it.
    pub fn new(
        kind: CallbackType,
        action: Option<String>,
        tag: Option<String>,
        data: Option<Map<String, JsonValue>>,
    ) -> (Self, Option<String>) {
        let mut data = data;
        let jwt = data
            .as_mut()
            .and_then(|d| d.remove(JWT_FIELD))
            .and_then(|v| match v {
                JsonValue::String(s) => Some(s),
                JsonValue::Null => None,
                other => Some(other.to_string()),
            });
        let data = data.filter(|d| !d.is_empty());

        (
            Self {
                action,
                kind,
                tag,
                data,
            },
            jwt,
        )
    }
}

/// What a click resulted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClickOutcome {
    /// No target URL in the notification data.
    Nothing,
    /// An open window already showed the target and was focused.
    Focused(ClientId),
    /// A new window was opened at the target.
    Opened(ClientId),
}

/// Relays notification events to the callback endpoint.
pub struct NotificationRelay {
    worker_id: WorkerId,
    location: Url,
    endpoint: Url,
    retry: RetryConfig,
    fetcher: Arc<dyn Fetcher>,
    center: Arc<RwLock<NotificationCenter>>,
    clients: Arc<RwLock<Clients>>,
}

impl NotificationRelay {
    pub fn new(
        worker_id: WorkerId,
        location: Url,
        endpoint: Url,
        retry: RetryConfig,
        fetcher: Arc<dyn Fetcher>,
        center: Arc<RwLock<NotificationCenter>>,
        clients: Arc<RwLock<Clients>>,
    ) -> Self {
        Self {
            worker_id,
            location,
            endpoint,
            retry,
            fetcher,
            center,
            clients,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Display a push message and report it as received.
    ///
    /// A push without data does nothing.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> PrecacheResult<Option<NotificationId>> {
        let Some(bytes) = data else {
            debug!("Push event without data");
            return Ok(None);
        };

        let payload = PushPayload::from_slice(bytes)?;
        let tag = payload.tag.clone();
        let data = payload.data.clone();

        let id = self.center.write().await.show(payload);
        info!(?id, tag = ?tag, "Displayed notification");

        let (body, jwt) = CallbackBody::new(CallbackType::Received, None, tag, data);
        self.fire_callback(&body, jwt.as_deref()).await;
        Ok(Some(id))
    }

    /// Report a click, close the notification and bring its target URL forward.
    pub async fn handle_click(
        &self,
        id: NotificationId,
        action: Option<&str>,
    ) -> PrecacheResult<ClickOutcome> {
        let notification = self
            .center
            .write()
            .await
            .close(id)
            .ok_or_else(|| PrecacheError::state(format!("no notification {:?}", id)))?;

        let (body, jwt) = CallbackBody::new(
            CallbackType::Clicked,
            Some(action.unwrap_or_default().to_string()),
            notification.tag.clone(),
            notification.data.clone(),
        );
        self.fire_callback(&body, jwt.as_deref()).await;

        let Some(target) = notification.target_url() else {
            return Ok(ClickOutcome::Nothing);
        };
        let target = self.location.join(target)?;

        let mut clients = self.clients.write().await;
        let windows = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        };
        let existing = clients
            .match_all(&windows)
            .into_iter()
            .find(|c| c.url == target)
            .map(|c| c.id);

        match existing {
            Some(client) => {
                clients.focus(client)?;
                debug!(?client, url = %target, "Focused existing window");
                Ok(ClickOutcome::Focused(client))
            }
            None => {
                let client = clients.open_window(target, Some(self.worker_id));
                Ok(ClickOutcome::Opened(client))
            }
        }
    }

    /// Report a notification dismissed by the user.
    pub async fn handle_close(&self, id: NotificationId) -> PrecacheResult<()> {
        let notification = self
            .center
            .write()
            .await
            .close(id)
            .ok_or_else(|| PrecacheError::state(format!("no notification {:?}", id)))?;

        let (body, jwt) =
            CallbackBody::new(CallbackType::Closed, None, notification.tag, notification.data);
        self.fire_callback(&body, jwt.as_deref()).await;
        Ok(())
    }

    /// Post a callback. Failures are logged, never returned.
    async fn fire_callback(&self, body: &CallbackBody, jwt: Option<&str>) {
        if let Err(e) = self.post_callback(body, jwt).await {
            warn!(endpoint = %self.endpoint, kind = ?body.kind, error = %e, "Notification callback failed");
        }
    }

    async fn post_callback(&self, body: &CallbackBody, jwt: Option<&str>) -> PrecacheResult<()> {
        let json = Bytes::from(serde_json::to_vec(body)?);

        let mut request = Request::post(self.endpoint.clone(), json)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(jwt) = jwt {
            let value = HeaderValue::try_from(format!("Bearer {}", jwt))
                .map_err(|e| PrecacheError::state(format!("unusable callback credential: {}", e)))?;
            request = request.header(AUTHORIZATION, value);
        }

        retry_with_backoff_if(
            &self.retry,
            || {
                let request = request.clone();
                async move { self.fetcher.fetch(request).await?.error_for_status() }
            },
            NetError::is_retryable,
        )
        .await?;

        debug!(endpoint = %self.endpoint, kind = ?body.kind, "Notification callback delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: JsonValue) -> Option<Map<String, JsonValue>> {
        match value {
            JsonValue::Object(map) => Some(map),
            _ => None,
        }
    }

    #[test]
    fn test_callback_body_moves_jwt_out() {
        let (body, jwt) = CallbackBody::new(
            CallbackType::Received,
            None,
            Some("door".into()),
            data(json!({"jwt": "abc.def", "entity_id": "lock.front"})),
        );

        assert_eq!(jwt.as_deref(), Some("abc.def"));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"type": "received", "tag": "door", "data": {"entity_id": "lock.front"}})
        );
    }

    #[test]
    fn test_callback_body_drops_empty_data_and_missing_tag() {
        let (body, jwt) = CallbackBody::new(
            CallbackType::Clicked,
            Some(String::new()),
            None,
            data(json!({"jwt": "abc"})),
        );

        assert_eq!(jwt.as_deref(), Some("abc"));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({"action": "", "type": "clicked"})
        );
    }

    #[test]
    fn test_center_replaces_same_tag() {
        let mut center = NotificationCenter::new();
        let payload = PushPayload {
            title: "Door".into(),
            body: None,
            tag: Some("door".into()),
            icon: None,
            data: None,
        };

        let first = center.show(payload.clone());
        let second = center.show(payload);

        assert_eq!(center.len(), 1);
        assert!(center.get(first).is_none());
        assert!(center.get(second).is_some());
    }

    #[test]
    fn test_payload_target_url() {
        let payload =
            PushPayload::from_slice(br#"{"title": "t", "data": {"url": "/lovelace/0"}}"#).unwrap();
        let mut center = NotificationCenter::new();
        let id = center.show(payload);
        assert_eq!(center.get(id).unwrap().target_url(), Some("/lovelace/0"));
    }
}
