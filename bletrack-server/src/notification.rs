//! Outbound notification delivery.
//!
//! The capture thread enqueues `Notification`s; a `NotificationDispatcher`
//! running on the tokio runtime drains the queue on a timer and hands every
//! item to each configured `Notifier`. Delivery is best-effort: failures are
//! logged and counted, never retried.

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use bletrack_core::queue::NotificationQueue;
use bletrack_core::types::{unix_now, Notification, StopFlag};

pub const TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{service} rejected request with status {status}: {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },
}

/// A delivery channel for notifications.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

async fn check_status(
    service: &'static str,
    resp: reqwest::Response,
) -> Result<(), NotifyError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        service,
        status: status.as_u16(),
        body,
    })
}

// ---------------------------------------------------------------------------
// Subscribers
// ---------------------------------------------------------------------------

/// Chats that receive Telegram notifications.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    chats: RwLock<BTreeSet<i64>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        SubscriberRegistry::default()
    }

    /// Returns false if the chat was already subscribed.
    pub fn add(&self, chat_id: i64) -> bool {
        self.chats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(chat_id)
    }

    /// Returns false if the chat was not subscribed.
    pub fn remove(&self, chat_id: i64) -> bool {
        self.chats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&chat_id)
    }

    pub fn contains(&self, chat_id: i64) -> bool {
        self.chats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&chat_id)
    }

    /// Snapshot of subscribed chats, ascending.
    pub fn list(&self) -> Vec<i64> {
        self.chats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.chats.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Telegram
// ---------------------------------------------------------------------------

/// Sends each notification to every subscribed chat via the Bot API:
/// `sendMessage` always, `sendLocation` when a location is attached.
///
/// A chat that answers 403 (bot blocked or removed from the group) is
/// dropped from the registry and receives nothing further.
pub struct TelegramNotifier {
    client: reqwest::Client,
    base_url: String,
    token: String,
    subscribers: Arc<SubscriberRegistry>,
}

impl TelegramNotifier {
    pub fn new(token: &str, subscribers: Arc<SubscriberRegistry>) -> Self {
        TelegramNotifier::with_base_url(TELEGRAM_API, token, subscribers)
    }

    /// Point at a different API host (self-hosted Bot API server, tests).
    pub fn with_base_url(
        base_url: &str,
        token: &str,
        subscribers: Arc<SubscriberRegistry>,
    ) -> Self {
        TelegramNotifier {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            subscribers,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        check_status("telegram", resp).await
    }
}

#[async_trait::async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let chats = self.subscribers.list();
        if chats.is_empty() {
            debug!("no telegram subscribers");
            return Ok(());
        }

        let mut first_error = None;
        for chat_id in chats {
            if !self.subscribers.contains(chat_id) {
                continue;
            }
            let mut result = self
                .call(
                    "sendMessage",
                    serde_json::json!({ "chat_id": chat_id, "text": notification.text }),
                )
                .await;
            if let (Ok(()), Some(loc)) = (&result, notification.location) {
                result = self
                    .call(
                        "sendLocation",
                        serde_json::json!({
                            "chat_id": chat_id,
                            "latitude": loc.latitude,
                            "longitude": loc.longitude,
                        }),
                    )
                    .await;
            }
            match result {
                Ok(()) => {}
                Err(NotifyError::Rejected { status: 403, .. }) => {
                    self.subscribers.remove(chat_id);
                    warn!(chat_id, "telegram chat refused delivery, unsubscribed");
                }
                Err(e) => {
                    warn!(chat_id, error = %e, "telegram delivery failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
    latitude: Option<f64>,
    longitude: Option<f64>,
    timestamp: f64,
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Self {
        WebhookNotifier {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

fn webhook_payload(notification: &Notification) -> WebhookPayload<'_> {
    WebhookPayload {
        text: &notification.text,
        latitude: notification.location.map(|l| l.latitude),
        longitude: notification.location.map(|l| l.longitude),
        timestamp: unix_now(),
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&webhook_payload(notification))
            .send()
            .await?;
        check_status("webhook", resp).await
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub drained: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// Drains the queue and fans each notification out to every notifier.
pub struct NotificationDispatcher {
    queue: Arc<NotificationQueue>,
    notifiers: Vec<Box<dyn Notifier>>,
    /// Max items per drain; 0 drains everything.
    batch: usize,
    stats: DispatchStats,
}

impl NotificationDispatcher {
    pub fn new(queue: Arc<NotificationQueue>) -> Self {
        NotificationDispatcher {
            queue,
            notifiers: Vec::new(),
            batch: 0,
            stats: DispatchStats::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn notifier_names(&self) -> Vec<&str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    /// Drain once and deliver. Returns the number of notifications taken.
    pub async fn dispatch_once(&mut self) -> usize {
        let items = if self.batch == 0 {
            self.queue.drain_all()
        } else {
            self.queue.drain_up_to(self.batch)
        };
        self.stats.drained += items.len() as u64;

        for item in &items {
            for notifier in &self.notifiers {
                match notifier.deliver(item).await {
                    Ok(()) => self.stats.delivered += 1,
                    Err(e) => {
                        self.stats.failed += 1;
                        warn!(
                            notifier = notifier.name(),
                            error = %e,
                            "notification not delivered"
                        );
                    }
                }
            }
        }
        items.len()
    }

    /// Dispatch every `interval` until `stop` is set, then drain what is left.
    pub async fn run(mut self, interval: Duration, stop: StopFlag) -> DispatchStats {
        info!(
            notifiers = ?self.notifier_names(),
            interval_secs = interval.as_secs_f64(),
            "notification dispatcher started"
        );
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        while !stop.is_set() {
            ticker.tick().await;
            self.dispatch_once().await;
        }
        while self.dispatch_once().await > 0 {}
        info!(
            delivered = self.stats.delivered,
            failed = self.stats.failed,
            "notification dispatcher stopped"
        );
        self.stats
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
