//! Asynchronous webhook fan-out.
//!
//! Events go through a bounded channel drained by a single worker; overflow
//! is dropped rather than blocking the request path. Generic destinations
//! receive the raw event JSON with an HMAC signature when a secret is
//! configured; Slack and Discord get their own message shapes.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::events::{Event, EventKind};

const CHANNEL_CAPACITY: usize = 1000;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationKind {
    Generic,
    Slack,
    Discord,
}

#[derive(Debug, Clone)]
pub struct WebhookDestination {
    pub kind: DestinationKind,
    pub url: String,
    pub secret: Option<String>,
    /// Event kinds to deliver. Empty means all.
    pub event_filter: Vec<EventKind>,
    pub retry_count: u32,
}

impl WebhookDestination {
    pub fn generic(url: String, secret: Option<String>) -> Self {
        Self {
            kind: DestinationKind::Generic,
            url,
            secret,
            event_filter: Vec::new(),
            retry_count: 2,
        }
    }

    pub fn slack(url: String) -> Self {
        Self {
            kind: DestinationKind::Slack,
            url,
            secret: None,
            event_filter: Vec::new(),
            retry_count: 2,
        }
    }

    pub fn discord(url: String) -> Self {
        Self {
            kind: DestinationKind::Discord,
            url,
            secret: None,
            event_filter: Vec::new(),
            retry_count: 2,
        }
    }

    fn accepts(&self, kind: EventKind) -> bool {
        self.event_filter.is_empty() || self.event_filter.contains(&kind)
    }
}

pub struct WebhookDispatcher {
    tx: Mutex<Option<mpsc::Sender<Event>>>,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WebhookDispatcher {
    pub fn new(destinations: Vec<WebhookDestination>, client: reqwest::Client) -> Self {
        let (tx, mut rx) = mpsc::channel::<Event>(CHANNEL_CAPACITY);

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for dest in destinations.iter().filter(|d| d.accepts(event.kind)) {
                    deliver(&client, dest, &event).await;
                }
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Queue an event. Never blocks; a full channel drops the event.
    pub fn emit(&self, event: Event) {
        let tx = self.tx.lock().unwrap();
        if let Some(tx) = tx.as_ref()
            && let Err(e) = tx.try_send(event)
        {
            tracing::warn!("webhook queue full, dropping event: {e}");
        }
    }

    /// Stop accepting events and wait for the queue to drain.
    pub async fn close(&self) {
        let tx = self.tx.lock().unwrap().take();
        drop(tx);
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

async fn deliver(client: &reqwest::Client, dest: &WebhookDestination, event: &Event) {
    let body = match dest.kind {
        DestinationKind::Generic => serde_json::to_vec(event),
        DestinationKind::Slack => serde_json::to_vec(&slack_message(event)),
        DestinationKind::Discord => serde_json::to_vec(&discord_message(event)),
    };
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("webhook payload serialization failed: {e}");
            return;
        }
    };

    let delivery_id = uuid::Uuid::new_v4().to_string();
    let tries = dest.retry_count + 1;

    for attempt in 1..=tries {
        let mut request = client
            .post(&dest.url)
            .header("content-type", "application/json")
            .body(body.clone());

        if dest.kind == DestinationKind::Generic {
            request = request
                .header("X-Veil-Event", event.kind.as_str())
                .header("X-Veil-Delivery", &delivery_id);
            if let Some(secret) = &dest.secret
                && let Some(signature) = sign(secret, &body)
            {
                request = request.header("X-Veil-Signature", format!("sha256={signature}"));
            }
        }

        match request.send().await {
            Ok(response) if response.status().is_success() => return,
            Ok(response) => {
                tracing::warn!(
                    "webhook {} returned {} (attempt {attempt}/{tries})",
                    dest.url,
                    response.status()
                );
            }
            Err(e) => {
                tracing::warn!("webhook {} failed (attempt {attempt}/{tries}): {e}", dest.url);
            }
        }

        if attempt < tries {
            tokio::time::sleep(RETRY_BACKOFF * attempt).await;
        }
    }
}

fn sign(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn severity_color(kind: EventKind) -> (&'static str, u32) {
    match kind {
        EventKind::PiiDetected => ("warning", 0x00FB_8C00),
        EventKind::ProviderUnhealthy => ("warning", 0x00FB_8C00),
        EventKind::InjectionBlocked | EventKind::GuardrailViolation | EventKind::CanaryLeaked => {
            ("danger", 0x00E5_3935)
        }
    }
}

fn slack_message(event: &Event) -> serde_json::Value {
    let (color, _) = severity_color(event.kind);
    serde_json::json!({
        "text": format!("veil: {} (session {})", event.kind.as_str(), event.session),
        "attachments": [{
            "color": color,
            "text": event.detail.to_string(),
            "ts": event.at.timestamp(),
        }],
    })
}

fn discord_message(event: &Event) -> serde_json::Value {
    let (_, color) = severity_color(event.kind);
    serde_json::json!({
        "content": format!("veil: {}", event.kind.as_str()),
        "embeds": [{
            "title": event.kind.as_str(),
            "description": format!("session `{}`\n```json\n{}\n```", event.session, event.detail),
            "color": color,
            "timestamp": event.at.to_rfc3339(),
        }],
    })
}
