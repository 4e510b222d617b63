// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Webhook collaborator: posts session lifecycle events to a configured URL.
//! Delivery is fire-and-forget with a hard timeout; it can never block the
//! supervisor core or fail a request.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

use crate::event::Event;

/// Total budget per delivery attempt.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    /// Returns `None` when no URL is configured.
    pub fn new(url: Option<String>) -> Option<Arc<Self>> {
        let url = url?;
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .ok()?;
        Some(Arc::new(Self { url, client }))
    }

    /// Consume supervisor events and forward lifecycle changes.
    pub fn spawn_forwarder(self: &Arc<Self>, mut rx: broadcast::Receiver<Event>) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let payload = match event {
                    Event::Created(info) => json!({
                        "event": "session:created",
                        "sessionId": info.id,
                        "name": info.name,
                    }),
                    Event::StateChange { id, state, prev } => json!({
                        "event": "session:stateChanged",
                        "sessionId": id,
                        "state": state.as_str(),
                        "prev": prev.as_str(),
                    }),
                    Event::Exit { id, code } => json!({
                        "event": "session:exited",
                        "sessionId": id,
                        "exitCode": code,
                    }),
                    // Raw output is far too chatty for webhooks.
                    Event::Output { .. } => continue,
                };
                notifier.deliver(payload);
            }
        });
    }

    fn deliver(self: &Arc<Self>, payload: serde_json::Value) {
        let notifier = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = notifier.client.post(&notifier.url).json(&payload).send().await {
                warn!("webhook delivery failed: {e}");
            }
        });
    }
}
