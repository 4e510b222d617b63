// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Streaming fan-out bridge: per-client subscriptions, output coalescing,
//! and backpressure-aware delivery.
//!
//! Every client owns one ordered frame queue. Output and scrollback frames
//! count against a byte budget and are evicted oldest-first when a client
//! falls behind; lifecycle and state frames are never dropped. Keeping one
//! queue (rather than separate channels per frame class) is what preserves
//! the output-before-exit ordering guarantee.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::OpError;
use crate::event::Event;
use crate::supervisor::Supervisor;
use crate::transport::ws_msg::ServerMessage;
use crate::utf8::Utf8Stream;

/// Ceiling on concurrent streaming clients.
pub const MAX_CLIENTS: usize = 50;

/// Close code sent to over-capacity connections.
pub const OVER_CAPACITY_CLOSE: u16 = 1013;

/// Output buffered for this long before a coalesced flush.
pub const COALESCE_INTERVAL: Duration = Duration::from_millis(16);

/// Per-client byte budget for droppable frames.
pub const CLIENT_QUEUE_BYTES: usize = 4 * 1024 * 1024;

/// Maximum accepted `input` payload; larger frames are rejected silently.
pub const MAX_INPUT_BYTES: usize = 65_536;

/// Ordered frame queue for one client.
///
/// `push` never blocks: when the droppable byte budget is exceeded, the
/// oldest droppable frame is discarded and counted. Non-droppable frames
/// are retained regardless.
pub struct ClientQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    budget: usize,
}

struct QueueInner {
    frames: VecDeque<ServerMessage>,
    droppable_bytes: usize,
    dropped: u64,
    closed: bool,
}

impl ClientQueue {
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::new(),
                droppable_bytes: 0,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            budget,
        }
    }

    pub fn push(&self, frame: ServerMessage) {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.droppable_bytes += frame.cost();
            inner.frames.push_back(frame);

            while inner.droppable_bytes > self.budget {
                let Some(pos) = inner.frames.iter().position(ServerMessage::droppable) else {
                    break;
                };
                if let Some(evicted) = inner.frames.remove(pos) {
                    inner.droppable_bytes -= evicted.cost();
                    inner.dropped += 1;
                }
            }
        }
        self.notify.notify_one();
    }

    /// Next frame, in order; `None` once closed and drained.
    pub async fn pop(&self) -> Option<ServerMessage> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    inner.droppable_bytes -= frame.cost();
                    return Some(frame);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<ServerMessage> {
        let mut inner = self.inner.lock();
        let frame = inner.frames.pop_front()?;
        inner.droppable_bytes -= frame.cost();
        Some(frame)
    }

    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_one();
    }

    /// Frames discarded for this client so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

struct Client {
    subscriptions: HashSet<String>,
    #[allow(dead_code)]
    addr: String,
    queue: Arc<ClientQueue>,
}

struct Inner {
    clients: HashMap<u64, Client>,
    next_client: u64,
    /// Per-session coalescing buffers, flushed together by one timer.
    pending: HashMap<String, String>,
    /// Per-session decode state: a glyph split across two output chunks
    /// must not reach clients as replacement characters.
    decoders: HashMap<String, Utf8Stream>,
    flush_armed: bool,
}

/// Handed to the WebSocket handler on register.
pub struct ClientConnection {
    pub id: u64,
    pub queue: Arc<ClientQueue>,
}

/// The fan-out engine. One per supervisor.
pub struct Bridge {
    inner: Mutex<Inner>,
    supervisor: Arc<Supervisor>,
}

impl Bridge {
    /// Build the bridge and start consuming the supervisor event stream.
    pub fn new(supervisor: Arc<Supervisor>) -> Arc<Self> {
        let bridge = Arc::new(Self {
            inner: Mutex::new(Inner {
                clients: HashMap::new(),
                next_client: 0,
                pending: HashMap::new(),
                decoders: HashMap::new(),
                flush_armed: false,
            }),
            supervisor: Arc::clone(&supervisor),
        });
        bridge.spawn_event_pump(supervisor.subscribe_events());
        bridge
    }

    /// Admit a client, or `None` at the ceiling (refuse the connection with
    /// [`OVER_CAPACITY_CLOSE`]).
    pub fn register(&self, addr: String) -> Option<ClientConnection> {
        let mut inner = self.inner.lock();
        if inner.clients.len() >= MAX_CLIENTS {
            return None;
        }
        inner.next_client += 1;
        let id = inner.next_client;
        let queue = Arc::new(ClientQueue::new(CLIENT_QUEUE_BYTES));
        inner.clients.insert(
            id,
            Client { subscriptions: HashSet::new(), addr, queue: Arc::clone(&queue) },
        );
        Some(ClientConnection { id, queue })
    }

    pub fn unregister(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.remove(&id) {
            client.queue.close();
        }
    }

    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Subscribe a client to a session.
    ///
    /// The resize is propagated BEFORE the scrollback snapshot is taken: the
    /// agent's SIGWINCH-driven redraw then overwrites any history rendered
    /// at the old dimensions. The snapshot frame is queued under the bridge
    /// lock, so no coalesced output for this session can precede it.
    pub async fn subscribe(
        &self,
        client_id: u64,
        session_id: &str,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<(), OpError> {
        if self.supervisor.get_info(session_id).await.is_none() {
            return Err(OpError::not_found(session_id));
        }
        if cols.is_some() || rows.is_some() {
            if let Err(e) = self.supervisor.resize(session_id, cols, rows).await {
                debug!(session = session_id, "subscribe resize skipped: {e}");
            }
        }
        let data = self.supervisor.scrollback(session_id).await.unwrap_or_default();

        let mut inner = self.inner.lock();
        let Some(client) = inner.clients.get_mut(&client_id) else {
            return Ok(());
        };
        client.subscriptions.insert(session_id.to_string());
        client.queue.push(ServerMessage::Scrollback {
            session_id: session_id.to_string(),
            data: String::from_utf8_lossy(&data).into_owned(),
        });
        Ok(())
    }

    pub fn unsubscribe(&self, client_id: u64, session_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.subscriptions.remove(session_id);
        }
    }

    /// Forward client input to the session. Oversized payloads are rejected
    /// silently per the wire contract.
    pub async fn handle_input(&self, session_id: &str, data: &str) -> Result<(), OpError> {
        if data.len() > MAX_INPUT_BYTES {
            return Ok(());
        }
        self.supervisor.write(session_id, data).await
    }

    pub async fn handle_resize(
        &self,
        session_id: &str,
        cols: Option<f64>,
        rows: Option<f64>,
    ) -> Result<(), OpError> {
        self.supervisor.resize(session_id, cols, rows).await.map(|_| ())
    }

    fn spawn_event_pump(self: &Arc<Self>, mut rx: broadcast::Receiver<Event>) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => bridge.handle_event(event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("bridge lagged behind supervisor events by {n}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::Output { id, data } => {
                let mut inner = self.inner.lock();
                let text = inner.decoders.entry(id.clone()).or_default().decode(&data);
                inner.pending.entry(id).or_default().push_str(&text);
                if !inner.flush_armed {
                    inner.flush_armed = true;
                    drop(inner);
                    self.spawn_flush_timer();
                }
            }
            Event::Created(info) => {
                let inner = self.inner.lock();
                for client in inner.clients.values() {
                    client.queue.push(ServerMessage::SessionCreated { session: info.clone() });
                }
            }
            Event::StateChange { id, state, prev } => {
                let inner = self.inner.lock();
                for client in inner.clients.values() {
                    client.queue.push(ServerMessage::SessionStateChanged {
                        session_id: id.clone(),
                        state: state.to_string(),
                        prev: prev.to_string(),
                    });
                }
            }
            Event::Exit { id, code } => {
                let mut inner = self.inner.lock();
                // Flush this session's buffered output first: nothing may
                // follow the exit frame. A half-received glyph dies with
                // the stream.
                inner.decoders.remove(&id);
                if let Some(buffer) = inner.pending.remove(&id) {
                    deliver_output(&inner, &id, buffer);
                }
                for client in inner.clients.values_mut() {
                    client.queue.push(ServerMessage::SessionExited {
                        session_id: id.clone(),
                        exit_code: code,
                    });
                    client.subscriptions.remove(&id);
                }
            }
        }
    }

    fn spawn_flush_timer(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(COALESCE_INTERVAL).await;
            bridge.flush();
        });
    }

    /// Deliver every buffered (session, output) pair and disarm the timer.
    fn flush(&self) {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        for (session_id, buffer) in pending {
            deliver_output(&inner, &session_id, buffer);
        }
        inner.flush_armed = false;
    }
}

fn deliver_output(inner: &Inner, session_id: &str, buffer: String) {
    if buffer.is_empty() {
        return;
    }
    for client in inner.clients.values() {
        if client.subscriptions.contains(session_id) {
            client.queue.push(ServerMessage::Output {
                session_id: session_id.to_string(),
                data: buffer.clone(),
            });
        }
    }
}

#[cfg(test)]
#[path = "bridge_tests.rs"]
mod tests;
