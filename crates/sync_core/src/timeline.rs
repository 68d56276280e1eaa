use std::sync::Arc;

use serde_json::Value;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::debug;

use shared::{
    domain::ChannelId,
    protocol::{ClientAction, Envelope, EventKind, SystemMessage, TimelineItem, UserMessage},
};

use crate::connection::LiveGateway;

/// Merges one conversation's initial snapshot with its live event stream
/// into a single deduplicated, timestamp-ordered sequence. Scoped to the
/// active conversation; switching conversations discards the buffer
/// wholesale.
pub struct Timeline {
    gateway: Arc<dyn LiveGateway>,
    inner: Mutex<TimelineState>,
}

struct TimelineState {
    channel: Option<ChannelId>,
    items: Vec<TimelineItem>,
    listener: Option<JoinHandle<()>>,
}

impl Timeline {
    pub fn new(gateway: Arc<dyn LiveGateway>) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            inner: Mutex::new(TimelineState {
                channel: None,
                items: Vec::new(),
                listener: None,
            }),
        })
    }

    /// Makes `channel` the active conversation, seeding the buffer from
    /// `snapshot`. The old channel's listener is detached before anything
    /// else, its leave is issued on transition away, and the join for the
    /// new channel precedes the listener consuming live events.
    pub async fn activate(self: &Arc<Self>, channel: ChannelId, snapshot: Vec<TimelineItem>) {
        // Subscribing up front means no event published after the join can
        // slip past the listener.
        let events = self.gateway.subscribe();

        let mut state = self.inner.lock().await;
        if let Some(task) = state.listener.take() {
            task.abort();
        }
        let previous = state.channel.take();
        let switching = previous != Some(channel);
        if switching {
            if let Some(previous) = previous {
                self.gateway
                    .send(ClientAction::LeaveChannel {
                        channel_id: previous,
                    })
                    .await;
            }
            self.gateway
                .send(ClientAction::JoinChannel {
                    channel_id: channel,
                })
                .await;
        }

        state.channel = Some(channel);
        state.items = snapshot;
        state.listener = Some(self.spawn_listener(channel, events));
    }

    /// Drops interest in the active conversation: detaches the listener and
    /// issues its leave. There is no grace period.
    pub async fn deactivate(&self) {
        let mut state = self.inner.lock().await;
        if let Some(task) = state.listener.take() {
            task.abort();
        }
        if let Some(channel) = state.channel.take() {
            self.gateway
                .send(ClientAction::LeaveChannel {
                    channel_id: channel,
                })
                .await;
        }
        state.items.clear();
    }

    /// Materialized view: ascending by timestamp, stable so same-timestamp
    /// items keep arrival order.
    pub async fn items(&self) -> Vec<TimelineItem> {
        let state = self.inner.lock().await;
        let mut items = state.items.clone();
        items.sort_by_key(|item| item.created_at());
        items
    }

    fn spawn_listener(
        self: &Arc<Self>,
        channel: ChannelId,
        mut events: broadcast::Receiver<Envelope>,
    ) -> JoinHandle<()> {
        let timeline = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let envelope = match events.recv().await {
                    Ok(envelope) => envelope,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "timeline: live event stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(timeline) = timeline.upgrade() else {
                    break;
                };
                timeline.ingest(channel, envelope).await;
            }
        })
    }

    async fn ingest(&self, channel: ChannelId, envelope: Envelope) {
        match envelope.kind {
            EventKind::NewMessage => self.ingest_user_message(channel, envelope.payload).await,
            EventKind::SystemMessageCreated => {
                self.ingest_system_message(channel, envelope.payload).await
            }
            _ => {}
        }
    }

    /// One malformed payload never discards the rest of the stream; the
    /// item is dropped alone.
    async fn ingest_user_message(&self, channel: ChannelId, payload: Value) {
        let message: UserMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!("timeline: dropping malformed user message: {err}");
                return;
            }
        };
        if message.channel_id != channel {
            return;
        }

        let mut state = self.inner.lock().await;
        if state.channel != Some(channel) {
            return;
        }
        let duplicate = state.items.iter().any(|item| {
            matches!(item, TimelineItem::User { user_message }
                if user_message.message_id == message.message_id)
        });
        if duplicate {
            // The locally initiated send already landed via request/response.
            debug!(
                message_id = message.message_id.0,
                "timeline: duplicate live message dropped"
            );
            return;
        }
        state.items.push(TimelineItem::User {
            user_message: message,
        });
    }

    async fn ingest_system_message(&self, channel: ChannelId, payload: Value) {
        let message: SystemMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                debug!("timeline: dropping malformed system message: {err}");
                return;
            }
        };
        if message.channel_id != channel {
            return;
        }

        let mut state = self.inner.lock().await;
        if state.channel != Some(channel) {
            return;
        }
        let duplicate = state.items.iter().any(|item| {
            matches!(item, TimelineItem::System { system_message }
                if system_message.system_message_id == message.system_message_id)
        });
        if duplicate {
            debug!(
                system_message_id = message.system_message_id.0,
                "timeline: duplicate system message dropped"
            );
            return;
        }
        state.items.push(TimelineItem::System {
            system_message: message,
        });
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.try_lock() {
            if let Some(task) = state.listener.take() {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/timeline_tests.rs"]
mod tests;
