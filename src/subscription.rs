//! Filtered live queries against a relay connection.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    connection::{RelayConnection, SubscriptionItem},
    error::{ChatError, Result},
    event::{Event, KIND_CHAT, KIND_GROUP_METADATA, KIND_GROUP_SUBGROUPS},
    filter::Filter,
};

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Filters registered, nothing requested yet.
    Created,
    /// `REQ` sent, waiting for the first message.
    Fired,
    /// Receiving stored and live events.
    Streaming,
    /// Terminated locally, by the relay, or with the connection.
    Closed,
}

/// How the stream of a subscription ended.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseReason {
    /// Closed locally or the connection went away.
    Local,
    /// The relay sent `CLOSED` with this message.
    Relay(String),
}

/// One filtered live query on a relay connection.
pub struct Subscription {
    id: String,
    filters: Vec<Filter>,
    connection: Arc<RelayConnection>,
    state: SubscriptionState,
    items: mpsc::UnboundedReceiver<SubscriptionItem>,
    close_reason: Option<CloseReason>,
}

impl Subscription {
    /// Register a subscription on `connection` without requesting data.
    pub fn create(connection: Arc<RelayConnection>, label: &str, filters: Vec<Filter>) -> Result<Self> {
        let (id, items) = connection.register(label)?;
        Ok(Self {
            id,
            filters,
            connection,
            state: SubscriptionState::Created,
            items,
            close_reason: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    #[cfg(test)]
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<&CloseReason> {
        self.close_reason.as_ref()
    }

    /// Send the `REQ` that activates delivery. Only a `Created` subscription
    /// sends anything; later calls succeed without effect.
    pub fn fire(&mut self) -> Result<()> {
        if self.state != SubscriptionState::Created {
            return Ok(());
        }
        if let Err(e) = self.connection.send_req(&self.id, &self.filters) {
            self.finish(CloseReason::Local);
            return Err(ChatError::Fire {
                id: self.id.clone(),
                reason: e.to_string(),
            });
        }
        self.state = SubscriptionState::Fired;
        debug!(subscription = %self.id, relay = %self.connection.url(), "fired");
        Ok(())
    }

    /// Next event matching the filters, or `None` once closed.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if matches!(
                self.state,
                SubscriptionState::Created | SubscriptionState::Closed
            ) {
                return None;
            }
            let Some(item) = self.items.recv().await else {
                self.finish(CloseReason::Local);
                return None;
            };
            self.state = SubscriptionState::Streaming;
            match item {
                SubscriptionItem::Event(ev) => {
                    if self.filters.iter().any(|f| f.matches(&ev)) {
                        return Some(ev);
                    }
                    debug!(subscription = %self.id, event = %ev.id, "dropping event outside filters");
                }
                SubscriptionItem::EndOfStoredEvents => {
                    debug!(subscription = %self.id, "end of stored events");
                }
                SubscriptionItem::Closed(reason) => {
                    self.finish(CloseReason::Relay(reason));
                    return None;
                }
            }
        }
    }

    /// Stop the subscription; no further events are returned.
    pub fn close(&mut self) {
        if self.state == SubscriptionState::Closed {
            return;
        }
        self.connection.unsubscribe(&self.id);
        self.finish(CloseReason::Local);
    }

    fn finish(&mut self, reason: CloseReason) {
        self.state = SubscriptionState::Closed;
        self.items.close();
        self.close_reason.get_or_insert(reason);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Filters for one group: its chat messages, plus the metadata and
/// sub-group announcements addressed to it.
pub fn group_filters(group_id: &str) -> Vec<Filter> {
    vec![
        Filter::new()
            .kinds(vec![KIND_CHAT])
            .tag("g", vec![group_id.to_string()]),
        Filter::new()
            .kinds(vec![KIND_GROUP_METADATA, KIND_GROUP_SUBGROUPS])
            .tag("d", vec![group_id.to_string()]),
    ]
}
