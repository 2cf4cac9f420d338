use std::{
    collections::HashMap,
    ops::Range,
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::core::{RatingSummary, RequestId, RequestStatus, ResourceId};

/// Change pushed to connected clients so they can refresh without polling.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    RequestStatusChanged {
        request_id: RequestId,
        resource_id: Option<ResourceId>,
        status: RequestStatus,
    },
    AvailabilityChanged {
        resource_id: ResourceId,
        time: Range<DateTime<Utc>>,
        available: bool,
    },
    RatingChanged {
        resource_id: ResourceId,
        summary: RatingSummary,
    },
}

impl Notification {
    pub fn resource_id(&self) -> Option<ResourceId> {
        match self {
            Notification::RequestStatusChanged { resource_id, .. } => *resource_id,
            Notification::AvailabilityChanged { resource_id, .. }
            | Notification::RatingChanged { resource_id, .. } => Some(*resource_id),
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Notification::RequestStatusChanged { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::RequestStatusChanged { .. } => "request_status_changed",
            Notification::AvailabilityChanged { .. } => "availability_changed",
            Notification::RatingChanged { .. } => "rating_changed",
        }
    }
}

/// Fire-and-forget outlet for notifications. Delivery and retry are the implementor's concern.
pub trait Notifier: Send + Sync {
    fn emit(&self, notification: Notification);
}

/// Drops everything. For batch jobs that have no listeners.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn emit(&self, _notification: Notification) {}
}

/// Narrows what a subscriber receives. An empty filter receives everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub resource_id: Option<ResourceId>,
    pub request_id: Option<RequestId>,
}

impl SubscriptionFilter {
    pub fn matches(&self, notification: &Notification) -> bool {
        let resource = self
            .resource_id
            .map_or(true, |id| notification.resource_id() == Some(id));
        let request = self
            .request_id
            .map_or(true, |id| notification.request_id() == Some(id));
        resource && request
    }
}

pub type SubscriptionId = u64;

pub struct Subscription {
    pub id: SubscriptionId,
    pub receiver: broadcast::Receiver<Notification>,
}

struct Subscriber {
    filter: SubscriptionFilter,
    sender: broadcast::Sender<Notification>,
}

/// In-process registry of connected clients.
///
/// Only reaches clients connected to this process; multiple instances need a shared channel.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = broadcast::channel(self.capacity);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Subscriber { filter, sender });
        info!("subscriber {} connected", id);
        Subscription { id, receiver }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            info!("subscriber {} disconnected", id);
        }
        removed
    }

    /// Sends to every matching subscriber and returns how many received it.
    pub fn broadcast(&self, notification: &Notification) -> usize {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.filter.matches(notification) {
                continue;
            }
            match subscriber.sender.send(notification.clone()) {
                Ok(_) => delivered += 1,
                Err(_) => warn!("subscriber {} has no live receiver", id),
            }
        }
        debug!(
            "{} delivered to {} subscribers",
            notification.event_name(),
            delivered
        );
        delivered
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}

impl Notifier for SubscriberRegistry {
    fn emit(&self, notification: Notification) {
        self.broadcast(&notification);
    }
}
