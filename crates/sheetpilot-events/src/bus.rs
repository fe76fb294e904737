use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use sheetpilot_protocol::{Notification, NotificationDraft, NotificationId, SubscriptionId};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::filter::NotificationFilter;

pub type NotificationCallback = Arc<dyn Fn(&Notification) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Retained notifications; persistent ones do not count towards eviction.
    pub capacity: usize,
    /// Buffer of the broadcast channel behind `subscribe_stream`.
    pub stream_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            stream_buffer: 256,
        }
    }
}

#[derive(Default)]
struct Delivery {
    active: bool,
    pending: VecDeque<Notification>,
}

struct Subscription {
    filter: NotificationFilter,
    callback: NotificationCallback,
}

/// Publish/subscribe fan-out with a bounded retention ring.
pub struct NotificationBus {
    config: BusConfig,
    ring: Mutex<VecDeque<Notification>>,
    subscriptions: Mutex<IndexMap<SubscriptionId, Arc<Subscription>>>,
    // Held for the whole publish. A publish made from inside a callback is
    // retained at once but only queued; the outermost publish drains the
    // queue, so every subscriber sees retention order.
    delivery: ReentrantMutex<RefCell<Delivery>>,
    stream: broadcast::Sender<Notification>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationBus")
            .field("config", &self.config)
            .field("retained", &self.ring.lock().len())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish()
    }
}

impl NotificationBus {
    pub fn new(config: BusConfig) -> Self {
        let (stream, _) = broadcast::channel(config.stream_buffer.max(1));
        Self {
            config,
            ring: Mutex::new(VecDeque::new()),
            subscriptions: Mutex::new(IndexMap::new()),
            delivery: ReentrantMutex::new(RefCell::new(Delivery::default())),
            stream,
        }
    }

    /// Retain the notification, then deliver it to every matching subscriber
    /// in registration order. Subscriber errors and panics are logged and do
    /// not stop delivery. Publishing from a callback defers delivery of the
    /// nested notification until the current one reached every subscriber.
    pub fn publish(&self, draft: NotificationDraft) -> Notification {
        let notification = Notification::from_draft(draft, Utc::now());
        let delivery = self.delivery.lock();

        self.retain(notification.clone());
        {
            let mut state = delivery.borrow_mut();
            state.pending.push_back(notification.clone());
            if state.active {
                debug!(notification_id = %notification.id, "nested publish queued");
                return notification;
            }
            state.active = true;
        }

        loop {
            let next = delivery.borrow_mut().pending.pop_front();
            let Some(next) = next else {
                break;
            };
            self.deliver(&next);
        }
        delivery.borrow_mut().active = false;
        notification
    }

    fn deliver(&self, notification: &Notification) {
        let subscribers: Vec<(SubscriptionId, Arc<Subscription>)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(id, subscription)| (id.clone(), Arc::clone(subscription)))
            .collect();

        let mut delivered = 0_usize;
        for (subscription_id, subscription) in subscribers {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                if subscription.filter.matches(notification) {
                    (subscription.callback)(notification).map(|()| true)
                } else {
                    Ok(false)
                }
            }));
            match outcome {
                Ok(Ok(true)) => delivered += 1,
                Ok(Ok(false)) => {}
                Ok(Err(error)) => warn!(
                    %subscription_id,
                    notification_id = %notification.id,
                    error = %error,
                    "notification subscriber failed"
                ),
                Err(_) => warn!(
                    %subscription_id,
                    notification_id = %notification.id,
                    "notification subscriber panicked"
                ),
            }
        }

        let _ = self.stream.send(notification.clone());
        debug!(
            notification_id = %notification.id,
            event = %notification.event,
            category = %notification.category,
            delivered,
            "notification published"
        );
    }

    fn retain(&self, notification: Notification) {
        let mut ring = self.ring.lock();
        ring.push_back(notification);
        while ring.len() > self.config.capacity {
            let Some(index) = ring.iter().position(|n| !n.persistent) else {
                break;
            };
            if let Some(evicted) = ring.remove(index) {
                debug!(notification_id = %evicted.id, "notification evicted");
            }
        }
    }

    pub fn subscribe<F>(&self, filter: NotificationFilter, callback: F) -> SubscriptionId
    where
        F: Fn(&Notification) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let subscription_id = SubscriptionId::generate();
        self.subscriptions.lock().insert(
            subscription_id.clone(),
            Arc::new(Subscription {
                filter,
                callback: Arc::new(callback),
            }),
        );
        debug!(%subscription_id, "subscription added");
        subscription_id
    }

    pub fn unsubscribe(&self, subscription_id: &SubscriptionId) -> bool {
        self.subscriptions
            .lock()
            .shift_remove(subscription_id)
            .is_some()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Live stream of notifications published after the call. Lagging
    /// receivers skip what they missed.
    pub fn subscribe_stream(
        &self,
        filter: NotificationFilter,
    ) -> impl Stream<Item = Notification> + Send + use<> {
        BroadcastStream::new(self.stream.subscribe()).filter_map(move |item| match item {
            Ok(notification) if filter.matches(&notification) => Some(notification),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "notification stream lagged");
                None
            }
        })
    }

    /// Retained notifications matching `filter`, oldest first.
    pub fn query(&self, filter: &NotificationFilter) -> Vec<Notification> {
        self.ring
            .lock()
            .iter()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &NotificationId) -> Option<Notification> {
        self.ring.lock().iter().find(|n| n.id == *id).cloned()
    }

    pub fn mark_read(&self, id: &NotificationId) -> bool {
        match self.ring.lock().iter_mut().find(|n| n.id == *id) {
            Some(notification) => {
                notification.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&self) -> usize {
        let mut marked = 0;
        for notification in self.ring.lock().iter_mut().filter(|n| !n.read) {
            notification.read = true;
            marked += 1;
        }
        marked
    }

    /// Remove one notification, persistent or not.
    pub fn dismiss(&self, id: &NotificationId) -> bool {
        let mut ring = self.ring.lock();
        match ring.iter().position(|n| n.id == *id) {
            Some(index) => ring.remove(index).is_some(),
            None => false,
        }
    }

    /// Remove non-persistent notifications created before `older_than`.
    pub fn purge(&self, older_than: DateTime<Utc>) -> usize {
        self.remove_where(|n| !n.persistent && n.created_at < older_than)
    }

    /// Remove non-persistent notifications whose auto-dismiss delay elapsed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        self.remove_where(|n| !n.persistent && n.is_expired(now))
    }

    fn remove_where(&self, predicate: impl Fn(&Notification) -> bool) -> usize {
        let mut ring = self.ring.lock();
        let before = ring.len();
        ring.retain(|n| !predicate(n));
        let removed = before - ring.len();
        if removed > 0 {
            debug!(removed, "notifications purged");
        }
        removed
    }

    pub fn unread_count(&self) -> usize {
        self.ring.lock().iter().filter(|n| !n.read).count()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}
