use std::fmt;
use std::sync::Arc;

use sheetpilot_protocol::{Category, Notification, Priority};

pub type NotificationPredicate = Arc<dyn Fn(&Notification) -> bool + Send + Sync>;

/// Event-name dimension of a filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum EventFilter {
    #[default]
    Any,
    Exact(String),
}

impl EventFilter {
    /// `"all"` and `"*"` are the wildcard.
    pub fn parse(event: &str) -> Self {
        match event {
            "all" | "*" => Self::Any,
            other => Self::Exact(other.to_owned()),
        }
    }

    pub fn matches(&self, event: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => expected == event,
        }
    }
}

/// Conjunction of optional dimensions plus an optional predicate.
/// An empty filter matches everything.
#[derive(Clone, Default)]
pub struct NotificationFilter {
    pub source: Option<String>,
    pub event: EventFilter,
    pub category: Option<Category>,
    pub priority: Option<Priority>,
    pub unread_only: bool,
    predicate: Option<NotificationPredicate>,
}

impl fmt::Debug for NotificationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationFilter")
            .field("source", &self.source)
            .field("event", &self.event)
            .field("category", &self.category)
            .field("priority", &self.priority)
            .field("unread_only", &self.unread_only)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl NotificationFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn event(mut self, event: &str) -> Self {
        self.event = EventFilter::parse(event);
        self
    }

    pub fn category(mut self, category: impl Into<Category>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn unread_only(mut self) -> Self {
        self.unread_only = true;
        self
    }

    pub fn predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Notification) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn matches(&self, notification: &Notification) -> bool {
        self.source
            .as_ref()
            .is_none_or(|source| *source == notification.source)
            && self.event.matches(&notification.event)
            && self
                .category
                .as_ref()
                .is_none_or(|category| *category == notification.category)
            && self
                .priority
                .is_none_or(|priority| priority == notification.priority)
            && (!self.unread_only || !notification.read)
            && self
                .predicate
                .as_ref()
                .is_none_or(|predicate| predicate(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sheetpilot_protocol::{NotificationDraft, NotificationPayload};

    fn notification(source: &str, event: &str, category: &str, priority: Priority) -> Notification {
        Notification::from_draft(
            NotificationDraft::new(
                source,
                event,
                NotificationPayload::Custom {
                    data: serde_json::Value::Null,
                },
            )
            .category(Category::new(category))
            .priority(priority),
            Utc::now(),
        )
    }

    #[test]
    fn empty_filter_matches_everything() {
        let n = notification("excel", "tool-executed", "excel", Priority::Normal);
        assert!(NotificationFilter::all().matches(&n));
        assert!(NotificationFilter::all().event("all").matches(&n));
        assert!(NotificationFilter::all().event("*").matches(&n));
    }

    #[test]
    fn every_dimension_must_match() {
        let n = notification("excel", "tool-executed", "excel", Priority::High);
        let filter = NotificationFilter::all()
            .source("excel")
            .event("tool-executed")
            .category("excel");
        assert!(filter.clone().matches(&n));
        assert!(!filter.clone().priority(Priority::Low).matches(&n));
        assert!(!filter.clone().source("ai").matches(&n));
        assert!(!filter.predicate(|n| n.title == "other").matches(&n));
    }

    #[test]
    fn unread_only_skips_read_notifications() {
        let mut n = notification("excel", "tool-executed", "excel", Priority::Normal);
        let filter = NotificationFilter::all().unread_only();
        assert!(filter.matches(&n));
        n.read = true;
        assert!(!filter.matches(&n));
    }
}
