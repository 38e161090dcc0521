/// Badge state store
///
/// Holds the two observable counters (`chat_count`, `inbox_has_unread`) and
/// notifies subscribers only when one of them actually changes. Server syncs
/// recompute both from scratch and overwrite local state.
use crate::event::{NotificationEvent, NotificationPage, NotificationType};
use crate::error::Result;
use crate::sync_client::SyncClient;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Observable part of the badge state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeSnapshot {
    pub chat_count: u32,
    pub inbox_has_unread: bool,
}

/// Full badge state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BadgeState {
    pub chat_count: u32,
    pub inbox_has_unread: bool,
    pub last_update: Option<DateTime<Utc>>,
}

impl BadgeState {
    pub fn snapshot(&self) -> BadgeSnapshot {
        BadgeSnapshot {
            chat_count: self.chat_count,
            inbox_has_unread: self.inbox_has_unread,
        }
    }
}

/// Partial update; `None` fields are left alone
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BadgePatch {
    pub chat_count: Option<u32>,
    pub inbox_has_unread: Option<bool>,
}

/// Realtime change to the chat counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BadgeDelta {
    Increment(u32),
    Decrement(u32),
    Set(u32),
}

/// Result of a reconciliation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Reconciled(BadgeSnapshot),
    /// Paced or rate limited; nothing fetched
    Skipped,
    Failed(String),
}

type Listener = Arc<dyn Fn(&BadgeSnapshot) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    state: BadgeState,
    listeners: BTreeMap<u64, Listener>,
    next_listener_id: u64,
}

/// Handle returned by `subscribe`; call `unsubscribe` to stop notifications
pub struct Subscription {
    id: u64,
    store: std::sync::Weak<Mutex<StoreInner>>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            let mut inner = inner.lock().unwrap_or_else(|p| p.into_inner());
            inner.listeners.remove(&self.id);
        }
    }
}

/// Session-wide badge store
#[derive(Clone)]
pub struct BadgeStore {
    inner: Arc<Mutex<StoreInner>>,
    sync: SyncClient,
    sync_page_size: u32,
}

impl BadgeStore {
    pub fn new(sync: SyncClient, sync_page_size: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            sync,
            sync_page_size,
        }
    }

    /// Register a listener for observable changes
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BadgeSnapshot) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(id, Arc::new(listener));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn snapshot(&self) -> BadgeSnapshot {
        self.lock().state.snapshot()
    }

    pub fn state(&self) -> BadgeState {
        self.lock().state
    }

    /// Apply an admitted foreground event
    pub fn apply_foreground_event(&self, event: &NotificationEvent) {
        match event.kind {
            NotificationType::Message => {
                self.apply_realtime_delta(BadgeDelta::Increment(1));
            }
            NotificationType::Like
            | NotificationType::Comment
            | NotificationType::Follow
            | NotificationType::Share => {
                self.update(BadgePatch {
                    inbox_has_unread: Some(true),
                    ..BadgePatch::default()
                });
            }
            NotificationType::Mention | NotificationType::General => {
                debug!("No badge effect for {} event {}", event.kind, event.id);
            }
        }
    }

    /// Apply a realtime change to the chat counter (clamped at zero)
    pub fn apply_realtime_delta(&self, delta: BadgeDelta) {
        self.update_with(|state| {
            let next = match delta {
                BadgeDelta::Increment(n) => state.chat_count.saturating_add(n),
                BadgeDelta::Decrement(n) => state.chat_count.saturating_sub(n),
                BadgeDelta::Set(n) => n,
            };
            BadgePatch {
                chat_count: Some(next),
                ..BadgePatch::default()
            }
        });
    }

    /// Signed adjustment of the chat counter
    pub fn update_chat_count(&self, delta: i64) {
        let magnitude = u32::try_from(delta.unsigned_abs()).unwrap_or(u32::MAX);
        if delta >= 0 {
            self.apply_realtime_delta(BadgeDelta::Increment(magnitude));
        } else {
            self.apply_realtime_delta(BadgeDelta::Decrement(magnitude));
        }
    }

    pub fn set_chat_count(&self, count: u32) {
        self.apply_realtime_delta(BadgeDelta::Set(count));
    }

    pub fn clear_chat_count(&self) {
        self.update(BadgePatch {
            chat_count: Some(0),
            ..BadgePatch::default()
        });
    }

    pub fn clear_inbox_indicator(&self) {
        self.update(BadgePatch {
            inbox_has_unread: Some(false),
            ..BadgePatch::default()
        });
    }

    /// Back to zero/false (logout)
    pub fn reset(&self) {
        self.update(BadgePatch {
            chat_count: Some(0),
            inbox_has_unread: Some(false),
        });
    }

    /// Reconcile against the server, respecting pacing. Never fails.
    pub async fn sync_with_server(&self) -> SyncOutcome {
        match self.sync.fetch(1, self.sync_page_size, false).await {
            Ok(page) => self.reconcile_fetched(page),
            Err(e) => {
                error!("Badge sync failed: {}", e);
                SyncOutcome::Failed(e.to_string())
            }
        }
    }

    /// Opportunistic reconciliation on app foreground
    pub async fn sync_on_foreground(&self) -> SyncOutcome {
        match self.sync.background_fetch(1, self.sync_page_size).await {
            Ok(page) => self.reconcile_fetched(page),
            Err(e) => {
                error!("Foreground badge sync failed: {}", e);
                SyncOutcome::Failed(e.to_string())
            }
        }
    }

    /// User-triggered refresh. Bypasses pacing and returns the failure so the
    /// caller can offer a retry.
    pub async fn refresh(&self) -> Result<SyncOutcome> {
        let page = self.sync.fetch(1, self.sync_page_size, true).await?;
        Ok(self.reconcile_fetched(page))
    }

    fn reconcile_fetched(&self, page: Option<NotificationPage>) -> SyncOutcome {
        match page {
            Some(page) => SyncOutcome::Reconciled(self.reconcile(&page)),
            None => SyncOutcome::Skipped,
        }
    }

    /// Recompute both counters from a server page and overwrite local state
    pub fn reconcile(&self, page: &NotificationPage) -> BadgeSnapshot {
        let unread = page.notifications.iter().filter(|n| !n.read);
        let (mut chat_count, mut inbox_has_unread) = (0u32, false);
        for notification in unread {
            if notification.notification_type() == NotificationType::Message {
                chat_count = chat_count.saturating_add(1);
            } else {
                inbox_has_unread = true;
            }
        }

        self.update(BadgePatch {
            chat_count: Some(chat_count),
            inbox_has_unread: Some(inbox_has_unread),
        });
        info!(
            "Badges reconciled with server: chat={} inbox_unread={}",
            chat_count, inbox_has_unread
        );
        BadgeSnapshot {
            chat_count,
            inbox_has_unread,
        }
    }

    /// Apply `patch`, stamp `last_update`, and notify iff an observable field changed
    pub fn update(&self, patch: BadgePatch) -> bool {
        self.update_with(|_| patch)
    }

    /// Like `update`, with the patch computed from the current state under the lock
    fn update_with<F>(&self, make_patch: F) -> bool
    where
        F: FnOnce(&BadgeState) -> BadgePatch,
    {
        let (changed, snapshot, listeners) = {
            let mut inner = self.lock();
            let before = inner.state.snapshot();
            let patch = make_patch(&inner.state);
            if let Some(count) = patch.chat_count {
                inner.state.chat_count = count;
            }
            if let Some(unread) = patch.inbox_has_unread {
                inner.state.inbox_has_unread = unread;
            }
            inner.state.last_update = Some(Utc::now());

            let after = inner.state.snapshot();
            let changed = after != before;
            let listeners: Vec<Listener> = if changed {
                inner.listeners.values().cloned().collect()
            } else {
                Vec::new()
            };
            (changed, after, listeners)
        };

        // Listeners run outside the lock so they may read the store
        for listener in listeners {
            listener(&snapshot);
        }
        if changed {
            debug!(
                "Badge changed: chat={} inbox_unread={}",
                snapshot.chat_count, snapshot.inbox_has_unread
            );
        }
        changed
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        // Every mutation leaves StoreInner consistent, so a poisoned guard is usable
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}
