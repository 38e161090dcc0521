/// Notification session: one owned context wiring the four components
///
/// Constructed once per signed-in session and cloned wherever needed; every
/// clone shares the same admission table, badge state, sync window and
/// pending-navigation slot.
use crate::admission::{Admission, AdmissionGate};
use crate::badge::{BadgeDelta, BadgeSnapshot, BadgeStore, Subscription, SyncOutcome};
use crate::config::Config;
use crate::error::Result;
use crate::event::{NotificationEvent, PushPayload, ReadReceipt, SocketMessage};
use crate::navigation::{NavigationHandle, NavigationRouter, SubmitOutcome};
use crate::sync_client::{HttpNotificationApi, NotificationApi, SyncClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

/// How the app was reached through a notification tap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapOrigin {
    /// App was in the foreground
    Foreground,
    /// App was backgrounded and brought back
    Background,
    /// App was launched by the tap (cold start)
    Initial,
}

#[derive(Clone)]
pub struct NotificationSession {
    /// Unique session identifier (for logs)
    pub id: String,

    user_id: Option<String>,
    poll_interval: Duration,
    gate: AdmissionGate,
    sync: SyncClient,
    badges: BadgeStore,
    router: NavigationRouter,
    shutdown: Arc<RwLock<bool>>,
}

impl NotificationSession {
    pub fn new(config: &Config, api: Arc<dyn NotificationApi>) -> Self {
        let id = Uuid::new_v4().to_string();
        let sync = SyncClient::new(api, &config.sync);
        let badges = BadgeStore::new(sync.clone(), config.sync.sync_page_size);

        info!("Created notification session {}", id);

        Self {
            id,
            user_id: config.user_id.clone(),
            poll_interval: config.sync.poll_interval,
            gate: AdmissionGate::new(config.admission.clone()),
            sync,
            badges,
            router: NavigationRouter::new(config.navigation.clone()),
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Session talking to the configured notification server over HTTP
    pub fn with_http(config: &Config) -> Self {
        let api = HttpNotificationApi::new(config.server_url.clone(), config.auth_token.clone());
        Self::new(config, Arc::new(api))
    }

    // ─── Ingestion ──────────────────────────────────────────────────────────

    /// Push received while the app is in the foreground
    pub fn ingest_push(&self, payload: PushPayload) -> Admission {
        let event = match NotificationEvent::from_push(payload) {
            Ok(event) => event,
            Err(e) => {
                debug!("Dropping push: {}", e);
                return Admission::invalid();
            }
        };
        let admission = self.gate.admit(&event);
        if admission.accepted {
            self.badges.apply_foreground_event(&event);
        }
        admission
    }

    /// New chat message on the realtime socket. `None` when the message needs
    /// no badge change at all (already read, or sent by us).
    pub fn ingest_socket_message(&self, message: SocketMessage) -> Option<Admission> {
        let event = match message.to_event() {
            Ok(event) => event,
            Err(e) => {
                debug!("Dropping socket message: {}", e);
                return Some(Admission::invalid());
            }
        };
        if message.read == Some(true) {
            debug!("Socket message {} already read", event.id);
            return None;
        }
        if self.user_id.as_deref() == Some(message.sender_id.as_str()) {
            debug!("Socket message {} sent by this user", event.id);
            return None;
        }

        let admission = self.gate.admit(&event);
        if admission.accepted {
            self.badges.apply_realtime_delta(BadgeDelta::Increment(1));
        }
        Some(admission)
    }

    /// A chat was read somewhere; per-chat counts are unknown locally, so
    /// reconcile (pacing still applies).
    pub async fn ingest_read_receipt(&self, receipt: ReadReceipt) -> SyncOutcome {
        debug!("Read receipt for chat {}", receipt.chat_id);
        self.badges.sync_with_server().await
    }

    // ─── Badges ─────────────────────────────────────────────────────────────

    pub fn subscribe_to_badge_updates<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&BadgeSnapshot) + Send + Sync + 'static,
    {
        self.badges.subscribe(listener)
    }

    pub fn get_badge_state(&self) -> BadgeSnapshot {
        self.badges.snapshot()
    }

    pub fn update_chat_count(&self, delta: i64) {
        self.badges.update_chat_count(delta);
    }

    pub fn set_chat_count(&self, count: u32) {
        self.badges.set_chat_count(count);
    }

    pub fn clear_chat_count(&self) {
        self.badges.clear_chat_count();
    }

    pub fn clear_inbox_indicator(&self) {
        self.badges.clear_inbox_indicator();
    }

    /// Paced reconciliation
    pub async fn sync_with_server(&self) -> SyncOutcome {
        self.badges.sync_with_server().await
    }

    /// Explicit user refresh; the error is returned so the UI can offer a retry
    pub async fn sync_now(&self) -> Result<SyncOutcome> {
        self.badges.refresh().await
    }

    /// App came back to the foreground
    pub async fn on_foreground(&self) -> SyncOutcome {
        self.badges.sync_on_foreground().await
    }

    // ─── Navigation ─────────────────────────────────────────────────────────

    pub fn handle_foreground_notification_tap(&self, payload: PushPayload) -> Option<SubmitOutcome> {
        self.handle_tap(TapOrigin::Foreground, payload)
    }

    pub fn handle_background_notification_tap(&self, payload: PushPayload) -> Option<SubmitOutcome> {
        self.handle_tap(TapOrigin::Background, payload)
    }

    pub fn handle_initial_notification(&self, payload: PushPayload) -> Option<SubmitOutcome> {
        self.handle_tap(TapOrigin::Initial, payload)
    }

    /// Route a tap. `None` when the payload is malformed.
    pub fn handle_tap(&self, origin: TapOrigin, payload: PushPayload) -> Option<SubmitOutcome> {
        match NotificationEvent::from_push(payload) {
            Ok(event) => {
                debug!("{:?} tap on {} ({})", origin, event.id, event.kind);
                Some(self.router.submit(event))
            }
            Err(e) => {
                debug!("Dropping {:?} tap: {}", origin, e);
                None
            }
        }
    }

    pub fn set_navigation_ref(&self, handle: Arc<dyn NavigationHandle>) {
        self.router.on_ready(handle);
    }

    /// The navigation surface became ready after registration
    pub fn navigation_ready(&self) -> Option<SubmitOutcome> {
        self.router.drain_pending()
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Periodic reconciliation until `shutdown` is called
    pub async fn run_poller(&self) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            if *self.shutdown.read().await {
                break;
            }

            ticker.tick().await;

            if *self.shutdown.read().await {
                break;
            }
            match self.badges.sync_with_server().await {
                SyncOutcome::Reconciled(badge) => debug!(
                    "Poll reconciled badges: chat={} inbox_unread={}",
                    badge.chat_count, badge.inbox_has_unread
                ),
                SyncOutcome::Skipped => debug!("Poll skipped by sync pacing"),
                SyncOutcome::Failed(_) => {}
            }
        }

        info!("Poller for session {} stopped", self.id);
    }

    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
    }

    /// Forget all session state
    pub fn logout(&self) {
        self.badges.reset();
        self.gate.reset();
        self.sync.reset();
        self.router.clear_pending();
        info!("Session {} logged out", self.id);
    }

    pub fn admission_gate(&self) -> &AdmissionGate {
        &self.gate
    }

    pub fn sync_client(&self) -> &SyncClient {
        &self.sync
    }

    pub fn router(&self) -> &NavigationRouter {
        &self.router
    }
}
