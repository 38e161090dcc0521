/// Navigation router for notification taps
///
/// A tap becomes exactly one navigation action. While a navigation is in
/// flight, or before the navigation surface is ready, taps park in a single
/// pending slot where a newer tap replaces an older one.
use crate::config::NavigationConfig;
use crate::error::Result;
use crate::event::{NotificationEvent, NotificationType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// In-app destination. The screen is fixed by the event type; ids are
/// passed along when the payload carries them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "screen", rename_all = "snake_case")]
pub enum Route {
    Chat {
        chat_id: Option<String>,
        peer_id: Option<String>,
    },
    Video {
        video_id: Option<String>,
    },
    Profile {
        user_id: Option<String>,
    },
    Notifications,
    /// Top-level fallback when a dispatch fails
    Home,
}

impl Route {
    /// Static type to screen table
    pub fn for_event(event: &NotificationEvent) -> Self {
        let param = |keys: &[&str]| event.field(keys).map(str::to_string);
        match event.kind {
            NotificationType::Message => Route::Chat {
                chat_id: param(&["chatId", "conversationId"]),
                peer_id: param(&["senderId", "userId", "fromUserId"]),
            },
            NotificationType::Like | NotificationType::Comment | NotificationType::Share => {
                Route::Video {
                    video_id: param(&["videoId", "postId"]),
                }
            }
            NotificationType::Follow => Route::Profile {
                user_id: param(&["userId", "followerId", "fromUserId", "senderId"]),
            },
            NotificationType::Mention | NotificationType::General => Route::Notifications,
        }
    }
}

/// What gets handed to the navigation surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationAction {
    pub route: Route,
    pub event_id: String,
}

impl NavigationAction {
    pub fn for_event(event: &NotificationEvent) -> Self {
        Self {
            route: Route::for_event(event),
            event_id: event.id.clone(),
        }
    }

    pub fn fallback(event: &NotificationEvent) -> Self {
        Self {
            route: Route::Home,
            event_id: event.id.clone(),
        }
    }
}

/// The app's navigation surface
#[async_trait]
pub trait NavigationHandle: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn dispatch(&self, action: NavigationAction) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    Idle,
    Navigating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitOutcome {
    /// Navigation task started
    Started,
    /// Parked in the pending slot
    Queued,
    /// Same tap already handled moments ago
    Ignored,
}

struct RouterInner {
    state: RouterState,
    pending: Option<NotificationEvent>,
    handle: Option<Arc<dyn NavigationHandle>>,
    last_started: Option<(String, Instant)>,
}

/// Session-wide navigation router
#[derive(Clone)]
pub struct NavigationRouter {
    config: NavigationConfig,
    inner: Arc<Mutex<RouterInner>>,
}

impl NavigationRouter {
    pub fn new(config: NavigationConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(RouterInner {
                state: RouterState::Idle,
                pending: None,
                handle: None,
                last_started: None,
            })),
        }
    }

    /// Route a tap. Must be called from within a tokio runtime.
    pub fn submit(&self, event: NotificationEvent) -> SubmitOutcome {
        let mut inner = self.lock();

        if let Some((id, at)) = &inner.last_started {
            if *id == event.id && at.elapsed() < self.config.tap_dedup_window {
                debug!("Tap {} ignored: already routed", event.id);
                return SubmitOutcome::Ignored;
            }
        }

        let handle = match inner.handle.clone() {
            Some(handle) if handle.is_ready() && inner.state == RouterState::Idle => handle,
            _ => {
                if let Some(old) = inner.pending.replace(event) {
                    debug!("Pending tap {} superseded", old.id);
                }
                debug!("Tap queued (state {:?})", inner.state);
                return SubmitOutcome::Queued;
            }
        };

        inner.state = RouterState::Navigating;
        inner.last_started = Some((event.id.clone(), Instant::now()));
        if let Some(old) = inner.pending.take() {
            debug!("Pending tap {} superseded by {}", old.id, event.id);
        }
        drop(inner);

        let router = self.clone();
        tokio::spawn(async move {
            router.navigate(event, handle).await;
        });
        SubmitOutcome::Started
    }

    async fn navigate(self, event: NotificationEvent, handle: Arc<dyn NavigationHandle>) {
        // Let the app finish mounting before touching the navigator
        sleep(self.config.settle_delay).await;

        let action = NavigationAction::for_event(&event);
        match handle.dispatch(action.clone()).await {
            Ok(()) => info!("Navigated to {:?} for {}", action.route, event.id),
            Err(e) => {
                warn!("Navigation for {} failed ({}); falling back to home", event.id, e);
                if let Err(e) = handle.dispatch(NavigationAction::fallback(&event)).await {
                    error!("Fallback navigation for {} failed: {}", event.id, e);
                }
            }
        }

        self.lock().state = RouterState::Idle;
        sleep(self.config.drain_delay).await;
        self.drain_pending();
    }

    /// Record the navigation surface and flush any parked tap
    pub fn on_ready(&self, handle: Arc<dyn NavigationHandle>) {
        self.lock().handle = Some(handle);
        info!("Navigation handle registered");
        self.drain_pending();
    }

    /// Resubmit the parked tap if the router can take it now
    pub fn drain_pending(&self) -> Option<SubmitOutcome> {
        let pending = {
            let mut inner = self.lock();
            let ready = inner.handle.as_ref().map(|h| h.is_ready()).unwrap_or(false);
            if inner.state != RouterState::Idle || !ready {
                return None;
            }
            inner.pending.take()
        }?;
        debug!("Draining pending tap {}", pending.id);
        Some(self.submit(pending))
    }

    pub fn state(&self) -> RouterState {
        self.lock().state
    }

    pub fn pending(&self) -> Option<NotificationEvent> {
        self.lock().pending.clone()
    }

    /// Drop the parked tap (logout)
    pub fn clear_pending(&self) {
        let mut inner = self.lock();
        inner.pending = None;
        inner.last_started = None;
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NotifyError;
    use crate::event::EventSource;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingHandle {
        ready: AtomicBool,
        failures: AtomicUsize,
        actions: Mutex<Vec<NavigationAction>>,
    }

    impl RecordingHandle {
        fn ready() -> Arc<Self> {
            let handle = Self::default();
            handle.ready.store(true, Ordering::SeqCst);
            Arc::new(handle)
        }

        fn actions(&self) -> Vec<NavigationAction> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NavigationHandle for RecordingHandle {
        fn is_ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn dispatch(&self, action: NavigationAction) -> Result<()> {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(NotifyError::Navigation("navigator not mounted".to_string()));
            }
            self.actions.lock().unwrap().push(action);
            Ok(())
        }
    }

    fn router() -> NavigationRouter {
        NavigationRouter::new(NavigationConfig {
            settle_delay: Duration::from_millis(300),
            drain_delay: Duration::from_millis(500),
            tap_dedup_window: Duration::from_secs(2),
        })
    }

    fn tap(id: &str, kind: NotificationType) -> NotificationEvent {
        NotificationEvent::new(id, kind, EventSource::Push)
    }

    #[test]
    fn test_route_table() {
        let follow = tap("f", NotificationType::Follow).with_field("userId", "u9");
        assert_eq!(
            Route::for_event(&follow),
            Route::Profile {
                user_id: Some("u9".to_string())
            }
        );

        let message = tap("m", NotificationType::Message)
            .with_field("chatId", "c1")
            .with_field("senderId", "u2");
        assert_eq!(
            Route::for_event(&message),
            Route::Chat {
                chat_id: Some("c1".to_string()),
                peer_id: Some("u2".to_string())
            }
        );

        let like = tap("l", NotificationType::Like).with_field("videoId", "v1");
        assert_eq!(
            Route::for_event(&like),
            Route::Video {
                video_id: Some("v1".to_string())
            }
        );

        // Missing ids never change the screen
        let bare_comment = tap("c", NotificationType::Comment);
        assert_eq!(Route::for_event(&bare_comment), Route::Video { video_id: None });
        let bare_follow = tap("f", NotificationType::Follow);
        assert_eq!(Route::for_event(&bare_follow), Route::Profile { user_id: None });
        let bare_message = tap("m", NotificationType::Message);
        assert_eq!(
            Route::for_event(&bare_message),
            Route::Chat {
                chat_id: None,
                peer_id: None
            }
        );
        assert_eq!(Route::for_event(&tap("g", NotificationType::General)), Route::Notifications);
        assert_eq!(Route::for_event(&tap("x", NotificationType::Mention)), Route::Notifications);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_when_idle_and_ready() {
        let router = router();
        let handle = RecordingHandle::ready();
        router.on_ready(handle.clone());

        let event = tap("f1", NotificationType::Follow).with_field("userId", "u9");
        assert_eq!(router.submit(event), SubmitOutcome::Started);
        assert_eq!(router.state(), RouterState::Navigating);

        sleep(Duration::from_secs(2)).await;
        assert_eq!(router.state(), RouterState::Idle);
        assert_eq!(
            handle.actions(),
            vec![NavigationAction {
                route: Route::Profile {
                    user_id: Some("u9".to_string())
                },
                event_id: "f1".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_latest_wins_while_navigating() {
        let router = router();
        let handle = RecordingHandle::ready();
        router.on_ready(handle.clone());

        assert_eq!(router.submit(tap("first", NotificationType::General)), SubmitOutcome::Started);
        assert_eq!(router.submit(tap("a", NotificationType::General)), SubmitOutcome::Queued);
        assert_eq!(router.submit(tap("b", NotificationType::General)), SubmitOutcome::Queued);
        assert_eq!(router.submit(tap("c", NotificationType::General)), SubmitOutcome::Queued);
        assert_eq!(router.pending().map(|e| e.id), Some("c".to_string()));

        sleep(Duration::from_secs(5)).await;
        let ids: Vec<String> = handle.actions().into_iter().map(|a| a.event_id).collect();
        assert_eq!(ids, vec!["first".to_string(), "c".to_string()]);
        assert!(router.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_during_drain_delay_supersedes_parked_tap() {
        let router = router();
        let handle = RecordingHandle::ready();
        router.on_ready(handle.clone());

        assert_eq!(router.submit(tap("first", NotificationType::General)), SubmitOutcome::Started);
        assert_eq!(router.submit(tap("older", NotificationType::General)), SubmitOutcome::Queued);

        // Settle delay elapsed, dispatch done, drain delay still running
        sleep(Duration::from_millis(400)).await;
        assert_eq!(router.state(), RouterState::Idle);
        assert_eq!(router.submit(tap("newer", NotificationType::General)), SubmitOutcome::Started);
        assert!(router.pending().is_none());

        sleep(Duration::from_secs(5)).await;
        let ids: Vec<String> = handle.actions().into_iter().map(|a| a.event_id).collect();
        assert_eq!(ids, vec!["first".to_string(), "newer".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_delivery() {
        let router = router();
        let event = tap("cold", NotificationType::Message).with_field("chatId", "c1");
        assert_eq!(router.submit(event), SubmitOutcome::Queued);

        let handle = RecordingHandle::ready();
        router.on_ready(handle.clone());
        // Same notification delivered again by the platform right after launch
        assert_eq!(
            router.submit(tap("cold", NotificationType::Message).with_field("chatId", "c1")),
            SubmitOutcome::Ignored
        );

        sleep(Duration::from_secs(3)).await;
        assert_eq!(handle.actions().len(), 1);
        assert_eq!(handle.actions()[0].event_id, "cold");
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_ready_handle_keeps_pending() {
        let router = router();
        let handle = Arc::new(RecordingHandle::default());
        router.on_ready(handle.clone());
        assert_eq!(router.submit(tap("t", NotificationType::Like)), SubmitOutcome::Queued);

        sleep(Duration::from_secs(1)).await;
        assert!(handle.actions().is_empty());

        handle.ready.store(true, Ordering::SeqCst);
        assert_eq!(router.drain_pending(), Some(SubmitOutcome::Started));
        sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.actions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_failure_falls_back_home() {
        let router = router();
        let handle = RecordingHandle::ready();
        handle.failures.store(1, Ordering::SeqCst);
        router.on_ready(handle.clone());

        router.submit(tap("v", NotificationType::Share).with_field("videoId", "v1"));
        sleep(Duration::from_secs(2)).await;

        assert_eq!(handle.actions().len(), 1);
        assert_eq!(handle.actions()[0].route, Route::Home);
        assert_eq!(router.state(), RouterState::Idle);
    }
}
