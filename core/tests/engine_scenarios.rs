/// End-to-end scenarios across admission, sync, badges and navigation
extern crate badgesync_core;

use async_trait::async_trait;
use badgesync_core::badge::{BadgeSnapshot, SyncOutcome};
use badgesync_core::config::{Config, SyncConfig};
use badgesync_core::event::{NotificationPage, PushPayload, ServerNotification};
use badgesync_core::navigation::{NavigationAction, NavigationHandle, Route, SubmitOutcome};
use badgesync_core::sync_client::{NotificationApi, SyncClient};
use badgesync_core::{NotificationSession, NotifyError, Result};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{advance, sleep};

// ─── Test doubles ────────────────────────────────────────────────────────────

#[derive(Default)]
struct ScriptedApi {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<NotificationPage>>>,
}

impl ScriptedApi {
    fn with(script: Vec<Result<NotificationPage>>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationApi for ScriptedApi {
    async fn fetch_notifications(&self, _page: u32, _limit: u32) -> Result<NotificationPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(NotificationPage::default()))
    }
}

#[derive(Default)]
struct RecordingNavigator {
    ready: AtomicBool,
    actions: Mutex<Vec<NavigationAction>>,
}

impl RecordingNavigator {
    fn ready() -> Arc<Self> {
        let nav = Self::default();
        nav.ready.store(true, Ordering::SeqCst);
        Arc::new(nav)
    }

    fn actions(&self) -> Vec<NavigationAction> {
        self.actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl NavigationHandle for RecordingNavigator {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn dispatch(&self, action: NavigationAction) -> Result<()> {
        self.actions.lock().unwrap().push(action);
        Ok(())
    }
}

fn push(value: serde_json::Value) -> PushPayload {
    serde_json::from_value(value).unwrap()
}

fn unread(id: &str, kind: &str) -> ServerNotification {
    ServerNotification {
        id: id.to_string(),
        kind: kind.to_string(),
        read: false,
        extra: Default::default(),
    }
}

fn session_with(api: Arc<ScriptedApi>) -> NotificationSession {
    NotificationSession::new(&Config::default(), api)
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_redelivered_push_counts_once() {
    let session = session_with(ScriptedApi::with(vec![]));
    let payload = push(json!({
        "messageId": "m1",
        "data": { "type": "message", "chatId": "c1" }
    }));

    assert!(session.ingest_push(payload.clone()).accepted);
    advance(Duration::from_millis(500)).await;
    assert!(!session.ingest_push(payload).accepted);

    assert_eq!(session.get_badge_state().chat_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_within_min_interval_skips_network() {
    let api = ScriptedApi::with(vec![]);
    let client = SyncClient::new(
        api.clone(),
        &SyncConfig {
            min_interval: Duration::from_secs(10),
            ..SyncConfig::default()
        },
    );

    assert!(client.fetch(1, 20, false).await.unwrap().is_some());
    advance(Duration::from_secs(5)).await;
    assert!(client.fetch(1, 20, false).await.unwrap().is_none());
    assert_eq!(api.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_monotonicity() {
    let api = ScriptedApi::with(vec![Err(NotifyError::RateLimited {
        retry_after: Some(Duration::from_secs(30)),
    })]);
    let client = SyncClient::new(
        api.clone(),
        &SyncConfig {
            min_interval: Duration::from_secs(1),
            background_min_interval: Duration::from_secs(1),
            ..SyncConfig::default()
        },
    );

    assert!(client.fetch(1, 20, false).await.unwrap().is_none());
    for _ in 0..29 {
        advance(Duration::from_secs(1)).await;
        assert!(client.fetch(1, 20, false).await.unwrap().is_none());
        assert!(client.background_fetch(1, 20).await.unwrap().is_none());
    }
    assert_eq!(api.calls(), 1);
}

#[tokio::test]
async fn test_sync_sets_badges_from_server_page() {
    let page = NotificationPage {
        notifications: vec![
            unread("1", "message"),
            unread("2", "message"),
            unread("3", "message"),
            unread("4", "like"),
        ],
        unread_count: 4,
        has_more: false,
        current_page: 1,
    };
    let session = session_with(ScriptedApi::with(vec![Ok(page)]));

    let outcome = session.sync_with_server().await;
    let expected = BadgeSnapshot {
        chat_count: 3,
        inbox_has_unread: true,
    };
    assert_eq!(outcome, SyncOutcome::Reconciled(expected));
    assert_eq!(session.get_badge_state(), expected);
}

#[tokio::test]
async fn test_reconciliation_is_not_a_merge() {
    let page = NotificationPage {
        notifications: vec![unread("1", "message"), unread("2", "message")],
        unread_count: 2,
        ..NotificationPage::default()
    };
    let session = session_with(ScriptedApi::with(vec![Ok(page)]));
    session.set_chat_count(5);

    session.sync_with_server().await;
    assert_eq!(session.get_badge_state().chat_count, 2);
}

#[tokio::test]
async fn test_failed_sync_is_silent_but_refresh_reports() {
    let api = ScriptedApi::with(vec![
        Err(NotifyError::Http("connection refused".to_string())),
        Err(NotifyError::Status {
            status: 500,
            body: "oops".to_string(),
        }),
    ]);
    let session = session_with(api);
    session.set_chat_count(2);

    assert!(matches!(session.sync_with_server().await, SyncOutcome::Failed(_)));
    assert!(session.sync_now().await.is_err());
    assert_eq!(session.get_badge_state().chat_count, 2);
}

#[tokio::test(start_paused = true)]
async fn test_follow_tap_dispatches_profile() {
    let session = session_with(ScriptedApi::with(vec![]));
    let nav = RecordingNavigator::ready();
    session.set_navigation_ref(nav.clone());

    let outcome = session.handle_foreground_notification_tap(push(json!({
        "messageId": "f1",
        "data": { "type": "follow", "userId": "u9" }
    })));
    assert_eq!(outcome, Some(SubmitOutcome::Started));

    sleep(Duration::from_secs(3)).await;
    let actions = nav.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(
        actions[0].route,
        Route::Profile {
            user_id: Some("u9".to_string())
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_cold_start_tap_dispatched_once() {
    let session = session_with(ScriptedApi::with(vec![]));
    let payload = push(json!({
        "messageId": "cold-1",
        "data": { "type": "comment", "videoId": "v7" }
    }));

    assert_eq!(
        session.handle_initial_notification(payload.clone()),
        Some(SubmitOutcome::Queued)
    );

    let nav = RecordingNavigator::ready();
    session.set_navigation_ref(nav.clone());
    // Platforms may also report the launch tap as a background tap
    session.handle_background_notification_tap(payload);

    sleep(Duration::from_secs(3)).await;
    let actions = nav.actions();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].event_id, "cold-1");
    assert_eq!(
        actions[0].route,
        Route::Video {
            video_id: Some("v7".to_string())
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_rapid_taps_keep_latest() {
    let session = session_with(ScriptedApi::with(vec![]));
    let nav = RecordingNavigator::ready();
    session.set_navigation_ref(nav.clone());

    let tap = |id: &str| {
        push(json!({
            "messageId": id,
            "data": { "type": "general" }
        }))
    };
    session.handle_foreground_notification_tap(tap("current"));
    for id in ["a", "b", "c"] {
        assert_eq!(
            session.handle_foreground_notification_tap(tap(id)),
            Some(SubmitOutcome::Queued)
        );
    }

    sleep(Duration::from_secs(5)).await;
    let ids: Vec<String> = nav.actions().into_iter().map(|a| a.event_id).collect();
    assert_eq!(ids, vec!["current".to_string(), "c".to_string()]);
}
