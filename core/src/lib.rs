/// BadgeSync - notification delivery and badge synchronization engine
///
/// Admits notification events from push, socket and poll sources, keeps the
/// chat/inbox badges consistent with the server, and routes notification taps
/// to in-app destinations even before the navigation surface is ready.

pub mod error;
pub mod config;
pub mod event;
pub mod admission;
pub mod sync_client;
pub mod badge;
pub mod navigation;
pub mod session;
pub mod http_api;

pub use error::{NotifyError, Result};
pub use config::Config;
pub use session::NotificationSession;
