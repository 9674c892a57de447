//! HTTP surface: a thin axum layer over the focus control plane.

pub mod connections;
pub mod events;
pub mod focus;
pub mod webhooks;

use axum::{
    extract::FromRef,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;

use crate::chat::SlackChat;
use crate::config::Config;
use crate::dedup::EventDedup;
use crate::focus::FocusOrchestrator;
use crate::github::GithubClient;
use crate::health;
use crate::notify::{sse, Notifier, SseRegistry};
use crate::oauth_state::OAuthStateStore;
use crate::store::Store;
use crate::tokens::TokenVault;

/// Composite state; handlers extract the slices they need via `FromRef`.
#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub orchestrator: Arc<FocusOrchestrator>,
    pub notifier: Arc<Notifier>,
    pub sse_registry: Arc<SseRegistry>,
    pub vault: Arc<TokenVault>,
    pub github: Arc<GithubClient>,
    pub slack: Arc<SlackChat>,
    pub oauth_states: Arc<OAuthStateStore>,
    pub dedup: Arc<EventDedup>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Health probes
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        // Focus mode
        .route("/focus/enable", post(focus::enable))
        .route("/focus/disable", post(focus::disable))
        .route("/focus/status", get(focus::status))
        .route("/focus/pomodoro/start", post(focus::start_pomodoro))
        .route("/focus/pomodoro/skip", post(focus::skip_phase))
        .route("/focus/settings", get(focus::get_settings))
        .route("/focus/settings", put(focus::update_settings))
        // Realtime events
        .route("/events/stream", get(sse::stream_events))
        // Webhook subscriptions
        .route("/webhooks", post(webhooks::create))
        .route("/webhooks/{id}", delete(webhooks::remove))
        // Third-party connections
        .route(
            "/connections/github/authorize",
            get(connections::github_authorize),
        )
        .route(
            "/connections/github/callback",
            get(connections::github_callback),
        )
        .route("/connections/github/pat", post(connections::github_pat))
        .route(
            "/connections/github/{label}",
            delete(connections::github_disconnect),
        )
        .route(
            "/connections/slack/authorize",
            get(connections::slack_authorize),
        )
        .route(
            "/connections/slack/callback",
            get(connections::slack_callback),
        )
        .route("/connections/slack", delete(connections::slack_disconnect))
        // Inbound chat-provider events
        .route("/slack/events", post(events::slack_events))
        .with_state(state)
}
