use axum::{
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parley_core::AppState;
use serde_json::json;

pub mod error;
pub mod middleware;
pub mod response;
pub mod routes;

/// Prefix of every unary `chat.ChatService` method.
pub const CHAT_SERVICE: &str = "/rpc/chat.ChatService";

fn rpc(method: &str) -> String {
    format!("{CHAT_SERVICE}/{method}")
}

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // Messages
        .route(&rpc("SendMessage"), post(routes::messages::send_message))
        .route(&rpc("GetMessages"), post(routes::messages::get_messages))
        .route(&rpc("GetMessage"), post(routes::messages::get_message))
        .route(
            &rpc("GetThreadMessages"),
            post(routes::messages::get_thread_messages),
        )
        .route(&rpc("EditMessage"), post(routes::messages::edit_message))
        .route(&rpc("DeleteMessage"), post(routes::messages::delete_message))
        // Reactions, likes, pins, reads
        .route(&rpc("AddReaction"), post(routes::reactions::add_reaction))
        .route(
            &rpc("RemoveReaction"),
            post(routes::reactions::remove_reaction),
        )
        .route(&rpc("ToggleLike"), post(routes::reactions::toggle_like))
        .route(&rpc("PinMessage"), post(routes::reactions::pin_message))
        .route(&rpc("UnpinMessage"), post(routes::reactions::unpin_message))
        .route(
            &rpc("GetPinnedMessages"),
            post(routes::reactions::get_pinned_messages),
        )
        .route(&rpc("MarkAsRead"), post(routes::reactions::mark_as_read))
        // Presence
        .route(
            &rpc("UpdatePresenceStatus"),
            post(routes::presence::update_presence_status),
        )
        .route(&rpc("GetPresence"), post(routes::presence::get_presence))
        // Groups
        .route(&rpc("CreateGroup"), post(routes::groups::create_group))
        .route(
            &rpc("AddGroupMember"),
            post(routes::groups::add_group_member),
        )
        .route(
            &rpc("RemoveGroupMember"),
            post(routes::groups::remove_group_member),
        )
        .route(
            &rpc("GetUsersInGroup"),
            post(routes::groups::get_users_in_group),
        )
        // Scheduling
        .route(
            &rpc("ScheduleMessage"),
            post(routes::scheduled::schedule_message),
        )
        .route(
            &rpc("CancelScheduledMessage"),
            post(routes::scheduled::cancel_scheduled_message),
        )
        .route(
            &rpc("ListScheduledMessages"),
            post(routes::scheduled::list_scheduled_messages),
        )
        // Admin
        .route(
            &rpc("ForceDisconnect"),
            post(routes::admin::force_disconnect),
        )
        .layer(build_cors_layer())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

fn build_cors_layer() -> tower_http::cors::CorsLayer {
    tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "service": "parley",
            "sessions": state.registry.len(),
            "shutting_down": state.registry.is_shutting_down(),
        })),
    )
}
