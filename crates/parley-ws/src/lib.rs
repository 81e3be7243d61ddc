mod handler;
mod params;
mod wire;

use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parley_core::AppState;
use parley_models::{ResponseEnvelope, SubscriptionTag};

pub use params::StreamParams;

pub const CHAT_STREAM_PATH: &str = "/rpc/chat.ChatService/ChatStream";
pub const SUBSCRIBE_PATH: &str = "/rpc/chat.ChatService/Subscribe/{tag}";

pub fn stream_router() -> Router<AppState> {
    Router::new()
        .route(CHAT_STREAM_PATH, get(chat_stream))
        .route(SUBSCRIBE_PATH, get(subscribe))
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(parley_core::auth::bearer_token)
        .map(str::to_string)
}

async fn chat_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Response {
    let request = handler::StreamRequest {
        tag: SubscriptionTag::Chat,
        token: header_token(&headers),
        params,
    };
    ws.on_upgrade(move |socket| handler::serve_stream(socket, state, request))
}

async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(tag): Path<String>,
    Query(params): Query<StreamParams>,
    headers: HeaderMap,
) -> Response {
    let tag = match tag.parse::<SubscriptionTag>() {
        Ok(tag) if tag.is_subscribable() => tag,
        Ok(_) => return bad_request(format!("{tag} is not a subscription tag")),
        Err(err) => return bad_request(err.to_string()),
    };
    let request = handler::StreamRequest {
        tag,
        token: header_token(&headers),
        params,
    };
    ws.on_upgrade(move |socket| handler::serve_stream(socket, state, request))
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ResponseEnvelope::<()>::error(400, message, Vec::new())),
    )
        .into_response()
}
