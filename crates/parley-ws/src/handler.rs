use std::collections::VecDeque;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_core::auth::bearer_token;
use parley_core::{
    AppState, ClaimSet, CloseReason, CoreError, MembershipFilter, NewSession, Session, SessionId,
    SinkRead,
};
use parley_models::stream::{close, code, kind};
use parley_models::wire::encode_envelope_into;
use parley_models::{Envelope, Frame, FrameCodec, FrameError, Payload, SubscriptionTag};
use tokio::task::JoinHandle;
use tokio::time::Duration;

use crate::params::StreamParams;
use crate::wire::{wire_log_close, wire_log_in, wire_log_out};

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const WRITE_BATCH: usize = 32;
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// How long an evicted stream's writer gets to send its close frame.
const CLOSE_FRAME_GRACE: Duration = Duration::from_millis(500);

type WsSender = SplitSink<WebSocket, Message>;
type WsReceiver = SplitStream<WebSocket>;

pub(crate) struct StreamRequest {
    pub tag: SubscriptionTag,
    pub token: Option<String>,
    pub params: StreamParams,
}

enum Inbound {
    Frame(Frame),
    Invalid(FrameError),
    Closed,
}

/// Decodes every frame of a WebSocket message in order before reading the next one.
struct FrameReader {
    receiver: WsReceiver,
    codec: FrameCodec,
    ready: VecDeque<Result<Frame, FrameError>>,
}

impl FrameReader {
    fn new(receiver: WsReceiver) -> Self {
        Self {
            receiver,
            codec: FrameCodec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Cancel safe: decoded frames stay buffered until returned.
    async fn next(&mut self, user_id: Option<&str>, session_id: Option<SessionId>) -> Inbound {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return match item {
                    Ok(frame) => Inbound::Frame(frame),
                    Err(err) => Inbound::Invalid(err),
                };
            }
            match self.receiver.next().await {
                Some(Ok(Message::Binary(data))) => {
                    wire_log_in(user_id, session_id, "binary", &data);
                    self.codec.feed(&data);
                    loop {
                        match self.codec.decode_next() {
                            Ok(Some(frame)) => self.ready.push_back(Ok(frame)),
                            Ok(None) => break,
                            Err(err) => self.ready.push_back(Err(err)),
                        }
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    wire_log_in(user_id, session_id, "text", text.as_bytes());
                    let parsed = serde_json::from_str::<Envelope>(text.as_str())
                        .map(Frame::Envelope)
                        .map_err(FrameError::Json);
                    self.ready.push_back(parsed);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                    return Inbound::Frame(Frame::Heartbeat);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Inbound::Closed,
            }
        }
    }
}

async fn send_close(
    sender: &mut WsSender,
    user_id: Option<&str>,
    session_id: Option<SessionId>,
    code: u16,
    reason: &str,
) {
    wire_log_close(user_id, session_id, code, reason);
    if let Ok(frame) = Frame::close(code, reason).encode() {
        let _ = sender.send(Message::Binary(frame)).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

/// Opening phase. Returns the claim set plus a first envelope that still has
/// to be dispatched once the session is active.
async fn authenticate(
    state: &AppState,
    request: &StreamRequest,
    reader: &mut FrameReader,
) -> Result<(ClaimSet, Option<Envelope>), CoreError> {
    if let Some(token) = &request.token {
        let claims = state.authenticate(token).await?;
        if request.tag != SubscriptionTag::Chat {
            return Ok((claims, None));
        }
        let envelope = match reader.next(None, None).await {
            Inbound::Frame(Frame::Envelope(envelope)) => envelope,
            _ => return Err(CoreError::Unauthenticated("expected an envelope".into())),
        };
        if envelope.originator() != Some(claims.user_id.as_str()) {
            return Err(CoreError::Unauthenticated(
                "first frame does not belong to the authenticated user".into(),
            ));
        }
        let pending = match &envelope.payload {
            Payload::State(s) if s.kind == kind::AUTHORIZATION => None,
            _ => Some(envelope),
        };
        return Ok((claims, pending));
    }

    match reader.next(None, None).await {
        Inbound::Frame(Frame::Envelope(Envelope {
            payload: Payload::State(s),
            ..
        })) if s.kind == kind::AUTHORIZATION => {
            let token = s
                .payload_str()
                .and_then(bearer_token)
                .ok_or_else(|| CoreError::Unauthenticated("empty authorization".into()))?;
            Ok((state.authenticate(token).await?, None))
        }
        _ => Err(CoreError::Unauthenticated("authorization required".into())),
    }
}

/// Runs one stream through Opening, Active, Draining and Closed.
pub(crate) async fn serve_stream(socket: WebSocket, state: AppState, request: StreamRequest) {
    let (mut sender, receiver) = socket.split();
    let mut reader = FrameReader::new(receiver);

    let (claims, pending) =
        match tokio::time::timeout(AUTH_TIMEOUT, authenticate(&state, &request, &mut reader)).await {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(err)) => {
                tracing::info!(tag = %request.tag, error = %err, "stream rejected");
                send_close(&mut sender, None, None, close::UNAUTHENTICATED, "unauthenticated").await;
                return;
            }
            Err(_) => {
                tracing::info!(tag = %request.tag, "stream authorization timed out");
                send_close(&mut sender, None, None, close::UNAUTHENTICATED, "authorization timeout")
                    .await;
                return;
            }
        };

    let requested_groups = request.params.group_ids();
    let (admitted, denied) = match state
        .pipeline
        .admit_groups(&claims.user_id, &requested_groups)
        .await
    {
        Ok(split) => split,
        Err(err) => {
            tracing::warn!(user_id = %claims.user_id, error = %err, "group admission failed");
            (Vec::new(), requested_groups)
        }
    };

    let user_id = claims.user_id.clone();
    let registered = match state.registry.register(NewSession {
        claims,
        device: request.params.device(),
        tag: request.tag.clone(),
        filter: MembershipFilter::new(request.params.peer_ids(), admitted),
    }) {
        Ok(registered) => registered,
        Err(_) => {
            send_close(
                &mut sender,
                Some(&user_id),
                None,
                close::SHUTTING_DOWN,
                CloseReason::ShuttingDown.as_str(),
            )
            .await;
            return;
        }
    };
    let session = registered.session;

    if !denied.is_empty() {
        let err = Envelope::error(
            code::FORBIDDEN,
            format!("not a member of: {}", denied.join(", ")),
        );
        state.router.push_direct(&session, Arc::new(err));
    }

    let mut writer = tokio::spawn(write_loop(sender, session.clone()));
    let mut writer_done = false;

    if let Some(envelope) = pending {
        dispatch(&state, &session, envelope).await;
    }

    let exit = loop {
        tokio::select! {
            inbound = reader.next(Some(&session.user_id), Some(session.id)) => match inbound {
                Inbound::Frame(Frame::Envelope(envelope)) => dispatch(&state, &session, envelope).await,
                Inbound::Frame(Frame::Heartbeat) => session.touch(),
                Inbound::Frame(Frame::Close(_)) | Inbound::Closed => break "client closed",
                Inbound::Invalid(err) => {
                    tracing::debug!(session_id = %session.id, error = %err, "invalid frame discarded");
                    let envelope = Envelope::error(code::BAD_REQUEST, err.to_string());
                    state.router.push_direct(&session, Arc::new(envelope));
                }
            },
            _ = session.sink().closed() => break "session closed",
            _ = &mut writer => {
                writer_done = true;
                break "writer finished";
            }
            _ = state.shutdown.cancelled() => break "server shutting down",
        }
    };

    // Draining: a normal close lets the writer flush what is queued. An
    // eviction only waits for the close frame, then drops the socket.
    state.registry.deregister(session.id);
    if !writer_done {
        let deadline = match session.sink().close_reason() {
            Some(reason) if !reason.drains() => CLOSE_FRAME_GRACE,
            _ => state.config.drain_deadline,
        };
        drain_writer(&mut writer, deadline, &session).await;
    }

    tracing::info!(
        session_id = %session.id,
        user_id = %session.user_id,
        tag = %session.tag,
        reason = exit,
        close = session.sink().close_reason().map(CloseReason::as_str).unwrap_or("none"),
        dropped = session.sink().dropped_count(),
        "stream closed"
    );
}

async fn drain_writer(writer: &mut JoinHandle<()>, deadline: Duration, session: &Session) {
    if tokio::time::timeout(deadline, &mut *writer).await.is_err() {
        tracing::warn!(
            session_id = %session.id,
            pending = session.sink().len(),
            close = session.sink().close_reason().map(CloseReason::as_str).unwrap_or("none"),
            "writer did not finish in time, aborting"
        );
        writer.abort();
    }
}

async fn dispatch(state: &AppState, session: &Arc<Session>, envelope: Envelope) {
    if session.sink().is_closed() {
        return;
    }
    if session.tag == SubscriptionTag::Chat {
        state.pipeline.handle_envelope(session, envelope).await;
        return;
    }
    // Subscription streams may only keep alive and edit their filter.
    match &envelope.payload {
        Payload::State(s)
            if matches!(
                s.kind.as_str(),
                kind::HEARTBEAT | kind::SUBSCRIBE | kind::UNSUBSCRIBE
            ) =>
        {
            state.pipeline.handle_envelope(session, envelope).await;
        }
        _ => {
            session.touch();
            let err = CoreError::invalid("subscription streams only accept heartbeat and filter changes");
            state.pipeline.reply_error(session, &err);
        }
    }
}

/// Single consumer of the session sink. Batches queued envelopes into one
/// binary message and ends with the sink's close reason.
async fn write_loop(mut sender: WsSender, session: Arc<Session>) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await;

    loop {
        tokio::select! {
            read = session.sink().next_batch(WRITE_BATCH) => match read {
                SinkRead::Items(batch) => {
                    let mut buf = BytesMut::new();
                    let mut frames = 0;
                    for envelope in &batch {
                        match encode_envelope_into(envelope, &mut buf) {
                            Ok(()) => frames += 1,
                            Err(err) => tracing::warn!(
                                session_id = %session.id,
                                error = %err,
                                "outbound envelope not encodable"
                            ),
                        }
                    }
                    if frames == 0 {
                        continue;
                    }
                    wire_log_out(&session.user_id, Some(session.id), "envelope", frames, &buf);
                    if sender.send(Message::Binary(buf.freeze())).await.is_err() {
                        session.sink().close(CloseReason::Normal);
                        break;
                    }
                }
                SinkRead::Closed(reason) => {
                    send_close(
                        &mut sender,
                        Some(&session.user_id),
                        Some(session.id),
                        reason.code(),
                        reason.as_str(),
                    )
                    .await;
                    break;
                }
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    session.sink().close(CloseReason::Normal);
                    break;
                }
            }
        }
    }
}
