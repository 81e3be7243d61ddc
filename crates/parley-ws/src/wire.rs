//! Frame-level trace output on the `wire` target.

use parley_core::SessionId;

const PREVIEW_BYTES: usize = 256;

pub(crate) fn wire_trace_enabled() -> bool {
    tracing::enabled!(target: "wire", tracing::Level::TRACE)
}

/// First bytes of a payload as lossy UTF-8, cut on a char boundary.
pub(crate) fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(&payload[..payload.len().min(PREVIEW_BYTES)]);
    let mut preview = text.into_owned();
    if payload.len() > PREVIEW_BYTES {
        preview.push('…');
    }
    preview
}

pub(crate) fn wire_log_in(
    user_id: Option<&str>,
    session_id: Option<SessionId>,
    frame_type: &str,
    payload: &[u8],
) {
    if !wire_trace_enabled() {
        return;
    }
    tracing::trace!(
        target: "wire",
        transport = "stream",
        direction = "in",
        frame_type,
        user_id = ?user_id,
        session_id = ?session_id.map(|id| id.to_string()),
        bytes = payload.len(),
        payload_preview = %payload_preview(payload),
        "server_in"
    );
}

pub(crate) fn wire_log_out(
    user_id: &str,
    session_id: Option<SessionId>,
    frame_type: &str,
    frames: usize,
    payload: &[u8],
) {
    if !wire_trace_enabled() {
        return;
    }
    tracing::trace!(
        target: "wire",
        transport = "stream",
        direction = "out",
        frame_type,
        user_id,
        session_id = ?session_id.map(|id| id.to_string()),
        frames,
        bytes = payload.len(),
        payload_preview = %payload_preview(payload),
        "server_out"
    );
}

pub(crate) fn wire_log_close(
    user_id: Option<&str>,
    session_id: Option<SessionId>,
    code: u16,
    reason: &str,
) {
    if !wire_trace_enabled() {
        return;
    }
    tracing::trace!(
        target: "wire",
        transport = "stream",
        direction = "out",
        frame_type = "close",
        user_id = ?user_id,
        session_id = ?session_id.map(|id| id.to_string()),
        code,
        reason,
        "server_out"
    );
}
