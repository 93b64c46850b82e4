//! The relay engine: WebSocket endpoint plus the per-session task trio.
//!
//! ## Connection lifecycle
//!
//! 1. Browser opens `GET /relay/{guid}/{mode}` (subprotocol `direct`).
//!    Mode validation and the device lookup happen before the upgrade, so
//!    an unknown GUID or mode is an HTTP error and no WebSocket traffic
//!    ever flows.
//! 2. The registry hands back the live session for the key, or creates one
//!    (device connect + digest state). A freshly created session gets two
//!    session-scoped tasks — the device→browser loop and the health
//!    monitor — plus a joiner that owns the teardown.
//! 3. The upgrade future itself runs the browser→device loop for this
//!    socket. On reconnect the previous socket is sent a normal close
//!    before the sink swap so no zombie reader can steal frames.
//!
//! ## Termination
//!
//! Browser-side closures detach quietly; the session keeps its device
//! connection for the reuse window. Transport errors, fatal codec errors,
//! the inactivity monitor, and process shutdown fire the session's
//! cancellation token. When the session-scoped tasks have ended, the joiner
//! stops the transport, closes the current browser socket, wipes the digest
//! secret, and frees the registry slot — the only removal path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, Stream, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

use super::codec;
use super::session::RedirectSession;
use super::{Mode, SessionKey};
use crate::error::RedirectError;
use crate::state::AppState;

/// `GET /relay/{guid}/{mode}` — redirection WebSocket upgrade.
///
/// Any Origin is accepted; the console assumes a trusted LAN.
pub async fn redirect_upgrade(
    State(state): State<AppState>,
    Path((guid, mode)): Path<(String, String)>,
    ws: WebSocketUpgrade,
) -> Response {
    let mode = match mode.parse::<Mode>() {
        Ok(mode) => mode,
        Err(err) => return error_response(&err),
    };

    let device = match state.repo.get_by_id(&guid, "").await {
        Ok(Some(device)) if !device.guid.is_empty() => device,
        Ok(_) => {
            debug!(%guid, "redirect request for unknown device");
            return error_response(&RedirectError::NotFound);
        }
        Err(err) => {
            warn!(%guid, %err, "device lookup failed");
            return error_response(&err);
        }
    };

    let span = info_span!("redirect", guid = %device.guid, mode = %mode);
    let read_buffer = state.config.redirect.ws_read_buffer_bytes;
    let write_buffer = state.config.redirect.ws_write_buffer_bytes;
    ws.protocols(["direct"])
        .max_message_size(read_buffer)
        .write_buffer_size(write_buffer)
        .on_upgrade(move |socket| attach(socket, state, device, mode).instrument(span))
}

/// Post-upgrade: join (or create) the session for this key and run the
/// browser→device loop on the new socket.
async fn attach(socket: WebSocket, state: AppState, device: crate::device::Device, mode: Mode) {
    let key = SessionKey::new(device.guid.clone(), mode);

    let acquired = state
        .registry
        .acquire(
            &key,
            &device,
            state.cryptor.as_ref(),
            state.transport_factory.as_ref(),
            &state.shutdown,
        )
        .await;

    let acquired = match acquired {
        Ok(a) => a,
        Err(err) => {
            // Already upgraded: nothing to report but a normal closure.
            warn!(%err, "session setup failed");
            let mut socket = socket;
            let _ = socket.send(close_frame("session setup failed")).await;
            return;
        }
    };

    let (sink, stream) = socket.split();
    let (generation, displaced) = acquired.session.attach_browser(Box::new(sink)).await;
    if let Some(mut old) = displaced {
        info!("browser reconnected; closing previous socket");
        let _ = old.sink.send(close_frame("session resumed elsewhere")).await;
    }

    if acquired.created {
        spawn_session_tasks(&state, &acquired.session);
    }

    browser_loop(state, acquired.session, stream, generation).await;
}

/// Start the session-scoped tasks and the joiner that owns teardown.
pub(crate) fn spawn_session_tasks(state: &AppState, session: &Arc<RedirectSession>) {
    let span = info_span!("session", key = %session.key);
    let cfg = &state.config.redirect;

    let device_task = tokio::spawn(
        device_loop(state.clone(), session.clone()).instrument(span.clone()),
    );
    let health_task = tokio::spawn(
        health_monitor(
            session.clone(),
            cfg.health_period(),
            cfg.inactivity_timeout(),
        )
        .instrument(span.clone()),
    );

    let registry = state.registry.clone();
    let session = session.clone();
    tokio::spawn(
        async move {
            let _ = device_task.await;
            let _ = health_task.await;

            session.cancel();
            session.transport().close().await;
            if let Some(mut browser) = session.take_browser().await {
                let _ = browser.sink.send(close_frame("session closed")).await;
            }
            session.wipe_secret();
            registry.release(&session.key, session.id).await;
            info!("session torn down");
        }
        .instrument(span),
    );
}

/// Device→browser loop. Runs for the session's lifetime; the browser sink
/// it writes through may be swapped (or absent) at any iteration.
async fn device_loop(state: AppState, session: Arc<RedirectSession>) {
    let mode = session.mode.as_str();

    loop {
        if session.is_cancelled() {
            break;
        }
        session.touch_activity();

        let recv_start = Instant::now();
        let received = session.transport().receive(session.token()).await;
        state
            .metrics
            .device_receive_block(mode, recv_start.elapsed());

        let data = match received {
            Ok(data) => data,
            Err(RedirectError::Cancelled) => break,
            Err(err) => {
                debug!(%err, "device receive failed");
                break;
            }
        };
        session.touch_activity();
        if data.is_empty() {
            continue;
        }
        session.mark_data_recv();

        let (out, now_direct) = if session.direct() {
            (data, false)
        } else {
            session.with_challenge(|ch| codec::process_device_frame(&data, ch))
        };
        if now_direct {
            session.set_direct();
            info!("authentication complete, direct relay established");
        }
        if out.is_empty() {
            continue;
        }

        let frame_len = out.len();
        let message = Message::Binary(out.into());
        let write_start = Instant::now();
        let mut slot = session.browser().await;
        match slot.as_mut() {
            // No browser attached: the frame has nowhere to go.
            None => {}
            Some(browser) => {
                if browser.sink.send(message).await.is_ok() {
                    state
                        .metrics
                        .device_to_browser(mode, frame_len, write_start.elapsed());
                } else {
                    // Browser went away mid-write. Detach and keep the
                    // device connection for the reuse window; the health
                    // monitor reaps the session once the device goes quiet.
                    debug!("browser write failed; detaching");
                    *slot = None;
                }
            }
        }
    }

    // Transport error or EOF ends the session.
    session.cancel();
}

/// Browser→device loop for one socket attachment. A closing browser
/// detaches quietly; only transport and fatal codec errors cancel the
/// session.
async fn browser_loop<S>(
    state: AppState,
    session: Arc<RedirectSession>,
    mut stream: S,
    generation: u64,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let mode = session.mode.as_str();

    loop {
        session.touch_activity();

        let read_start = Instant::now();
        let incoming = tokio::select! {
            () = session.cancelled() => break,
            msg = stream.next() => msg,
        };
        state.metrics.browser_read_block(mode, read_start.elapsed());

        let data = match incoming {
            Some(Ok(Message::Binary(data))) => data,
            Some(Ok(Message::Close(_))) | None => {
                debug!("browser closed; detaching");
                session.detach_browser(generation).await;
                return;
            }
            // Pings are answered by the websocket layer; nothing else is
            // part of the redirection protocol.
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                debug!(%err, "browser read failed; detaching");
                session.detach_browser(generation).await;
                return;
            }
        };
        session.touch_activity();

        let out = if session.direct() {
            data.to_vec()
        } else {
            match session.with_challenge(|ch| codec::process_browser_frame(&data, ch)) {
                Ok(out) => out,
                Err(err) => {
                    warn!(%err, "fatal digest error; terminating session");
                    session.cancel();
                    return;
                }
            }
        };
        if out.is_empty() {
            continue;
        }

        let frame_len = out.len();
        let send_start = Instant::now();
        if let Err(err) = session.transport().send(session.token(), &out).await {
            if !matches!(err, RedirectError::Cancelled) {
                debug!(%err, "device send failed");
            }
            session.cancel();
            return;
        }
        state
            .metrics
            .browser_to_device(mode, frame_len, send_start.elapsed());
    }
}

/// Inactivity watchdog: cancels the session when the device has been silent
/// past the configured timeout.
async fn health_monitor(
    session: Arc<RedirectSession>,
    period: Duration,
    inactivity_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            () = session.cancelled() => return,
            _ = ticker.tick() => {
                if session.since_last_data() > inactivity_timeout {
                    info!(
                        timeout_secs = inactivity_timeout.as_secs(),
                        "no device data within the inactivity timeout; closing session"
                    );
                    session.cancel();
                    return;
                }
            }
        }
    }
}

fn close_frame(reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.into(),
    }))
}

/// Map a pre-upgrade error to its HTTP response. Anything not meant for the
/// client gets a generic body.
fn error_response(err: &RedirectError) -> Response {
    let status = match err {
        RedirectError::NotFound => StatusCode::NOT_FOUND,
        RedirectError::Validation(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = if err.is_client_visible() {
        err.to_string()
    } else {
        "internal error".to_string()
    };
    (status, body).into_response()
}
