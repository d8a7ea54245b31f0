//! # Realtime Transcription WebSocket
//!
//! Clients connect to `/v1/transcribe/realtime` (also `/api/v1/transcribe/realtime`),
//! stream binary fragments of one audio container and receive partial and
//! final transcriptions as JSON text frames.
//!
//! ## WebSocket Protocol:
//! - **Client → Server text**: `{"type":"config",...}` or `{"type":"flush"}`
//! - **Client → Server binary**: the next fragment of the audio stream
//! - **Server → Client text**: `config_ack`, `error`, `done`, or a result
//!   `{"text","is_partial","is_final_segment"}`
//!
//! Messages split into continuation frames are reassembled and then handled
//! like a single text or binary frame.
//!
//! ## Actor Model:
//! Each connection is one actor owning one [`RealtimeSession`]. Every frame is
//! handled inside `ctx.wait`, which suspends the actor's mailbox and stream
//! until the future resolves, so frame N+1 is never looked at before frame N
//! (including its transcription) has finished.
//!
//! ## Cleanup:
//! `stopped` runs on every exit path (close frame, protocol error, heartbeat
//! timeout, server shutdown). It runs the session's final drain and releases
//! the session slot.

use crate::audio::session::{RealtimeSession, ServerMessage};
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_http::ws::Item;
use actix_web::web::{self, BytesMut};
use actix_web::{HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
enum FragmentKind {
    Text,
    Binary,
}

/// A message arriving as continuation frames, collected until the last one.
struct Fragmented {
    kind: FragmentKind,
    data: BytesMut,
}

/// WebSocket actor for one realtime transcription connection.
pub struct RealtimeSocket {
    session_id: String,
    /// Shared with the cleanup task spawned from `stopped`
    session: Arc<Mutex<RealtimeSession>>,
    app_state: web::Data<AppState>,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    client_timeout: Duration,
    max_message_bytes: usize,
    fragment: Option<Fragmented>,
}

impl RealtimeSocket {
    pub fn new(session: RealtimeSession, app_state: web::Data<AppState>) -> Self {
        let realtime = app_state.get_config().realtime;
        Self {
            session_id: session.id().to_string(),
            session: Arc::new(Mutex::new(session)),
            app_state,
            last_heartbeat: Instant::now(),
            heartbeat_interval: Duration::from_millis(realtime.heartbeat_interval_ms),
            client_timeout: Duration::from_millis(realtime.client_timeout_ms),
            max_message_bytes: realtime.max_frame_bytes,
            fragment: None,
        }
    }

    /// Run one frame's work to completion before the next frame is read.
    fn process_in_order<F>(&mut self, work: F, ctx: &mut ws::WebsocketContext<Self>)
    where
        F: Future<Output = Vec<ServerMessage>> + 'static,
    {
        ctx.wait(work.into_actor(self).map(|replies, act, ctx| {
            // Frames queued behind a slow load or transcription were not
            // readable, so that time does not count as client silence.
            act.last_heartbeat = Instant::now();
            act.deliver(replies, ctx);
        }));
    }

    /// Write replies if the connection is still open; otherwise drop them.
    fn deliver(&self, replies: Vec<ServerMessage>, ctx: &mut ws::WebsocketContext<Self>) {
        if ctx.state() != ActorState::Running {
            if !replies.is_empty() {
                debug!(
                    session_id = %self.session_id,
                    "Connection closing, dropping {} replies",
                    replies.len()
                );
            }
            return;
        }

        for reply in replies {
            if let Ok(json) = serde_json::to_string(&reply) {
                ctx.text(json);
            }
        }
    }

    fn handle_text_frame(&mut self, text: String, ctx: &mut ws::WebsocketContext<Self>) {
        let session = self.session.clone();
        self.process_in_order(
            async move { session.lock().await.handle_text(&text).await },
            ctx,
        );
    }

    fn handle_binary_frame(&mut self, data: web::Bytes, ctx: &mut ws::WebsocketContext<Self>) {
        debug!(session_id = %self.session_id, "Received {} bytes of audio", data.len());
        let session = self.session.clone();
        self.process_in_order(
            async move { session.lock().await.handle_binary(&data).await },
            ctx,
        );
    }

    /// Collect continuation frames; the completed message is handled like an
    /// unfragmented one.
    fn handle_continuation(&mut self, item: Item, ctx: &mut ws::WebsocketContext<Self>) {
        let (start, data, last) = match item {
            Item::FirstText(data) => (Some(FragmentKind::Text), data, false),
            Item::FirstBinary(data) => (Some(FragmentKind::Binary), data, false),
            Item::Continue(data) => (None, data, false),
            Item::Last(data) => (None, data, true),
        };

        if let Some(kind) = start {
            if self.fragment.is_some() {
                self.reject_fragment(
                    "Fragmented message started before the previous one ended".to_string(),
                    ctx,
                );
                return;
            }
            self.fragment = Some(Fragmented {
                kind,
                data: BytesMut::new(),
            });
        }

        let buffered = match &self.fragment {
            Some(fragment) => fragment.data.len(),
            None => {
                self.reject_fragment("Continuation frame without a starting frame".to_string(), ctx);
                return;
            }
        };
        if buffered + data.len() > self.max_message_bytes {
            let message = format!("Fragmented message exceeds {} bytes", self.max_message_bytes);
            self.reject_fragment(message, ctx);
            return;
        }
        if let Some(fragment) = self.fragment.as_mut() {
            fragment.data.extend_from_slice(&data);
        }

        if !last {
            return;
        }
        if let Some(Fragmented { kind, data }) = self.fragment.take() {
            match kind {
                FragmentKind::Binary => self.handle_binary_frame(data.freeze(), ctx),
                FragmentKind::Text => match String::from_utf8(data.to_vec()) {
                    Ok(text) => self.handle_text_frame(text, ctx),
                    Err(_) => self.reject_fragment(
                        "Fragmented text message is not valid UTF-8".to_string(),
                        ctx,
                    ),
                },
            }
        }
    }

    /// Drop the partial message and tell the client; the connection stays open.
    fn reject_fragment(&mut self, message: String, ctx: &mut ws::WebsocketContext<Self>) {
        warn!(session_id = %self.session_id, "{}", message);
        self.fragment = None;
        self.deliver(vec![ServerMessage::error(message)], ctx);
    }
}

impl Actor for RealtimeSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Realtime session started");

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!(session_id = %act.session_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let session = self.session.clone();
        let app_state = self.app_state.clone();
        let session_id = self.session_id.clone();

        // The final drain may run a transcription; it cannot happen inside
        // the (synchronous) stop hook.
        actix_web::rt::spawn(async move {
            session.lock().await.close().await;
            app_state.end_session();
            info!(session_id = %session_id, "Realtime session released");
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RealtimeSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(err) => {
                warn!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                self.deliver(vec![ServerMessage::error(format!("WebSocket error: {}", err))], ctx);
                ctx.stop();
                return;
            }
        };

        self.last_heartbeat = Instant::now();
        match msg {
            ws::Message::Text(text) => self.handle_text_frame(text.to_string(), ctx),
            ws::Message::Binary(data) => self.handle_binary_frame(data, ctx),
            ws::Message::Continuation(item) => self.handle_continuation(item, ctx),
            ws::Message::Ping(payload) => ctx.pong(&payload),
            ws::Message::Pong(_) => {}
            ws::Message::Close(reason) => {
                info!(session_id = %self.session_id, "Client closed connection: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            ws::Message::Nop => {}
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// 1. Reserve a session slot (503 when the limit is reached)
/// 2. Build the session with the current config snapshot
/// 3. Upgrade; on handshake failure the slot is released again
pub async fn realtime_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    if !app_state.try_start_session() {
        let limit = app_state.get_config().realtime.max_concurrent_sessions;
        warn!("Refusing realtime session: {} sessions already active", limit);
        return Err(AppError::Unavailable(format!(
            "Too many active realtime sessions (limit {})",
            limit
        )));
    }

    let session_id = Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        "New realtime connection from {:?}",
        req.connection_info().peer_addr()
    );

    let session = RealtimeSession::new(
        session_id,
        app_state.engine.clone(),
        app_state.session_policy(),
    );
    let max_frame_bytes = app_state.get_config().realtime.max_frame_bytes;
    let actor = RealtimeSocket::new(session, app_state.clone());

    ws::WsResponseBuilder::new(actor, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
        .map_err(|e| {
            app_state.end_session();
            AppError::BadRequest(format!("WebSocket handshake failed: {}", e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::testing::state_with;
    use crate::transcription::backend::testing::FakeLoader;
    use crate::transcription::ModelIdentifier;
    use actix_web::{http::StatusCode, test, web::Bytes, App};
    use futures_util::{SinkExt, Stream, StreamExt};

    const REALTIME_PATH: &str = "/v1/transcribe/realtime";

    fn state(limit: usize) -> AppState {
        let mut config = AppConfig::default();
        config.realtime.max_concurrent_sessions = limit;
        state_with(Arc::new(FakeLoader::new()), config)
    }

    fn serve(state: AppState) -> actix_test::TestServer {
        actix_test::start(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route(REALTIME_PATH, web::get().to(realtime_websocket))
        })
    }

    /// Next JSON text frame from the server, skipping heartbeat pings.
    async fn next_reply<S>(conn: &mut S) -> serde_json::Value
    where
        S: Stream<Item = Result<ws::Frame, ws::ProtocolError>> + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), conn.next())
                .await
                .expect("timed out waiting for a reply")
                .expect("connection ended")
                .expect("protocol error");
            match frame {
                ws::Frame::Text(text) => return serde_json::from_slice(&text).unwrap(),
                ws::Frame::Ping(_) | ws::Frame::Pong(_) => continue,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("condition not met within 5s");
    }

    fn audio(len: usize) -> ws::Message {
        ws::Message::Binary(Bytes::from(vec![0u8; len]))
    }

    fn flush() -> ws::Message {
        ws::Message::Text(r#"{"type":"flush"}"#.into())
    }

    #[actix_web::test]
    async fn test_plain_http_request_is_rejected_and_slot_released() {
        let state = state(1);
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route(REALTIME_PATH, web::get().to(realtime_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri(REALTIME_PATH).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[actix_web::test]
    async fn test_session_limit_returns_503() {
        let state = state(1);
        assert!(state.try_start_session());

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route(REALTIME_PATH, web::get().to(realtime_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri(REALTIME_PATH).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.active_sessions, 1);
        assert_eq!(metrics.sessions_rejected, 1);
    }

    #[actix_web::test]
    async fn test_frames_are_handled_in_arrival_order() {
        // Slow loads make a reordering visible: the second config must not
        // overtake the transcription started by the second fragment.
        let loader = Arc::new(FakeLoader::new().with_load_delay(Duration::from_millis(200)));
        let state = state_with(loader.clone(), AppConfig::default());
        let mut srv = serve(state);
        let mut conn = srv.ws_at(REALTIME_PATH).await.unwrap();

        conn.send(ws::Message::Text(r#"{"type":"config","model":"small"}"#.into()))
            .await
            .unwrap();
        conn.send(audio(1200)).await.unwrap();
        conn.send(audio(1200)).await.unwrap();
        conn.send(ws::Message::Text(r#"{"type":"config","model":"turbo"}"#.into()))
            .await
            .unwrap();
        conn.send(flush()).await.unwrap();

        assert_eq!(next_reply(&mut conn).await["type"], "config_ack");
        let partial = next_reply(&mut conn).await;
        assert_eq!(partial["text"], "2400 bytes via small");
        assert_eq!(partial["is_partial"], true);
        assert_eq!(next_reply(&mut conn).await["type"], "config_ack");
        assert_eq!(next_reply(&mut conn).await["type"], "done");

        let calls = loader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].model_id, ModelIdentifier::Small);
    }

    #[actix_web::test]
    async fn test_slow_transcription_does_not_trip_heartbeat_timeout() {
        let mut config = AppConfig::default();
        config.realtime.heartbeat_interval_ms = 100;
        config.realtime.client_timeout_ms = 1_000;
        let loader = Arc::new(FakeLoader::new().with_load_delay(Duration::from_secs(2)));
        let mut srv = serve(state_with(loader, config));
        let mut conn = srv.ws_at(REALTIME_PATH).await.unwrap();

        conn.send(audio(2000)).await.unwrap();
        conn.send(flush()).await.unwrap();

        let segment = next_reply(&mut conn).await;
        assert_eq!(segment["text"], "2000 bytes via medium");
        assert_eq!(segment["is_final_segment"], true);
        assert_eq!(next_reply(&mut conn).await["type"], "done");

        // Still inside the client timeout measured from the reply.
        tokio::time::sleep(Duration::from_millis(300)).await;
        conn.send(flush()).await.unwrap();
        assert_eq!(next_reply(&mut conn).await["type"], "done");
    }

    #[actix_web::test]
    async fn test_disconnect_transcribes_buffered_audio_and_releases_session() {
        let loader = Arc::new(FakeLoader::new());
        let state = state_with(loader.clone(), AppConfig::default());
        let mut srv = serve(state.clone());
        let mut conn = srv.ws_at(REALTIME_PATH).await.unwrap();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 1);

        conn.send(audio(2000)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(conn);

        eventually(|| {
            loader.calls().len() == 1 && state.get_metrics_snapshot().active_sessions == 0
        })
        .await;
        assert_eq!(loader.calls()[0].audio.len(), 2000);
    }

    #[actix_web::test]
    async fn test_protocol_error_sends_error_frame_and_releases_session() {
        let mut config = AppConfig::default();
        config.realtime.max_frame_bytes = 1024;
        let loader = Arc::new(FakeLoader::new());
        let state = state_with(loader.clone(), config);
        let mut srv = serve(state.clone());
        let mut conn = srv.ws_at(REALTIME_PATH).await.unwrap();

        conn.send(audio(2000)).await.unwrap();

        let reply = next_reply(&mut conn).await;
        assert_eq!(reply["type"], "error");
        assert!(reply["message"]
            .as_str()
            .unwrap()
            .starts_with("WebSocket error"));

        eventually(|| state.get_metrics_snapshot().active_sessions == 0).await;
        assert!(loader.calls().is_empty());
    }

    #[actix_web::test]
    async fn test_continuation_frames_are_reassembled() {
        let loader = Arc::new(FakeLoader::new());
        let mut srv = serve(state_with(loader.clone(), AppConfig::default()));
        let mut conn = srv.ws_at(REALTIME_PATH).await.unwrap();

        for item in [
            Item::FirstText(Bytes::from_static(br#"{"type":"config","#)),
            Item::Last(Bytes::from_static(br#""model":"small"}"#)),
        ] {
            conn.send(ws::Message::Continuation(item)).await.unwrap();
        }
        assert_eq!(next_reply(&mut conn).await["type"], "config_ack");

        for item in [
            Item::FirstBinary(Bytes::from(vec![1u8; 1000])),
            Item::Continue(Bytes::from(vec![2u8; 500])),
            Item::Last(Bytes::from(vec![3u8; 500])),
        ] {
            conn.send(ws::Message::Continuation(item)).await.unwrap();
        }
        conn.send(flush()).await.unwrap();

        assert_eq!(next_reply(&mut conn).await["text"], "2000 bytes via small");
        assert_eq!(next_reply(&mut conn).await["type"], "done");

        let calls = loader.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].audio.len(), 2000);
        assert_eq!(calls[0].audio[999..1001], [1, 2]);
    }

    #[actix_web::test]
    async fn test_oversized_fragmented_message_is_rejected() {
        let mut config = AppConfig::default();
        config.realtime.max_frame_bytes = 1024;
        let loader = Arc::new(FakeLoader::new());
        let mut srv = serve(state_with(loader.clone(), config));
        let mut conn = srv.ws_at(REALTIME_PATH).await.unwrap();

        for item in [
            Item::FirstBinary(Bytes::from(vec![0u8; 800])),
            Item::Last(Bytes::from(vec![0u8; 800])),
        ] {
            conn.send(ws::Message::Continuation(item)).await.unwrap();
        }

        let reply = next_reply(&mut conn).await;
        assert_eq!(reply["type"], "error");
        assert_eq!(reply["message"], "Fragmented message exceeds 1024 bytes");

        // The connection stays usable and nothing was buffered.
        conn.send(flush()).await.unwrap();
        assert_eq!(next_reply(&mut conn).await["type"], "done");
        assert!(loader.calls().is_empty());
    }
}
