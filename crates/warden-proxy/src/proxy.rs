//! The runtime proxy itself.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, accept_async, connect_async};
use tracing::{debug, info, warn};
use warden_audit::{EntryDraft, EventType, Ledger};
use warden_cert::CertificateVerifier;
use warden_core::SessionId;

use crate::error::{ProxyError, ProxyResult};
use crate::frame::{Frame, error_response};
use crate::scopes::ScopeTable;
use crate::session::SessionState;

/// Ledger `gateway_id` for entries produced by the proxy.
const PROXY_GATEWAY_ID: &str = "runtime-proxy";

type ClientStream = SplitStream<WebSocketStream<TcpStream>>;
type UpstreamStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Static configuration for the runtime proxy.
#[derive(Debug, Clone)]
pub struct RuntimeProxyConfig {
    /// WebSocket URL of the upstream agent runtime.
    pub upstream_url: String,
    /// Credential substituted into `auth.token` before forwarding the
    /// client's `connect` request.
    pub upstream_token: Option<String>,
    /// Whether every session must present a capability certificate.
    pub require_cc: bool,
}

/// Proxy statistics.
#[derive(Debug, Clone)]
pub struct ProxyStats {
    /// Sessions currently forwarding.
    pub active_sessions: usize,
    /// Upstream URL.
    pub upstream_url: String,
    /// Whether certificates are mandatory.
    pub require_cc: bool,
}

/// Frame-level bidirectional forwarder with certificate gating.
pub struct RuntimeProxy {
    config: RuntimeProxyConfig,
    verifier: Option<Arc<CertificateVerifier>>,
    ledger: Arc<Ledger>,
    scope_table: ScopeTable,
    sessions: Mutex<HashMap<SessionId, Arc<SessionState>>>,
}

impl RuntimeProxy {
    /// Create a proxy.
    ///
    /// `verifier = None` disables certificate validation; combined
    /// with `require_cc = true` every handshake is refused, never
    /// silently admitted.
    #[must_use]
    pub fn new(
        config: RuntimeProxyConfig,
        verifier: Option<Arc<CertificateVerifier>>,
        ledger: Arc<Ledger>,
        scope_table: ScopeTable,
    ) -> Self {
        Self {
            config,
            verifier,
            ledger,
            scope_table,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Accept clients forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails; per-session errors are
    /// logged and do not stop the accept loop.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> ProxyResult<()> {
        info!(upstream = %self.config.upstream_url, "runtime proxy listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                debug!(%peer, "client connected");
                if let Err(e) = proxy.handle_client(stream).await {
                    debug!(%peer, error = %e, "session ended with error");
                }
            });
        }
    }

    /// Proxy statistics.
    pub async fn stats(&self) -> ProxyStats {
        ProxyStats {
            active_sessions: self.sessions.lock().await.len(),
            upstream_url: self.config.upstream_url.clone(),
            require_cc: self.config.require_cc,
        }
    }

    /// Handle one client connection end to end.
    ///
    /// # Errors
    ///
    /// Returns the reason the session ended abnormally.
    pub async fn handle_client(&self, stream: TcpStream) -> ProxyResult<()> {
        let client_ws = accept_async(stream).await?;
        let (client_sink, client_stream) = client_ws.split();

        // One writer per transport; both pumps go through it.
        let (client_tx, client_rx) = mpsc::channel::<Message>(64);
        let client_writer = tokio::spawn(writer_loop(client_sink, client_rx));

        let result = self.run_session(client_stream, client_tx).await;

        // Writer exits once every sender is dropped.
        let _ = client_writer.await;
        result
    }

    async fn run_session(
        &self,
        mut client_stream: ClientStream,
        client_tx: mpsc::Sender<Message>,
    ) -> ProxyResult<()> {
        // Dial upstream first: it sends its challenge immediately.
        let upstream_ws = match connect_async(self.config.upstream_url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                warn!(error = %e, "upstream dial failed");
                let _ = client_tx
                    .send(text_message(error_response(
                        json!("0"),
                        "UPSTREAM_ERROR",
                        &format!("failed to connect: {e}"),
                    )))
                    .await;
                return Err(ProxyError::UpstreamUnavailable(e.to_string()));
            },
        };
        let (upstream_sink, mut upstream_stream) = upstream_ws.split();
        let (upstream_tx, upstream_rx) = mpsc::channel::<Message>(64);
        let upstream_writer = tokio::spawn(writer_loop(upstream_sink, upstream_rx));

        let result = self
            .handshake_and_forward(
                &mut client_stream,
                &client_tx,
                &mut upstream_stream,
                &upstream_tx,
            )
            .await;

        drop(upstream_tx);
        let _ = upstream_writer.await;
        result
    }

    async fn handshake_and_forward(
        &self,
        client_stream: &mut ClientStream,
        client_tx: &mpsc::Sender<Message>,
        upstream_stream: &mut UpstreamStream,
        upstream_tx: &mpsc::Sender<Message>,
    ) -> ProxyResult<()> {
        // Relay the upstream challenge unmodified.
        let challenge = next_data_message(upstream_stream)
            .await?
            .ok_or(ProxyError::Closed)?;
        send_or_closed(client_tx, challenge).await?;

        // The client must open with a connect request.
        let connect_message = next_data_message(client_stream)
            .await?
            .ok_or(ProxyError::Closed)?;
        let connect_text = connect_message
            .to_text()
            .map_err(|e| ProxyError::InvalidFrame(e.to_string()))?;

        let Ok(mut connect_value) = serde_json::from_str::<Value>(connect_text) else {
            send_or_closed(
                client_tx,
                text_message(error_response(json!("0"), "INVALID_FRAME", "invalid frame format")),
            )
            .await?;
            return Err(ProxyError::InvalidFrame("connect frame not JSON".into()));
        };

        let request_id = connect_value.get("id").cloned().unwrap_or_else(|| json!("0"));
        let is_connect = connect_value.get("type").and_then(Value::as_str) == Some("req")
            && connect_value.get("method").and_then(Value::as_str) == Some("connect");
        if !is_connect {
            send_or_closed(
                client_tx,
                text_message(error_response(
                    request_id,
                    "INVALID_HANDSHAKE",
                    "expected connect request",
                )),
            )
            .await?;
            return Err(ProxyError::HandshakeFailed("expected connect request".into()));
        }

        let params = connect_value.get("params").cloned().unwrap_or_else(|| json!({}));
        let mut session = SessionState::from_connect_params(&params);

        self.ledger.append(
            EntryDraft::new(EventType::ConnectAttempt, PROXY_GATEWAY_ID).arguments(json!({
                "client_id": session.client_id,
                "role": session.role,
                "scopes": params.get("scopes").cloned().unwrap_or_else(|| json!([])),
            })),
        )?;

        // Certificate gate.
        let cc_token = params
            .get("auth")
            .and_then(|a| a.get("ccToken"))
            .and_then(Value::as_str);

        if cc_token.is_some() || self.config.require_cc {
            let Some(token) = cc_token else {
                self.deny_connect(client_tx, &request_id, &session, "ACC_REQUIRED", "capability certificate required")
                    .await?;
                return Err(ProxyError::HandshakeFailed("certificate required".into()));
            };

            match &self.verifier {
                Some(verifier) => match verifier.verify(token) {
                    Ok(certificate) => {
                        debug!(
                            client = %session.client_id,
                            token_id = %certificate.token_id,
                            "certificate accepted"
                        );
                        session.certificate = Some(certificate);
                    },
                    Err(e) => {
                        self.deny_connect(
                            client_tx,
                            &request_id,
                            &session,
                            "ACC_INVALID",
                            &format!("capability certificate invalid: {e}"),
                        )
                        .await?;
                        return Err(ProxyError::HandshakeFailed(e.to_string()));
                    },
                },
                None if self.config.require_cc => {
                    self.deny_connect(
                        client_tx,
                        &request_id,
                        &session,
                        "ACC_INVALID",
                        "no certificate verifier configured",
                    )
                    .await?;
                    return Err(ProxyError::HandshakeFailed("no verifier configured".into()));
                },
                None => {
                    warn!(
                        client = %session.client_id,
                        "ccToken presented but no verifier configured; ignoring it"
                    );
                },
            }
        }

        // Rewrite the upstream credential, leave everything else intact.
        if let Some(token) = &self.config.upstream_token {
            set_auth_token(&mut connect_value, token);
        }
        send_or_closed(upstream_tx, text_message(connect_value.to_string())).await?;

        // Relay the upstream verdict verbatim.
        let response = next_data_message(upstream_stream)
            .await?
            .ok_or(ProxyError::Closed)?;
        let authenticated = response
            .to_text()
            .ok()
            .and_then(|text| Frame::parse(text).ok())
            .is_some_and(|frame| matches!(frame, Frame::Response { ok: true, .. }));
        send_or_closed(client_tx, response).await?;

        if !authenticated {
            self.ledger.append(
                EntryDraft::new(EventType::ConnectDenied, PROXY_GATEWAY_ID)
                    .error("upstream rejected connect")
                    .arguments(json!({"client_id": session.client_id})),
            )?;
            return Err(ProxyError::HandshakeFailed("upstream rejected connect".into()));
        }

        let mut accept = EntryDraft::new(EventType::ConnectSuccess, PROXY_GATEWAY_ID)
            .arguments(json!({"client_id": session.client_id}));
        if let Some(token_id) = session.cc_token_id() {
            accept = accept.cc_token_id(token_id);
        }
        self.ledger.append(accept)?;

        let session = Arc::new(session);
        self.sessions
            .lock()
            .await
            .insert(session.session_id, Arc::clone(&session));
        info!(client = %session.client_id, session = %session.session_id, "session authenticated");

        // Bidirectional forwarding; either pump ending closes both.
        let result = tokio::select! {
            r = self.client_pump(client_stream, upstream_tx, client_tx, &session) => r,
            r = upstream_pump(upstream_stream, client_tx) => r,
        };

        self.sessions.lock().await.remove(&session.session_id);
        info!(
            client = %session.client_id,
            forwarded = session.stats.forwarded(),
            blocked = session.stats.blocked(),
            "session closed"
        );
        result
    }

    async fn deny_connect(
        &self,
        client_tx: &mpsc::Sender<Message>,
        request_id: &Value,
        session: &SessionState,
        code: &str,
        message: &str,
    ) -> ProxyResult<()> {
        self.ledger.append(
            EntryDraft::new(EventType::ConnectDenied, PROXY_GATEWAY_ID)
                .error(message)
                .arguments(json!({"client_id": session.client_id, "code": code})),
        )?;
        send_or_closed(
            client_tx,
            text_message(error_response(request_id.clone(), code, message)),
        )
        .await
    }

    /// Client → upstream: forward requests in arrival order, gating
    /// by method scope.
    async fn client_pump(
        &self,
        client_stream: &mut ClientStream,
        upstream_tx: &mpsc::Sender<Message>,
        client_tx: &mpsc::Sender<Message>,
        session: &Arc<SessionState>,
    ) -> ProxyResult<()> {
        while let Some(message) = client_stream.next().await {
            let message = message.map_err(ProxyError::from)?;
            match message {
                Message::Text(text) => {
                    if let Ok(Frame::Request { id, method, .. }) = Frame::parse(&text) {
                        let required = self.scope_table.required_scopes(&method);
                        let granted =
                            required.is_empty() || required.iter().any(|s| session.has_scope(s));

                        if !granted {
                            session.stats.record_blocked();
                            self.ledger.append(
                                self.session_draft(EventType::RequestDenied, session)
                                    .tool(&method)
                                    .error(format!("missing required scope: {required:?}")),
                            )?;
                            send_or_closed(
                                client_tx,
                                text_message(error_response(
                                    id,
                                    "POLICY_DENIED",
                                    &format!("missing required scope: {required:?}"),
                                )),
                            )
                            .await?;
                            continue;
                        }

                        session.stats.record_forwarded();
                        self.ledger.append(
                            self.session_draft(EventType::RequestForwarded, session)
                                .tool(&method),
                        )?;
                    }
                    // Forward the original text: unknown fields survive.
                    send_or_closed(upstream_tx, Message::Text(text)).await?;
                },
                Message::Binary(bytes) => {
                    send_or_closed(upstream_tx, Message::Binary(bytes)).await?;
                },
                Message::Close(_) => break,
                _ => {},
            }
        }
        Ok(())
    }

    fn session_draft(&self, event_type: EventType, session: &SessionState) -> EntryDraft {
        let mut draft = EntryDraft::new(event_type, PROXY_GATEWAY_ID)
            .arguments(json!({"client_id": session.client_id}));
        if let Some(token_id) = session.cc_token_id() {
            draft = draft.cc_token_id(token_id);
        }
        draft
    }
}

impl std::fmt::Debug for RuntimeProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeProxy")
            .field("upstream_url", &self.config.upstream_url)
            .field("require_cc", &self.config.require_cc)
            .finish_non_exhaustive()
    }
}

/// Upstream → client: relay responses and events in arrival order.
async fn upstream_pump(
    upstream_stream: &mut UpstreamStream,
    client_tx: &mpsc::Sender<Message>,
) -> ProxyResult<()> {
    while let Some(message) = upstream_stream.next().await {
        match message {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                send_or_closed(client_tx, message).await?;
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {},
        }
    }
    Ok(())
}

/// Single writer per transport: serializes every outbound message.
async fn writer_loop<S>(mut sink: SplitSink<S, Message>, mut rx: mpsc::Receiver<Message>)
where
    SplitSink<S, Message>: Sink<Message> + Unpin,
{
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Next text/binary message, skipping control frames. `None` on close
/// or end of stream.
async fn next_data_message<S, E>(stream: &mut S) -> ProxyResult<Option<Message>>
where
    S: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => return Ok(Some(message)),
            Ok(Message::Close(_)) => return Ok(None),
            Ok(_) => {},
            Err(e) => return Err(ProxyError::WebSocket(e.to_string())),
        }
    }
    Ok(None)
}

async fn send_or_closed(tx: &mpsc::Sender<Message>, message: Message) -> ProxyResult<()> {
    tx.send(message).await.map_err(|_| ProxyError::Closed)
}

fn text_message(text: String) -> Message {
    Message::Text(text)
}

/// Overwrite `params.auth.token`, creating the containers if absent.
fn set_auth_token(frame: &mut Value, token: &str) {
    let Some(frame) = frame.as_object_mut() else {
        return;
    };
    let params = frame
        .entry("params")
        .or_insert_with(|| json!({}));
    if !params.is_object() {
        *params = json!({});
    }
    if let Some(params) = params.as_object_mut() {
        let auth = params.entry("auth").or_insert_with(|| json!({}));
        if !auth.is_object() {
            *auth = json!({});
        }
        if let Some(auth) = auth.as_object_mut() {
            auth.insert("token".to_string(), json!(token));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_auth_token_preserves_other_fields() {
        let mut frame = json!({
            "type": "req",
            "id": "1",
            "method": "connect",
            "params": {
                "role": "operator",
                "auth": {"token": "client-token", "ccToken": "abc"},
                "custom": {"nested": true},
            },
        });
        set_auth_token(&mut frame, "upstream-secret");

        assert_eq!(frame["params"]["auth"]["token"], "upstream-secret");
        assert_eq!(frame["params"]["auth"]["ccToken"], "abc");
        assert_eq!(frame["params"]["custom"]["nested"], true);
        assert_eq!(frame["params"]["role"], "operator");
    }

    #[test]
    fn test_set_auth_token_creates_missing_containers() {
        let mut frame = json!({"type": "req", "id": "1", "method": "connect"});
        set_auth_token(&mut frame, "upstream-secret");
        assert_eq!(frame["params"]["auth"]["token"], "upstream-secret");
    }
}
