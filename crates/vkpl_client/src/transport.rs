#![forbid(unsafe_code)]

//! Pub/sub transport: one owned WebSocket connection plus the method-call
//! correlator driving it.
//!
//! The task established by [`connect`] owns the socket exclusively. Method
//! calls travel in over an unbounded command channel and resolve through
//! oneshot replies; pushes and lifecycle notices travel out over an
//! unbounded event channel. The event channel must never apply backpressure
//! to the read loop: a subscribe reply can be queued behind an arbitrary
//! number of pushes, and blocking on their delivery while the subscriber is
//! itself awaiting that reply would wedge the connection. An unclean
//! closure (stream end or read error without a close handshake) triggers an
//! immediate re-dial and re-handshake with no backoff and no retry cap; a
//! clean closure, local or remote, is terminal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tracing::{debug, info, warn};
use url::Url;
use vkpl_protocol::{FramePeek, KEEPALIVE_FRAME, PushFrame, ReplyFrame, connect_method};

use crate::rpc::RpcCorrelator;

pub const DEFAULT_WS_URL: &str = "wss://pubsub.live.vkplay.ru/connection/websocket?cf_protocol_version=v2";
pub const DEFAULT_ORIGIN: &str = "https://live.vkplay.ru";
/// Client name reported in the `connect` handshake; the backend knows
/// this one from its own web client.
pub const DEFAULT_CLIENT_NAME: &str = "js";

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type PubSubWs = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
pub type WsConnector = Arc<dyn Fn(Url) -> BoxFuture<'static, anyhow::Result<PubSubWs>> + Send + Sync>;

/// Auth collaborator feeding the transport and the session.
#[async_trait]
pub trait TokenProvider: Send + Sync {
	/// Token for the `connect` handshake.
	async fn connect_token(&self) -> anyhow::Result<String>;

	/// Scoped tokens for restricted topics (reward management).
	async fn subscription_tokens(&self, channels: &[String]) -> anyhow::Result<Vec<SubscriptionToken>>;
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SubscriptionToken {
	pub channel: String,
	#[serde(default)]
	pub token: String,
}

#[derive(Clone)]
pub struct TransportConfig {
	pub ws_url: String,
	pub origin: String,
	pub client_name: String,
	pub ws_connector: Option<WsConnector>,
}

impl Default for TransportConfig {
	fn default() -> Self {
		Self {
			ws_url: DEFAULT_WS_URL.to_string(),
			origin: DEFAULT_ORIGIN.to_string(),
			client_name: DEFAULT_CLIENT_NAME.to_string(),
			ws_connector: None,
		}
	}
}

impl TransportConfig {
	fn connector(&self) -> WsConnector {
		if let Some(connector) = &self.ws_connector {
			return connector.clone();
		}

		let origin = self.origin.clone();
		Arc::new(move |url: Url| {
			let origin = origin.clone();
			Box::pin(async move { connect_pubsub_ws(url, &origin).await }) as BoxFuture<'static, anyhow::Result<PubSubWs>>
		})
	}
}

async fn connect_pubsub_ws(url: Url, origin: &str) -> anyhow::Result<PubSubWs> {
	let mut request = url.as_str().into_client_request().context("build ws request")?;
	let origin = HeaderValue::from_str(origin).context("invalid origin header")?;
	request.headers_mut().insert(ORIGIN, origin);

	let (ws, _resp) = tokio_tungstenite::connect_async(request)
		.await
		.context("connect_async to pubsub ws")?;
	Ok(ws)
}

/// Transport → session notifications.
#[derive(Debug)]
pub enum TransportEvent {
	/// Automatic re-handshake completed; every subscription must be
	/// replayed before further pushes mean anything.
	Reconnected,
	Push(PushFrame),
	/// Clean closure; nothing follows.
	Closed,
}

enum SocketCommand {
	Invoke {
		payload: Value,
		resp: oneshot::Sender<Value>,
	},
	Disconnect,
}

/// Handle to the transport task. Cloneable; all clones drive the same
/// connection.
#[derive(Clone)]
pub struct Socket {
	cmd_tx: mpsc::UnboundedSender<SocketCommand>,
}

impl Socket {
	/// Invoke a method call and await its reply frame.
	///
	/// There is deliberately no timeout here: a reply lost to a dropped
	/// connection leaves the call pending forever. Wrap with
	/// `tokio::time::timeout` when bounded latency matters.
	pub async fn invoke(&self, payload: Value) -> anyhow::Result<Value> {
		let (resp_tx, resp_rx) = oneshot::channel();
		self.cmd_tx
			.send(SocketCommand::Invoke {
				payload,
				resp: resp_tx,
			})
			.map_err(|_| anyhow!("transport task is gone"))?;
		resp_rx.await.map_err(|_| anyhow!("transport task dropped before replying"))
	}

	/// Clean local close. Idempotent; pending calls are abandoned.
	pub fn disconnect(&self) {
		let _ = self.cmd_tx.send(SocketCommand::Disconnect);
	}
}

/// Dial the pub/sub endpoint and run the connect handshake. Resolves only
/// once the handshake reply arrives; the background task takes over from
/// there.
pub async fn connect(
	cfg: TransportConfig,
	tokens: Arc<dyn TokenProvider>,
) -> anyhow::Result<(Socket, mpsc::UnboundedReceiver<TransportEvent>)> {
	let url = Url::parse(&cfg.ws_url).with_context(|| format!("invalid ws url: {}", cfg.ws_url))?;
	let connector = cfg.connector();
	let mut correlator = RpcCorrelator::new();

	let mut ws = connector(url.clone()).await?;
	handshake(&mut ws, &mut correlator, &cfg.client_name, tokens.as_ref()).await?;
	info!(%url, "pub/sub connected");

	let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
	let (events_tx, events_rx) = mpsc::unbounded_channel();

	let state = RunState {
		connector,
		url,
		client_name: cfg.client_name,
		tokens,
		correlator,
		cmd_rx,
		events_tx,
	};
	tokio::spawn(run_loop(state, ws));

	Ok((Socket { cmd_tx }, events_rx))
}

struct RunState {
	connector: WsConnector,
	url: Url,
	client_name: String,
	tokens: Arc<dyn TokenProvider>,
	correlator: RpcCorrelator,
	cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
	events_tx: mpsc::UnboundedSender<TransportEvent>,
}

enum CloseKind {
	Clean,
	Unclean,
}

async fn run_loop(mut state: RunState, mut ws: PubSubWs) {
	loop {
		match drive(&mut state, &mut ws).await {
			CloseKind::Clean => {
				let _ = state.events_tx.send(TransportEvent::Closed);
				return;
			}
			CloseKind::Unclean => {
				warn!(pending_calls = state.correlator.pending_calls(), "pub/sub connection lost; reconnecting");
				let Some(next) = reconnect(&mut state).await else {
					return;
				};
				ws = next;
				if state.events_tx.send(TransportEvent::Reconnected).is_err() {
					return;
				}
			}
		}
	}
}

/// Immediate re-dial loop. No backoff and no attempt cap; a consistently
/// failing endpoint is retried until the event receiver goes away.
async fn reconnect(state: &mut RunState) -> Option<PubSubWs> {
	loop {
		if state.events_tx.is_closed() {
			return None;
		}
		match establish(state).await {
			Ok(ws) => {
				info!(url = %state.url, "pub/sub reconnected");
				return Some(ws);
			}
			Err(e) => warn!(error = %e, "reconnect attempt failed"),
		}
	}
}

async fn establish(state: &mut RunState) -> anyhow::Result<PubSubWs> {
	let mut ws = (state.connector)(state.url.clone()).await?;
	handshake(&mut ws, &mut state.correlator, &state.client_name, state.tokens.as_ref()).await?;
	Ok(ws)
}

async fn handshake(
	ws: &mut PubSubWs,
	correlator: &mut RpcCorrelator,
	client_name: &str,
	tokens: &dyn TokenProvider,
) -> anyhow::Result<()> {
	let token = tokens.connect_token().await.context("fetch connect token")?;
	let mut payload = connect_method(&token, client_name);
	let (resp_tx, mut resp_rx) = oneshot::channel();
	let id = correlator.register(&mut payload, resp_tx);
	ws.send(Message::Text(payload.to_string().into()))
		.await
		.context("send connect method")?;

	// No subscriptions exist yet, so apart from keepalives the only
	// interesting inbound frame is our own reply.
	loop {
		let msg = ws
			.next()
			.await
			.ok_or_else(|| anyhow!("socket ended during connect handshake"))?
			.context("read during connect handshake")?;
		match msg {
			Message::Text(text) => {
				if text.as_str() == KEEPALIVE_FRAME {
					ws.send(Message::Text(KEEPALIVE_FRAME.into())).await.context("echo keepalive")?;
					continue;
				}
				let frame: Value = match serde_json::from_str(text.as_str()) {
					Ok(frame) => frame,
					Err(e) => {
						warn!(error = %e, "malformed frame during handshake dropped");
						continue;
					}
				};
				if !correlator.resolve(&frame) {
					continue;
				}
				let Ok(reply) = resp_rx.try_recv() else {
					// Some other pending call got its answer.
					continue;
				};
				let reply: ReplyFrame = serde_json::from_value(reply).context("decode connect reply")?;
				anyhow::ensure!(reply.id == id, "connect reply id mismatch");
				if let Some(error) = reply.error {
					bail!("connect rejected: code={} message={}", error.code, error.message);
				}
				debug!("connect handshake complete");
				return Ok(());
			}
			Message::Ping(body) => {
				ws.send(Message::Pong(body)).await.context("pong during handshake")?;
			}
			Message::Close(frame) => bail!("socket closed during connect handshake: {frame:?}"),
			_ => {}
		}
	}
}

async fn drive(state: &mut RunState, ws: &mut PubSubWs) -> CloseKind {
	loop {
		tokio::select! {
			cmd = state.cmd_rx.recv() => {
				match cmd {
					Some(SocketCommand::Invoke { mut payload, resp }) => {
						let id = state.correlator.register(&mut payload, resp);
						if let Err(e) = ws.send(Message::Text(payload.to_string().into())).await {
							// The reply will never come; the entry stays
							// pending like any call lost to a dying socket.
							warn!(id, error = %e, "failed to send method call");
						}
					}
					Some(SocketCommand::Disconnect) | None => {
						let _ = ws.close(None).await;
						return CloseKind::Clean;
					}
				}
			}

			msg = ws.next() => {
				let Some(msg) = msg else {
					return CloseKind::Unclean;
				};
				let msg = match msg {
					Ok(msg) => msg,
					Err(e) => {
						warn!(error = %e, "pub/sub read error");
						return CloseKind::Unclean;
					}
				};

				match msg {
					Message::Text(text) => {
						if let Some(event) = handle_text(state, ws, text.as_str()).await
							&& state.events_tx.send(event).is_err()
						{
							// Nobody is listening anymore.
							let _ = ws.close(None).await;
							return CloseKind::Clean;
						}
					}
					Message::Ping(body) => {
						let _ = ws.send(Message::Pong(body)).await;
					}
					Message::Close(frame) => {
						debug!(?frame, "pub/sub closed by server");
						return CloseKind::Clean;
					}
					_ => {}
				}
			}
		}
	}
}

async fn handle_text(state: &mut RunState, ws: &mut PubSubWs, text: &str) -> Option<TransportEvent> {
	if text == KEEPALIVE_FRAME {
		if let Err(e) = ws.send(Message::Text(KEEPALIVE_FRAME.into())).await {
			warn!(error = %e, "failed to echo keepalive");
		}
		return None;
	}

	let peek: FramePeek = match serde_json::from_str(text) {
		Ok(peek) => peek,
		Err(e) => {
			warn!(error = %e, "malformed pub/sub frame dropped");
			return None;
		}
	};

	// Anything with an id is a method reply; it is never push traffic.
	if peek.id.is_some() {
		if let Ok(frame) = serde_json::from_str::<Value>(text) {
			state.correlator.resolve(&frame);
		}
		return None;
	}

	match serde_json::from_str::<PushFrame>(text) {
		Ok(push) => Some(TransportEvent::Push(push)),
		Err(e) => {
			debug!(error = %e, "unclassifiable frame dropped");
			None
		}
	}
}
