//! End-to-end transport and session tests against an in-process WebSocket
//! server speaking the pub/sub dialect.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use vkpl_client::api::VkplApi;
use vkpl_client::events::ChatEvent;
use vkpl_client::session::ChannelSession;
use vkpl_client::token::{SecretString, TokenAuth, TokenStore};
use vkpl_client::transport::{self, SubscriptionToken, TokenProvider, TransportConfig, TransportEvent};
use vkpl_domain::Channel;
use vkpl_protocol::subscribe_method;

type ServerWs = WebSocketStream<TcpStream>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct StubTokens;

#[async_trait::async_trait]
impl TokenProvider for StubTokens {
	async fn connect_token(&self) -> anyhow::Result<String> {
		Ok("conn-token".to_string())
	}

	async fn subscription_tokens(&self, channels: &[String]) -> anyhow::Result<Vec<SubscriptionToken>> {
		Ok(channels
			.iter()
			.map(|channel| SubscriptionToken {
				channel: channel.clone(),
				token: format!("tok-{channel}"),
			})
			.collect())
	}
}

async fn bind_server() -> (TcpListener, String) {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
	let addr = listener.local_addr().expect("local addr");
	let url = format!("ws://{addr}/connection/websocket?cf_protocol_version=v2");
	(listener, url)
}

async fn accept_ws(listener: &TcpListener) -> ServerWs {
	let (stream, _) = listener.accept().await.expect("accept");
	tokio_tungstenite::accept_async(stream).await.expect("ws handshake")
}

async fn next_text(ws: &mut ServerWs) -> Value {
	loop {
		let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
			.await
			.expect("server read timed out")
			.expect("stream ended")
			.expect("read failed");
		if let Message::Text(text) = msg {
			return serde_json::from_str(text.as_str()).expect("json frame");
		}
	}
}

async fn send_json(ws: &mut ServerWs, frame: Value) {
	ws.send(Message::Text(frame.to_string().into())).await.expect("server send");
}

/// Read the `connect` method call and acknowledge it.
async fn handle_connect(ws: &mut ServerWs) {
	let frame = next_text(ws).await;
	assert_eq!(frame["connect"]["token"], "conn-token");
	assert_eq!(frame["connect"]["name"], "js");
	let id = frame["id"].as_u64().expect("connect id");
	send_json(ws, json!({ "id": id, "result": { "client": "c1" } })).await;
}

/// Read `count` subscribe calls, acknowledge each and return the
/// `(channel, token)` pairs in arrival order.
async fn ack_subscribes(ws: &mut ServerWs, count: usize) -> Vec<(String, Option<String>)> {
	let mut seen = Vec::with_capacity(count);
	for _ in 0..count {
		let frame = next_text(ws).await;
		let channel = frame["subscribe"]["channel"].as_str().expect("subscribe channel").to_string();
		let token = frame["subscribe"]["token"].as_str().map(str::to_string);
		let id = frame["id"].as_u64().expect("subscribe id");
		send_json(ws, json!({ "id": id, "result": {} })).await;
		seen.push((channel, token));
	}
	seen
}

fn mk_channel(ws_id: &str) -> Channel {
	Channel {
		blog_url: "demo".parse().expect("channel name"),
		public_ws_channel: ws_id.to_string(),
		name: "Demo".to_string(),
		owner_id: 1,
	}
}

fn message_push(channel: &str, id: i64, nick: &str, text: &str) -> Value {
	let content = json!([text, "unstyled", []]).to_string();
	json!({
		"push": {
			"channel": channel,
			"pub": {
				"data": {
					"type": "message",
					"data": {
						"id": id,
						"author": { "id": 5, "nick": nick },
						"createdAt": 1700000000,
						"data": [{ "type": "text", "content": content }]
					}
				},
				"offset": 1
			}
		}
	})
}

async fn recv_event(events: &mut mpsc::Receiver<ChatEvent>) -> ChatEvent {
	tokio::time::timeout(RECV_TIMEOUT, events.recv())
		.await
		.expect("event wait timed out")
		.expect("event channel closed")
}

fn transport_config(url: &str) -> TransportConfig {
	TransportConfig {
		ws_url: url.to_string(),
		..TransportConfig::default()
	}
}

#[tokio::test]
async fn concurrent_calls_resolve_out_of_order_replies() {
	let (listener, url) = bind_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;

		let first = next_text(&mut ws).await;
		let second = next_text(&mut ws).await;
		// Answer in reverse arrival order.
		for frame in [second, first] {
			let id = frame["id"].as_u64().expect("call id");
			let channel = frame["subscribe"]["channel"].as_str().expect("channel");
			send_json(&mut ws, json!({ "id": id, "result": { "topic": channel } })).await;
		}
		ws
	});

	let (socket, events) = transport::connect(transport_config(&url), Arc::new(StubTokens))
		.await
		.expect("connect");

	let (reply_a, reply_b) = tokio::join!(
		socket.invoke(subscribe_method("public-chat:a", None)),
		socket.invoke(subscribe_method("public-chat:b", None)),
	);
	assert_eq!(reply_a.expect("reply a")["result"]["topic"], "public-chat:a");
	assert_eq!(reply_b.expect("reply b")["result"]["topic"], "public-chat:b");

	socket.disconnect();
	// Dropping the receiver lets the transport task stop once the mock
	// server goes away instead of redialing a dead listener.
	drop(events);
	server.await.expect("server task");
}

#[tokio::test]
async fn keepalive_frames_are_echoed() {
	let (listener, url) = bind_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;

		ws.send(Message::Text("{}".into())).await.expect("send keepalive");
		let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
			.await
			.expect("echo timed out")
			.expect("stream ended")
			.expect("read failed");
		let Message::Text(text) = msg else {
			panic!("expected text echo, got {msg:?}");
		};
		assert_eq!(text.as_str(), "{}");
	});

	let (socket, events) = transport::connect(transport_config(&url), Arc::new(StubTokens))
		.await
		.expect("connect");

	server.await.expect("server task");
	drop(events);
	socket.disconnect();
}

#[tokio::test]
async fn session_subscribes_topics_and_routes_pushes() {
	let (listener, url) = bind_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;
		let subscribed = ack_subscribes(&mut ws, 3).await;

		// A frame for a channel this client never resolved, then a real one.
		send_json(&mut ws, message_push("public-chat:ghost", 9, "phantom", "boo")).await;
		send_json(&mut ws, message_push("public-chat:chan1", 10, "viewer", "hello")).await;
		(ws, subscribed)
	});

	let tokens = TokenStore::new(Some(TokenAuth {
		access_token: SecretString::new("access"),
		refresh_token: None,
		expires_at: None,
		client_id: None,
	}));
	let api = Arc::new(VkplApi::new("https://api.invalid.test/v1/", tokens, None).expect("api"));
	let provider: Arc<dyn TokenProvider> = Arc::new(StubTokens);

	let (socket, transport_events) = transport::connect(transport_config(&url), provider.clone())
		.await
		.expect("connect");

	let (events_tx, mut events_rx) = mpsc::channel(16);
	let channels = Arc::new(vec![mk_channel("chan1")]);
	let session = ChannelSession::new(channels, socket.clone(), api, provider, events_tx);
	session.subscribe_all().await;
	tokio::spawn(session.run(transport_events));

	let event = recv_event(&mut events_rx).await;
	let ChatEvent::Message(message) = event else {
		panic!("expected a chat message, got {event:?}");
	};
	assert_eq!(message.channel.public_ws_channel, "chan1");
	assert_eq!(message.id, 10);
	assert_eq!(message.user.user.nick, "viewer");
	assert_eq!(message.message.text, "hello");
	assert!(message.parent.is_none());

	socket.disconnect();
	let (_ws, subscribed) = server.await.expect("server task");
	assert_eq!(
		subscribed,
		vec![
			("public-chat:chan1".to_string(), None),
			("channel-info:chan1".to_string(), None),
			(
				"channel-info-manage:chan1".to_string(),
				Some("tok-channel-info-manage:chan1".to_string())
			),
		]
	);
}

#[tokio::test]
async fn subscribe_acks_are_read_behind_a_push_burst() {
	let (listener, url) = bind_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;

		// Queue a burst of pushes ahead of the first subscribe ack. The
		// transport must keep reading (and buffering) to reach the ack
		// while the subscriber is still awaiting it.
		let frame = next_text(&mut ws).await;
		let id = frame["id"].as_u64().expect("subscribe id");
		for n in 0..70i64 {
			send_json(&mut ws, message_push("public-chat:chan1", n, "flooder", "spam")).await;
		}
		send_json(&mut ws, json!({ "id": id, "result": {} })).await;
		ack_subscribes(&mut ws, 1).await;
		ws
	});

	let api = Arc::new(VkplApi::new("https://api.invalid.test/v1/", TokenStore::new(None), None).expect("api"));
	let provider: Arc<dyn TokenProvider> = Arc::new(StubTokens);
	let (socket, transport_events) = transport::connect(transport_config(&url), provider.clone())
		.await
		.expect("connect");

	let (events_tx, mut events_rx) = mpsc::channel(16);
	let channels = Arc::new(vec![mk_channel("chan1")]);
	let session = ChannelSession::new(channels, socket.clone(), api, provider, events_tx);
	tokio::time::timeout(RECV_TIMEOUT, session.subscribe_all())
		.await
		.expect("subscriptions wedged behind the push burst");
	tokio::spawn(session.run(transport_events));

	// Nothing from the burst is lost.
	let mut received = 0;
	while received < 70 {
		if matches!(recv_event(&mut events_rx).await, ChatEvent::Message(_)) {
			received += 1;
		}
	}

	socket.disconnect();
	server.await.expect("server task");
}

#[tokio::test]
async fn unclean_close_triggers_rehandshake_and_subscription_replay() {
	let (listener, url) = bind_server().await;
	let subscription_log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

	let server_log = subscription_log.clone();
	let server = tokio::spawn(async move {
		// First connection dies without a close handshake.
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;
		let subscribed = ack_subscribes(&mut ws, 2).await;
		server_log.lock().push(subscribed.into_iter().map(|(channel, _)| channel).collect());
		drop(ws);

		// The client redials immediately and replays everything.
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;
		let subscribed = ack_subscribes(&mut ws, 2).await;
		server_log.lock().push(subscribed.into_iter().map(|(channel, _)| channel).collect());
		ws
	});

	let api = Arc::new(VkplApi::new("https://api.invalid.test/v1/", TokenStore::new(None), None).expect("api"));
	let provider: Arc<dyn TokenProvider> = Arc::new(StubTokens);

	let (socket, transport_events) = transport::connect(transport_config(&url), provider.clone())
		.await
		.expect("connect");

	let (events_tx, mut events_rx) = mpsc::channel(16);
	let channels = Arc::new(vec![mk_channel("chan1")]);
	let session = ChannelSession::new(channels, socket.clone(), api, provider, events_tx);
	session.subscribe_all().await;
	tokio::spawn(session.run(transport_events));

	let event = recv_event(&mut events_rx).await;
	assert!(matches!(event, ChatEvent::Reconnected), "expected reconnect notice, got {event:?}");

	socket.disconnect();
	server.await.expect("server task");

	let expected_round = vec!["public-chat:chan1".to_string(), "channel-info:chan1".to_string()];
	let log = subscription_log.lock();
	assert_eq!(*log, vec![expected_round.clone(), expected_round]);
}

#[tokio::test]
async fn remote_close_frame_ends_the_session_cleanly() {
	let (listener, url) = bind_server().await;

	let server = tokio::spawn(async move {
		let mut ws = accept_ws(&listener).await;
		handle_connect(&mut ws).await;
		ws.close(None).await.expect("server close");
		// Drain until the close completes.
		while ws.next().await.is_some() {}
	});

	let (_socket, mut transport_events) = transport::connect(transport_config(&url), Arc::new(StubTokens))
		.await
		.expect("connect");

	let event = tokio::time::timeout(RECV_TIMEOUT, transport_events.recv())
		.await
		.expect("close wait timed out")
		.expect("transport channel closed early");
	assert!(matches!(event, TransportEvent::Closed), "expected clean close, got {event:?}");
	assert!(transport_events.recv().await.is_none());
}
