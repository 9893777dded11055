#![forbid(unsafe_code)]

//! Chat client for VK Play Live channels.
//!
//! [`VkplClient::connect`] resolves the configured channels over REST,
//! establishes the pub/sub WebSocket, subscribes each channel's topics and
//! hands back an event stream. Messages are sent through the client or
//! through the [`events::MessageEvent`] handles it emits.

pub mod api;
pub mod events;
pub mod router;
pub mod rpc;
pub mod session;
pub mod token;
pub mod transport;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};
use vkpl_domain::{Channel, ChannelName};
use vkpl_protocol::frames::WsMessage;

use crate::api::VkplApi;
use crate::session::ChannelSession;
use crate::token::{TokenAuth, TokenStore};
use crate::transport::{Socket, TransportConfig, WsConnector};

pub use crate::api::{CurrentUser, DEFAULT_API_BASE_URL};
pub use crate::events::{
	ChannelInfoEvent, ChatEvent, FollowerEvent, LikeCounterEvent, MessageEvent, ParentMessage, RewardEvent,
	StreamStatusEvent, TokenRefreshed,
};
pub use crate::token::SecretString;
pub use crate::transport::{DEFAULT_CLIENT_NAME, DEFAULT_ORIGIN, DEFAULT_WS_URL, SubscriptionToken, TokenProvider};

/// Buffered public events before backpressure hits the session task.
const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Config(String),
	#[error("authentication required: {0}")]
	Auth(String),
	#[error("api request failed: {0}")]
	Api(#[source] anyhow::Error),
	#[error("connecting to pub/sub failed: {0}")]
	Connect(#[source] anyhow::Error),
	#[error("transport failure: {0}")]
	Transport(String),
}

/// How the client authenticates against the API and the pub/sub endpoint.
#[derive(Debug, Clone)]
pub enum AuthConfig {
	/// Watch chat anonymously; sending and reward topics are unavailable.
	ReadOnly,
	/// OAuth tokens lifted from an authenticated web session.
	Token {
		access_token: SecretString,
		refresh_token: Option<SecretString>,
		expires_at: Option<chrono::DateTime<chrono::Utc>>,
		client_id: Option<String>,
	},
	/// Retired credential scheme, rejected at connect time.
	LoginPassword { login: String, password: SecretString },
}

#[derive(Clone)]
pub struct ClientConfig {
	pub channels: Vec<ChannelName>,
	pub auth: AuthConfig,
	pub ws_url: String,
	pub api_base_url: String,
	pub client_name: String,
	/// Test hook for dialing something other than the real endpoint.
	pub ws_connector: Option<WsConnector>,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			channels: Vec::new(),
			auth: AuthConfig::ReadOnly,
			ws_url: transport::DEFAULT_WS_URL.to_string(),
			api_base_url: DEFAULT_API_BASE_URL.to_string(),
			client_name: transport::DEFAULT_CLIENT_NAME.to_string(),
			ws_connector: None,
		}
	}
}

impl ClientConfig {
	pub fn new(channels: Vec<ChannelName>, auth: AuthConfig) -> Self {
		Self {
			channels,
			auth,
			..Self::default()
		}
	}
}

/// Connected chat client. Dropping it does not tear the connection down;
/// call [`VkplClient::disconnect`] for a clean close.
pub struct VkplClient {
	api: Arc<VkplApi>,
	socket: Socket,
	channels: Arc<Vec<Channel>>,
}

impl VkplClient {
	/// Resolve channels, connect and subscribe. The returned receiver
	/// yields every [`ChatEvent`] until the connection closes cleanly.
	pub async fn connect(config: ClientConfig) -> Result<(Self, mpsc::Receiver<ChatEvent>), Error> {
		let tokens = match config.auth {
			AuthConfig::ReadOnly => TokenStore::new(None),
			AuthConfig::Token {
				access_token,
				refresh_token,
				expires_at,
				client_id,
			} => TokenStore::new(Some(TokenAuth {
				access_token,
				refresh_token,
				expires_at,
				client_id,
			})),
			AuthConfig::LoginPassword { .. } => {
				return Err(Error::Config(
					"login and password credentials are no longer supported; supply oauth tokens instead".into(),
				));
			}
		};
		if config.channels.is_empty() {
			return Err(Error::Config("at least one channel is required".into()));
		}

		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
		let api = Arc::new(
			VkplApi::new(&config.api_base_url, tokens, Some(events_tx.clone())).map_err(Error::Api)?,
		);

		let mut channels = Vec::with_capacity(config.channels.len());
		for name in &config.channels {
			let channel = api.blog(name).await.map_err(Error::Api)?;
			debug!(channel = %name, ws_id = %channel.public_ws_channel, "channel resolved");
			channels.push(channel);
		}
		let channels = Arc::new(channels);

		// Smile ids are account-scoped, not channel-scoped, so one
		// channel's set covers outgoing messages everywhere.
		if api.is_authenticated()
			&& let Some(first) = config.channels.first()
		{
			let smiles = api.smiles(first).await.map_err(Error::Api)?;
			api.set_smiles(smiles);
		}

		let transport_cfg = TransportConfig {
			ws_url: config.ws_url,
			origin: transport::DEFAULT_ORIGIN.to_string(),
			client_name: config.client_name,
			ws_connector: config.ws_connector,
		};
		let provider: Arc<dyn TokenProvider> = api.clone();
		let (socket, transport_events) = transport::connect(transport_cfg, provider.clone())
			.await
			.map_err(Error::Connect)?;

		let session = ChannelSession::new(channels.clone(), socket.clone(), api.clone(), provider, events_tx);
		session.subscribe_all().await;
		tokio::spawn(session.run(transport_events));
		info!(channels = channels.len(), "chat client connected");

		Ok((
			Self {
				api,
				socket,
				channels,
			},
			events_rx,
		))
	}

	pub fn channels(&self) -> &[Channel] {
		&self.channels
	}

	pub fn channel_by_name(&self, name: &ChannelName) -> Option<&Channel> {
		self.channels.iter().find(|channel| &channel.blog_url == name)
	}

	pub fn channel_by_ws_id(&self, ws_id: &str) -> Option<&Channel> {
		self.channels.iter().find(|channel| channel.public_ws_channel == ws_id)
	}

	pub fn is_authenticated(&self) -> bool {
		self.api.is_authenticated()
	}

	pub async fn current_user(&self) -> Result<CurrentUser, Error> {
		self.api.current_user().await.map_err(Error::Api)
	}

	/// Send a chat message into one of the connected channels.
	pub async fn send_message(&self, name: &ChannelName, text: &str) -> Result<WsMessage, Error> {
		self.send_message_with(name, text, &[], None).await
	}

	/// Send with explicit mention and reply targets.
	pub async fn send_message_with(
		&self,
		name: &ChannelName,
		text: &str,
		mentions: &[i64],
		reply_to: Option<i64>,
	) -> Result<WsMessage, Error> {
		if !self.api.is_authenticated() {
			return Err(Error::Auth("sending messages requires oauth tokens".into()));
		}
		let channel = self
			.channel_by_name(name)
			.ok_or_else(|| Error::Config(format!("channel {name} is not part of this session")))?;
		self.api
			.send_message(channel, text, mentions, reply_to)
			.await
			.map_err(Error::Api)
	}

	/// Raw method call on the pub/sub connection. The reply frame comes
	/// back verbatim.
	pub async fn invoke(&self, payload: Value) -> Result<Value, Error> {
		self.socket.invoke(payload).await.map_err(|e| Error::Transport(e.to_string()))
	}

	/// Clean close. The event receiver yields pending events and ends.
	pub fn disconnect(&self) {
		self.socket.disconnect();
	}
}
