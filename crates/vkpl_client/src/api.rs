#![forbid(unsafe_code)]

//! REST collaborator for the `api.live.vkplay.ru` surface: channel lookup,
//! smile sets, message posting and the OAuth token endpoints backing the
//! pub/sub transport.

use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use url::Url;
use vkpl_domain::{Channel, ChannelName};
use vkpl_protocol::blocks::{self, SmileMap};
use vkpl_protocol::frames::WsMessage;

use crate::events::{ChatEvent, TokenRefreshed};
use crate::token::{SecretString, TokenAuth, TokenStore};
use crate::transport::{SubscriptionToken, TokenProvider};

pub const DEFAULT_API_BASE_URL: &str = "https://api.live.vkplay.ru/v1/";

/// Failing response bodies are truncated to this many characters in errors.
const ERROR_BODY_SNIPPET: usize = 256;

pub struct VkplApi {
	http: reqwest::Client,
	base_url: Url,
	oauth_url: Url,
	tokens: TokenStore,
	smiles: RwLock<SmileMap>,
	notify: Option<mpsc::Sender<ChatEvent>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlogResponse {
	#[serde(default)]
	public_web_socket_channel: String,
	owner: BlogOwner,
	#[serde(default)]
	blog_url: String,
}

#[derive(Debug, Deserialize)]
struct BlogOwner {
	id: i64,
	#[serde(default)]
	nick: String,
}

#[derive(Debug, Deserialize)]
struct SmileSetsResponse {
	data: SmileSetsData,
}

#[derive(Debug, Deserialize)]
struct SmileSetsData {
	#[serde(default)]
	sets: Vec<SmileSet>,
}

#[derive(Debug, Deserialize)]
struct SmileSet {
	#[serde(default)]
	smiles: Vec<SmileEntry>,
}

#[derive(Debug, Deserialize)]
struct SmileEntry {
	id: String,
	name: String,
}

#[derive(Debug, Deserialize)]
pub struct CurrentUser {
	pub id: i64,
	#[serde(default)]
	pub nick: String,
}

#[derive(Debug, Deserialize)]
struct ConnectTokenResponse {
	token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubscribeTokensResponse {
	data: SubscribeTokensData,
}

#[derive(Debug, Deserialize)]
struct SubscribeTokensData {
	#[serde(default)]
	tokens: Vec<SubscriptionToken>,
}

#[derive(Debug, Deserialize)]
struct RefreshedTokenResponse {
	access_token: String,
	refresh_token: String,
	expires_in: i64,
}

impl VkplApi {
	pub fn new(base_url: &str, tokens: TokenStore, notify: Option<mpsc::Sender<ChatEvent>>) -> anyhow::Result<Self> {
		// A missing trailing slash would make Url::join eat the last path
		// segment ("/v1" + "blog/x" = "/blog/x").
		let mut base = base_url.to_string();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url = Url::parse(&base).with_context(|| format!("invalid api base url: {base}"))?;
		let oauth_url = base_url.join("/oauth/token/").context("building oauth token url")?;

		let http = reqwest::Client::builder()
			.gzip(true)
			.build()
			.context("building http client")?;

		Ok(Self {
			http,
			base_url,
			oauth_url,
			tokens,
			smiles: RwLock::new(SmileMap::new()),
			notify,
		})
	}

	pub fn is_authenticated(&self) -> bool {
		self.tokens.is_authenticated()
	}

	pub fn token_store(&self) -> TokenStore {
		self.tokens.clone()
	}

	/// Resolve a channel name into its pub/sub identity and owner.
	pub async fn blog(&self, name: &ChannelName) -> anyhow::Result<Channel> {
		let url = self
			.base_url
			.join(&format!("blog/{name}"))
			.with_context(|| format!("building blog url for {name}"))?;
		let blog: BlogResponse = self.execute(self.authed(url).await?).await.with_context(|| format!("fetching blog {name}"))?;

		if blog.public_web_socket_channel.is_empty() {
			bail!("blog {name} has no public websocket channel");
		}
		// The API reports "public-stream:XXX"; only the id after the colon
		// identifies the channel across topics.
		let ws_id = blog
			.public_web_socket_channel
			.split_once(':')
			.map(|(_, id)| id.to_string())
			.unwrap_or(blog.public_web_socket_channel);

		let blog_url = if blog.blog_url.is_empty() { name.clone() } else { blog.blog_url.parse()? };
		Ok(Channel {
			blog_url,
			public_ws_channel: ws_id,
			name: blog.owner.nick,
			owner_id: blog.owner.id,
		})
	}

	/// Fetch every smile usable in the channel, keyed by name.
	pub async fn smiles(&self, name: &ChannelName) -> anyhow::Result<SmileMap> {
		let url = self
			.base_url
			.join(&format!("blog/{name}/smile/user_set/"))
			.with_context(|| format!("building smile set url for {name}"))?;
		let sets: SmileSetsResponse = self.execute(self.authed(url).await?).await.with_context(|| format!("fetching smiles for {name}"))?;

		let map: SmileMap = sets
			.data
			.sets
			.into_iter()
			.flat_map(|set| set.smiles)
			.map(|smile| (smile.name, smile.id))
			.collect();
		debug!(channel = %name, smiles = map.len(), "loaded smile map");
		Ok(map)
	}

	/// Replace the smile map consulted when serializing outgoing messages.
	pub fn set_smiles(&self, smiles: SmileMap) {
		*self.smiles.write() = smiles;
	}

	pub async fn current_user(&self) -> anyhow::Result<CurrentUser> {
		let url = self.base_url.join("user/current").context("building current user url")?;
		self.execute(self.authed(url).await?).await.context("fetching current user")
	}

	/// Post a chat message. `mentions` are prepended as mention blocks,
	/// `reply_to` turns the message into a reply.
	pub async fn send_message(
		&self,
		channel: &Channel,
		text: &str,
		mentions: &[i64],
		reply_to: Option<i64>,
	) -> anyhow::Result<WsMessage> {
		if !self.is_authenticated() {
			bail!("sending messages requires credentials");
		}

		let data = {
			let smiles = self.smiles.read();
			let payload = blocks::serialize(text, mentions, &smiles);
			serde_json::to_string(&payload).context("encoding message blocks")?
		};

		let url = self
			.base_url
			.join(&format!("blog/{}/public_video_stream/chat", channel.blog_url))
			.context("building send message url")?;

		let mut form = vec![("data".to_string(), data)];
		if let Some(parent) = reply_to {
			form.push(("reply_to_id".to_string(), parent.to_string()));
		}

		self.refresh_if_needed().await?;
		let request = self.decorate(self.http.post(url)).form(&form);
		self.execute(request).await.context("sending chat message")
	}

	/// Exchange the refresh token for a fresh access token if the current
	/// one is within its expiry window. Concurrent callers collapse into a
	/// single exchange.
	pub async fn refresh_if_needed(&self) -> anyhow::Result<()> {
		if !self.tokens.needs_refresh() {
			return Ok(());
		}
		let _guard = self.tokens.refresh_guard().await;
		if !self.tokens.needs_refresh() {
			// Another caller already refreshed while we waited.
			return Ok(());
		}

		let Some(auth) = self.tokens.snapshot() else {
			return Ok(());
		};
		let Some(refresh_token) = auth.refresh_token else {
			return Ok(());
		};
		let device_id = auth.client_id.clone().unwrap_or_default();

		let form = [
			("response_type", "code"),
			("refresh_token", refresh_token.expose()),
			("grant_type", "refresh_token"),
			("device_id", &device_id),
			("device_os", "streams_web"),
		];
		let response = self
			.http
			.post(self.oauth_url.clone())
			.form(&form)
			.send()
			.await
			.context("requesting token refresh")?;
		let refreshed: RefreshedTokenResponse = decode_response(response).await.context("token refresh")?;

		let expires_at = Utc::now() + Duration::seconds(refreshed.expires_in);
		let access_token = SecretString::new(refreshed.access_token);
		self.tokens.replace(TokenAuth {
			access_token: access_token.clone(),
			refresh_token: Some(SecretString::new(refreshed.refresh_token)),
			expires_at: Some(expires_at),
			client_id: auth.client_id,
		});
		info!(%expires_at, "access token refreshed");

		if let Some(notify) = &self.notify {
			let event = ChatEvent::TokenRefreshed(TokenRefreshed { access_token, expires_at });
			if notify.try_send(event).is_err() {
				warn!("event receiver not keeping up, token refresh notification dropped");
			}
		}
		Ok(())
	}

	/// Build a GET request carrying the auth headers when credentials are
	/// present, refreshing them first if needed.
	async fn authed(&self, url: Url) -> anyhow::Result<reqwest::RequestBuilder> {
		self.refresh_if_needed().await?;
		Ok(self.decorate(self.http.get(url)))
	}

	fn decorate(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		if let Some(token) = self.tokens.access_token() {
			request = request.bearer_auth(token.expose());
		}
		if let Some(client_id) = self.tokens.client_id() {
			request = request.header("X-From-Id", client_id);
		}
		request
	}

	async fn execute<T: serde::de::DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> anyhow::Result<T> {
		let response = request.send().await.context("sending api request")?;
		decode_response(response).await
	}
}

async fn decode_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
	let status = response.status();
	if !status.is_success() {
		let body = response.text().await.unwrap_or_default();
		let snippet: String = body.chars().take(ERROR_BODY_SNIPPET).collect();
		bail!("api returned {status}: {snippet}");
	}
	response.json().await.context("decoding api response")
}

#[async_trait]
impl TokenProvider for VkplApi {
	async fn connect_token(&self) -> anyhow::Result<String> {
		let url = self.base_url.join("ws/connect").context("building connect token url")?;
		let response: ConnectTokenResponse = self.execute(self.authed(url).await?).await.context("fetching connect token")?;
		response.token.context("connect token missing from response")
	}

	async fn subscription_tokens(&self, channels: &[String]) -> anyhow::Result<Vec<SubscriptionToken>> {
		let mut url = self.base_url.join("ws/subscribe").context("building subscribe token url")?;
		url.query_pairs_mut().append_pair("channels", &channels.join(","));
		let response: SubscribeTokensResponse = self.execute(self.authed(url).await?).await.context("fetching subscription tokens")?;
		Ok(response.data.tokens)
	}
}

/// Shared handle letting events send follow-up messages into their channel.
#[derive(Clone)]
pub struct ChannelHandle {
	api: Arc<VkplApi>,
	channel: Channel,
}

impl ChannelHandle {
	pub fn new(api: Arc<VkplApi>, channel: Channel) -> Self {
		Self { api, channel }
	}

	pub fn channel(&self) -> &Channel {
		&self.channel
	}

	pub async fn send(&self, text: &str) -> anyhow::Result<WsMessage> {
		self.api.send_message(&self.channel, text, &[], None).await
	}

	pub async fn send_reply(&self, text: &str, mentions: &[i64], reply_to: Option<i64>) -> anyhow::Result<WsMessage> {
		self.api.send_message(&self.channel, text, mentions, reply_to).await
	}
}

impl std::fmt::Debug for ChannelHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChannelHandle").field("channel", &self.channel.blog_url).finish()
	}
}
