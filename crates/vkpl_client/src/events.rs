#![forbid(unsafe_code)]

//! Public event surface. Everything the backend pushes is normalized into
//! [`ChatEvent`] variants carrying decoded payloads and a [`ChannelHandle`]
//! for sending follow-ups without going back through the client.

use chrono::{DateTime, Utc};
use vkpl_domain::{Channel, ParsedMessage};
use vkpl_protocol::frames::{Reward, RewardStatus, WsChatUser, WsMessage, WsUser};

use crate::api::ChannelHandle;
use crate::token::SecretString;

/// Everything the client surfaces to its consumer.
#[derive(Debug)]
pub enum ChatEvent {
	Message(MessageEvent),
	Reward(RewardEvent),
	ChannelInfo(ChannelInfoEvent),
	StreamStatus(StreamStatusEvent),
	LikeCounter(LikeCounterEvent),
	Follower(FollowerEvent),
	/// Credentials were rotated; consumers persisting tokens should store
	/// the new ones.
	TokenRefreshed(TokenRefreshed),
	/// The transport dropped and came back; subscriptions were replayed.
	Reconnected,
}

/// A chat message, decoded from its block form.
#[derive(Debug)]
pub struct MessageEvent {
	pub channel: Channel,
	pub id: i64,
	pub user: WsChatUser,
	pub message: ParsedMessage,
	pub created_at: i64,
	pub is_private: bool,
	pub parent: Option<ParentMessage>,
	handle: ChannelHandle,
}

/// The message this one replies to, already decoded.
#[derive(Debug)]
pub struct ParentMessage {
	pub id: i64,
	pub user: WsChatUser,
	pub message: ParsedMessage,
	pub is_private: bool,
}

impl MessageEvent {
	pub(crate) fn new(
		channel: Channel,
		source: WsMessage,
		message: ParsedMessage,
		parent: Option<ParentMessage>,
		handle: ChannelHandle,
	) -> Self {
		// Whispers carry the counterpart in `user`; everything else only
		// sets `author`.
		let user = source.user.unwrap_or(source.author);
		Self {
			channel,
			id: source.id,
			user,
			message,
			created_at: source.created_at,
			is_private: source.is_private,
			parent,
			handle,
		}
	}

	/// Send a plain message into the channel this one arrived on.
	pub async fn send(&self, text: &str) -> anyhow::Result<WsMessage> {
		self.handle.send(text).await
	}

	/// Reply by mentioning this message's author.
	pub async fn reply(&self, text: &str) -> anyhow::Result<WsMessage> {
		self.handle.send_reply(text, &[self.user.user.id], None).await
	}

	/// Reply in this message's thread, mentioning its author.
	pub async fn reply_in_thread(&self, text: &str) -> anyhow::Result<WsMessage> {
		self.handle.send_reply(text, &[self.user.user.id], Some(self.id)).await
	}
}

/// A channel points reward was claimed.
#[derive(Debug)]
pub struct RewardEvent {
	pub channel: Channel,
	pub reward: Reward,
	pub user: WsUser,
	pub status: RewardStatus,
	/// The claimant's activation message, when the reward asks for one.
	pub message: Option<ParsedMessage>,
	pub demand_id: i64,
	pub created_at: i64,
	handle: ChannelHandle,
}

impl RewardEvent {
	pub(crate) fn new(
		channel: Channel,
		reward: Reward,
		user: WsUser,
		status: RewardStatus,
		message: Option<ParsedMessage>,
		demand_id: i64,
		created_at: i64,
		handle: ChannelHandle,
	) -> Self {
		Self { channel, reward, user, status, message, demand_id, created_at, handle }
	}

	pub async fn send(&self, text: &str) -> anyhow::Result<WsMessage> {
		self.handle.send(text).await
	}
}

/// Stream metadata changed (title, category, viewer count, online flag).
#[derive(Debug)]
pub struct ChannelInfoEvent {
	pub channel: Channel,
	pub title: String,
	pub category: String,
	pub is_online: bool,
	pub viewers: u64,
}

/// The stream went online or offline.
#[derive(Debug)]
pub struct StreamStatusEvent {
	pub channel: Channel,
	pub online: bool,
	pub video_id: i64,
}

#[derive(Debug)]
pub struct LikeCounterEvent {
	pub channel: Channel,
	pub counter: u64,
}

/// Somebody followed the channel.
#[derive(Debug)]
pub struct FollowerEvent {
	pub channel: Channel,
	pub follower: Option<WsUser>,
	pub action_time: i64,
}

#[derive(Debug)]
pub struct TokenRefreshed {
	pub access_token: SecretString,
	pub expires_at: DateTime<Utc>,
}
