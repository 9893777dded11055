#![forbid(unsafe_code)]

//! Channel session: subscribes the resolved channels on the transport,
//! replays those subscriptions after reconnects and turns routed pushes
//! into public [`ChatEvent`]s.

use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vkpl_domain::Channel;
use vkpl_protocol::frames::{JournalData, PushData};
use vkpl_protocol::{blocks, subscribe_method};

use crate::api::{ChannelHandle, VkplApi};
use crate::events::{
	ChannelInfoEvent, ChatEvent, FollowerEvent, LikeCounterEvent, MessageEvent, ParentMessage, RewardEvent,
	StreamStatusEvent,
};
use crate::router::{self, RoutedPush};
use crate::transport::{Socket, TokenProvider, TransportEvent};

pub struct ChannelSession {
	channels: Arc<Vec<Channel>>,
	socket: Socket,
	api: Arc<VkplApi>,
	tokens: Arc<dyn TokenProvider>,
	authenticated: bool,
	events_tx: mpsc::Sender<ChatEvent>,
}

impl ChannelSession {
	pub fn new(
		channels: Arc<Vec<Channel>>,
		socket: Socket,
		api: Arc<VkplApi>,
		tokens: Arc<dyn TokenProvider>,
		events_tx: mpsc::Sender<ChatEvent>,
	) -> Self {
		let authenticated = api.is_authenticated();
		Self {
			channels,
			socket,
			api,
			tokens,
			authenticated,
			events_tx,
		}
	}

	/// Subscribe every channel's topics. A channel that fails to subscribe
	/// is logged and skipped so one broken channel cannot take down the
	/// rest of the session.
	pub async fn subscribe_all(&self) {
		for channel in self.channels.iter() {
			if let Err(e) = self.subscribe_channel(channel).await {
				warn!(channel = %channel.blog_url, error = %e, "channel subscription failed");
			}
		}
	}

	async fn subscribe_channel(&self, channel: &Channel) -> anyhow::Result<()> {
		self.subscribe_topic(&channel.chat_topic(), None).await?;
		self.subscribe_topic(&channel.info_topic(), None).await?;

		// The reward management topic is scoped; the backend hands out a
		// per-channel token only to authenticated clients.
		if self.authenticated {
			let topic = channel.rewards_topic();
			let tokens = self
				.tokens
				.subscription_tokens(std::slice::from_ref(&topic))
				.await
				.context("fetching reward topic token")?;
			match tokens.into_iter().find(|entry| entry.channel == topic) {
				Some(entry) => self.subscribe_topic(&topic, Some(&entry.token)).await?,
				None => warn!(topic, "no subscription token issued; skipping reward topic"),
			}
		}
		Ok(())
	}

	async fn subscribe_topic(&self, topic: &str, token: Option<&str>) -> anyhow::Result<()> {
		let reply = self
			.socket
			.invoke(subscribe_method(topic, token))
			.await
			.with_context(|| format!("subscribing to {topic}"))?;
		if let Some(error) = reply.get("error") {
			bail!("subscribe to {topic} rejected: {error}");
		}
		debug!(topic, "subscribed");
		Ok(())
	}

	/// Consume transport events until the connection closes cleanly.
	pub async fn run(self, mut transport_events: mpsc::UnboundedReceiver<TransportEvent>) {
		while let Some(event) = transport_events.recv().await {
			match event {
				TransportEvent::Reconnected => {
					// Server-side subscription state died with the old
					// connection; replay before telling the consumer.
					self.subscribe_all().await;
					info!("subscriptions replayed after reconnect");
					if self.events_tx.send(ChatEvent::Reconnected).await.is_err() {
						return;
					}
				}
				TransportEvent::Push(frame) => {
					let Some(routed) = router::route(frame, &self.channels) else {
						continue;
					};
					if let Some(event) = self.map_push(routed)
						&& self.events_tx.send(event).await.is_err()
					{
						return;
					}
				}
				TransportEvent::Closed => {
					debug!("transport closed; session ending");
					return;
				}
			}
		}
	}

	fn map_push(&self, routed: RoutedPush) -> Option<ChatEvent> {
		let RoutedPush { channel, data, .. } = routed;
		let handle = ChannelHandle::new(self.api.clone(), channel.clone());

		match data {
			PushData::Message { data } => {
				let message = blocks::deserialize(&data.data);
				let parent = data.parent.as_ref().map(|parent| ParentMessage {
					id: parent.id,
					user: parent.author.clone(),
					message: blocks::deserialize(&parent.data),
					is_private: parent.is_private,
				});
				Some(ChatEvent::Message(MessageEvent::new(channel, data, message, parent, handle)))
			}
			PushData::RewardDemand { data } => {
				let message = if data.activation_message.is_empty() {
					None
				} else {
					Some(blocks::deserialize(&data.activation_message))
				};
				Some(ChatEvent::Reward(RewardEvent::new(
					channel,
					data.reward,
					data.user,
					data.status,
					message,
					data.demand_id,
					data.created_at,
					handle,
				)))
			}
			PushData::ChannelInfo(info) => Some(ChatEvent::ChannelInfo(ChannelInfoEvent {
				channel,
				title: info.title,
				category: info.category.title,
				is_online: info.is_online,
				viewers: info.viewers,
			})),
			PushData::StreamStart(status) => Some(ChatEvent::StreamStatus(StreamStatusEvent {
				channel,
				online: true,
				video_id: status.video_id,
			})),
			PushData::StreamEnd(status) => Some(ChatEvent::StreamStatus(StreamStatusEvent {
				channel,
				online: false,
				video_id: status.video_id,
			})),
			PushData::LikeCounter(likes) => Some(ChatEvent::LikeCounter(LikeCounterEvent {
				channel,
				counter: likes.counter,
			})),
			PushData::Journal { data } => match data {
				JournalData::Follower(event) => Some(ChatEvent::Follower(FollowerEvent {
					channel,
					follower: event.follower,
					action_time: event.action_time,
				})),
				// Reward demands arrive on their own topic already.
				JournalData::RewardDemand(_) | JournalData::Unknown => None,
			},
			PushData::Unknown => None,
		}
	}
}
