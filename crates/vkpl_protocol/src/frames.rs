#![forbid(unsafe_code)]

use serde::Deserialize;
use serde_json::{Value, json};

use crate::blocks::MessageBlock;

/// Keepalive frame, sent by the backend and echoed back verbatim.
pub const KEEPALIVE_FRAME: &str = "{}";

/// Build a `connect` method payload. The correlator injects the `id`
/// before the payload is written to the wire.
pub fn connect_method(token: &str, client_name: &str) -> Value {
	json!({ "connect": { "token": token, "name": client_name } })
}

/// Build a `subscribe` method payload for a pub/sub topic. Scoped topics
/// (reward management) carry a per-channel token.
pub fn subscribe_method(channel: &str, token: Option<&str>) -> Value {
	match token {
		Some(token) => json!({ "subscribe": { "channel": channel, "token": token } }),
		None => json!({ "subscribe": { "channel": channel } }),
	}
}

/// Cheap peek at an inbound frame: anything carrying an `id` is a method
/// reply, everything else is push traffic or keepalive.
#[derive(Debug, Deserialize)]
pub struct FramePeek {
	#[serde(default)]
	pub id: Option<u64>,
}

/// Method reply as delivered to callers. `result` is left opaque; the
/// correlator never inspects it.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyFrame {
	pub id: u64,
	#[serde(default)]
	pub result: Value,
	#[serde(default)]
	pub error: Option<ReplyError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplyError {
	#[serde(default)]
	pub code: u64,
	#[serde(default)]
	pub message: String,
}

/// Unsolicited server-to-client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct PushFrame {
	pub push: PushEnvelope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushEnvelope {
	/// Topic string of the form `<topic>:<channel-id>`.
	pub channel: String,
	#[serde(rename = "pub")]
	pub publication: Publication,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Publication {
	pub data: PushData,
	#[serde(default)]
	pub offset: u64,
}

/// Push payload union, discriminated by the `type` field. Unrecognized
/// discriminators decode to `Unknown` instead of failing the frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum PushData {
	#[serde(rename = "message")]
	Message { data: WsMessage },
	#[serde(rename = "cp_reward_demand")]
	RewardDemand { data: RewardDemand },
	#[serde(rename = "stream_online_status")]
	ChannelInfo(ChannelInfo),
	#[serde(rename = "stream_start")]
	StreamStart(StreamStatus),
	#[serde(rename = "stream_end")]
	StreamEnd(StreamStatus),
	#[serde(rename = "stream_like_counter")]
	LikeCounter(LikeCounter),
	#[serde(rename = "actions_journal_new_event")]
	Journal { data: JournalData },
	#[serde(other)]
	Unknown,
}

/// A chat message as published on a `public-chat` topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsMessage {
	pub id: i64,
	pub author: WsChatUser,
	#[serde(default)]
	pub user: Option<WsChatUser>,
	#[serde(default)]
	pub created_at: i64,
	#[serde(default)]
	pub data: Vec<MessageBlock>,
	#[serde(default)]
	pub is_private: bool,
	#[serde(default)]
	pub parent: Option<WsParentMessage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsParentMessage {
	pub id: i64,
	pub author: WsChatUser,
	#[serde(default)]
	pub created_at: i64,
	#[serde(default)]
	pub data: Vec<MessageBlock>,
	#[serde(default)]
	pub is_private: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsUser {
	pub id: i64,
	#[serde(default)]
	pub nick: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub display_name: String,
	#[serde(default)]
	pub nick_color: i64,
	#[serde(default)]
	pub has_avatar: bool,
	#[serde(default)]
	pub avatar_url: String,
	#[serde(default)]
	pub is_verified_streamer: bool,
}

/// Chat-scoped user: base profile plus per-channel badges and roles.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsChatUser {
	#[serde(flatten)]
	pub user: WsUser,
	#[serde(default)]
	pub badges: Vec<WsBadge>,
	#[serde(default)]
	pub roles: Vec<WsRole>,
	#[serde(default)]
	pub created_at: i64,
	#[serde(default)]
	pub is_owner: bool,
	#[serde(default)]
	pub is_chat_moderator: bool,
	#[serde(default)]
	pub is_channel_moderator: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsBadge {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub small_url: String,
	#[serde(default)]
	pub medium_url: String,
	#[serde(default)]
	pub large_url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsRole {
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub priority: i64,
	#[serde(default)]
	pub small_url: String,
	#[serde(default)]
	pub medium_url: String,
	#[serde(default)]
	pub large_url: String,
}

/// A channel-point reward definition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
	pub id: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub price: i64,
	#[serde(default)]
	pub bgcolor: i64,
	#[serde(default)]
	pub is_autoapproved: bool,
	#[serde(default)]
	pub is_disabled: bool,
	#[serde(default)]
	pub is_text_required: bool,
	#[serde(default)]
	pub is_hidden_text: bool,
	#[serde(default)]
	pub is_unlimited: bool,
	#[serde(default)]
	pub small_url: String,
	#[serde(default)]
	pub medium_url: String,
	#[serde(default)]
	pub large_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RewardStatus {
	Pending,
	Approved,
	Rejected,
	#[default]
	#[serde(other)]
	Unknown,
}

/// A viewer redeeming a channel-point reward.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardDemand {
	pub reward: Reward,
	pub user: WsUser,
	#[serde(default)]
	pub demand_id: i64,
	#[serde(default)]
	pub created_at: i64,
	#[serde(default)]
	pub activation_message: Vec<MessageBlock>,
	#[serde(default)]
	pub status: RewardStatus,
}

/// Channel info update published on a `channel-info` topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelInfo {
	#[serde(default)]
	pub blog_url: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub category: ChannelCategory,
	#[serde(default)]
	pub is_online: bool,
	#[serde(default)]
	pub viewers: u64,
	#[serde(default)]
	pub stream_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelCategory {
	#[serde(default)]
	pub title: String,
}

/// Stream start/stop marker; the direction comes from the enclosing
/// `PushData` variant.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
	#[serde(default)]
	pub video_id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LikeCounter {
	#[serde(default)]
	pub counter: u64,
}

/// Nested journal payload. The outer frame only says "journal event";
/// the interesting discriminator sits one level down and uses snake_case
/// keys unlike the rest of the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum JournalData {
	#[serde(rename = "actions_journal_follower")]
	Follower(JournalEvent),
	#[serde(rename = "reward_demand")]
	RewardDemand(JournalEvent),
	#[serde(other)]
	Unknown,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JournalEvent {
	#[serde(default)]
	pub action_time: i64,
	#[serde(default)]
	pub follower: Option<WsUser>,
	#[serde(default)]
	pub reward_demand: Option<RewardDemand>,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn mk_user_json(id: i64, nick: &str) -> serde_json::Value {
		json!({
			"id": id,
			"nick": nick,
			"name": nick,
			"displayName": nick,
			"nickColor": 3,
			"hasAvatar": false,
			"avatarUrl": "",
			"isVerifiedStreamer": false,
			"badges": [],
			"roles": [],
			"createdAt": 1700000000,
			"isOwner": false,
			"isChatModerator": false,
			"isChannelModerator": false,
		})
	}

	#[test]
	fn peek_distinguishes_replies_from_pushes() {
		let reply: FramePeek = serde_json::from_str(r#"{"id":3,"result":{}}"#).unwrap();
		assert_eq!(reply.id, Some(3));

		let push: FramePeek = serde_json::from_str(r#"{"push":{"channel":"x:y","pub":{"data":{"type":"nope"}}}}"#).unwrap();
		assert_eq!(push.id, None);
	}

	#[test]
	fn decodes_chat_message_push() {
		let frame = json!({
			"push": {
				"channel": "public-chat:chan1",
				"pub": {
					"data": {
						"type": "message",
						"data": {
							"id": 42,
							"author": mk_user_json(7, "tester"),
							"user": mk_user_json(7, "tester"),
							"createdAt": 1700000001,
							"isPrivate": false,
							"data": [
								{ "type": "text", "content": "[\"hello \",\"unstyled\",[]]", "modificator": "" }
							],
						},
					},
					"offset": 12,
				},
			},
		});

		let frame: PushFrame = serde_json::from_value(frame).unwrap();
		assert_eq!(frame.push.channel, "public-chat:chan1");
		assert_eq!(frame.push.publication.offset, 12);
		let PushData::Message { data } = frame.push.publication.data else {
			panic!("expected chat message push");
		};
		assert_eq!(data.id, 42);
		assert_eq!(data.author.user.nick, "tester");
		assert_eq!(data.data.len(), 1);
	}

	#[test]
	fn unknown_push_type_decodes_to_unknown() {
		let data: PushData = serde_json::from_value(json!({ "type": "some_future_event", "data": {} })).unwrap();
		assert!(matches!(data, PushData::Unknown));
	}

	#[test]
	fn decodes_stream_markers_and_info() {
		let start: PushData = serde_json::from_value(json!({ "type": "stream_start", "videoId": 9 })).unwrap();
		let PushData::StreamStart(status) = start else {
			panic!("expected stream_start");
		};
		assert_eq!(status.video_id, 9);

		let info: PushData = serde_json::from_value(json!({
			"type": "stream_online_status",
			"blogUrl": "demo",
			"title": "Playing something",
			"category": { "title": "IRL" },
			"isOnline": true,
			"viewers": 120,
			"streamId": "s-1",
		}))
		.unwrap();
		let PushData::ChannelInfo(info) = info else {
			panic!("expected channel info");
		};
		assert!(info.is_online);
		assert_eq!(info.viewers, 120);
		assert_eq!(info.category.title, "IRL");
	}

	#[test]
	fn decodes_nested_journal_follower() {
		let data: PushData = serde_json::from_value(json!({
			"type": "actions_journal_new_event",
			"data": {
				"type": "actions_journal_follower",
				"action_time": 1700000002,
				"follower": { "id": 11, "nick": "newfan" },
			},
		}))
		.unwrap();
		let PushData::Journal { data: JournalData::Follower(event) } = data else {
			panic!("expected follower journal event");
		};
		assert_eq!(event.follower.unwrap().id, 11);

		let other: JournalData = serde_json::from_value(json!({ "type": "something_else" })).unwrap();
		assert!(matches!(other, JournalData::Unknown));
	}

	#[test]
	fn reward_status_tolerates_new_values() {
		let status: RewardStatus = serde_json::from_value(json!("approved")).unwrap();
		assert_eq!(status, RewardStatus::Approved);
		let status: RewardStatus = serde_json::from_value(json!("half-approved")).unwrap();
		assert_eq!(status, RewardStatus::Unknown);
	}

	#[test]
	fn method_payloads_have_no_id_until_correlated() {
		let connect = connect_method("tok", "js");
		assert_eq!(connect["connect"]["token"], "tok");
		assert_eq!(connect["connect"]["name"], "js");
		assert!(connect.get("id").is_none());

		let plain = subscribe_method("public-chat:abc", None);
		assert!(plain["subscribe"].get("token").is_none());
		let scoped = subscribe_method("channel-info-manage:abc", Some("st"));
		assert_eq!(scoped["subscribe"]["token"], "st");
	}
}
