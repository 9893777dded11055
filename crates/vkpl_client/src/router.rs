#![forbid(unsafe_code)]

use tracing::debug;
use vkpl_domain::{Channel, Topic};
use vkpl_protocol::{PushData, PushFrame};

/// A push frame resolved to one of the channels this client subscribed to.
#[derive(Debug)]
pub struct RoutedPush {
	pub channel: Channel,
	/// Topic kind segment (`public-chat`, `channel-info`, ...).
	pub topic: String,
	pub data: PushData,
	pub offset: u64,
}

/// Resolve a push frame's `<topic>:<channel-id>` discriminator against the
/// known channel set. Frames for channels the client never subscribed to
/// are backend noise and are dropped, as are `Unknown` payloads.
pub fn route(frame: PushFrame, channels: &[Channel]) -> Option<RoutedPush> {
	let (topic, channel_id) = match Topic::split(&frame.push.channel) {
		Ok(parts) => parts,
		Err(e) => {
			debug!(channel = %frame.push.channel, error = %e, "push with malformed topic dropped");
			return None;
		}
	};

	let Some(channel) = channels.iter().find(|channel| channel.public_ws_channel == channel_id) else {
		debug!(channel_id, "push for unsubscribed channel dropped");
		return None;
	};

	if matches!(frame.push.publication.data, PushData::Unknown) {
		debug!(topic, "push with unknown payload type dropped");
		return None;
	}

	Some(RoutedPush {
		channel: channel.clone(),
		topic: topic.to_string(),
		data: frame.push.publication.data,
		offset: frame.push.publication.offset,
	})
}
