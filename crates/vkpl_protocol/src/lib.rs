#![forbid(unsafe_code)]

pub mod blocks;
pub mod frames;

pub use blocks::{BLOCK_END, MessageBlock, SmileMap, deserialize, serialize};
pub use frames::{
	ChannelInfo, FramePeek, JournalData, JournalEvent, KEEPALIVE_FRAME, LikeCounter, Publication, PushData,
	PushEnvelope, PushFrame, ReplyError, ReplyFrame, Reward, RewardDemand, RewardStatus, StreamStatus, WsBadge,
	WsChatUser, WsMessage, WsParentMessage, WsRole, WsUser, connect_method, subscribe_method,
};
