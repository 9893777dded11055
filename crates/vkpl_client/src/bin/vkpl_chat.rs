#![forbid(unsafe_code)]

//! Minimal chat watcher. Connects to one or more channels and prints every
//! event; with a token it can also greet on request.
//!
//! Usage:
//!   vkpl_chat --channel <name> [--channel <name> ...] [--token <access-token>] [--ws <url>]

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vkpl_client::{AuthConfig, ChatEvent, ClientConfig, SecretString, VkplClient};
use vkpl_domain::ChannelName;

fn usage_and_exit() -> ! {
	eprintln!("usage: vkpl_chat --channel <name> [--channel <name> ...] [--token <access-token>] [--ws <url>]");
	std::process::exit(2);
}

fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,vkpl_client=debug"));
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

struct Args {
	channels: Vec<ChannelName>,
	token: Option<String>,
	ws_url: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args {
		channels: Vec::new(),
		token: None,
		ws_url: None,
	};
	let mut iter = std::env::args().skip(1);
	while let Some(arg) = iter.next() {
		match arg.as_str() {
			"--channel" => {
				let Some(value) = iter.next() else { usage_and_exit() };
				match value.parse() {
					Ok(name) => args.channels.push(name),
					Err(e) => {
						eprintln!("invalid channel name {value:?}: {e}");
						usage_and_exit();
					}
				}
			}
			"--token" => {
				let Some(value) = iter.next() else { usage_and_exit() };
				args.token = Some(value);
			}
			"--ws" => {
				let Some(value) = iter.next() else { usage_and_exit() };
				args.ws_url = Some(value);
			}
			_ => usage_and_exit(),
		}
	}
	if args.channels.is_empty() {
		usage_and_exit();
	}
	args
}

#[tokio::main]
async fn main() -> ExitCode {
	init_tracing();
	let args = parse_args();

	let auth = match args.token {
		Some(token) => AuthConfig::Token {
			access_token: SecretString::new(token),
			refresh_token: None,
			expires_at: None,
			client_id: None,
		},
		None => AuthConfig::ReadOnly,
	};
	let mut config = ClientConfig::new(args.channels, auth);
	if let Some(ws_url) = args.ws_url {
		config.ws_url = ws_url;
	}

	let (client, mut events) = match VkplClient::connect(config).await {
		Ok(connected) => connected,
		Err(e) => {
			error!(error = %e, "failed to connect");
			return ExitCode::FAILURE;
		}
	};
	info!(authenticated = client.is_authenticated(), "connected; watching chat");

	while let Some(event) = events.recv().await {
		match event {
			ChatEvent::Message(msg) => {
				let reply_marker = if msg.parent.is_some() { " (reply)" } else { "" };
				println!("[{}] {}{}: {}", msg.channel.blog_url, msg.user.user.nick, reply_marker, msg.message.text);
			}
			ChatEvent::Reward(reward) => {
				let note = reward.message.as_ref().map(|m| m.text.as_str()).unwrap_or("");
				println!(
					"[{}] * {} redeemed {:?} ({:?}) {}",
					reward.channel.blog_url, reward.user.nick, reward.reward.name, reward.status, note
				);
			}
			ChatEvent::ChannelInfo(info) => {
				println!(
					"[{}] = {} | {} | online={} viewers={}",
					info.channel.blog_url, info.title, info.category, info.is_online, info.viewers
				);
			}
			ChatEvent::StreamStatus(status) => {
				let state = if status.online { "went live" } else { "went offline" };
				println!("[{}] = stream {} (video {})", status.channel.blog_url, state, status.video_id);
			}
			ChatEvent::LikeCounter(likes) => {
				println!("[{}] = likes: {}", likes.channel.blog_url, likes.counter);
			}
			ChatEvent::Follower(follower) => {
				let nick = follower.follower.as_ref().map(|user| user.nick.as_str()).unwrap_or("someone");
				println!("[{}] + {} followed", follower.channel.blog_url, nick);
			}
			ChatEvent::TokenRefreshed(refreshed) => {
				info!(expires_at = %refreshed.expires_at, "access token rotated");
			}
			ChatEvent::Reconnected => {
				info!("reconnected and resubscribed");
			}
		}
	}

	info!("connection closed");
	ExitCode::SUCCESS
}
