#![forbid(unsafe_code)]

//! Rich-text message codec.
//!
//! Outbound chat messages are an ordered sequence of typed blocks. Plain
//! text rides inside `text` blocks whose `content` is a JSON-encoded
//! `[fragment, "unstyled", []]` triple; emotes, mentions and links are
//! their own block types, with zero-content `BLOCK_END` text blocks as
//! boundary markers around emotes and mentions.
//!
//! Markdown-style `[label](url)` spans are protected from word-splitting
//! by positional `__markdownLink+<n>__` placeholders. A message that
//! literally contains such a placeholder string will be misparsed; that
//! collision is accepted rather than hardened.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use vkpl_domain::{Link, Mention, ParsedMessage, Smile};

/// Modificator value of a boundary-marker text block.
pub const BLOCK_END: &str = "BLOCK_END";

const PLACEHOLDER_PREFIX: &str = "__markdownLink+";
const PLACEHOLDER_SUFFIX: &str = "__";

/// One token of a rich chat message. Block types added by the backend
/// later decode to `Unknown` and are skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBlock {
	Text {
		#[serde(default)]
		content: String,
		#[serde(default)]
		modificator: String,
	},
	Smile {
		id: String,
		name: String,
	},
	Mention {
		id: i64,
		#[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
		display_name: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		name: Option<String>,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		nick: Option<String>,
	},
	Link {
		explicit: bool,
		#[serde(default)]
		content: String,
		url: String,
	},
	#[serde(other)]
	Unknown,
}

impl MessageBlock {
	/// Boundary marker emitted around emote and mention blocks.
	pub fn block_end() -> Self {
		MessageBlock::Text {
			content: String::new(),
			modificator: BLOCK_END.to_string(),
		}
	}

	pub fn is_block_end(&self) -> bool {
		matches!(self, MessageBlock::Text { modificator, .. } if modificator == BLOCK_END)
	}
}

/// Emote display name -> emote id, as granted to the sending account.
#[derive(Debug, Clone, Default)]
pub struct SmileMap(HashMap<String, String>);

impl SmileMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, name: impl Into<String>, id: impl Into<String>) {
		self.0.insert(name.into(), id.into());
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.0.get(name).map(String::as_str)
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

impl FromIterator<(String, String)> for SmileMap {
	fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

fn markdown_link_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("literal regex"))
}

/// JSON-encode a text fragment into the `[fragment, "unstyled", []]`
/// triple the backend expects.
fn encode_content(fragment: &str) -> String {
	json!([fragment, "unstyled", []]).to_string()
}

/// Decode a content triple back to its text fragment. Empty or malformed
/// content contributes nothing.
fn decode_content(content: &str) -> Option<String> {
	if content.is_empty() {
		return None;
	}
	let value: serde_json::Value = serde_json::from_str(content).ok()?;
	value.get(0)?.as_str().map(str::to_owned)
}

/// Replace every `[label](url)` span with a positional placeholder so
/// word-splitting cannot tear the span apart. Returns the substituted
/// text plus the captured `(label, url)` pairs in match order.
fn replace_markdown_links(message: &str) -> (String, Vec<(String, String)>) {
	let re = markdown_link_re();
	let links: Vec<(String, String)> = re
		.captures_iter(message)
		.map(|captures| (captures[1].to_string(), captures[2].to_string()))
		.collect();
	if links.is_empty() {
		return (message.to_string(), links);
	}

	let mut index = 0usize;
	let replaced = re
		.replace_all(message, |_: &regex::Captures<'_>| {
			let token = format!("{PLACEHOLDER_PREFIX}{index}{PLACEHOLDER_SUFFIX}");
			index += 1;
			token
		})
		.into_owned();
	(replaced, links)
}

fn placeholder_index(word: &str) -> Option<usize> {
	word.strip_prefix(PLACEHOLDER_PREFIX)?.strip_suffix(PLACEHOLDER_SUFFIX)?.parse().ok()
}

fn text_block(fragment: &str) -> MessageBlock {
	MessageBlock::Text {
		content: encode_content(fragment),
		modificator: String::new(),
	}
}

fn flush_text(blocks: &mut Vec<MessageBlock>, stack: &mut String) {
	if stack.is_empty() {
		return;
	}
	blocks.push(text_block(stack));
	stack.clear();
}

fn push_smile(blocks: &mut Vec<MessageBlock>, id: &str, name: &str) {
	blocks.push(MessageBlock::block_end());
	blocks.push(MessageBlock::Smile {
		id: id.to_string(),
		name: name.to_string(),
	});
	blocks.push(MessageBlock::block_end());
}

fn push_mention(blocks: &mut Vec<MessageBlock>, user_id: i64) {
	blocks.push(MessageBlock::block_end());
	blocks.push(MessageBlock::Mention {
		id: user_id,
		display_name: None,
		name: None,
		nick: None,
	});
	blocks.push(MessageBlock::block_end());
}

/// Link block plus the single-space text fragment that follows every link.
fn push_link(blocks: &mut Vec<MessageBlock>, url: &str, shown: &str) {
	blocks.push(MessageBlock::Link {
		explicit: false,
		content: encode_content(shown),
		url: url.to_string(),
	});
	blocks.push(text_block(" "));
}

/// Serialize a human-authored message into its block sequence.
///
/// Mentions are prepended in the given order, each flanked by boundary
/// markers. The text is then scanned word by word (split on single
/// spaces): known emote names become `smile` blocks, bare `http(s)://`
/// words and markdown links become `link` blocks, everything else
/// accumulates into `text` blocks.
pub fn serialize(text: &str, mention_ids: &[i64], smiles: &SmileMap) -> Vec<MessageBlock> {
	let mut blocks = Vec::new();
	for &user_id in mention_ids {
		push_mention(&mut blocks, user_id);
	}

	let (stripped, links) = replace_markdown_links(text);
	let mut text_stack = String::new();

	for word in stripped.split(' ') {
		if let Some(id) = smiles.get(word) {
			flush_text(&mut blocks, &mut text_stack);
			push_smile(&mut blocks, id, word);
		} else if word.starts_with("https://") || word.starts_with("http://") {
			flush_text(&mut blocks, &mut text_stack);
			push_link(&mut blocks, word, word);
		} else if word.starts_with(PLACEHOLDER_PREFIX) && word.ends_with(PLACEHOLDER_SUFFIX) {
			// A placeholder with a mangled index is dropped outright.
			let Some((label, url)) = placeholder_index(word).and_then(|index| links.get(index)) else {
				continue;
			};
			flush_text(&mut blocks, &mut text_stack);
			if url.is_empty() {
				continue;
			}
			let shown = if label.is_empty() { url } else { label };
			push_link(&mut blocks, url, shown);
		} else {
			text_stack.push_str(word);
			text_stack.push(' ');
		}
	}

	flush_text(&mut blocks, &mut text_stack);
	blocks
}

/// Fold a block sequence into a [`ParsedMessage`]. Single forward pass;
/// no block looks at its neighbors.
///
/// `Link::text` keeps the raw JSON-encoded content triple as received,
/// matching the long-standing output shape; the decoded fragment is
/// available as `Link::label`.
pub fn deserialize(blocks: &[MessageBlock]) -> ParsedMessage {
	let mut message = ParsedMessage::default();

	for block in blocks {
		match block {
			MessageBlock::Mention {
				id,
				display_name,
				name,
				nick,
			} => {
				message.mentions.push(Mention {
					user_id: *id,
					name: name.clone(),
					display_name: display_name.clone(),
					nick: nick.clone(),
				});
				if let Some(display_name) = display_name
					&& !display_name.is_empty()
				{
					append_fragment(&mut message.text, display_name);
				}
			}
			MessageBlock::Text { content, .. } => {
				append_fragment(&mut message.text, &decode_content(content).unwrap_or_default());
			}
			MessageBlock::Smile { id, name } => {
				message.smiles.push(Smile {
					id: id.clone(),
					name: name.clone(),
				});
				append_fragment(&mut message.text, name);
			}
			MessageBlock::Link { content, url, .. } => {
				let label = decode_content(content).unwrap_or_default();
				message.links.push(Link {
					text: content.clone(),
					url: url.clone(),
					label: label.clone(),
				});
				append_fragment(&mut message.text, &label);
			}
			MessageBlock::Unknown => {}
		}
	}

	message.text = message.text.trim().to_string();
	message
}

/// Trim-then-append with a single joining space. Fragments keep their own
/// trailing spaces until the next append or the final trim normalizes them.
fn append_fragment(text: &mut String, fragment: &str) {
	let trimmed = text.trim();
	*text = format!("{trimmed} {fragment}");
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn content_triple_roundtrip() {
		let encoded = encode_content("hi ");
		assert_eq!(encoded, r#"["hi ","unstyled",[]]"#);
		assert_eq!(decode_content(&encoded).as_deref(), Some("hi "));
		assert_eq!(decode_content(""), None);
		assert_eq!(decode_content("not json"), None);
	}

	#[test]
	fn block_end_shape() {
		let json = serde_json::to_value(MessageBlock::block_end()).unwrap();
		assert_eq!(json, serde_json::json!({ "type": "text", "content": "", "modificator": "BLOCK_END" }));
	}

	#[test]
	fn placeholder_substitution_indexes_in_match_order() {
		let (replaced, links) = replace_markdown_links("[a](u1) mid [b](u2)");
		assert_eq!(replaced, "__markdownLink+0__ mid __markdownLink+1__");
		assert_eq!(links, vec![("a".into(), "u1".into()), ("b".into(), "u2".into())]);
	}

	#[test]
	fn unknown_block_type_is_skipped() {
		let blocks: Vec<MessageBlock> =
			serde_json::from_str(r#"[{"type":"avatar","url":"x"},{"type":"text","content":"[\"ok\",\"unstyled\",[]]","modificator":""}]"#)
				.unwrap();
		assert!(matches!(blocks[0], MessageBlock::Unknown));
		let parsed = deserialize(&blocks);
		assert_eq!(parsed.text, "ok");
	}
}
