#![forbid(unsafe_code)]

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

/// Request/response multiplexer for method calls on the pub/sub socket.
///
/// Ids start at 1, grow monotonically and are never reused. There is no
/// timeout: an entry whose reply never arrives (connection dropped
/// mid-flight) stays pending forever, including across reconnects.
/// Callers needing bounded latency wrap the call externally.
#[derive(Debug, Default)]
pub struct RpcCorrelator {
	next_id: u64,
	pending: HashMap<u64, oneshot::Sender<Value>>,
}

impl RpcCorrelator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Assign the next id, write it into the payload and register the
	/// reply sender under it.
	pub fn register(&mut self, payload: &mut Value, resp: oneshot::Sender<Value>) -> u64 {
		self.next_id += 1;
		let id = self.next_id;
		if let Some(object) = payload.as_object_mut() {
			object.insert("id".to_string(), Value::from(id));
		}
		self.pending.insert(id, resp);
		id
	}

	/// Resolve the pending call matching the frame's `id`, if any.
	/// Returns whether the frame was consumed; frames with a stale or
	/// foreign id are logged and left to the caller.
	pub fn resolve(&mut self, frame: &Value) -> bool {
		let Some(id) = frame.get("id").and_then(Value::as_u64) else {
			return false;
		};
		let Some(resp) = self.pending.remove(&id) else {
			debug!(id, "reply for unknown call id");
			return false;
		};
		// The caller may have given up on the call; that is its business.
		let _ = resp.send(frame.clone());
		true
	}

	pub fn pending_calls(&self) -> usize {
		self.pending.len()
	}
}
