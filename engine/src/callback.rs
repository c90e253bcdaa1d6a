use serde_json::{json, Value};
use tracing::{info, warn};

use tasknet::Transport;

/// Sends protocol outcomes to the consumer's callback url. Failures are
/// logged and not retried; the consumer reissues its request if it never
/// hears back.
#[derive(Clone)]
pub struct CallbackClient {
	transport: Transport,
}

impl CallbackClient {
	pub fn new(transport: Transport) -> Self {
		Self { transport }
	}

	pub async fn post(&self, callback_url: &str, body: Value) {
		info!(callback_url, "posting callback");
		if let Err(error) = self.transport.post_json(callback_url, &body).await {
			warn!(callback_url, "callback delivery failed: {error}");
		}
	}
}

pub fn election_finished(election_id: i64, session_data: Value) -> Value {
	json!({
		"status": "finished",
		"reference": { "election_id": election_id, "action": "POST /election" },
		"session_data": session_data,
	})
}

pub fn election_error(election_id: i64, message: &str) -> Value {
	json!({
		"status": "error",
		"reference": { "election_id": election_id, "action": "POST /election" },
		"data": { "message": message },
	})
}

pub fn tally_finished(election_id: i64, tally_url: &str, tally_hash: &str) -> Value {
	json!({
		"status": "finished",
		"reference": { "election_id": election_id, "action": "POST /tally" },
		"data": { "tally_url": tally_url, "tally_hash": tally_hash },
	})
}

pub fn tally_error(election_id: i64, message: &str) -> Value {
	json!({
		"status": "error",
		"reference": { "election_id": election_id, "action": "POST /tally" },
		"data": { "message": message },
	})
}
