use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::hashing::NI_SHA256_PREFIX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
	Creating,
	Created,
	Tallying,
	Tallied,
	Error,
}

impl ElectionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ElectionStatus::Creating => "creating",
			ElectionStatus::Created => "created",
			ElectionStatus::Tallying => "tallying",
			ElectionStatus::Tallied => "tallied",
			ElectionStatus::Error => "error",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"creating" => Some(ElectionStatus::Creating),
			"created" => Some(ElectionStatus::Created),
			"tallying" => Some(ElectionStatus::Tallying),
			"tallied" => Some(ElectionStatus::Tallied),
			"error" => Some(ElectionStatus::Error),
			_ => None,
		}
	}
}

/// An election with one cryptographic session (and public key) per
/// question. Questions and authorities are immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
	pub id: i64,
	pub title: String,
	pub description: String,
	/// The questions as submitted; opaque to the orchestration layer.
	pub questions: Vec<Value>,
	pub start_date: Option<DateTime<Utc>>,
	pub end_date: Option<DateTime<Utc>>,
	pub callback_url: String,
	pub num_parties: u32,
	pub threshold_parties: u32,
	pub status: ElectionStatus,
}

/// A peer trusted to co-run the protocol, identified by the certificate it
/// presents and the task endpoint it listens on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authority {
	pub id: i64,
	pub election_id: i64,
	pub name: String,
	pub ssl_cert: String,
	pub orchestra_url: String,
}

/// One mixnet session per question, carrying its own key material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
	/// `"<question-index>-<uuid>"`.
	pub id: String,
	pub election_id: i64,
	pub question_number: i32,
	pub status: String,
	pub public_key: Option<String>,
}

/// A recorded per-session ciphertext digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ballot {
	pub session_id: String,
	pub ballot_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
	Election,
	Tally,
}

impl JobKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobKind::Election => "election",
			JobKind::Tally => "tally",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"election" => Some(JobKind::Election),
			"tally" => Some(JobKind::Tally),
			_ => None,
		}
	}
}

/// A row of the persistent work queue. At most one row is `doing` at any
/// moment; completed rows are deleted rather than flagged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
	pub id: i64,
	pub kind: JobKind,
	pub payload: Value,
	pub doing: bool,
	pub created_at: DateTime<Utc>,
}

// ======= Public API payloads =======

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthoritySpec {
	pub name: String,
	pub orchestra_url: String,
	pub ssl_cert: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionRequest {
	pub id: i64,
	pub title: String,
	pub description: String,
	#[serde(default)]
	pub start_date: Option<DateTime<Utc>>,
	#[serde(default)]
	pub end_date: Option<DateTime<Utc>>,
	pub callback_url: String,
	pub authorities: Vec<AuthoritySpec>,
	pub questions: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyRequest {
	pub election_id: i64,
	pub callback_url: String,
	pub votes_url: String,
	pub votes_hash: String,
}

/// Validate an election submission. Every check runs before anything is
/// written; the same function guards the public API and the performer-side
/// task input.
pub fn check_election_data(
	request: &ElectionRequest,
	max_questions: usize,
) -> Result<(), String> {
	if request.id < 1 {
		return Err("id must be positive".to_string());
	}
	if request.authorities.is_empty() {
		return Err("no authorities".to_string());
	}
	if request.questions.is_empty() || request.questions.len() > max_questions {
		return Err("unsupported number of questions in the election".to_string());
	}

	check_absolute_url(&request.callback_url, "callback_url")?;
	for authority in &request.authorities {
		check_absolute_url(&authority.orchestra_url, "orchestra_url")?;
		if authority.name.is_empty() || authority.ssl_cert.is_empty() {
			return Err("invalid authorities parameters".to_string());
		}
	}
	if !unique_by(&request.authorities, |a| &a.ssl_cert)
		|| !unique_by(&request.authorities, |a| &a.orchestra_url)
		|| !unique_by(&request.authorities, |a| &a.name)
	{
		return Err("invalid authorities parameters".to_string());
	}

	for question in &request.questions {
		check_question(question)?;
	}
	Ok(())
}

/// Every answer carries a dense 0-based id and a text, both unique within
/// the question.
fn check_question(question: &Value) -> Result<(), String> {
	let invalid = || "invalid question/answers".to_string();
	let answers = question
		.get("answers")
		.and_then(Value::as_array)
		.ok_or_else(invalid)?;

	let mut ids = HashSet::new();
	let mut texts = HashSet::new();
	for answer in answers {
		let id = answer.get("id").and_then(Value::as_i64).ok_or_else(invalid)?;
		let text = answer.get("text").and_then(Value::as_str).ok_or_else(invalid)?;
		if !ids.insert(id) || !texts.insert(text) {
			return Err(invalid());
		}
	}
	for expected in 0..answers.len() as i64 {
		if !ids.contains(&expected) {
			return Err(invalid());
		}
	}
	Ok(())
}

pub fn check_tally_data(request: &TallyRequest) -> Result<(), String> {
	if request.election_id < 1 {
		return Err("election id must be >= 1".to_string());
	}
	if !request.votes_hash.starts_with(NI_SHA256_PREFIX) {
		return Err("invalid votes_hash, must be sha256".to_string());
	}
	check_absolute_url(&request.callback_url, "callback_url")?;
	check_absolute_url(&request.votes_url, "votes_url")?;
	Ok(())
}

fn check_absolute_url(value: &str, field: &str) -> Result<(), String> {
	match url::Url::parse(value) {
		Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
		_ => Err(format!("invalid {field} parameter")),
	}
}

fn unique_by<'a, T, K: Eq + std::hash::Hash + ?Sized + 'a>(
	items: &'a [T],
	key: impl Fn(&'a T) -> &'a K,
) -> bool {
	let mut seen = HashSet::new();
	items.iter().all(|item| seen.insert(key(item)))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn request() -> ElectionRequest {
		ElectionRequest {
			id: 42,
			title: "New Directive Board".to_string(),
			description: "election description".to_string(),
			start_date: None,
			end_date: None,
			callback_url: "https://consumer.example/callback".to_string(),
			authorities: vec![
				AuthoritySpec {
					name: "Authority A".to_string(),
					orchestra_url: "https://a.example:5000/api/queues".to_string(),
					ssl_cert: "CERT-A".to_string(),
				},
				AuthoritySpec {
					name: "Authority B".to_string(),
					orchestra_url: "https://b.example:5000/api/queues".to_string(),
					ssl_cert: "CERT-B".to_string(),
				},
			],
			questions: vec![json!({
				"question": "Who should be president?",
				"answers": [
					{ "id": 0, "text": "Alice" },
					{ "id": 1, "text": "Bob" },
				],
			})],
		}
	}

	#[test]
	fn accepts_a_well_formed_election() {
		assert!(check_election_data(&request(), 40).is_ok());
	}

	#[test]
	fn rejects_non_positive_ids_and_empty_authorities() {
		let mut bad = request();
		bad.id = 0;
		assert_eq!(check_election_data(&bad, 40).unwrap_err(), "id must be positive");

		let mut bad = request();
		bad.authorities.clear();
		assert_eq!(check_election_data(&bad, 40).unwrap_err(), "no authorities");
	}

	#[test]
	fn rejects_duplicate_authority_keys() {
		let mut bad = request();
		bad.authorities[1].ssl_cert = bad.authorities[0].ssl_cert.clone();
		assert!(check_election_data(&bad, 40).is_err());

		let mut bad = request();
		bad.authorities[1].orchestra_url = bad.authorities[0].orchestra_url.clone();
		assert!(check_election_data(&bad, 40).is_err());
	}

	#[test]
	fn rejects_oversized_question_lists() {
		let mut bad = request();
		bad.questions = vec![bad.questions[0].clone(); 3];
		assert!(check_election_data(&bad, 2).is_err());
	}

	#[test]
	fn rejects_sparse_or_duplicate_answer_ids() {
		let mut bad = request();
		bad.questions = vec![json!({
			"answers": [{ "id": 0, "text": "Alice" }, { "id": 2, "text": "Bob" }],
		})];
		assert!(check_election_data(&bad, 40).is_err());

		let mut bad = request();
		bad.questions = vec![json!({
			"answers": [{ "id": 0, "text": "Alice" }, { "id": 0, "text": "Bob" }],
		})];
		assert!(check_election_data(&bad, 40).is_err());

		let mut bad = request();
		bad.questions = vec![json!({
			"answers": [{ "id": 0, "text": "Alice" }, { "id": 1, "text": "Alice" }],
		})];
		assert!(check_election_data(&bad, 40).is_err());
	}

	#[test]
	fn tally_requests_need_the_named_information_prefix() {
		let mut request = TallyRequest {
			election_id: 42,
			callback_url: "https://consumer.example/callback".to_string(),
			votes_url: "https://ballots.example/bundle".to_string(),
			votes_hash: "ni:///sha-256;ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0=".to_string(),
		};
		assert!(check_tally_data(&request).is_ok());

		request.votes_hash = "sha256:deadbeef".to_string();
		assert_eq!(
			check_tally_data(&request).unwrap_err(),
			"invalid votes_hash, must be sha256"
		);
	}
}
