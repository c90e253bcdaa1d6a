use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use tasknet::{certs_differ, ActionHandler, ExternalSpec, SimpleSpec, TaskContext, TaskError};

use crate::app::App;
use crate::artifacts::{ensure_dir, publish};
use crate::constants::PERFORMER_QUEUE;
use crate::db::Store;
use crate::mixnet::Mixnet;
use crate::models::{check_election_data, AuthoritySpec, Election, ElectionRequest, ElectionStatus, Session};
use crate::utils::{input_array, input_i64, input_str, is_safe_id, subprocess_error};

fn parse_authorities(input: &Value) -> Result<Vec<AuthoritySpec>, TaskError> {
	serde_json::from_value(input.get("authorities").cloned().unwrap_or(Value::Null))
		.map_err(|_| TaskError::validation("authorities"))
}

/// The authority name this node acts under, derived from the registered
/// authority whose url is our own root url.
fn self_authority_name<'a>(
	authorities: &'a [AuthoritySpec],
	root_url: &str,
) -> Result<&'a str, TaskError> {
	authorities
		.iter()
		.find(|authority| authority.orchestra_url == root_url)
		.map(|authority| authority.name.as_str())
		.ok_or_else(|| {
			TaskError::invariant("this node is not among the authorities of the election")
		})
}

/// Performer entry point of the creation protocol. Validates the
/// director's request, materializes the election locally when the request
/// comes from a foreign director, and schedules the local private-info
/// generation, optionally gated behind operator approval.
pub struct GeneratePrivateInfo {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for GeneratePrivateInfo {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let input = ctx.input().clone();
		let election_id = input_i64(&input, "id")?;
		let title = input_str(&input, "title")?.to_string();
		let description = input_str(&input, "description")?.to_string();
		let questions = input_array(&input, "questions")?.clone();
		let num_parties = input_i64(&input, "num_parties")? as u32;
		let threshold_parties = input_i64(&input, "threshold_parties")? as u32;
		let authorities = parse_authorities(&input)?;

		// Same defensive checks as the public api, minus the fields only
		// the director knows (callback url).
		let request = ElectionRequest {
			id: election_id,
			title: title.clone(),
			description: description.clone(),
			start_date: serde_json::from_value(input.get("start_date").cloned().unwrap_or(Value::Null))
				.map_err(|_| TaskError::validation("start_date"))?,
			end_date: serde_json::from_value(input.get("end_date").cloned().unwrap_or(Value::Null))
				.map_err(|_| TaskError::validation("end_date"))?,
			callback_url: "https://unused.invalid/".to_string(),
			authorities: authorities.clone(),
			questions: questions.clone(),
		};
		check_election_data(&request, self.app.settings.max_num_questions_per_election)
			.map_err(TaskError::Validation)?;

		let sessions = input_array(&input, "sessions")?.clone();
		if sessions.is_empty() {
			return Err(TaskError::invariant("no sessions provided"));
		}
		for session in &sessions {
			let id = session.get("id").and_then(Value::as_str);
			let stub = session.get("stub").and_then(Value::as_str);
			match (id, stub) {
				(Some(id), Some(_)) if is_safe_id(id) => {},
				_ => return Err(TaskError::invariant("invalid session data provided")),
			}
		}

		let auth_name =
			self_authority_name(&authorities, &self.app.settings.root_url)?.to_string();
		info!(election_id, authority = %auth_name, "generating private info");

		// Creating localProtInfo.xml is precisely this task's job; finding
		// one means the session was already processed.
		let election_dir = self.app.layout.election_private_dir(election_id);
		for session in &sessions {
			let session_id = session["id"].as_str().expect("validated above");
			let protinfo_path = self
				.app
				.layout
				.session_private_dir(election_id, session_id)
				.join("localProtInfo.xml");
			if protinfo_path.exists() {
				return Err(TaskError::invariant(format!(
					"session_id {session_id} already created"
				)));
			}
		}

		// A foreign director's request materializes the election here; on
		// the director's own node everything already exists.
		if certs_differ(ctx.sender_cert(), self.app.settings.self_cert()) {
			if election_dir.exists() {
				return Err(TaskError::invariant(format!(
					"already existing election id {election_id}"
				)));
			}
			let election = Election {
				id: election_id,
				title: title.clone(),
				description: description.clone(),
				questions: questions.clone(),
				start_date: request.start_date,
				end_date: request.end_date,
				callback_url: String::new(),
				num_parties,
				threshold_parties,
				status: ElectionStatus::Creating,
			};
			self.app
				.store
				.insert_election(&election, &authorities)
				.await
				.map_err(TaskError::storage)?;

			let mut session_rows = Vec::new();
			for (question_number, session) in sessions.iter().enumerate() {
				let session_id = session["id"].as_str().expect("validated above");
				let stub = session["stub"].as_str().expect("validated above");
				let session_dir = self.app.layout.session_private_dir(election_id, session_id);
				ensure_dir(&session_dir).map_err(TaskError::storage)?;
				tokio::fs::write(session_dir.join("stub.xml"), stub)
					.await
					.map_err(TaskError::storage)?;
				session_rows.push(Session {
					id: session_id.to_string(),
					election_id,
					question_number: question_number as i32,
					status: "default".to_string(),
					public_key: None,
				});
			}
			self.app.store.insert_sessions(&session_rows).await.map_err(TaskError::storage)?;
		}

		if !self.app.settings.autoaccept_requests {
			let voting_period = format!(
				"{} - {}",
				request.start_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
				request.end_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
			);
			ctx.add(ExternalSpec::new(
				"approve_election",
				json!({
					"Title": title,
					"Description": description,
					"Voting period": voting_period,
					"Question data": questions,
					"Authorities": authorities,
				}),
			));
		}
		ctx.add(SimpleSpec::local("generate_private_info_vfork", PERFORMER_QUEUE, json!({})));
		Ok(None)
	}
}

/// Continuation after the (optional) approval gate: run the mixnet's
/// private-info generation for every session and hand the collected
/// protocol infos back as the parent task's output.
pub struct GeneratePrivateInfoVfork {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for GeneratePrivateInfoVfork {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		if !self.app.settings.autoaccept_requests
			&& ctx.prev_output().await? != json!({ "status": "accepted" })
		{
			return Err(TaskError::NotAccepted);
		}

		let input = ctx.parent_input().await?;
		let election_id = input_i64(&input, "id")?;
		let sessions = input_array(&input, "sessions")?.clone();
		let authorities = parse_authorities(&input)?;
		let auth_name =
			self_authority_name(&authorities, &self.app.settings.root_url)?.to_string();

		let mut protinfos = Vec::new();
		for session in &sessions {
			let session_id = session
				.get("id")
				.and_then(Value::as_str)
				.ok_or_else(|| TaskError::invariant("invalid session data provided"))?;
			let session_dir = self.app.layout.session_private_dir(election_id, session_id);

			self.app
				.mixnet
				.gen_private_info(&auth_name, &session_dir)
				.await
				.map_err(subprocess_error)?;

			let protinfo = tokio::fs::read_to_string(session_dir.join("localProtInfo.xml"))
				.await
				.map_err(|e| TaskError::invariant(format!("missing localProtInfo.xml: {e}")))?;
			protinfos.push(json!(protinfo));
		}

		ctx.set_parent_output(Value::Array(protinfos));
		Ok(None)
	}
}

/// Joint key generation for one session, synchronized across all
/// authorities on the single-threaded mixnet queue. Publishes the
/// resulting public key and protocol info.
pub struct GeneratePublicKey {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for GeneratePublicKey {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let input = ctx.input().clone();
		let election_id = input_i64(&input, "election_id")?;
		let session_id = input_str(&input, "session_id")?;
		if !is_safe_id(session_id) {
			return Err(TaskError::validation("session_id"));
		}

		// Not a local task; sanity-check the filesystem state it implies.
		let session_dir = self.app.layout.session_private_dir(election_id, session_id);
		if !session_dir.exists() {
			return Err(TaskError::invariant(format!(
				"invalid session_id / election_id: {}",
				session_dir.display()
			)));
		}
		if session_dir.join("publicKey_raw").exists()
			|| session_dir.join("publicKey_json").exists()
		{
			return Err(TaskError::invariant("pubkey already created"));
		}

		// Performers other than the director still need the merged
		// protocol info on disk.
		let protinfo_path = session_dir.join("protInfo.xml");
		if !protinfo_path.exists() {
			let protinfo = input_str(&input, "protInfo_content")?;
			tokio::fs::write(&protinfo_path, protinfo).await.map_err(TaskError::storage)?;
		}

		self.app.mixnet.gen_public_key(&session_dir).await.map_err(subprocess_error)?;
		self.app.mixnet.convert_pkey_to_json(&session_dir).await.map_err(subprocess_error)?;

		let public_dir = self.app.layout.session_public_dir(election_id, session_id);
		publish(&session_dir.join("publicKey_json"), &public_dir.join("publicKey_json"))
			.map_err(TaskError::storage)?;
		publish(&protinfo_path, &public_dir.join("protInfo.xml")).map_err(TaskError::storage)?;
		Ok(None)
	}
}
