use async_trait::async_trait;
use serde_json::{json, Value};
use std::{fs, sync::Arc};
use tracing::{info, warn};

use tasknet::{certs_differ, ActionHandler, ExternalSpec, SimpleSpec, TaskContext, TaskError};

use crate::app::App;
use crate::constants::{PERFORMER_QUEUE, VERIFY_SUCCESS_MARKER};
use crate::db::Store;
use crate::hashing::{constant_time_eq, hash_file, ni_sha256_digest};
use crate::mixnet::Mixnet;
use crate::models::{check_tally_data, Authority, TallyRequest};
use crate::tally::{split_ciphertexts, write_tally_archive};
use crate::utils::{input_i64, input_str, input_string_list, is_safe_id, subprocess_error};

/// The director of a tally must be one of the election's registered
/// authorities, proven by the certificate the task was sent under.
fn check_sender_is_authority(
	authorities: &[Authority],
	sender_cert: &str,
	action: &str,
) -> Result<(), TaskError> {
	if authorities.iter().any(|authority| !certs_differ(&authority.ssl_cert, sender_cert)) {
		Ok(())
	} else {
		Err(TaskError::Authorization(format!("{action} task sent by an invalid authority")))
	}
}

/// Review a requested tally: validate the request, clear previous mix
/// state, download the ciphertext bundle, verify its hash in constant
/// time, split it per question and convert each session's share to the
/// mixnet's raw format. May suspend on operator approval.
pub struct ReviewTally {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for ReviewTally {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let request: TallyRequest = serde_json::from_value(ctx.input().clone())
			.map_err(|_| TaskError::validation("tally request"))?;
		check_tally_data(&request).map_err(TaskError::Validation)?;
		let election_id = request.election_id;

		let election = self
			.app
			.store
			.election(election_id)
			.await
			.map_err(TaskError::storage)?
			.ok_or_else(|| TaskError::invariant("election not created"))?;
		let authorities =
			self.app.store.authorities(election_id).await.map_err(TaskError::storage)?;
		check_sender_is_authority(&authorities, ctx.sender_cert(), "review tally")?;

		let tally_path = self.app.layout.tally_archive_path(election_id);
		if !self.app.settings.enable_multiple_tallies && tally_path.exists() {
			return Err(TaskError::invariant("election already tallied"));
		}

		// Clear leftovers of any previous tally attempt before touching
		// new data.
		let sessions = self.app.store.sessions(election_id).await.map_err(TaskError::storage)?;
		let mut pubkeys = Vec::new();
		for session in &sessions {
			let session_dir = self.app.layout.session_private_dir(election_id, &session.id);
			if !session_dir.join("protInfo.xml").exists()
				|| !session_dir.join("publicKey_raw").exists()
			{
				return Err(TaskError::invariant("election not created"));
			}
			for leftover in ["ciphertexts_json", "ciphertexts_raw"] {
				let path = session_dir.join(leftover);
				if path.exists() {
					fs::remove_file(&path).map_err(TaskError::storage)?;
				}
			}
			let pubkey = fs::read_to_string(session_dir.join("publicKey_json"))
				.map_err(|e| TaskError::invariant(format!("missing publicKey_json: {e}")))?;
			pubkeys.push(
				serde_json::from_str::<Value>(&pubkey)
					.map_err(|e| TaskError::invariant(format!("publicKey_json is not json: {e}")))?,
			);
			self.app.mixnet.reset(&session_dir).await.map_err(subprocess_error)?;
		}
		let approved_path = self.app.layout.tally_approved_path(election_id);
		if approved_path.exists() {
			fs::remove_file(&approved_path).map_err(TaskError::storage)?;
		}

		// Stream the ciphertext bundle to disk and authenticate it.
		let election_dir = self.app.layout.election_private_dir(election_id);
		let bundle_path = election_dir.join("ciphertexts_json");
		self.app
			.engine
			.transport()
			.download_to_file(&request.votes_url, &bundle_path)
			.await?;
		let declared = ni_sha256_digest(&request.votes_hash)
			.ok_or_else(|| TaskError::validation("votes_hash"))?;
		let actual = hash_file(&bundle_path).map_err(TaskError::storage)?;
		if !constant_time_eq(declared, &actual) {
			return Err(TaskError::HashMismatch("invalid votes_hash".to_string()));
		}

		fs::write(
			election_dir.join("pubkeys_json"),
			crate::utils::canonical_pretty(&Value::Array(pubkeys)),
		)
		.map_err(TaskError::storage)?;

		let session_outputs: Vec<_> = sessions
			.iter()
			.map(|session| {
				self.app
					.layout
					.session_private_dir(election_id, &session.id)
					.join("ciphertexts_json")
			})
			.collect();
		let ballots = split_ciphertexts(&bundle_path, &session_outputs)?;
		info!(election_id, ballots, "ciphertext bundle split per question");
		// Ballots rejected before decryption would be counted here; the
		// bundle is already pre-validated upstream.
		fs::write(election_dir.join("invalid_votes"), "0").map_err(TaskError::storage)?;

		for session in &sessions {
			let session_dir = self.app.layout.session_private_dir(election_id, &session.id);
			self.app
				.mixnet
				.convert_ciphertexts_to_raw(&session_dir)
				.await
				.map_err(subprocess_error)?;
		}

		if !self.app.settings.autoaccept_requests {
			let voting_period = format!(
				"{} - {}",
				election.start_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
				election.end_date.map(|d| d.to_rfc3339()).unwrap_or_default(),
			);
			ctx.add(ExternalSpec::new(
				"approve_election_tally",
				json!({
					"Title": election.title,
					"Description": election.description,
					"Voting period": voting_period,
					"Question data": election.questions,
					"Authorities": authorities,
				}),
			));
			ctx.add(SimpleSpec::local(
				"check_tally_approval",
				PERFORMER_QUEUE,
				json!({ "election_id": election_id }),
			));
		}
		Ok(None)
	}
}

/// Records the operator's approval as a sentinel file the mix steps check
/// for; a rejection fails the tally here.
pub struct CheckTallyApproval {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for CheckTallyApproval {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		if ctx.prev_output().await? != json!({ "status": "accepted" }) {
			return Err(TaskError::NotAccepted);
		}
		let election_id = input_i64(ctx.input(), "election_id")?;
		fs::File::create(self.app.layout.tally_approved_path(election_id))
			.map_err(TaskError::storage)?;
		Ok(None)
	}
}

/// Run the mix for one session. Requires the approval sentinel when the
/// node does not autoaccept; a failed mix removes the sentinel and resets
/// the session so a later tally starts clean.
pub struct PerformTally {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for PerformTally {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let election_id = input_i64(ctx.input(), "election_id")?;
		let session_id = input_str(ctx.input(), "session_id")?;
		if election_id < 1 {
			return Err(TaskError::validation("election_id"));
		}
		if !is_safe_id(session_id) {
			return Err(TaskError::validation("session_id"));
		}

		let authorities =
			self.app.store.authorities(election_id).await.map_err(TaskError::storage)?;
		if self.app.store.election(election_id).await.map_err(TaskError::storage)?.is_none() {
			return Err(TaskError::invariant("election not found"));
		}
		check_sender_is_authority(&authorities, ctx.sender_cert(), "perform tally")?;

		if !self.app.settings.autoaccept_requests
			&& !self.app.layout.tally_approved_path(election_id).exists()
		{
			return Err(TaskError::NotAccepted);
		}

		let session_dir = self.app.layout.session_private_dir(election_id, session_id);
		self.app.mixnet.mix(&session_dir).await.map_err(subprocess_error)?;
		Ok(None)
	}

	async fn on_error(&self, ctx: &TaskContext, _error: &TaskError) {
		let Ok(election_id) = input_i64(ctx.input(), "election_id") else {
			return;
		};
		let Ok(session_id) = input_str(ctx.input(), "session_id") else {
			return;
		};
		let approved_path = self.app.layout.tally_approved_path(election_id);
		if approved_path.exists() {
			if let Err(error) = fs::remove_file(&approved_path) {
				warn!("cannot remove approval sentinel: {error}");
			}
		}
		let session_dir = self.app.layout.session_private_dir(election_id, session_id);
		if let Err(error) = self.app.mixnet.reset(&session_dir).await {
			warn!(session_id, "cannot reset the tally, maybe it doesn't exist: {error}");
		}
	}
}

/// After all sessions are mixed: convert the plaintexts, verify every
/// session's shuffle proofs, and publish the deterministic archive with
/// its hash.
pub struct VerifyAndPublishTally {
	pub(crate) app: Arc<App>,
}

#[async_trait]
impl ActionHandler for VerifyAndPublishTally {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let election_id = input_i64(ctx.input(), "election_id")?;
		let session_ids = input_string_list(ctx.input(), "session_ids")?;
		if election_id < 1 {
			return Err(TaskError::validation("election_id"));
		}

		let election = self
			.app
			.store
			.election(election_id)
			.await
			.map_err(TaskError::storage)?
			.ok_or_else(|| TaskError::invariant("election not found"))?;
		let authorities =
			self.app.store.authorities(election_id).await.map_err(TaskError::storage)?;
		check_sender_is_authority(&authorities, ctx.sender_cert(), "verify and publish tally")?;

		if !self.app.layout.election_public_dir(election_id).exists() {
			return Err(TaskError::invariant("election public path doesn't exist"));
		}
		let tally_path = self.app.layout.tally_archive_path(election_id);
		if !self.app.settings.enable_multiple_tallies && tally_path.exists() {
			return Err(TaskError::invariant(format!(
				"tally already exists, election_id = {election_id}"
			)));
		}

		let sessions = self.app.store.sessions(election_id).await.map_err(TaskError::storage)?;
		if sessions.len() != session_ids.len() {
			return Err(TaskError::invariant("unexpected session list"));
		}

		for session in &sessions {
			let session_dir = self.app.layout.session_private_dir(election_id, &session.id);
			let proofs_path = session_dir.join("dir").join("roProof");
			if !proofs_path.exists() || !session_dir.join("plaintexts_raw").exists() {
				return Err(TaskError::invariant(
					"proofs or plaintexts couldn't be verified",
				));
			}
			let plaintexts_json = session_dir.join("plaintexts_json");
			if plaintexts_json.exists() {
				fs::remove_file(&plaintexts_json).map_err(TaskError::storage)?;
			}
			self.app
				.mixnet
				.convert_plaintexts_to_json(&session_dir)
				.await
				.map_err(subprocess_error)?;

			let output = self
				.app
				.mixnet
				.verify(&session_dir.join("protInfo.xml"), &proofs_path)
				.await
				.map_err(subprocess_error)?;
			if !output.contains(VERIFY_SUCCESS_MARKER) {
				return Err(TaskError::invariant("invalid tally proofs"));
			}
		}

		// Written by the review step; its absence means the tally never
		// went through review on this node.
		let invalid_votes_path =
			self.app.layout.election_private_dir(election_id).join("invalid_votes");
		let invalid_votes: u64 = fs::read_to_string(&invalid_votes_path)
			.map_err(|e| TaskError::invariant(format!("missing invalid_votes: {e}")))?
			.trim()
			.parse()
			.map_err(|_| TaskError::invariant("malformed invalid_votes"))?;
		info!(election_id, invalid_votes, "verified tally, publishing archive");

		write_tally_archive(&self.app.layout, &election, &sessions)
			.map_err(TaskError::storage)?;
		Ok(None)
	}
}
