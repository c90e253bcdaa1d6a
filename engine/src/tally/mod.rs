//! The tally protocol: ciphertext review and split, synchronized
//! re-encryption mix per session, proof verification and deterministic
//! publication.

pub mod director;
pub mod performer;

use anyhow::{Context, Result};
use serde_json::Value;
use std::{
	fs,
	io::{BufRead, BufReader, BufWriter, Write},
	path::{Path, PathBuf},
	sync::Arc,
};
use tracing::{info, warn};

use tasknet::TaskError;

use crate::app::App;
use crate::artifacts::{create_deterministic_tarball, DataLayout, TarEntry};
use crate::constants::{DIRECTOR_QUEUE, LAUNCH_QUEUE, MIXNET_QUEUE, PERFORMER_QUEUE};
use crate::hashing::hash_file;
use crate::mixnet::Mixnet;
use crate::models::{Election, Session};
use crate::utils::canonical_pretty;

pub fn register(app: &Arc<App>) {
	let engine = &app.engine;
	engine.register(
		LAUNCH_QUEUE,
		"tally_election",
		Arc::new(director::TallyElection { app: app.clone() }),
	);
	engine.register(
		DIRECTOR_QUEUE,
		"return_tally",
		Arc::new(director::ReturnTally { app: app.clone() }),
	);
	engine.register(
		PERFORMER_QUEUE,
		"review_tally",
		Arc::new(performer::ReviewTally { app: app.clone() }),
	);
	engine.register(
		PERFORMER_QUEUE,
		"check_tally_approval",
		Arc::new(performer::CheckTallyApproval { app: app.clone() }),
	);
	engine.register(
		MIXNET_QUEUE,
		"perform_tally",
		Arc::new(performer::PerformTally { app: app.clone() }),
	);
	engine.register(
		PERFORMER_QUEUE,
		"verify_and_publish_tally",
		Arc::new(performer::VerifyAndPublishTally { app: app.clone() }),
	);
}

/// Split the downloaded ciphertext bundle by question: every input line is
/// a ballot `{"choices": [c_0, …, c_Q-1], "proofs": []}`, and choice `i`
/// goes into session `i`'s `ciphertexts_json`, one compact JSON value per
/// line (the mixnet's converter rejects embedded whitespace). Returns the
/// number of ballots read.
pub(crate) fn split_ciphertexts(
	bundle_path: &Path,
	session_outputs: &[PathBuf],
) -> Result<u64, TaskError> {
	let bundle = fs::File::open(bundle_path)
		.map_err(|e| TaskError::invariant(format!("cannot open ciphertext bundle: {e}")))?;
	let mut writers = session_outputs
		.iter()
		.map(|path| fs::File::create(path).map(BufWriter::new))
		.collect::<std::io::Result<Vec<_>>>()
		.map_err(|e| TaskError::invariant(format!("cannot open session ciphertexts: {e}")))?;

	let mut ballots = 0u64;
	for line in BufReader::new(bundle).lines() {
		let line = line.map_err(|e| TaskError::invariant(format!("read error: {e}")))?;
		if line.trim().is_empty() {
			continue;
		}
		let ballot: Value = serde_json::from_str(&line)
			.map_err(|_| TaskError::invariant("malformed ballot line"))?;
		let choices = ballot
			.get("choices")
			.and_then(Value::as_array)
			.ok_or_else(|| TaskError::invariant("malformed ballot line"))?;
		if choices.len() != writers.len() {
			return Err(TaskError::invariant(
				"ballot choice count does not match question count",
			));
		}
		for (choice, writer) in choices.iter().zip(writers.iter_mut()) {
			serde_json::to_writer(&mut *writer, choice)
				.map_err(|e| TaskError::invariant(format!("write error: {e}")))?;
			writer
				.write_all(b"\n")
				.map_err(|e| TaskError::invariant(format!("write error: {e}")))?;
		}
		ballots += 1;
	}
	for mut writer in writers {
		writer.flush().map_err(|e| TaskError::invariant(format!("write error: {e}")))?;
	}
	Ok(ballots)
}

/// Stage and write the deterministic `tally.tar.gz` plus its `.sha256`
/// sidecar. Contents: the questions, the original ciphertext bundle and
/// the aggregated public keys at the root; per session the decrypted
/// plaintexts, the shuffle proofs and the protocol info.
pub fn write_tally_archive(
	layout: &DataLayout,
	election: &Election,
	sessions: &[Session],
) -> Result<()> {
	let election_dir = layout.election_private_dir(election.id);

	let mut pubkeys = Vec::new();
	for session in sessions {
		let pubkey_path =
			layout.session_private_dir(election.id, &session.id).join("publicKey_json");
		let pubkey = fs::read_to_string(&pubkey_path)
			.with_context(|| format!("cannot read {}", pubkey_path.display()))?;
		pubkeys.push(
			serde_json::from_str::<Value>(&pubkey).context("publicKey_json is not json")?,
		);
	}
	fs::write(election_dir.join("pubkeys_json"), canonical_pretty(&Value::Array(pubkeys)))
		.context("cannot write pubkeys_json")?;
	fs::write(
		election_dir.join("questions_json"),
		canonical_pretty(&Value::Array(election.questions.clone())),
	)
	.context("cannot write questions_json")?;

	let mut entries = vec![
		TarEntry::new(election_dir.join("questions_json"), "questions_json"),
		TarEntry::new(election_dir.join("ciphertexts_json"), "ciphertexts_json"),
		TarEntry::new(election_dir.join("pubkeys_json"), "pubkeys_json"),
	];
	for session in sessions {
		let session_dir = layout.session_private_dir(election.id, &session.id);
		entries.push(TarEntry::new(
			session_dir.join("plaintexts_json"),
			format!("{}/plaintexts_json", session.id),
		));
		entries.push(TarEntry::new(
			session_dir.join("dir").join("roProof"),
			format!("{}/proofs", session.id),
		));
		entries.push(TarEntry::new(
			session_dir.join("protInfo.xml"),
			format!("{}/protInfo.xml", session.id),
		));
	}

	let tally_path = layout.tally_archive_path(election.id);
	create_deterministic_tarball(&tally_path, &entries)?;
	fs::write(layout.tally_hash_path(election.id), hash_file(&tally_path)?)
		.context("cannot write tally hash")?;
	info!(election_id = election.id, "tally archive published");
	Ok(())
}

/// Clear all tally state of an election so the protocol can run again:
/// the approval sentinel, per-session ciphertext and plaintext artifacts,
/// the mixnet's own mix state, and the published archive.
pub async fn reset_tally_state(
	layout: &DataLayout,
	mixnet: &dyn Mixnet,
	election_id: i64,
	sessions: &[Session],
) -> Result<()> {
	let remove_if_exists = |path: PathBuf| {
		if path.exists() {
			if let Err(error) = fs::remove_file(&path) {
				warn!("cannot remove {}: {error}", path.display());
			}
		}
	};

	remove_if_exists(layout.tally_approved_path(election_id));
	remove_if_exists(layout.election_private_dir(election_id).join("ciphertexts_json"));
	remove_if_exists(layout.election_private_dir(election_id).join("invalid_votes"));
	for session in sessions {
		let session_dir = layout.session_private_dir(election_id, &session.id);
		for artifact in
			["ciphertexts_json", "ciphertexts_raw", "plaintexts_raw", "plaintexts_json"]
		{
			remove_if_exists(session_dir.join(artifact));
		}
		if let Err(error) = mixnet.reset(&session_dir).await {
			warn!(session_id = %session.id, "cannot reset the tally, maybe it doesn't exist: {error}");
		}
	}
	remove_if_exists(layout.tally_archive_path(election_id));
	remove_if_exists(layout.tally_hash_path(election_id));
	Ok(())
}
