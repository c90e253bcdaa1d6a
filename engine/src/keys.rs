use base64::Engine;
use std::fs;
use thiserror::Error;

use crate::artifacts::{
	create_deterministic_tarball, ensure_dir, extract_tarball, sidecar_path, DataLayout,
	TarEntry,
};
use crate::db::Store;
use crate::hashing::{constant_time_eq, hash_bytes, hash_file};
use crate::models::Session;

/// Escrow of per-authority private key fragments: every session's
/// `privInfo.xml` can be exported as one deterministic archive, checked
/// against the stored fragments, deleted (only against a verified copy)
/// and restored. The `.sha256` sidecars guarantee a silently replaced
/// share is detected before it is ever used.
#[derive(Error, Debug)]
pub enum EscrowError {
	/// Caller error; maps to HTTP 400.
	#[error("{0}")]
	BadRequest(String),
	/// Inconsistent local state; maps to HTTP 500.
	#[error("{0}")]
	Internal(String),
}

fn internal(error: impl std::fmt::Display) -> EscrowError {
	EscrowError::Internal(error.to_string())
}

async fn sessions_of(
	store: &dyn Store,
	election_id: i64,
) -> Result<Vec<Session>, EscrowError> {
	if !store.election_exists(election_id).await.map_err(internal)? {
		return Err(EscrowError::BadRequest(format!("unknown election {election_id}")));
	}
	store.sessions(election_id).await.map_err(internal)
}

/// Verify each share against its sidecar hash, creating missing sidecars
/// on first use.
fn assert_share_hashes(
	layout: &DataLayout,
	election_id: i64,
	sessions: &[Session],
) -> Result<(), EscrowError> {
	for session in sessions {
		let share_path = layout.privinfo_path(election_id, &session.id);
		if !share_path.exists() {
			return Err(EscrowError::Internal(format!(
				"missing file {}",
				share_path.display()
			)));
		}
		let digest = hash_file(&share_path).map_err(internal)?;
		let sidecar = sidecar_path(&share_path);
		if sidecar.exists() {
			let stored = fs::read_to_string(&sidecar).map_err(internal)?;
			if !constant_time_eq(stored.trim(), &digest) {
				return Err(EscrowError::Internal(
					"private key file has a hash consistency error".to_string(),
				));
			}
		} else {
			fs::write(&sidecar, &digest).map_err(internal)?;
		}
	}
	Ok(())
}

/// Stage every share under `<session_id>/privInfo.xml` and build the
/// deterministic archive; identical inputs give identical bytes on every
/// run, which Check relies on.
fn build_archive(
	layout: &DataLayout,
	election_id: i64,
	sessions: &[Session],
) -> Result<Vec<u8>, EscrowError> {
	let stage = tempfile::tempdir().map_err(internal)?;
	let mut entries = Vec::new();
	for session in sessions {
		let session_stage = stage.path().join(&session.id);
		ensure_dir(&session_stage).map_err(internal)?;
		fs::copy(
			layout.privinfo_path(election_id, &session.id),
			session_stage.join("privInfo.xml"),
		)
		.map_err(internal)?;
		entries.push(TarEntry::new(session_stage, session.id.clone()));
	}

	let scratch = tempfile::tempdir().map_err(internal)?;
	let archive_path = scratch.path().join("private_keys.tar.gz");
	create_deterministic_tarball(&archive_path, &entries).map_err(internal)?;
	fs::read(&archive_path).map_err(internal)
}

/// Export every session's private share as base64 of a deterministic
/// `.tar.gz`.
pub async fn export(
	store: &dyn Store,
	layout: &DataLayout,
	election_id: i64,
) -> Result<String, EscrowError> {
	let sessions = sessions_of(store, election_id).await?;
	assert_share_hashes(layout, election_id, &sessions)?;
	let bytes = build_archive(layout, election_id, &sessions)?;
	Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
}

/// Rebuild the archive and compare it against the provided one, by hash,
/// in constant time.
pub async fn check(
	store: &dyn Store,
	layout: &DataLayout,
	election_id: i64,
	share_b64: &str,
) -> Result<bool, EscrowError> {
	let blob = base64::engine::general_purpose::STANDARD
		.decode(share_b64.trim())
		.map_err(|_| EscrowError::BadRequest("invalid base64".to_string()))?;
	let sessions = sessions_of(store, election_id).await?;
	assert_share_hashes(layout, election_id, &sessions)?;
	let rebuilt = build_archive(layout, election_id, &sessions)?;
	Ok(constant_time_eq(&hash_bytes(&blob), &hash_bytes(&rebuilt)))
}

/// Delete the stored shares, but only against a verified copy: the caller
/// must present an archive matching what is on disk, and every share must
/// exist before any is unlinked.
pub async fn delete(
	store: &dyn Store,
	layout: &DataLayout,
	election_id: i64,
	share_b64: &str,
) -> Result<(), EscrowError> {
	if !check(store, layout, election_id, share_b64).await? {
		return Err(EscrowError::BadRequest(
			"provided share does not match the stored key shares".to_string(),
		));
	}
	let sessions = sessions_of(store, election_id).await?;
	let share_paths: Vec<_> = sessions
		.iter()
		.map(|session| layout.privinfo_path(election_id, &session.id))
		.collect();
	for path in &share_paths {
		if !path.exists() {
			return Err(EscrowError::Internal(format!("missing file {}", path.display())));
		}
	}
	for path in &share_paths {
		fs::remove_file(path).map_err(internal)?;
	}
	Ok(())
}

/// Restore shares from an exported archive. For every session the archive
/// must contain the share, a local sidecar must exist, a still-present
/// local share must match its sidecar, and the archived share's hash must
/// equal the sidecar; only then is anything copied into place.
pub async fn restore(
	store: &dyn Store,
	layout: &DataLayout,
	election_id: i64,
	share_b64: &str,
) -> Result<(), EscrowError> {
	let blob = base64::engine::general_purpose::STANDARD
		.decode(share_b64.trim())
		.map_err(|_| EscrowError::BadRequest("invalid base64".to_string()))?;
	let sessions = sessions_of(store, election_id).await?;

	let scratch = tempfile::tempdir().map_err(internal)?;
	let archive_path = scratch.path().join("private_keys.tar.gz");
	fs::write(&archive_path, &blob).map_err(internal)?;
	let extracted = scratch.path().join("extracted");
	ensure_dir(&extracted).map_err(internal)?;
	extract_tarball(&archive_path, &extracted)
		.map_err(|e| EscrowError::BadRequest(format!("unreadable archive: {e}")))?;

	let mut restorable = Vec::new();
	for session in &sessions {
		let archived_share = extracted.join(&session.id).join("privInfo.xml");
		if !archived_share.exists() {
			return Err(EscrowError::BadRequest(format!(
				"missing key in tar file for session id {}",
				session.id
			)));
		}

		let share_path = layout.privinfo_path(election_id, &session.id);
		let sidecar = sidecar_path(&share_path);
		if !sidecar.exists() {
			return Err(EscrowError::Internal(format!(
				"missing hash for key share in session id {}",
				session.id
			)));
		}
		let stored_digest = fs::read_to_string(&sidecar).map_err(internal)?;
		let stored_digest = stored_digest.trim();

		if share_path.exists() {
			let local_digest = hash_file(&share_path).map_err(internal)?;
			if !constant_time_eq(stored_digest, &local_digest) {
				return Err(EscrowError::Internal(
					"private key file has a hash consistency error".to_string(),
				));
			}
		}

		let archived_digest = hash_file(&archived_share).map_err(internal)?;
		if !constant_time_eq(stored_digest, &archived_digest) {
			return Err(EscrowError::BadRequest(format!(
				"hashes don't match for session id {}",
				session.id
			)));
		}
		restorable.push((archived_share, share_path));
	}

	for (archived_share, share_path) in restorable {
		fs::copy(&archived_share, &share_path).map_err(internal)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::db::memory::MemoryStore;
	use crate::models::{AuthoritySpec, Election, ElectionStatus};
	use std::path::Path;

	const ELECTION_ID: i64 = 7;

	async fn escrow_fixture(root: &Path) -> (MemoryStore, DataLayout) {
		let layout =
			DataLayout::new(root.join("private"), root.join("public"));
		let store = MemoryStore::new();
		let election = Election {
			id: ELECTION_ID,
			title: "t".to_string(),
			description: "d".to_string(),
			questions: vec![serde_json::json!({})],
			start_date: None,
			end_date: None,
			callback_url: "https://consumer.example/cb".to_string(),
			num_parties: 1,
			threshold_parties: 1,
			status: ElectionStatus::Created,
		};
		let authority = AuthoritySpec {
			name: "self".to_string(),
			orchestra_url: "https://self.example/api/queues".to_string(),
			ssl_cert: "CERT".to_string(),
		};
		store.insert_election(&election, &[authority]).await.unwrap();

		let mut sessions = Vec::new();
		for question_number in 0..2 {
			let session_id = format!("{question_number}-fixture");
			let session_dir = layout.session_private_dir(ELECTION_ID, &session_id);
			ensure_dir(&session_dir).unwrap();
			fs::write(
				session_dir.join("privInfo.xml"),
				format!("<privInfo>{question_number}</privInfo>"),
			)
			.unwrap();
			sessions.push(Session {
				id: session_id,
				election_id: ELECTION_ID,
				question_number,
				status: "default".to_string(),
				public_key: None,
			});
		}
		store.insert_sessions(&sessions).await.unwrap();
		(store, layout)
	}

	#[tokio::test]
	async fn export_restore_is_the_identity_on_shares() {
		let tmp = tempfile::tempdir().unwrap();
		let (store, layout) = escrow_fixture(tmp.path()).await;

		let share = export(&store, &layout, ELECTION_ID).await.unwrap();
		assert!(check(&store, &layout, ELECTION_ID, &share).await.unwrap());

		let original =
			fs::read(layout.privinfo_path(ELECTION_ID, "0-fixture")).unwrap();
		delete(&store, &layout, ELECTION_ID, &share).await.unwrap();
		assert!(!layout.privinfo_path(ELECTION_ID, "0-fixture").exists());
		assert!(!layout.privinfo_path(ELECTION_ID, "1-fixture").exists());

		restore(&store, &layout, ELECTION_ID, &share).await.unwrap();
		assert_eq!(
			fs::read(layout.privinfo_path(ELECTION_ID, "0-fixture")).unwrap(),
			original
		);
	}

	#[tokio::test]
	async fn export_is_deterministic() {
		let tmp = tempfile::tempdir().unwrap();
		let (store, layout) = escrow_fixture(tmp.path()).await;

		let first = export(&store, &layout, ELECTION_ID).await.unwrap();
		let second = export(&store, &layout, ELECTION_ID).await.unwrap();
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn tampered_local_share_is_detected() {
		let tmp = tempfile::tempdir().unwrap();
		let (store, layout) = escrow_fixture(tmp.path()).await;

		// First export writes the sidecars.
		let _ = export(&store, &layout, ELECTION_ID).await.unwrap();
		fs::write(layout.privinfo_path(ELECTION_ID, "0-fixture"), "replaced").unwrap();

		assert!(matches!(
			export(&store, &layout, ELECTION_ID).await,
			Err(EscrowError::Internal(_))
		));
	}

	#[tokio::test]
	async fn foreign_archive_is_rejected_before_any_copy() {
		let tmp = tempfile::tempdir().unwrap();
		let (store, layout) = escrow_fixture(tmp.path()).await;
		let share = export(&store, &layout, ELECTION_ID).await.unwrap();

		// An archive from a different election state must not overwrite
		// anything.
		fs::write(layout.privinfo_path(ELECTION_ID, "1-fixture"), "rotated").unwrap();
		let sidecar = sidecar_path(&layout.privinfo_path(ELECTION_ID, "1-fixture"));
		fs::write(
			&sidecar,
			hash_file(&layout.privinfo_path(ELECTION_ID, "1-fixture")).unwrap(),
		)
		.unwrap();

		let result = restore(&store, &layout, ELECTION_ID, &share).await;
		assert!(matches!(result, Err(EscrowError::BadRequest(_))));
		assert_eq!(
			fs::read_to_string(layout.privinfo_path(ELECTION_ID, "1-fixture")).unwrap(),
			"rotated"
		);
	}

	#[tokio::test]
	async fn delete_requires_a_matching_archive() {
		let tmp = tempfile::tempdir().unwrap();
		let (store, layout) = escrow_fixture(tmp.path()).await;
		let _ = export(&store, &layout, ELECTION_ID).await.unwrap();

		let bogus = base64::engine::general_purpose::STANDARD.encode(b"not the archive");
		assert!(matches!(
			delete(&store, &layout, ELECTION_ID, &bogus).await,
			Err(EscrowError::BadRequest(_))
		));
		assert!(layout.privinfo_path(ELECTION_ID, "0-fixture").exists());
	}
}
