use anyhow::{Context, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::{io::Read, path::Path};
use subtle::ConstantTimeEq;

use crate::constants::HASH_BUF_SIZE;

pub const NI_SHA256_PREFIX: &str = "ni:///sha-256;";

/// URL-safe base64 SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
	let digest = Sha256::digest(bytes);
	base64::engine::general_purpose::URL_SAFE.encode(digest)
}

/// URL-safe base64 SHA-256 of a file, streamed in 10 KiB chunks.
pub fn hash_file(path: &Path) -> Result<String> {
	let file = std::fs::File::open(path)
		.with_context(|| format!("cannot open {} for hashing", path.display()))?;
	let mut reader = std::io::BufReader::new(file);
	let mut hasher = Sha256::new();
	let mut buffer = [0u8; HASH_BUF_SIZE];
	loop {
		let read = reader
			.read(&mut buffer)
			.with_context(|| format!("read error hashing {}", path.display()))?;
		if read == 0 {
			break;
		}
		hasher.update(&buffer[..read]);
	}
	Ok(base64::engine::general_purpose::URL_SAFE.encode(hasher.finalize()))
}

/// Format a digest as an RFC 6920 named-information URI.
pub fn ni_sha256(digest: &str) -> String {
	format!("{NI_SHA256_PREFIX}{digest}")
}

/// Strip the `ni:///sha-256;` prefix, if present.
pub fn ni_sha256_digest(uri: &str) -> Option<&str> {
	uri.strip_prefix(NI_SHA256_PREFIX)
}

/// Constant-time string equality, used wherever a hash authenticates data
/// (downloaded bundles, escrowed key shares). Short-circuits only on
/// length, which is not secret for fixed-size digests.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn known_digests() {
		assert_eq!(hash_bytes(b"abc"), "ungWv48Bz-pBQUDeXa4iI7ADYaOWF3qctBD_YfIAFa0=");
		assert_eq!(hash_bytes(b""), "47DEQpj8HBSa-_TImW-5JCeuQeRkm5NMpJWZG3hSuFU=");
	}

	#[test]
	fn file_hash_matches_byte_hash() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("bundle");
		// Larger than one hashing chunk to exercise the streaming path.
		let content = vec![0x5au8; 3 * HASH_BUF_SIZE + 17];
		std::fs::File::create(&path).unwrap().write_all(&content).unwrap();
		assert_eq!(hash_file(&path).unwrap(), hash_bytes(&content));
	}

	#[test]
	fn ni_uri_round_trip() {
		let digest = hash_bytes(b"abc");
		let uri = ni_sha256(&digest);
		assert!(uri.starts_with("ni:///sha-256;"));
		assert_eq!(ni_sha256_digest(&uri), Some(digest.as_str()));
		assert_eq!(ni_sha256_digest("sha-256;nope"), None);
	}

	#[test]
	fn comparison_is_exact() {
		let digest = hash_bytes(b"abc");
		assert!(constant_time_eq(&digest, &digest));
		assert!(!constant_time_eq(&digest, &hash_bytes(b"abd")));
		assert!(!constant_time_eq(&digest, "short"));
	}
}
