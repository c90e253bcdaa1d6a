use async_trait::async_trait;
use std::{path::Path, sync::Arc, time::Duration};
use tracing::{info, warn};

use crate::constants::{
	KEYGEN_FATAL_PATTERNS, KEYGEN_TIMEOUT, MIX_FATAL_PATTERNS, MIX_TIMEOUT,
	PKEY_CONVERSION_FATAL_PATTERNS, PKEY_CONVERSION_TIMEOUT, PLAINTEXT_CONVERSION_TIMEOUT,
};
use crate::proc::{fatal_pattern_filter, run_command, ProcError};
use crate::settings::Settings;

/// Typed wrappers around the mixnet executables. Every call runs with the
/// session's private directory as working directory; all semantic results
/// flow through the files the mixnet leaves there.
#[async_trait]
pub trait Mixnet: Send + Sync {
	/// `vmni -prot`: write the protocol skeleton (`stub.xml`).
	async fn gen_protocol_info(
		&self,
		session_id: &str,
		name: &str,
		num_parties: u32,
		threshold: u32,
		dir: &Path,
	) -> Result<(), ProcError>;

	/// `vmni -party`: write this party's `localProtInfo.xml` and
	/// `privInfo.xml` next to an existing `stub.xml`.
	async fn gen_private_info(&self, auth_name: &str, dir: &Path) -> Result<(), ProcError>;

	/// `vmni -merge`: combine every party's protocol info into
	/// `protInfo.xml`.
	async fn merge(&self, protinfo_files: &[String], dir: &Path) -> Result<(), ProcError>;

	/// `vmn -keygen`: run the joint key generation, producing
	/// `publicKey_raw`.
	async fn gen_public_key(&self, dir: &Path) -> Result<(), ProcError>;

	/// `vmn -mix`: shuffle and jointly decrypt `ciphertexts_raw` into
	/// `plaintexts_raw`.
	async fn mix(&self, dir: &Path) -> Result<(), ProcError>;

	/// `vmn -reset`: drop any partial mix state for the session.
	async fn reset(&self, dir: &Path) -> Result<(), ProcError>;

	/// `vmnv`: verify the shuffle proofs; returns the verifier output.
	async fn verify(&self, protinfo: &Path, proofs: &Path) -> Result<String, ProcError>;

	async fn convert_pkey_to_json(&self, dir: &Path) -> Result<(), ProcError>;
	async fn convert_ciphertexts_to_raw(&self, dir: &Path) -> Result<(), ProcError>;
	async fn convert_plaintexts_to_json(&self, dir: &Path) -> Result<(), ProcError>;
}

pub struct VforkMixnet {
	settings: Arc<Settings>,
}

impl VforkMixnet {
	pub fn new(settings: Arc<Settings>) -> Self {
		Self { settings }
	}

	/// Kill lingering mixnet JVMs left behind by a previous run. The
	/// mixnet is single-instance per node; a stray process would fight the
	/// next invocation over ports and array files.
	async fn pre_kill(&self, dir: &Path) {
		if !self.settings.kill_all_vfork_before_start_new {
			return;
		}
		info!("killing previous mixnet instances");
		let result = run_command(
			"sh",
			&["-c", "ps aux | grep java | grep -i mixnet | awk '{print $2}' | xargs -r kill -9"],
			dir,
			Some(Duration::from_secs(10)),
			None,
			None,
		)
		.await;
		if let Err(error) = result {
			warn!("failed to kill stray mixnet instances: {error}");
		}
	}
}

#[async_trait]
impl Mixnet for VforkMixnet {
	async fn gen_protocol_info(
		&self,
		session_id: &str,
		name: &str,
		num_parties: u32,
		threshold: u32,
		dir: &Path,
	) -> Result<(), ProcError> {
		self.pre_kill(dir).await;
		let num_parties = num_parties.to_string();
		let threshold = threshold.to_string();
		run_command(
			"vmni",
			&[
				"-prot",
				"-sid",
				session_id,
				"-name",
				name,
				"-nopart",
				num_parties.as_str(),
				"-thres",
				threshold.as_str(),
			],
			dir,
			None,
			Some(0),
			None,
		)
		.await
		.map(|_| ())
	}

	async fn gen_private_info(&self, auth_name: &str, dir: &Path) -> Result<(), ProcError> {
		self.pre_kill(dir).await;
		let server_url = self.settings.vfork_server_url();
		let hint_server_url = self.settings.vfork_hint_server_url();
		run_command(
			"vmni",
			&[
				"-party",
				"-arrays",
				"file",
				"-name",
				auth_name,
				"-http",
				server_url.as_str(),
				"-hint",
				hint_server_url.as_str(),
			],
			dir,
			None,
			Some(0),
			None,
		)
		.await
		.map(|_| ())
	}

	async fn merge(&self, protinfo_files: &[String], dir: &Path) -> Result<(), ProcError> {
		self.pre_kill(dir).await;
		let mut args = vec!["-merge"];
		args.extend(protinfo_files.iter().map(String::as_str));
		run_command("vmni", &args, dir, None, Some(0), None).await.map(|_| ())
	}

	async fn gen_public_key(&self, dir: &Path) -> Result<(), ProcError> {
		self.pre_kill(dir).await;
		let filter = fatal_pattern_filter(KEYGEN_FATAL_PATTERNS);
		run_command(
			"vmn",
			&["-keygen", "publicKey_raw"],
			dir,
			Some(KEYGEN_TIMEOUT),
			Some(0),
			Some(&filter),
		)
		.await
		.map(|_| ())
	}

	async fn mix(&self, dir: &Path) -> Result<(), ProcError> {
		self.pre_kill(dir).await;
		let filter = fatal_pattern_filter(MIX_FATAL_PATTERNS);
		run_command(
			"vmn",
			&["-mix", "privInfo.xml", "protInfo.xml", "ciphertexts_raw", "plaintexts_raw"],
			dir,
			Some(MIX_TIMEOUT),
			Some(0),
			Some(&filter),
		)
		.await
		.map(|_| ())
	}

	async fn reset(&self, dir: &Path) -> Result<(), ProcError> {
		self.pre_kill(dir).await;
		run_command(
			"vmn",
			&["-reset", "privInfo.xml", "protInfo.xml", "-f"],
			dir,
			None,
			Some(0),
			None,
		)
		.await
		.map(|_| ())
	}

	async fn verify(&self, protinfo: &Path, proofs: &Path) -> Result<String, ProcError> {
		let dir = protinfo.parent().unwrap_or(Path::new("."));
		let protinfo = protinfo.to_string_lossy().into_owned();
		let proofs = proofs.to_string_lossy().into_owned();
		// The verifier sometimes trips over its own cleanup after printing
		// the success marker, so the exit status is not asserted; callers
		// check the output instead.
		run_command(
			"vmnv",
			&[protinfo.as_str(), proofs.as_str(), "-v"],
			dir,
			None,
			None,
			None,
		)
		.await
		.map(|result| result.output)
	}

	async fn convert_pkey_to_json(&self, dir: &Path) -> Result<(), ProcError> {
		let filter = fatal_pattern_filter(PKEY_CONVERSION_FATAL_PATTERNS);
		run_command(
			"vmnc",
			&["-pkey", "-outi", "json", "publicKey_raw", "publicKey_json"],
			dir,
			Some(PKEY_CONVERSION_TIMEOUT),
			Some(0),
			Some(&filter),
		)
		.await
		.map(|_| ())
	}

	async fn convert_ciphertexts_to_raw(&self, dir: &Path) -> Result<(), ProcError> {
		run_command(
			"vmnc",
			&["-ciphs", "-ini", "json", "ciphertexts_json", "ciphertexts_raw"],
			dir,
			None,
			Some(0),
			None,
		)
		.await
		.map(|_| ())
	}

	async fn convert_plaintexts_to_json(&self, dir: &Path) -> Result<(), ProcError> {
		run_command(
			"vmnc",
			&["-plain", "-outi", "json", "plaintexts_raw", "plaintexts_json"],
			dir,
			Some(PLAINTEXT_CONVERSION_TIMEOUT),
			Some(0),
			None,
		)
		.await
		.map(|_| ())
	}
}
