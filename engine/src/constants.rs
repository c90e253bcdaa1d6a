use std::time::Duration;

// ======= Mixnet subprocess timeouts =======

/// Joint public key generation runs a full DKG round between all parties.
pub const KEYGEN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The shuffle + joint decryption of a full ciphertext set.
pub const MIX_TIMEOUT: Duration = Duration::from_secs(5 * 3600);

/// Raw to JSON public key conversion is purely local.
pub const PKEY_CONVERSION_TIMEOUT: Duration = Duration::from_secs(20);

/// Plaintext conversion scales with the number of votes.
pub const PLAINTEXT_CONVERSION_TIMEOUT: Duration = Duration::from_secs(3600);

// ======= Known-fatal mixnet output =======
//
// The mixnet keeps running (and retrying) after printing these; the output
// filter kills it instead of burning the whole timeout.

pub const KEYGEN_FATAL_PATTERNS: &[&str] =
	&["Unable to download signature!", "ERROR: Invalid socket address!"];

pub const PKEY_CONVERSION_FATAL_PATTERNS: &[&str] = &["Failed to parse info files!"];

pub const MIX_FATAL_PATTERNS: &[&str] = &["Exception in thread \"main\""];

/// The marker vmnv prints when a proof verification actually passed;
/// everything else (including a clean exit) counts as failure.
pub const VERIFY_SUCCESS_MARKER: &str = "Verification completed SUCCESSFULLY after";

// ======= Artifact packaging =======

/// Fixed modification time stamped on every archive entry so all
/// authorities produce bit-identical tarballs.
pub const MAGIC_TIMESTAMP: u64 = 1394060400;

/// Chunk size for streamed file hashing and downloads.
pub const HASH_BUF_SIZE: usize = 10 * 1024;

// ======= Settings environment variables =======

/// Prefix of environment overrides for settings, e.g.
/// `ORCHESTRA__ROOT_URL` or `ORCHESTRA__SSL__CERT_PATH`.
pub const SETTINGS_ENV_PREFIX: &str = "ORCHESTRA";

pub const DEFAULT_CONFIG_PATH: &str = "./engine/config/Default.toml";

// ======= Queue names =======

/// Director-side composite heads; serialized so one protocol runs at a time.
pub const LAUNCH_QUEUE: &str = "launch_task";
pub const DIRECTOR_QUEUE: &str = "orchestra_director";
pub const PERFORMER_QUEUE: &str = "orchestra_performer";
/// Heavy mixnet invocations; bound to one so keygen and mix never overlap.
pub const MIXNET_QUEUE: &str = "mixnet_queue";
