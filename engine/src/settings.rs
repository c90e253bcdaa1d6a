use clap::Parser;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

use tasknet::TlsMaterial;

use crate::constants::{
	DEFAULT_CONFIG_PATH, LAUNCH_QUEUE, MIXNET_QUEUE, SETTINGS_ENV_PREFIX,
};

#[derive(Parser, Debug, Clone, Default)]
pub struct CommandLineOptions {
	#[clap(short = 'c', long = "config-path", help = "Path to the settings file")]
	pub config_path: Option<String>,

	#[clap(long = "root-url", help = "Base URL of this node's task endpoint")]
	pub root_url: Option<String>,

	#[clap(long = "database-url", help = "Postgres connection string")]
	pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Listen {
	pub hostname: String,
	pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Ssl {
	pub cert_path: Option<PathBuf>,
	pub key_path: Option<PathBuf>,
	/// PEM bundle with the certificates of every peer authority CA.
	pub calist_path: Option<PathBuf>,
	/// The node certificate as a PEM string; loaded from `cert_path` at
	/// startup when absent. Used for "is this sender me?" comparisons.
	#[serde(default)]
	pub cert_string: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueOptions {
	pub max_threads: usize,
}

/// Host and port material handed to the mixnet: its public HTTP server and
/// the UDP hint server peers use to reduce polling.
#[derive(Debug, Deserialize, Clone)]
pub struct Vfork {
	pub server_url: String,
	pub server_port_range: Vec<u16>,
	pub hint_server_socket: String,
	pub hint_server_port_range: Vec<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub root_url: String,
	pub listen: Listen,
	pub database_url: String,
	pub private_data_path: PathBuf,
	pub public_data_path: PathBuf,
	pub public_data_base_url: String,

	#[serde(default)]
	pub ssl: Ssl,
	#[serde(default)]
	pub allow_only_ssl_connections: bool,
	#[serde(default = "default_true")]
	pub autoaccept_requests: bool,
	#[serde(default)]
	pub kill_all_vfork_before_start_new: bool,
	#[serde(default = "default_max_questions")]
	pub max_num_questions_per_election: usize,
	#[serde(default)]
	pub enable_multiple_tallies: bool,

	pub queues: HashMap<String, QueueOptions>,
	pub vfork: Vfork,
}

fn default_true() -> bool {
	true
}

fn default_max_questions() -> usize {
	40
}

impl Settings {
	pub fn new(opts: CommandLineOptions) -> Result<Self, ConfigError> {
		let mut settings = Self::from_file_and_env(
			opts.config_path.as_deref().unwrap_or(DEFAULT_CONFIG_PATH),
		)?;

		// Command line options take precedence over file and environment.
		if let Some(root_url) = opts.root_url {
			settings.root_url = root_url;
		}
		if let Some(database_url) = opts.database_url {
			settings.database_url = database_url;
		}

		settings.validate_settings()?;
		Ok(settings)
	}

	pub fn from_file_and_env(file: &str) -> Result<Self, ConfigError> {
		Config::builder()
			.add_source(File::with_name(file))
			.add_source(Environment::with_prefix(SETTINGS_ENV_PREFIX).separator("__"))
			.build()?
			.try_deserialize()
	}

	pub fn validate_settings(&self) -> Result<(), ConfigError> {
		if !self.root_url.trim_end_matches('/').ends_with("/api/queues") {
			return Err(ConfigError::Message(
				"root_url must point at the task endpoint (…/api/queues)".to_string(),
			));
		}
		if self.allow_only_ssl_connections && !self.root_url.starts_with("https://") {
			return Err(ConfigError::Message(
				"root_url must be https when only ssl connections are allowed".to_string(),
			));
		}
		for (queue, expected) in [(LAUNCH_QUEUE, 1), (MIXNET_QUEUE, 1)] {
			match self.queues.get(queue) {
				Some(options) if options.max_threads == expected => {},
				Some(_) => {
					return Err(ConfigError::Message(format!(
						"queue {queue} must have max_threads = {expected}"
					)));
				},
				None => {
					return Err(ConfigError::Message(format!(
						"queue {queue} is not configured"
					)));
				},
			}
		}
		for (name, range) in [
			("vfork.server_port_range", &self.vfork.server_port_range),
			("vfork.hint_server_port_range", &self.vfork.hint_server_port_range),
		] {
			if range.len() != 2 || range[0] > range[1] {
				return Err(ConfigError::Message(format!("{name} must be [low, high]")));
			}
		}
		Ok(())
	}

	/// Read the TLS material referenced by the settings into memory,
	/// filling `ssl.cert_string` along the way. Returns `None` when no
	/// certificate is configured (local development, tests).
	pub fn load_tls_material(&mut self) -> anyhow::Result<Option<TlsMaterial>> {
		let (Some(cert_path), Some(key_path)) = (&self.ssl.cert_path, &self.ssl.key_path) else {
			return Ok(None);
		};
		let cert_pem = std::fs::read_to_string(cert_path)?;
		let key_pem = std::fs::read_to_string(key_path)?;
		let ca_pem = self
			.ssl
			.calist_path
			.as_ref()
			.map(std::fs::read_to_string)
			.transpose()?;
		if self.ssl.cert_string.is_none() {
			self.ssl.cert_string = Some(cert_pem.clone());
		}
		Ok(Some(TlsMaterial { cert_pem, key_pem, ca_pem }))
	}

	/// The node's own certificate, as registered with its peers.
	pub fn self_cert(&self) -> &str {
		self.ssl.cert_string.as_deref().unwrap_or("")
	}

	pub fn queue_bounds(&self) -> HashMap<String, usize> {
		self.queues
			.iter()
			.map(|(name, options)| (name.clone(), options.max_threads))
			.collect()
	}

	/// Indicative mixnet HTTP server address; the mixnet may move to
	/// another port of the configured range later.
	pub fn vfork_server_url(&self) -> String {
		format!("{}:{}", self.vfork.server_url, self.vfork.server_port_range[0])
	}

	pub fn vfork_hint_server_url(&self) -> String {
		format!(
			"{}:{}",
			self.vfork.hint_server_socket, self.vfork.hint_server_port_range[0]
		)
	}

	/// A settings value for tests: local-only node, temp directories, no
	/// TLS, autoaccept on.
	pub fn new_test(private_data_path: PathBuf, public_data_path: PathBuf) -> Self {
		let queues = [
			(LAUNCH_QUEUE, 1),
			(MIXNET_QUEUE, 1),
			(crate::constants::DIRECTOR_QUEUE, 2),
			(crate::constants::PERFORMER_QUEUE, 2),
		]
		.into_iter()
		.map(|(name, max_threads)| (name.to_string(), QueueOptions { max_threads }))
		.collect();
		Settings {
			root_url: "http://127.0.0.1:5000/api/queues".to_string(),
			listen: Listen { hostname: "127.0.0.1".to_string(), port: 5000 },
			database_url: "postgres://localhost/orchestra_test".to_string(),
			private_data_path,
			public_data_path,
			public_data_base_url: "http://127.0.0.1:5000/public_data".to_string(),
			ssl: Ssl::default(),
			allow_only_ssl_connections: false,
			autoaccept_requests: true,
			kill_all_vfork_before_start_new: false,
			max_num_questions_per_election: 40,
			enable_multiple_tallies: false,
			queues,
			vfork: Vfork {
				server_url: "http://127.0.0.1".to_string(),
				server_port_range: vec![4081, 4083],
				hint_server_socket: "127.0.0.1".to_string(),
				hint_server_port_range: vec![8081, 8083],
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn init_default_config() {
		let settings = Settings::from_file_and_env("engine/config/Default.toml")
			.or_else(|_| Settings::from_file_and_env("config/Default.toml"))
			.unwrap();
		settings.validate_settings().unwrap();
		assert_eq!(settings.listen.port, 5000);
		assert_eq!(settings.queues.get(MIXNET_QUEUE).unwrap().max_threads, 1);
	}

	#[test]
	fn rejects_misconfigured_queues() {
		let mut settings =
			Settings::new_test(PathBuf::from("/tmp/private"), PathBuf::from("/tmp/public"));
		settings
			.queues
			.insert(MIXNET_QUEUE.to_string(), QueueOptions { max_threads: 4 });
		assert!(settings.validate_settings().is_err());
	}

	#[test]
	fn rejects_non_tls_root_url_under_ssl_policy() {
		let mut settings =
			Settings::new_test(PathBuf::from("/tmp/private"), PathBuf::from("/tmp/public"));
		settings.allow_only_ssl_connections = true;
		assert!(settings.validate_settings().is_err());
		settings.root_url = "https://127.0.0.1:5000/api/queues".to_string();
		assert!(settings.validate_settings().is_ok());
	}
}
