use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::TaskError;
use crate::task::{TaskEnvelope, UpdateEnvelope};

/// PEM material identifying this node towards its peers.
#[derive(Debug, Clone, Default)]
pub struct TlsMaterial {
	pub cert_pem: String,
	pub key_pem: String,
	/// Concatenated PEM certificates of every peer CA we accept.
	pub ca_pem: Option<String>,
}

/// Compare two PEM certificates ignoring all whitespace. Peers are
/// identified by the certificate they registered with, which may have been
/// re-wrapped in transit.
pub fn certs_differ(a: &str, b: &str) -> bool {
	let normalize = |s: &str| s.chars().filter(|c| !c.is_whitespace()).collect::<String>();
	normalize(a) != normalize(b)
}

/// HTTPS client used for task fan-out, completion reports and consumer
/// callbacks. Plain-http targets are refused outright when the node is
/// configured to only allow TLS.
#[derive(Clone)]
pub struct Transport {
	client: reqwest::Client,
	allow_only_ssl: bool,
}

impl Transport {
	pub fn new(tls: Option<&TlsMaterial>, allow_only_ssl: bool) -> Result<Self, TaskError> {
		let mut builder = reqwest::Client::builder().use_rustls_tls();

		if let Some(tls) = tls {
			let identity_pem = format!("{}\n{}", tls.key_pem, tls.cert_pem);
			let identity = reqwest::Identity::from_pem(identity_pem.as_bytes())
				.map_err(|e| TaskError::Network(format!("invalid client identity: {e}")))?;
			builder = builder.identity(identity);

			if let Some(ca_pem) = &tls.ca_pem {
				for cert in split_pem_certs(ca_pem) {
					let cert = reqwest::Certificate::from_pem(cert.as_bytes())
						.map_err(|e| TaskError::Network(format!("invalid CA certificate: {e}")))?;
					builder = builder.add_root_certificate(cert);
				}
			}
		}

		let client = builder
			.build()
			.map_err(|e| TaskError::Network(format!("failed to build http client: {e}")))?;
		Ok(Transport { client, allow_only_ssl })
	}

	/// A client with no identity, for tests and local-only nodes.
	pub fn insecure() -> Self {
		Transport { client: reqwest::Client::new(), allow_only_ssl: false }
	}

	fn check_scheme(&self, url: &str) -> Result<Url, TaskError> {
		let parsed = Url::parse(url)
			.map_err(|e| TaskError::Network(format!("invalid url {url}: {e}")))?;
		if self.allow_only_ssl && parsed.scheme() != "https" {
			return Err(TaskError::Network(format!(
				"policy set to reject non-tls connection to {url}"
			)));
		}
		Ok(parsed)
	}

	/// Hand a task to the peer at `receiver_url`. The peer persists it and
	/// enqueues it on the named queue; the actual work happens later.
	pub async fn send_task(
		&self,
		receiver_url: &str,
		envelope: &TaskEnvelope,
	) -> Result<(), TaskError> {
		let url = format!("{}/task", receiver_url.trim_end_matches('/'));
		debug!(task_id = %envelope.id, url, "sending task to peer");
		self.post(&url, envelope).await
	}

	/// Report a finished or failed task back to its sender.
	pub async fn send_update(
		&self,
		sender_url: &str,
		envelope: &UpdateEnvelope,
	) -> Result<(), TaskError> {
		let url = format!("{}/update", sender_url.trim_end_matches('/'));
		debug!(task_id = %envelope.task_id, url, "reporting task update to sender");
		self.post(&url, envelope).await
	}

	/// POST an arbitrary JSON document, used for consumer callbacks.
	pub async fn post_json(&self, url: &str, body: &Value) -> Result<(), TaskError> {
		self.post(url, body).await
	}

	async fn post<B: Serialize>(&self, url: &str, body: &B) -> Result<(), TaskError> {
		let parsed = self.check_scheme(url)?;
		let response = self
			.client
			.post(parsed)
			.json(body)
			.send()
			.await
			.map_err(|e| TaskError::Network(format!("post to {url} failed: {e}")))?;
		if !response.status().is_success() {
			return Err(TaskError::Network(format!(
				"post to {url} returned {}",
				response.status()
			)));
		}
		Ok(())
	}

	/// Stream a GET response to disk in chunks; used for ciphertext
	/// bundles that may not fit in memory.
	pub async fn download_to_file(
		&self,
		url: &str,
		dest: &std::path::Path,
	) -> Result<(), TaskError> {
		use tokio::io::AsyncWriteExt;

		let parsed = self.check_scheme(url)?;
		let mut response = self
			.client
			.get(parsed)
			.send()
			.await
			.map_err(|e| TaskError::Network(format!("download from {url} failed: {e}")))?;
		if !response.status().is_success() {
			return Err(TaskError::Network("error downloading the votes".to_string()));
		}

		let mut file = tokio::fs::File::create(dest)
			.await
			.map_err(|e| TaskError::Network(format!("cannot create {}: {e}", dest.display())))?;
		while let Some(chunk) = response
			.chunk()
			.await
			.map_err(|e| TaskError::Network(format!("download from {url} failed: {e}")))?
		{
			file.write_all(&chunk)
				.await
				.map_err(|e| TaskError::Network(format!("write failed: {e}")))?;
		}
		file.flush()
			.await
			.map_err(|e| TaskError::Network(format!("write failed: {e}")))?;
		Ok(())
	}
}

/// Split a PEM bundle into individual certificates.
fn split_pem_certs(bundle: &str) -> Vec<String> {
	const BEGIN: &str = "-----BEGIN CERTIFICATE-----";
	const END: &str = "-----END CERTIFICATE-----";
	let mut certs = Vec::new();
	let mut rest = bundle;
	while let Some(start) = rest.find(BEGIN) {
		let Some(end) = rest[start..].find(END) else {
			break;
		};
		let end = start + end + END.len();
		certs.push(rest[start..end].to_string());
		rest = &rest[end..];
	}
	certs
}

#[cfg(test)]
mod tests {
	use super::*;

	const CERT_A: &str = "-----BEGIN CERTIFICATE-----\nMIIFATCCA+mgAwIBAgIQ\nAOli4NZQEWpKZeYX25jjwA==\n-----END CERTIFICATE-----";

	#[test]
	fn certs_compare_ignoring_whitespace() {
		let rewrapped = CERT_A.replace('\n', " \n\t");
		assert!(!certs_differ(CERT_A, &rewrapped));
		assert!(certs_differ(CERT_A, "-----BEGIN CERTIFICATE-----\nzzzz\n-----END CERTIFICATE-----"));
	}

	#[test]
	fn pem_bundles_split_per_certificate() {
		let bundle = format!("{CERT_A}\n{CERT_A}\n");
		assert_eq!(split_pem_certs(&bundle).len(), 2);
		assert_eq!(split_pem_certs("no certs here").len(), 0);
	}

	#[tokio::test]
	async fn plain_http_is_refused_when_policy_demands() {
		let transport = Transport {
			client: reqwest::Client::new(),
			allow_only_ssl: true,
		};
		let result = transport
			.post_json("http://consumer.example/callback", &serde_json::json!({}))
			.await;
		assert!(matches!(result, Err(TaskError::Network(_))));
	}
}
