//! End-to-end protocol runs on a single-authority node: the director and
//! performer roles both live here, the mixnet is faked with an
//! implementation that writes the artifacts the real one would, and the
//! consumer (callback sink and ballot bundle server) is a local HTTP
//! server.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::{
	fs,
	path::Path,
	sync::{Arc, Mutex},
	time::Duration,
};
use warp::Filter;

use orchestra_engine::{
	api,
	app::{self, App},
	artifacts,
	db::{memory::MemoryStore, Store},
	hashing,
	mixnet::Mixnet,
	models::ElectionStatus,
	proc::ProcError,
	settings::Settings,
};
use tasknet::{MemoryTaskStore, Transport};

struct FakeMixnet {
	fail_mix: bool,
}

fn io_error(error: std::io::Error) -> ProcError {
	ProcError::Io { program: "fake-mixnet".to_string(), source: error }
}

fn copy_artifact(dir: &Path, from: &str, to: &str) -> Result<(), ProcError> {
	fs::copy(dir.join(from), dir.join(to)).map_err(io_error)?;
	Ok(())
}

#[async_trait]
impl Mixnet for FakeMixnet {
	async fn gen_protocol_info(
		&self,
		session_id: &str,
		name: &str,
		num_parties: u32,
		threshold: u32,
		dir: &Path,
	) -> Result<(), ProcError> {
		fs::write(
			dir.join("stub.xml"),
			format!(
				"<stub sid=\"{session_id}\" name=\"{name}\" \
				 parties=\"{num_parties}\" threshold=\"{threshold}\"/>"
			),
		)
		.map_err(io_error)
	}

	async fn gen_private_info(&self, auth_name: &str, dir: &Path) -> Result<(), ProcError> {
		fs::write(dir.join("localProtInfo.xml"), format!("<protInfo party=\"{auth_name}\"/>"))
			.map_err(io_error)?;
		fs::write(dir.join("privInfo.xml"), format!("<privInfo party=\"{auth_name}\"/>"))
			.map_err(io_error)
	}

	async fn merge(&self, protinfo_files: &[String], dir: &Path) -> Result<(), ProcError> {
		let mut merged = String::from("<merged>");
		for file in protinfo_files {
			merged.push_str(&fs::read_to_string(dir.join(file)).map_err(io_error)?);
		}
		merged.push_str("</merged>");
		fs::write(dir.join("protInfo.xml"), merged).map_err(io_error)
	}

	async fn gen_public_key(&self, dir: &Path) -> Result<(), ProcError> {
		fs::write(dir.join("publicKey_raw"), b"raw-public-key").map_err(io_error)
	}

	async fn mix(&self, dir: &Path) -> Result<(), ProcError> {
		if self.fail_mix {
			return Err(ProcError::TimedOut {
				program: "vmn".to_string(),
				after: Duration::from_secs(5 * 3600),
			});
		}
		copy_artifact(dir, "ciphertexts_raw", "plaintexts_raw")?;
		let proofs = dir.join("dir").join("roProof");
		fs::create_dir_all(&proofs).map_err(io_error)?;
		fs::write(proofs.join("proof.txt"), b"proof-of-shuffle").map_err(io_error)
	}

	async fn reset(&self, _dir: &Path) -> Result<(), ProcError> {
		Ok(())
	}

	async fn verify(&self, _protinfo: &Path, _proofs: &Path) -> Result<String, ProcError> {
		Ok("Verification completed SUCCESSFULLY after 0 ms".to_string())
	}

	async fn convert_pkey_to_json(&self, dir: &Path) -> Result<(), ProcError> {
		fs::write(dir.join("publicKey_json"), r#"{"p": "167", "g": "3", "y": "133"}"#)
			.map_err(io_error)
	}

	async fn convert_ciphertexts_to_raw(&self, dir: &Path) -> Result<(), ProcError> {
		copy_artifact(dir, "ciphertexts_json", "ciphertexts_raw")
	}

	async fn convert_plaintexts_to_json(&self, dir: &Path) -> Result<(), ProcError> {
		copy_artifact(dir, "plaintexts_raw", "plaintexts_json")
	}
}

struct TestNode {
	app: Arc<App>,
	callbacks: Arc<Mutex<Vec<Value>>>,
	bundle: Arc<Mutex<String>>,
	consumer_url: String,
	_tmp: tempfile::TempDir,
}

async fn start_node(autoaccept: bool, fail_mix: bool) -> TestNode {
	let tmp = tempfile::tempdir().unwrap();
	let mut settings =
		Settings::new_test(tmp.path().join("private"), tmp.path().join("public"));
	settings.autoaccept_requests = autoaccept;
	settings.ssl.cert_string = Some("CERT-SELF".to_string());
	let settings = Arc::new(settings);

	let app = app::build(
		settings,
		Arc::new(MemoryStore::new()),
		Arc::new(MemoryTaskStore::new()),
		Transport::insecure(),
		Arc::new(FakeMixnet { fail_mix }),
	);

	// The consumer: a callback sink and the ballot bundle download.
	let callbacks: Arc<Mutex<Vec<Value>>> = Default::default();
	let bundle: Arc<Mutex<String>> = Default::default();
	let callback_log = callbacks.clone();
	let callback_route = warp::post()
		.and(warp::path("cb"))
		.and(warp::body::json())
		.map(move |body: Value| {
			callback_log.lock().unwrap().push(body);
			warp::reply::with_status("", warp::http::StatusCode::ACCEPTED)
		});
	let served_bundle = bundle.clone();
	let votes_route = warp::get()
		.and(warp::path("votes"))
		.map(move || served_bundle.lock().unwrap().clone());

	let (address, server) =
		warp::serve(callback_route.or(votes_route)).bind_ephemeral(([127, 0, 0, 1], 0));
	tokio::spawn(server);

	TestNode {
		app,
		callbacks,
		bundle,
		consumer_url: format!("http://{address}"),
		_tmp: tmp,
	}
}

fn election_request(node: &TestNode, election_id: i64, questions: usize) -> Value {
	let questions: Vec<Value> = (0..questions)
		.map(|i| {
			json!({
				"question": format!("Question {i}"),
				"answers": [
					{ "id": 0, "text": "Alice" },
					{ "id": 1, "text": "Bob" },
				],
			})
		})
		.collect();
	json!({
		"id": election_id,
		"title": "Test Election",
		"description": "integration test election",
		"callback_url": format!("{}/cb", node.consumer_url),
		"authorities": [{
			"name": "self",
			"orchestra_url": node.app.settings.root_url,
			"ssl_cert": "CERT-SELF",
		}],
		"questions": questions,
	})
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
	for _ in 0..500 {
		if condition() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("timed out waiting for {what}");
}

/// The queue slot is released just after the final callback is posted, so
/// give the gate a moment to delete the active row.
async fn wait_queue_drained(node: &TestNode) {
	for _ in 0..250 {
		if node.app.store.queue_jobs().await.unwrap().is_empty() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	panic!("work queue never drained");
}

async fn create_election(node: &TestNode, election_id: i64, questions: usize) -> Value {
	let filter = api::routes(node.app.clone()).recover(api::handle_rejection);
	let response = warp::test::request()
		.method("POST")
		.path("/election")
		.json(&election_request(node, election_id, questions))
		.reply(&filter)
		.await;
	assert_eq!(response.status(), warp::http::StatusCode::ACCEPTED);
	let body: Value = serde_json::from_slice(response.body()).unwrap();
	assert!(body["queue_id"].is_i64());

	let callbacks = node.callbacks.clone();
	wait_for("election callback", || !callbacks.lock().unwrap().is_empty()).await;
	node.callbacks.lock().unwrap().remove(0)
}

async fn submit_tally(node: &TestNode, election_id: i64, votes_hash: &str) -> Value {
	let filter = api::routes(node.app.clone()).recover(api::handle_rejection);
	let response = warp::test::request()
		.method("POST")
		.path("/tally")
		.json(&json!({
			"election_id": election_id,
			"callback_url": format!("{}/cb", node.consumer_url),
			"votes_url": format!("{}/votes", node.consumer_url),
			"votes_hash": votes_hash,
		}))
		.reply(&filter)
		.await;
	assert_eq!(response.status(), warp::http::StatusCode::ACCEPTED);

	let callbacks = node.callbacks.clone();
	wait_for("tally callback", || !callbacks.lock().unwrap().is_empty()).await;
	node.callbacks.lock().unwrap().remove(0)
}

fn ballot_bundle(columns: &[&[&str]]) -> String {
	// columns[q][ballot]: choices for question q.
	let ballots = columns[0].len();
	(0..ballots)
		.map(|ballot| {
			let choices: Vec<Value> =
				columns.iter().map(|column| json!({ "alpha": column[ballot] })).collect();
			json!({ "choices": choices, "proofs": [] }).to_string() + "\n"
		})
		.collect()
}

#[tokio::test]
async fn election_creation_then_tally_happy_path() {
	let node = start_node(true, false).await;

	// ── creation ──
	let callback = create_election(&node, 42, 2).await;
	assert_eq!(callback["status"], "finished");
	assert_eq!(callback["reference"]["election_id"], 42);
	assert_eq!(callback["reference"]["action"], "POST /election");
	let session_data = callback["session_data"].as_array().unwrap();
	assert_eq!(session_data.len(), 2);
	for entry in session_data {
		for field in ["p", "g", "y"] {
			assert!(entry["pubkey"][field].is_string(), "pubkey misses {field}");
		}
	}

	let sessions = node.app.store.sessions(42).await.unwrap();
	assert_eq!(sessions.len(), 2);
	for session in &sessions {
		let private_key = fs::read(
			node.app.layout.session_private_dir(42, &session.id).join("publicKey_json"),
		)
		.unwrap();
		let public_key = fs::read(
			node.app.layout.session_public_dir(42, &session.id).join("publicKey_json"),
		)
		.unwrap();
		assert_eq!(private_key, public_key);
	}
	wait_queue_drained(&node).await;
	assert_eq!(
		node.app.store.election(42).await.unwrap().unwrap().status,
		ElectionStatus::Created
	);

	// ── tally ──
	let columns: [&[&str]; 2] = [&["a1", "a2", "a3"], &["b1", "b2", "b3"]];
	let bundle = ballot_bundle(&columns);
	*node.bundle.lock().unwrap() = bundle.clone();
	let votes_hash = hashing::ni_sha256(&hashing::hash_bytes(bundle.as_bytes()));

	let callback = submit_tally(&node, 42, &votes_hash).await;
	assert_eq!(callback["status"], "finished", "unexpected callback: {callback}");
	assert_eq!(callback["reference"]["action"], "POST /tally");

	let archive_path = node.app.layout.tally_archive_path(42);
	assert!(archive_path.exists());
	let archive_hash = hashing::hash_file(&archive_path).unwrap();
	assert_eq!(
		callback["data"]["tally_hash"].as_str().unwrap(),
		hashing::ni_sha256(&archive_hash)
	);
	assert_eq!(
		callback["data"]["tally_url"].as_str().unwrap(),
		format!("{}/42/tally.tar.gz", node.app.settings.public_data_base_url)
	);
	// The published sidecar is what the callback reported.
	assert_eq!(
		fs::read_to_string(node.app.layout.tally_hash_path(42)).unwrap().trim(),
		archive_hash
	);

	// The archive carries the per-question plaintext columns.
	let extracted = tempfile::tempdir().unwrap();
	artifacts::extract_tarball(&archive_path, extracted.path()).unwrap();
	for (question, column) in columns.iter().enumerate() {
		let session = &sessions[question];
		let plaintexts = fs::read_to_string(
			extracted.path().join(&session.id).join("plaintexts_json"),
		)
		.unwrap();
		let expected: Vec<String> =
			column.iter().map(|alpha| format!(r#"{{"alpha":"{alpha}"}}"#)).collect();
		assert_eq!(plaintexts.lines().collect::<Vec<_>>(), expected);
	}
	for root_file in ["questions_json", "ciphertexts_json", "pubkeys_json"] {
		assert!(extracted.path().join(root_file).exists(), "{root_file} missing");
	}

	assert_eq!(
		node.app.store.election(42).await.unwrap().unwrap().status,
		ElectionStatus::Tallied
	);
	wait_queue_drained(&node).await;
}

#[tokio::test]
async fn tally_with_mismatching_hash_fails_without_artifacts() {
	let node = start_node(true, false).await;
	let callback = create_election(&node, 43, 1).await;
	assert_eq!(callback["status"], "finished");

	let bundle = ballot_bundle(&[&["a1", "a2"]]);
	*node.bundle.lock().unwrap() = bundle;
	let wrong_hash =
		hashing::ni_sha256(&hashing::hash_bytes(b"definitely not the served bundle"));

	let callback = submit_tally(&node, 43, &wrong_hash).await;
	assert_eq!(callback["status"], "error");
	assert_eq!(callback["reference"]["action"], "POST /tally");
	assert_eq!(callback["data"]["message"], "invalid votes_hash");
	assert!(!node.app.layout.tally_archive_path(43).exists());
	wait_queue_drained(&node).await;
}

#[tokio::test]
async fn operator_rejection_halts_election_creation() {
	let node = start_node(false, false).await;
	let filter = api::routes(node.app.clone()).recover(api::handle_rejection);

	let response = warp::test::request()
		.method("POST")
		.path("/election")
		.json(&election_request(&node, 44, 1))
		.reply(&filter)
		.await;
	assert_eq!(response.status(), warp::http::StatusCode::ACCEPTED);

	// The protocol suspends on the approval task.
	let mut pending = Vec::new();
	for _ in 0..500 {
		pending = node.app.engine.pending_external().await.unwrap();
		if !pending.is_empty() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert!(!pending.is_empty(), "timed out waiting for the approval task");
	assert_eq!(pending[0].label, "approve_election");

	node.app.engine.decide_external(pending[0].id, false).await.unwrap();

	let callbacks = node.callbacks.clone();
	wait_for("error callback", || !callbacks.lock().unwrap().is_empty()).await;
	let callback = node.callbacks.lock().unwrap().remove(0);
	assert_eq!(callback["status"], "error");
	assert_eq!(callback["data"]["message"], "task not accepted");
	wait_queue_drained(&node).await;
}

#[tokio::test]
async fn mix_failure_reports_a_subprocess_error() {
	let node = start_node(true, true).await;
	let callback = create_election(&node, 45, 1).await;
	assert_eq!(callback["status"], "finished");

	let bundle = ballot_bundle(&[&["a1"]]);
	*node.bundle.lock().unwrap() = bundle.clone();
	let votes_hash = hashing::ni_sha256(&hashing::hash_bytes(bundle.as_bytes()));

	let callback = submit_tally(&node, 45, &votes_hash).await;
	assert_eq!(callback["status"], "error");
	assert_eq!(callback["data"]["message"], "error executing vfork");
	assert!(!node.app.layout.tally_archive_path(45).exists());
	wait_queue_drained(&node).await;
}
