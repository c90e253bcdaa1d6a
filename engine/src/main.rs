use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use std::{net::IpAddr, sync::Arc};
use tracing::info;
use warp::Filter;

use orchestra_engine::{
	api,
	app::{self, App},
	db::{postgres::PgStore, Store},
	logging,
	mixnet::{Mixnet, VforkMixnet},
	settings::{CommandLineOptions, Settings},
	tally,
};
use tasknet::{PgTaskStore, Transport};

#[derive(Parser)]
#[clap(version, about = "Multi-authority mixnet orchestration node")]
struct Cli {
	#[clap(flatten)]
	opts: CommandLineOptions,

	#[clap(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	#[clap(about = "Run the node (default)")]
	Run {
		#[clap(
			long,
			help = "Re-examine interrupted queue jobs instead of abandoning them"
		)]
		resume_queue: bool,
	},
	#[clap(name = "create-tarball", about = "Package the current tally artifacts offline")]
	CreateTarball { election_id: i64 },
	#[clap(name = "reset-tally", about = "Clear tally state so a tally can run again")]
	ResetTally { election_id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logging::init();

	let mut settings = Settings::new(cli.opts).context("invalid settings")?;
	let tls = settings.load_tls_material().context("cannot load TLS material")?;
	let settings = Arc::new(settings);

	let pool = sqlx::postgres::PgPoolOptions::new()
		.max_connections(10)
		.connect(&settings.database_url)
		.await
		.context("cannot connect to the database")?;
	let store = PgStore::new(pool.clone());
	store.bootstrap().await?;
	let task_store = PgTaskStore::new(pool);
	task_store.bootstrap().await?;

	let transport = Transport::new(tls.as_ref(), settings.allow_only_ssl_connections)?;
	let mixnet = Arc::new(VforkMixnet::new(settings.clone()));
	let app = app::build(
		settings.clone(),
		Arc::new(store),
		Arc::new(task_store),
		transport,
		mixnet,
	);

	match cli.command.unwrap_or(Command::Run { resume_queue: false }) {
		Command::Run { resume_queue } => run_node(app, resume_queue).await,
		Command::CreateTarball { election_id } => create_tarball(app, election_id).await,
		Command::ResetTally { election_id } => reset_tally(app, election_id).await,
	}
}

async fn run_node(app: Arc<App>, resume_queue: bool) -> Result<()> {
	let recovered = app.engine.recover().await?;
	if recovered > 0 {
		info!(recovered, "resumed in-flight tasks");
	}
	app.queue.start(resume_queue).await?;

	let routes = api::routes(app.clone())
		.or(tasknet::api::routes(app.engine.clone()))
		.recover(api::handle_rejection);

	let settings = &app.settings;
	let address: std::net::SocketAddr = (
		settings
			.listen
			.hostname
			.parse::<IpAddr>()
			.context("listen.hostname is not an ip address")?,
		settings.listen.port,
	)
		.into();
	info!(%address, root_url = %settings.root_url, "node listening");

	match (&settings.ssl.cert_path, &settings.ssl.key_path) {
		(Some(cert_path), Some(key_path)) => {
			let mut server = warp::serve(routes).tls().cert_path(cert_path).key_path(key_path);
			if let Some(calist_path) = &settings.ssl.calist_path {
				server = if settings.allow_only_ssl_connections {
					server.client_auth_required_path(calist_path)
				} else {
					server.client_auth_optional_path(calist_path)
				};
			}
			server.run(address).await;
		},
		_ => {
			ensure!(
				!settings.allow_only_ssl_connections,
				"allow_only_ssl_connections requires ssl.cert_path and ssl.key_path"
			);
			warp::serve(routes).run(address).await;
		},
	}
	Ok(())
}

/// Offline variant of the publication step: convert plaintexts and build
/// the deterministic archive without re-running the verify fan-out.
async fn create_tarball(app: Arc<App>, election_id: i64) -> Result<()> {
	let election = app
		.store
		.election(election_id)
		.await?
		.with_context(|| format!("election {election_id} not found"))?;
	let sessions = app.store.sessions(election_id).await?;
	ensure!(
		app.layout.election_public_dir(election_id).exists(),
		"election public path doesn't exist"
	);
	ensure!(
		!app.layout.tally_archive_path(election_id).exists(),
		"tally already exists, election_id = {election_id}"
	);

	for session in &sessions {
		let session_dir = app.layout.session_private_dir(election_id, &session.id);
		ensure!(
			session_dir.join("dir").join("roProof").exists()
				&& session_dir.join("plaintexts_raw").exists(),
			"proofs or plaintexts couldn't be verified"
		);
		let plaintexts_json = session_dir.join("plaintexts_json");
		if plaintexts_json.exists() {
			std::fs::remove_file(&plaintexts_json)?;
		}
		app.mixnet.convert_plaintexts_to_json(&session_dir).await?;
	}

	tally::write_tally_archive(&app.layout, &election, &sessions)?;
	println!("tally = {}", app.layout.tally_archive_path(election_id).display());
	Ok(())
}

async fn reset_tally(app: Arc<App>, election_id: i64) -> Result<()> {
	let sessions = app.store.sessions(election_id).await?;
	ensure!(!sessions.is_empty(), "election {election_id} not found");
	tally::reset_tally_state(&app.layout, app.mixnet.as_ref(), election_id, &sessions).await?;
	println!("tally state cleared for election {election_id}");
	Ok(())
}
