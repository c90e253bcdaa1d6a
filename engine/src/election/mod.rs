//! The election-creation protocol: joint public key generation per
//! question, driven by the director and performed by every authority.

pub mod director;
pub mod performer;

use std::sync::Arc;

use crate::app::App;
use crate::constants::{DIRECTOR_QUEUE, LAUNCH_QUEUE, MIXNET_QUEUE, PERFORMER_QUEUE};

pub fn register(app: &Arc<App>) {
	let engine = &app.engine;
	engine.register(
		LAUNCH_QUEUE,
		"create_election",
		Arc::new(director::CreateElection { app: app.clone() }),
	);
	engine.register(
		DIRECTOR_QUEUE,
		"merge_protinfo",
		Arc::new(director::MergeProtInfo { app: app.clone() }),
	);
	engine.register(
		DIRECTOR_QUEUE,
		"return_election",
		Arc::new(director::ReturnElection { app: app.clone() }),
	);
	engine.register(
		PERFORMER_QUEUE,
		"generate_private_info",
		Arc::new(performer::GeneratePrivateInfo { app: app.clone() }),
	);
	engine.register(
		PERFORMER_QUEUE,
		"generate_private_info_vfork",
		Arc::new(performer::GeneratePrivateInfoVfork { app: app.clone() }),
	);
	engine.register(
		MIXNET_QUEUE,
		"generate_public_key",
		Arc::new(performer::GeneratePublicKey { app: app.clone() }),
	);
}
