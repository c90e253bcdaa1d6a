use std::sync::Arc;

use tasknet::{NodeIdentity, TaskEngine, TaskStore, Transport};

use crate::artifacts::DataLayout;
use crate::callback::CallbackClient;
use crate::db::Store;
use crate::mixnet::Mixnet;
use crate::queue::WorkQueue;
use crate::settings::Settings;
use crate::{election, tally};

/// Everything a protocol handler needs, threaded explicitly rather than
/// held in globals.
pub struct App {
	pub settings: Arc<Settings>,
	pub store: Arc<dyn Store>,
	pub layout: DataLayout,
	pub mixnet: Arc<dyn Mixnet>,
	pub engine: TaskEngine,
	pub queue: WorkQueue,
	pub callbacks: CallbackClient,
}

/// Wire the node together and register every protocol action on the task
/// engine.
pub fn build(
	settings: Arc<Settings>,
	store: Arc<dyn Store>,
	task_store: Arc<dyn TaskStore>,
	transport: Transport,
	mixnet: Arc<dyn Mixnet>,
) -> Arc<App> {
	let identity = NodeIdentity {
		root_url: settings.root_url.clone(),
		cert_pem: settings.self_cert().to_string(),
	};
	let engine =
		TaskEngine::new(task_store, transport.clone(), identity, &settings.queue_bounds());
	let layout =
		DataLayout::new(settings.private_data_path.clone(), settings.public_data_path.clone());
	let queue = WorkQueue::new(store.clone(), engine.clone(), settings.clone());
	let callbacks = CallbackClient::new(transport);

	let app = Arc::new(App { settings, store, layout, mixnet, engine, queue, callbacks });
	election::register(&app);
	tally::register(&app);
	app
}
