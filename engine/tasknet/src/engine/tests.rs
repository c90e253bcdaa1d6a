use super::*;
use crate::store::MemoryTaskStore;
use crate::task::{ExternalSpec, ParallelSpec, SequentialSpec, SimpleSpec, SynchronizedSpec};
use async_trait::async_trait;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

type Log = Arc<StdMutex<Vec<String>>>;

fn test_engine(queues: &[(&str, usize)]) -> TaskEngine {
	let bounds: HashMap<String, usize> =
		queues.iter().map(|(name, threads)| (name.to_string(), *threads)).collect();
	TaskEngine::new(
		Arc::new(MemoryTaskStore::new()),
		Transport::insecure(),
		NodeIdentity {
			root_url: "https://node-a.test/api/queues".to_string(),
			cert_pem: "CERT-A".to_string(),
		},
		&bounds,
	)
}

async fn wait_settled(engine: &TaskEngine, id: TaskId) -> TaskRecord {
	for _ in 0..300 {
		let task = engine.store().get(id).await.unwrap().unwrap();
		if task.status.is_terminal() {
			return task;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("task {id} did not settle");
}

async fn wait_status(engine: &TaskEngine, id: TaskId, status: TaskStatus) -> TaskRecord {
	for _ in 0..300 {
		let task = engine.store().get(id).await.unwrap().unwrap();
		if task.status == status {
			return task;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("task {id} never reached {}", status.as_str());
}

/// Records its name and finishes with `{"step": <name>}`.
struct Step {
	name: &'static str,
	log: Log,
}

#[async_trait]
impl ActionHandler for Step {
	async fn execute(&self, _ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		self.log.lock().unwrap().push(self.name.to_string());
		Ok(Some(json!({ "step": self.name })))
	}
}

/// Records the previous sibling's output, exercising the adjacent-step
/// contract.
struct CheckPrev {
	log: Log,
}

#[async_trait]
impl ActionHandler for CheckPrev {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		let prev = ctx.prev_output().await?;
		self.log
			.lock()
			.unwrap()
			.push(format!("prev={}", prev["step"].as_str().unwrap_or("?")));
		Ok(None)
	}
}

struct Fails;

#[async_trait]
impl ActionHandler for Fails {
	async fn execute(&self, _ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		Err(TaskError::invariant("boom"))
	}
}

/// Root handler that expands into a given subtree and records failures
/// propagated up to it.
struct Root {
	subtree: StdMutex<Option<TaskSpec>>,
	log: Log,
}

impl Root {
	fn new(subtree: TaskSpec, log: Log) -> Arc<Self> {
		Arc::new(Root { subtree: StdMutex::new(Some(subtree)), log })
	}
}

#[async_trait]
impl ActionHandler for Root {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
		self.log.lock().unwrap().push("root".to_string());
		let subtree = self.subtree.lock().unwrap().take().expect("root executed twice");
		ctx.add(subtree);
		Ok(None)
	}

	async fn on_error(&self, _ctx: &TaskContext, error: &TaskError) {
		self.log.lock().unwrap().push(format!("on_error:{error}"));
	}
}

fn launch_spec() -> TaskSpec {
	SimpleSpec::local("root", "launch_task", json!({})).into()
}

#[tokio::test]
async fn sequential_children_run_in_order_with_sibling_contract() {
	let engine = test_engine(&[("launch_task", 1), ("orchestra", 2)]);
	let log: Log = Default::default();

	let mut seq = SequentialSpec::new();
	seq.add(SimpleSpec::local("step_a", "orchestra", json!({})));
	seq.add(SimpleSpec::local("check_prev", "orchestra", json!({})));

	engine.register("launch_task", "root", Root::new(seq.into(), log.clone()));
	engine.register("orchestra", "step_a", Arc::new(Step { name: "step_a", log: log.clone() }));
	engine.register("orchestra", "check_prev", Arc::new(CheckPrev { log: log.clone() }));

	let root_id = engine.launch(launch_spec()).await.unwrap();
	let root = wait_settled(&engine, root_id).await;

	assert_eq!(root.status, TaskStatus::Finished);
	assert_eq!(
		*log.lock().unwrap(),
		vec!["root".to_string(), "step_a".to_string(), "prev=step_a".to_string()]
	);
}

#[tokio::test]
async fn parallel_composite_finishes_once_all_children_settle() {
	let engine = test_engine(&[("launch_task", 1), ("orchestra", 4)]);
	let log: Log = Default::default();

	let mut par = ParallelSpec::new();
	par.add(SimpleSpec::local("step_a", "orchestra", json!({})));
	par.add(SimpleSpec::local("step_b", "orchestra", json!({})));

	engine.register("launch_task", "root", Root::new(par.into(), log.clone()));
	engine.register("orchestra", "step_a", Arc::new(Step { name: "step_a", log: log.clone() }));
	engine.register("orchestra", "step_b", Arc::new(Step { name: "step_b", log: log.clone() }));

	let root_id = engine.launch(launch_spec()).await.unwrap();
	let root = wait_settled(&engine, root_id).await;
	assert_eq!(root.status, TaskStatus::Finished);

	// The fan-out composite aggregates child outputs in sibling order.
	let children = engine.store().children(root_id).await.unwrap();
	assert_eq!(children.len(), 1);
	assert_eq!(children[0].kind, TaskKind::Parallel);
	assert_eq!(
		children[0].output,
		json!([{ "step": "step_a" }, { "step": "step_b" }])
	);
}

#[tokio::test]
async fn synchronized_barrier_aborts_on_child_error() {
	let engine = test_engine(&[("launch_task", 1), ("orchestra", 4)]);
	let log: Log = Default::default();

	let mut sync = SynchronizedSpec::new();
	sync.add(SimpleSpec::local("step_a", "orchestra", json!({})));
	sync.add(SimpleSpec::local("fails", "orchestra", json!({})));

	engine.register("launch_task", "root", Root::new(sync.into(), log.clone()));
	engine.register("orchestra", "step_a", Arc::new(Step { name: "step_a", log: log.clone() }));
	engine.register("orchestra", "fails", Arc::new(Fails));

	let root_id = engine.launch(launch_spec()).await.unwrap();
	let root = wait_settled(&engine, root_id).await;

	assert_eq!(root.status, TaskStatus::Error);
	assert_eq!(root.output["reason"], "boom");
	assert!(log.lock().unwrap().iter().any(|line| line == "on_error:boom"));
}

#[tokio::test]
async fn external_rejection_halts_the_following_step() {
	let engine = test_engine(&[("launch_task", 1), ("orchestra", 2)]);
	let log: Log = Default::default();

	struct CheckApproval;

	#[async_trait]
	impl ActionHandler for CheckApproval {
		async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
			if ctx.prev_output().await? != json!({ "status": "accepted" }) {
				return Err(TaskError::NotAccepted);
			}
			Ok(None)
		}
	}

	let mut seq = SequentialSpec::new();
	seq.add(ExternalSpec::new("approve_election", json!({ "Title": "test" })));
	seq.add(SimpleSpec::local("check_approval", "orchestra", json!({})));

	engine.register("launch_task", "root", Root::new(seq.into(), log.clone()));
	engine.register("orchestra", "check_approval", Arc::new(CheckApproval));

	let root_id = engine.launch(launch_spec()).await.unwrap();

	// The external task suspends until an operator decides.
	let children = {
		let mut external = None;
		for _ in 0..300 {
			let composites = engine.store().children(root_id).await.unwrap();
			if let Some(seq) = composites.first() {
				let inner = engine.store().children(seq.id).await.unwrap();
				if let Some(task) =
					inner.iter().find(|task| task.kind == TaskKind::External).cloned()
				{
					if task.status == TaskStatus::Waiting {
						external = Some((seq.id, task));
						break;
					}
				}
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		external.expect("external task never suspended")
	};
	let (_, external) = children;
	assert_eq!(external.label, "approve_election");

	engine.decide_external(external.id, false).await.unwrap();

	let root = wait_settled(&engine, root_id).await;
	assert_eq!(root.status, TaskStatus::Error);
	assert_eq!(root.output["reason"], "task not accepted");

	// The external task itself finished; the rejection surfaced in the
	// step that inspected it.
	let external = engine.store().get(external.id).await.unwrap().unwrap();
	assert_eq!(external.status, TaskStatus::Finished);
	assert_eq!(external.output, json!({ "status": "rejected" }));
}

#[tokio::test]
async fn bounded_queue_serializes_its_tasks() {
	let engine = test_engine(&[("launch_task", 1), ("mixnet_queue", 1)]);
	let log: Log = Default::default();
	let spans: Arc<StdMutex<Vec<(Instant, Instant)>>> = Default::default();

	struct Timed {
		spans: Arc<StdMutex<Vec<(Instant, Instant)>>>,
	}

	#[async_trait]
	impl ActionHandler for Timed {
		async fn execute(&self, _ctx: &mut TaskContext) -> Result<Option<Value>, TaskError> {
			let started = Instant::now();
			tokio::time::sleep(Duration::from_millis(40)).await;
			self.spans.lock().unwrap().push((started, Instant::now()));
			Ok(None)
		}
	}

	let mut par = ParallelSpec::new();
	par.add(SimpleSpec::local("keygen", "mixnet_queue", json!({})));
	par.add(SimpleSpec::local("keygen", "mixnet_queue", json!({})));

	engine.register("launch_task", "root", Root::new(par.into(), log.clone()));
	engine.register("mixnet_queue", "keygen", Arc::new(Timed { spans: spans.clone() }));

	let root_id = engine.launch(launch_spec()).await.unwrap();
	wait_settled(&engine, root_id).await;

	let spans = spans.lock().unwrap();
	assert_eq!(spans.len(), 2);
	let (first, second) =
		if spans[0].0 <= spans[1].0 { (spans[0], spans[1]) } else { (spans[1], spans[0]) };
	assert!(first.1 <= second.0, "tasks on a single-thread queue overlapped");
}

#[tokio::test]
async fn restart_recovery_resumes_crashed_tasks() {
	let engine = test_engine(&[("launch_task", 1), ("orchestra", 2)]);
	let log: Log = Default::default();
	engine.register("orchestra", "step_a", Arc::new(Step { name: "step_a", log: log.clone() }));

	// Simulate a task that was mid-flight when the previous process died.
	let crashed = TaskRecord {
		id: Uuid::new_v4(),
		kind: TaskKind::Simple,
		status: TaskStatus::Executing,
		action: "step_a".to_string(),
		queue: "orchestra".to_string(),
		input: json!({}),
		output: Value::Null,
		sender_url: engine.identity().root_url.clone(),
		sender_cert: engine.identity().cert_pem.clone(),
		receiver_url: engine.identity().root_url.clone(),
		receiver_cert: engine.identity().cert_pem.clone(),
		parent_id: None,
		order_index: 0,
		label: String::new(),
		created_at: Utc::now(),
	};
	engine.store().insert(&crashed).await.unwrap();

	assert_eq!(engine.recover().await.unwrap(), 1);
	let task = wait_settled(&engine, crashed.id).await;
	assert_eq!(task.status, TaskStatus::Finished);
	assert_eq!(*log.lock().unwrap(), vec!["step_a".to_string()]);
}

#[tokio::test]
async fn unknown_action_fails_the_task() {
	let engine = test_engine(&[("launch_task", 1)]);
	let root_id = engine
		.launch(SimpleSpec::local("no_such_action", "launch_task", json!({})).into())
		.await
		.unwrap();
	let root = wait_settled(&engine, root_id).await;
	assert_eq!(root.status, TaskStatus::Error);
}

#[tokio::test]
async fn external_decision_is_single_shot() {
	let engine = test_engine(&[("launch_task", 1)]);
	let root_id = engine
		.launch(ExternalSpec::new("approve", json!({})).into())
		.await
		.unwrap();
	wait_status(&engine, root_id, TaskStatus::Waiting).await;

	engine.decide_external(root_id, true).await.unwrap();
	assert!(engine.decide_external(root_id, false).await.is_err());

	let task = engine.store().get(root_id).await.unwrap().unwrap();
	assert_eq!(task.output, json!({ "status": "accepted" }));
}
