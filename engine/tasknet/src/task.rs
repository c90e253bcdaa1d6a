use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
	Simple,
	Parallel,
	Sequential,
	Synchronized,
	External,
}

impl TaskKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			TaskKind::Simple => "simple",
			TaskKind::Parallel => "parallel",
			TaskKind::Sequential => "sequential",
			TaskKind::Synchronized => "synchronized",
			TaskKind::External => "external",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"simple" => Some(TaskKind::Simple),
			"parallel" => Some(TaskKind::Parallel),
			"sequential" => Some(TaskKind::Sequential),
			"synchronized" => Some(TaskKind::Synchronized),
			"external" => Some(TaskKind::External),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
	Created,
	Executing,
	Waiting,
	Finished,
	Error,
}

impl TaskStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			TaskStatus::Created => "created",
			TaskStatus::Executing => "executing",
			TaskStatus::Waiting => "waiting",
			TaskStatus::Finished => "finished",
			TaskStatus::Error => "error",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"created" => Some(TaskStatus::Created),
			"executing" => Some(TaskStatus::Executing),
			"waiting" => Some(TaskStatus::Waiting),
			"finished" => Some(TaskStatus::Finished),
			"error" => Some(TaskStatus::Error),
			_ => None,
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, TaskStatus::Finished | TaskStatus::Error)
	}
}

/// A persisted node of a task tree. Parent and sibling links are id
/// references so a tree survives process restarts; `order_index` gives the
/// stable position among siblings (the previous sibling is the record with
/// the same parent and `order_index - 1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
	pub id: TaskId,
	pub kind: TaskKind,
	pub status: TaskStatus,
	/// Action name resolved against the handler registry. Empty for pure
	/// composites.
	pub action: String,
	/// Queue the action executes on. Empty for pure composites.
	pub queue: String,
	pub input: Value,
	pub output: Value,
	pub sender_url: String,
	pub sender_cert: String,
	pub receiver_url: String,
	pub receiver_cert: String,
	pub parent_id: Option<TaskId>,
	pub order_index: i32,
	/// Operator-facing label, used by external (approval) tasks.
	pub label: String,
	pub created_at: DateTime<Utc>,
}

impl TaskRecord {
	pub fn is_composite(&self) -> bool {
		matches!(
			self.kind,
			TaskKind::Parallel | TaskKind::Sequential | TaskKind::Synchronized
		)
	}
}

/// Where a simple task runs.
#[derive(Debug, Clone)]
pub enum Receiver {
	/// This node; resolved to the node's own url and certificate.
	Local,
	Remote { url: String, cert: String },
}

/// Declarative description of a (sub)tree, built by action handlers and
/// turned into persisted records by the engine.
#[derive(Debug, Clone)]
pub enum TaskSpec {
	Simple(SimpleSpec),
	Parallel(ParallelSpec),
	Sequential(SequentialSpec),
	Synchronized(SynchronizedSpec),
	External(ExternalSpec),
}

#[derive(Debug, Clone)]
pub struct SimpleSpec {
	pub receiver: Receiver,
	pub action: String,
	pub queue: String,
	pub input: Value,
}

impl SimpleSpec {
	pub fn local(action: impl Into<String>, queue: impl Into<String>, input: Value) -> Self {
		SimpleSpec { receiver: Receiver::Local, action: action.into(), queue: queue.into(), input }
	}

	pub fn remote(
		url: impl Into<String>,
		cert: impl Into<String>,
		action: impl Into<String>,
		queue: impl Into<String>,
		input: Value,
	) -> Self {
		SimpleSpec {
			receiver: Receiver::Remote { url: url.into(), cert: cert.into() },
			action: action.into(),
			queue: queue.into(),
			input,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ParallelSpec {
	pub children: Vec<TaskSpec>,
}

impl ParallelSpec {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, spec: impl Into<TaskSpec>) {
		self.children.push(spec.into());
	}
}

#[derive(Debug, Clone, Default)]
pub struct SequentialSpec {
	pub children: Vec<TaskSpec>,
}

impl SequentialSpec {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, spec: impl Into<TaskSpec>) {
		self.children.push(spec.into());
	}
}

#[derive(Debug, Clone, Default)]
pub struct SynchronizedSpec {
	pub children: Vec<TaskSpec>,
}

impl SynchronizedSpec {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&mut self, spec: impl Into<TaskSpec>) {
		self.children.push(spec.into());
	}
}

#[derive(Debug, Clone)]
pub struct ExternalSpec {
	pub label: String,
	pub info: Value,
}

impl ExternalSpec {
	pub fn new(label: impl Into<String>, info: Value) -> Self {
		ExternalSpec { label: label.into(), info }
	}
}

impl From<SimpleSpec> for TaskSpec {
	fn from(spec: SimpleSpec) -> Self {
		TaskSpec::Simple(spec)
	}
}

impl From<ParallelSpec> for TaskSpec {
	fn from(spec: ParallelSpec) -> Self {
		TaskSpec::Parallel(spec)
	}
}

impl From<SequentialSpec> for TaskSpec {
	fn from(spec: SequentialSpec) -> Self {
		TaskSpec::Sequential(spec)
	}
}

impl From<SynchronizedSpec> for TaskSpec {
	fn from(spec: SynchronizedSpec) -> Self {
		TaskSpec::Synchronized(spec)
	}
}

impl From<ExternalSpec> for TaskSpec {
	fn from(spec: ExternalSpec) -> Self {
		TaskSpec::External(spec)
	}
}

/// Wire form of a task crossing node boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
	pub id: TaskId,
	pub action: String,
	pub queue: String,
	pub input: Value,
	pub sender_url: String,
	pub sender_cert: String,
	pub receiver_url: String,
}

/// Wire form of a completion report sent back to the task's sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEnvelope {
	pub task_id: TaskId,
	pub status: TaskStatus,
	pub output: Value,
}
