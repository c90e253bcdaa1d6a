use async_trait::async_trait;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

use crate::error::TaskError;
use crate::store::TaskStore;
use crate::task::{TaskRecord, TaskSpec};

/// Execution context handed to an action handler. Besides the task record
/// itself it gives access to the sibling contract (`prev_output`), the
/// enclosing task's input, and lets the handler declare a subtree to run
/// under the current task.
pub struct TaskContext {
	pub task: TaskRecord,
	store: Arc<dyn TaskStore>,
	children: Vec<TaskSpec>,
	parent_output: Option<Value>,
}

impl TaskContext {
	pub(crate) fn new(task: TaskRecord, store: Arc<dyn TaskStore>) -> Self {
		TaskContext { task, store, children: Vec::new(), parent_output: None }
	}

	pub fn input(&self) -> &Value {
		&self.task.input
	}

	pub fn sender_cert(&self) -> &str {
		&self.task.sender_cert
	}

	/// Queue a subtree under the current task. Subtrees added during
	/// `execute` run in order after it returns; the task only finishes once
	/// they all have.
	pub fn add(&mut self, spec: impl Into<TaskSpec>) {
		self.children.push(spec.into());
	}

	/// Output of the sibling directly before this task within a sequential
	/// composite. This is the data contract between adjacent steps.
	pub async fn prev_output(&self) -> Result<Value, TaskError> {
		let prev = self
			.store
			.prev_sibling(&self.task)
			.await
			.map_err(TaskError::storage)?
			.ok_or_else(|| TaskError::invariant("task has no previous sibling"))?;
		Ok(prev.output)
	}

	/// Input of the task this one was added under.
	pub async fn parent_input(&self) -> Result<Value, TaskError> {
		let parent_id = self
			.task
			.parent_id
			.ok_or_else(|| TaskError::invariant("task has no parent"))?;
		let parent = self
			.store
			.get(parent_id)
			.await
			.map_err(TaskError::storage)?
			.ok_or_else(|| TaskError::invariant("parent task not found"))?;
		Ok(parent.input)
	}

	/// Stage an output value for the enclosing task; it is persisted when
	/// the handler returns successfully. Used by continuation steps that
	/// compute the result their parent reports back to its sender.
	pub fn set_parent_output(&mut self, output: Value) {
		self.parent_output = Some(output);
	}

	pub(crate) fn into_effects(self) -> (Vec<TaskSpec>, Option<Value>) {
		(self.children, self.parent_output)
	}
}

/// A unit of work bound to an (action, queue) pair.
///
/// `on_error` runs when this task, or any task in the subtree below it,
/// ends in error, as the failure walks up towards the tree root; top-level
/// protocol handlers use it for the user-visible failure callback and for
/// releasing the work-queue slot. The default is a no-op.
#[async_trait]
pub trait ActionHandler: Send + Sync {
	async fn execute(&self, ctx: &mut TaskContext) -> Result<Option<Value>, TaskError>;

	async fn on_error(&self, _ctx: &TaskContext, _error: &TaskError) {}
}

#[derive(Default)]
pub struct HandlerRegistry {
	handlers: HashMap<(String, String), Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		&mut self,
		queue: impl Into<String>,
		action: impl Into<String>,
		handler: Arc<dyn ActionHandler>,
	) {
		self.handlers.insert((queue.into(), action.into()), handler);
	}

	pub fn get(&self, queue: &str, action: &str) -> Option<Arc<dyn ActionHandler>> {
		self.handlers.get(&(queue.to_string(), action.to_string())).cloned()
	}
}
