use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::{
	collections::HashMap,
	sync::Mutex,
};

use crate::task::{TaskId, TaskRecord, TaskStatus};

/// Persistence seam for the task table. The engine is written against this
/// trait so protocol tests can run on the in-memory implementation while
/// production uses Postgres.
#[async_trait]
pub trait TaskStore: Send + Sync {
	async fn insert(&self, task: &TaskRecord) -> Result<()>;

	async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>>;

	async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<()>;

	async fn set_output(&self, id: TaskId, output: &Value) -> Result<()>;

	/// Children of a composite, ordered by `order_index`.
	async fn children(&self, parent_id: TaskId) -> Result<Vec<TaskRecord>>;

	/// The sibling directly before `task` under the same parent, if any.
	async fn prev_sibling(&self, task: &TaskRecord) -> Result<Option<TaskRecord>>;

	/// External tasks suspended awaiting an operator decision, oldest
	/// first. This is what an operator lists to find approvals to act on.
	async fn awaiting_decision(&self) -> Result<Vec<TaskRecord>>;

	/// Flip all `executing` rows to `waiting` and return them. Called once
	/// on startup: an executing row with no live worker is a crashed one.
	async fn recover_executing(&self) -> Result<Vec<TaskRecord>>;
}

#[derive(Default)]
pub struct MemoryTaskStore {
	tasks: Mutex<HashMap<TaskId, TaskRecord>>,
}

impl MemoryTaskStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
	async fn insert(&self, task: &TaskRecord) -> Result<()> {
		self.tasks.lock().unwrap().insert(task.id, task.clone());
		Ok(())
	}

	async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>> {
		Ok(self.tasks.lock().unwrap().get(&id).cloned())
	}

	async fn set_status(&self, id: TaskId, status: TaskStatus) -> Result<()> {
		if let Some(task) = self.tasks.lock().unwrap().get_mut(&id) {
			task.status = status;
		}
		Ok(())
	}

	async fn set_output(&self, id: TaskId, output: &Value) -> Result<()> {
		if let Some(task) = self.tasks.lock().unwrap().get_mut(&id) {
			task.output = output.clone();
		}
		Ok(())
	}

	async fn children(&self, parent_id: TaskId) -> Result<Vec<TaskRecord>> {
		let mut children: Vec<_> = self
			.tasks
			.lock()
			.unwrap()
			.values()
			.filter(|task| task.parent_id == Some(parent_id))
			.cloned()
			.collect();
		children.sort_by_key(|task| task.order_index);
		Ok(children)
	}

	async fn prev_sibling(&self, task: &TaskRecord) -> Result<Option<TaskRecord>> {
		let Some(parent_id) = task.parent_id else {
			return Ok(None);
		};
		Ok(self
			.tasks
			.lock()
			.unwrap()
			.values()
			.find(|other| {
				other.parent_id == Some(parent_id) && other.order_index == task.order_index - 1
			})
			.cloned())
	}

	async fn awaiting_decision(&self) -> Result<Vec<TaskRecord>> {
		let mut pending: Vec<_> = self
			.tasks
			.lock()
			.unwrap()
			.values()
			.filter(|task| {
				task.kind == crate::task::TaskKind::External
					&& task.status == TaskStatus::Waiting
			})
			.cloned()
			.collect();
		pending.sort_by_key(|task| task.created_at);
		Ok(pending)
	}

	async fn recover_executing(&self) -> Result<Vec<TaskRecord>> {
		let mut recovered = Vec::new();
		for task in self.tasks.lock().unwrap().values_mut() {
			if task.status == TaskStatus::Executing {
				task.status = TaskStatus::Waiting;
				recovered.push(task.clone());
			}
		}
		recovered.sort_by_key(|task| task.created_at);
		Ok(recovered)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Utc;
	use serde_json::json;
	use uuid::Uuid;

	use crate::task::TaskKind;

	fn record(parent: Option<TaskId>, order_index: i32) -> TaskRecord {
		TaskRecord {
			id: Uuid::new_v4(),
			kind: TaskKind::Simple,
			status: TaskStatus::Created,
			action: "noop".to_string(),
			queue: "q".to_string(),
			input: json!({}),
			output: Value::Null,
			sender_url: String::new(),
			sender_cert: String::new(),
			receiver_url: String::new(),
			receiver_cert: String::new(),
			parent_id: parent,
			order_index,
			label: String::new(),
			created_at: Utc::now(),
		}
	}

	#[tokio::test]
	async fn children_are_ordered_and_prev_sibling_resolves() {
		let store = MemoryTaskStore::new();
		let parent = record(None, 0);
		store.insert(&parent).await.unwrap();

		let first = record(Some(parent.id), 0);
		let second = record(Some(parent.id), 1);
		// Insert out of order on purpose.
		store.insert(&second).await.unwrap();
		store.insert(&first).await.unwrap();

		let children = store.children(parent.id).await.unwrap();
		assert_eq!(
			children.iter().map(|t| t.id).collect::<Vec<_>>(),
			vec![first.id, second.id]
		);

		let prev = store.prev_sibling(&second).await.unwrap().unwrap();
		assert_eq!(prev.id, first.id);
		assert!(store.prev_sibling(&first).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn recovery_flips_executing_to_waiting() {
		let store = MemoryTaskStore::new();
		let mut task = record(None, 0);
		task.status = TaskStatus::Executing;
		store.insert(&task).await.unwrap();

		let recovered = store.recover_executing().await.unwrap();
		assert_eq!(recovered.len(), 1);
		assert_eq!(
			store.get(task.id).await.unwrap().unwrap().status,
			TaskStatus::Waiting
		);
	}
}
