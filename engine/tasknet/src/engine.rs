use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use std::{
	collections::HashMap,
	sync::{Arc, RwLock},
};
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::TaskError;
use crate::handler::{ActionHandler, HandlerRegistry, TaskContext};
use crate::store::TaskStore;
use crate::task::{
	Receiver, TaskEnvelope, TaskId, TaskKind, TaskRecord, TaskSpec, TaskStatus, UpdateEnvelope,
};
use crate::transport::{certs_differ, Transport};

/// How this node is addressed and authenticated by its peers.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
	/// Base URL of this node's task endpoint (the configured root url).
	pub root_url: String,
	/// This node's PEM certificate, compared against task sender fields.
	pub cert_pem: String,
}

const DEFAULT_QUEUE_THREADS: usize = 4;

/// The federated task runtime: persists task trees, walks the
/// Simple/Parallel/Sequential/Synchronized/External algebra, dispatches leaf
/// work onto bounded queues and reports results across node boundaries.
#[derive(Clone)]
pub struct TaskEngine {
	inner: Arc<EngineInner>,
}

struct EngineInner {
	store: Arc<dyn TaskStore>,
	transport: Transport,
	identity: NodeIdentity,
	registry: RwLock<HandlerRegistry>,
	queues: HashMap<String, Arc<Semaphore>>,
	default_queue: Arc<Semaphore>,
	// Serializes task tree state transitions; handler execution and network
	// IO happen outside of it.
	state_lock: tokio::sync::Mutex<()>,
}

// Side effects gathered while the state lock is held, executed after it is
// released so handlers and transport calls can re-enter the engine.
enum Deferred {
	ExecuteLeaf {
		task: TaskRecord,
		handler: Arc<dyn ActionHandler>,
		semaphore: Arc<Semaphore>,
	},
	SendTask(TaskRecord),
	SendUpdate {
		sender_url: String,
		envelope: UpdateEnvelope,
	},
	RunOnError {
		task: TaskRecord,
		handler: Arc<dyn ActionHandler>,
		error: TaskError,
	},
}

impl TaskEngine {
	pub fn new(
		store: Arc<dyn TaskStore>,
		transport: Transport,
		identity: NodeIdentity,
		queue_bounds: &HashMap<String, usize>,
	) -> Self {
		let queues = queue_bounds
			.iter()
			.map(|(name, threads)| (name.clone(), Arc::new(Semaphore::new((*threads).max(1)))))
			.collect();
		TaskEngine {
			inner: Arc::new(EngineInner {
				store,
				transport,
				identity,
				registry: RwLock::new(HandlerRegistry::new()),
				queues,
				default_queue: Arc::new(Semaphore::new(DEFAULT_QUEUE_THREADS)),
				state_lock: tokio::sync::Mutex::new(()),
			}),
		}
	}

	pub fn register(
		&self,
		queue: impl Into<String>,
		action: impl Into<String>,
		handler: Arc<dyn ActionHandler>,
	) {
		self.inner.registry.write().unwrap().register(queue, action, handler);
	}

	pub fn identity(&self) -> &NodeIdentity {
		&self.inner.identity
	}

	pub fn transport(&self) -> &Transport {
		&self.inner.transport
	}

	pub fn store(&self) -> Arc<dyn TaskStore> {
		self.inner.store.clone()
	}

	/// Persist and start a new task tree rooted on this node.
	pub async fn launch(&self, spec: TaskSpec) -> Result<TaskId> {
		let mut deferred = Vec::new();
		let root_id = {
			let _guard = self.inner.state_lock.lock().await;
			let root_id = self.inner.persist_spec(&spec, None, 0).await?;
			self.inner.dispatch(root_id, &mut deferred).await?;
			root_id
		};
		self.run_deferred(deferred).await;
		Ok(root_id)
	}

	/// Accept a task handed over by a peer node. Idempotent on re-delivery.
	pub async fn receive_remote(&self, envelope: TaskEnvelope) -> Result<TaskId> {
		let mut deferred = Vec::new();
		let id = {
			let _guard = self.inner.state_lock.lock().await;
			if self.inner.store.get(envelope.id).await?.is_some() {
				debug!(task_id = %envelope.id, "task already known, ignoring re-delivery");
				return Ok(envelope.id);
			}
			let record = TaskRecord {
				id: envelope.id,
				kind: TaskKind::Simple,
				status: TaskStatus::Created,
				action: envelope.action,
				queue: envelope.queue,
				input: envelope.input,
				output: Value::Null,
				sender_url: envelope.sender_url,
				sender_cert: envelope.sender_cert,
				receiver_url: self.inner.identity.root_url.clone(),
				receiver_cert: self.inner.identity.cert_pem.clone(),
				parent_id: None,
				order_index: 0,
				label: String::new(),
				created_at: Utc::now(),
			};
			self.inner.store.insert(&record).await?;
			self.inner.dispatch(record.id, &mut deferred).await?;
			record.id
		};
		self.run_deferred(deferred).await;
		Ok(id)
	}

	/// Apply a completion report received from the peer that executed one
	/// of our remote tasks.
	pub async fn apply_update(&self, update: UpdateEnvelope) -> Result<()> {
		let mut deferred = Vec::new();
		{
			let _guard = self.inner.state_lock.lock().await;
			let Some(task) = self.inner.store.get(update.task_id).await? else {
				warn!(task_id = %update.task_id, "update for unknown task, ignoring");
				return Ok(());
			};
			if task.status.is_terminal() {
				debug!(task_id = %task.id, "update for settled task, ignoring");
				return Ok(());
			}
			self.inner.store.set_output(task.id, &update.output).await?;
			match update.status {
				TaskStatus::Finished => {
					self.inner.store.set_status(task.id, TaskStatus::Finished).await?;
					self.inner.after_terminal(&task, &mut deferred).await?;
				},
				TaskStatus::Error => {
					let reason = reason_from_output(&update.output);
					// The executing node already ran the action's own error
					// handler; only propagate here.
					self.inner.store.set_status(task.id, TaskStatus::Error).await?;
					if let Some(parent_id) = task.parent_id {
						self.inner
							.propagate_child_error(
								parent_id,
								TaskError::Reported(reason),
								&mut deferred,
							)
							.await?;
					}
				},
				other => {
					warn!(task_id = %task.id, status = other.as_str(), "unexpected update status");
				},
			}
		}
		self.run_deferred(deferred).await;
		Ok(())
	}

	/// Resolve an external (operator approval) task. The task completes
	/// with the decision as output either way; rejection is surfaced by
	/// whichever step inspects the decision next.
	pub async fn decide_external(&self, id: TaskId, accepted: bool) -> Result<()> {
		let mut deferred = Vec::new();
		{
			let _guard = self.inner.state_lock.lock().await;
			let task = self
				.inner
				.store
				.get(id)
				.await?
				.ok_or_else(|| anyhow!("unknown task {id}"))?;
			if task.kind != TaskKind::External {
				return Err(anyhow!("task {id} does not await an operator decision"));
			}
			if task.status.is_terminal() {
				return Err(anyhow!("task {id} has already been decided"));
			}
			let status = if accepted { "accepted" } else { "rejected" };
			self.inner.store.set_output(id, &json!({ "status": status })).await?;
			self.inner.store.set_status(id, TaskStatus::Finished).await?;
			self.inner.after_terminal(&task, &mut deferred).await?;
		}
		self.run_deferred(deferred).await;
		Ok(())
	}

	/// External tasks currently suspended on this node, for operators to
	/// inspect and decide.
	pub async fn pending_external(&self) -> Result<Vec<TaskRecord>> {
		self.inner.store.awaiting_decision().await
	}

	/// Mark a task tree as failed from outside handler execution (e.g. a
	/// transport failure noticed by a background send).
	pub async fn fail_task(&self, id: TaskId, error: TaskError) -> Result<()> {
		let mut deferred = Vec::new();
		{
			let _guard = self.inner.state_lock.lock().await;
			self.inner.fail(id, error, true, &mut deferred).await?;
		}
		self.run_deferred(deferred).await;
		Ok(())
	}

	/// Restore in-flight work after a restart: crashed `executing` rows
	/// resume as `waiting` and are re-dispatched.
	pub async fn recover(&self) -> Result<usize> {
		let mut deferred = Vec::new();
		let count = {
			let _guard = self.inner.state_lock.lock().await;
			let recovered = self.inner.store.recover_executing().await?;
			for task in &recovered {
				self.inner.dispatch(task.id, &mut deferred).await?;
			}
			recovered.len()
		};
		self.run_deferred(deferred).await;
		Ok(count)
	}

	// Leaf completion, called from the spawned worker once the handler
	// returns.
	async fn complete_leaf(
		&self,
		id: TaskId,
		children: Vec<TaskSpec>,
		parent_output: Option<Value>,
		output: Option<Value>,
	) -> Result<()> {
		let mut deferred = Vec::new();
		{
			let _guard = self.inner.state_lock.lock().await;
			let Some(task) = self.inner.store.get(id).await? else {
				return Ok(());
			};
			if let Some(output) = output {
				self.inner.store.set_output(id, &output).await?;
			}
			if let Some(parent_output) = parent_output {
				if let Some(parent_id) = task.parent_id {
					self.inner.store.set_output(parent_id, &parent_output).await?;
				}
			}
			if children.is_empty() {
				self.inner.store.set_status(id, TaskStatus::Finished).await?;
				self.inner.after_terminal(&task, &mut deferred).await?;
			} else {
				let existing = self.inner.store.children(id).await?.len() as i32;
				for (offset, spec) in children.iter().enumerate() {
					self.inner.persist_spec(spec, Some(id), existing + offset as i32).await?;
				}
				self.inner.store.set_status(id, TaskStatus::Waiting).await?;
				self.inner.advance(id, &mut deferred).await?;
			}
		}
		self.run_deferred(deferred).await;
		Ok(())
	}

	fn run_deferred<'a>(&'a self, deferred: Vec<Deferred>) -> BoxFuture<'a, ()> {
		async move {
		for action in deferred {
			match action {
				Deferred::ExecuteLeaf { task, handler, semaphore } => {
					let engine = self.clone();
					let span = info_span!(
						"task",
						action = %task.action,
						queue = %task.queue,
						task_id = %task.id
					);
					tokio::spawn(
						async move {
							let permit = semaphore
								.acquire_owned()
								.await
								.expect("queue semaphore is never closed");
							let mut ctx =
								TaskContext::new(task.clone(), engine.inner.store.clone());
							let result = handler.execute(&mut ctx).await;
							drop(permit);
							let outcome = match result {
								Ok(output) => {
									let (children, parent_output) = ctx.into_effects();
									engine
										.complete_leaf(task.id, children, parent_output, output)
										.await
								},
								Err(error) => {
									debug!(reason = %error, "task failed");
									engine.fail_task(task.id, error).await
								},
							};
							if let Err(error) = outcome {
								warn!("failed to settle task {}: {error:#}", task.id);
							}
						}
						.instrument(span),
					);
				},
				Deferred::SendTask(task) => {
					let engine = self.clone();
					tokio::spawn(async move {
						let envelope = TaskEnvelope {
							id: task.id,
							action: task.action.clone(),
							queue: task.queue.clone(),
							input: task.input.clone(),
							sender_url: engine.inner.identity.root_url.clone(),
							sender_cert: engine.inner.identity.cert_pem.clone(),
							receiver_url: task.receiver_url.clone(),
						};
						if let Err(error) =
							engine.inner.transport.send_task(&task.receiver_url, &envelope).await
						{
							warn!("failed to hand task {} to {}: {error}", task.id, task.receiver_url);
							if let Err(error) = engine.fail_task(task.id, error).await {
								warn!("failed to settle task {}: {error:#}", task.id);
							}
						}
					});
				},
				Deferred::SendUpdate { sender_url, envelope } => {
					let transport = self.inner.transport.clone();
					tokio::spawn(async move {
						// Completion reports are not retried; the sender node
						// re-examines its tree on restart.
						if let Err(error) = transport.send_update(&sender_url, &envelope).await {
							warn!(
								"failed to report task {} to {sender_url}: {error}",
								envelope.task_id
							);
						}
					});
				},
				Deferred::RunOnError { task, handler, error } => {
					let ctx = TaskContext::new(task, self.inner.store.clone());
					handler.on_error(&ctx, &error).await;
				},
			}
		}
		}
		.boxed()
	}
}

impl EngineInner {
	fn queue_semaphore(&self, name: &str) -> Arc<Semaphore> {
		match self.queues.get(name) {
			Some(semaphore) => semaphore.clone(),
			None => {
				warn!(queue = name, "no configured bound for queue, using default");
				self.default_queue.clone()
			},
		}
	}

	fn is_local(&self, task: &TaskRecord) -> bool {
		if task.receiver_url == self.identity.root_url {
			return true;
		}
		!task.receiver_cert.is_empty()
			&& !self.identity.cert_pem.is_empty()
			&& !certs_differ(&task.receiver_cert, &self.identity.cert_pem)
	}

	/// Persist a spec subtree; returns the subtree root id.
	fn persist_spec<'a>(
		&'a self,
		spec: &'a TaskSpec,
		parent_id: Option<TaskId>,
		order_index: i32,
	) -> BoxFuture<'a, Result<TaskId>> {
		async move {
			let id = Uuid::new_v4();
			let base = TaskRecord {
				id,
				kind: TaskKind::Simple,
				status: TaskStatus::Created,
				action: String::new(),
				queue: String::new(),
				input: Value::Null,
				output: Value::Null,
				sender_url: self.identity.root_url.clone(),
				sender_cert: self.identity.cert_pem.clone(),
				receiver_url: self.identity.root_url.clone(),
				receiver_cert: self.identity.cert_pem.clone(),
				parent_id,
				order_index,
				label: String::new(),
				created_at: Utc::now(),
			};
			let (record, children) = match spec {
				TaskSpec::Simple(simple) => {
					let (receiver_url, receiver_cert) = match &simple.receiver {
						Receiver::Local =>
							(self.identity.root_url.clone(), self.identity.cert_pem.clone()),
						Receiver::Remote { url, cert } => (url.clone(), cert.clone()),
					};
					(
						TaskRecord {
							action: simple.action.clone(),
							queue: simple.queue.clone(),
							input: simple.input.clone(),
							receiver_url,
							receiver_cert,
							..base
						},
						&[][..],
					)
				},
				TaskSpec::Parallel(composite) =>
					(TaskRecord { kind: TaskKind::Parallel, ..base }, composite.children.as_slice()),
				TaskSpec::Sequential(composite) => (
					TaskRecord { kind: TaskKind::Sequential, ..base },
					composite.children.as_slice(),
				),
				TaskSpec::Synchronized(composite) => (
					TaskRecord { kind: TaskKind::Synchronized, ..base },
					composite.children.as_slice(),
				),
				TaskSpec::External(external) => (
					TaskRecord {
						kind: TaskKind::External,
						label: external.label.clone(),
						input: external.info.clone(),
						..base
					},
					&[][..],
				),
			};
			self.store.insert(&record).await?;
			for (index, child) in children.iter().enumerate() {
				self.persist_spec(child, Some(id), index as i32).await?;
			}
			Ok(id)
		}
		.boxed()
	}

	/// Start or resume a task: composites advance through their children,
	/// local leaves execute on their queue, remote leaves are handed to the
	/// receiving peer, external tasks suspend awaiting a decision.
	fn dispatch<'a>(
		&'a self,
		id: TaskId,
		deferred: &'a mut Vec<Deferred>,
	) -> BoxFuture<'a, Result<()>> {
		async move {
			let Some(task) = self.store.get(id).await? else {
				return Ok(());
			};
			if task.status.is_terminal() {
				return Ok(());
			}
			match task.kind {
				TaskKind::Simple => {
					let children = self.store.children(id).await?;
					if !children.is_empty() {
						// A simple task that spawned a subtree behaves as a
						// sequential composite until the subtree completes.
						self.advance(id, deferred).await
					} else if self.is_local(&task) {
						self.execute_leaf(task, deferred).await
					} else if task.status == TaskStatus::Created {
						self.store.set_status(id, TaskStatus::Executing).await?;
						deferred.push(Deferred::SendTask(task));
						Ok(())
					} else {
						// Already handed to the peer; await its report.
						Ok(())
					}
				},
				TaskKind::External => {
					if task.status == TaskStatus::Created {
						debug!(task_id = %id, label = %task.label, "task suspended awaiting operator decision");
						self.store.set_status(id, TaskStatus::Waiting).await?;
					}
					Ok(())
				},
				TaskKind::Parallel | TaskKind::Sequential | TaskKind::Synchronized => {
					if task.status == TaskStatus::Created {
						self.store.set_status(id, TaskStatus::Executing).await?;
					}
					self.advance(id, deferred).await
				},
			}
		}
		.boxed()
	}

	async fn execute_leaf(&self, task: TaskRecord, deferred: &mut Vec<Deferred>) -> Result<()> {
		let handler = self.registry.read().unwrap().get(&task.queue, &task.action);
		match handler {
			Some(handler) => {
				let semaphore = self.queue_semaphore(&task.queue);
				self.store.set_status(task.id, TaskStatus::Executing).await?;
				deferred.push(Deferred::ExecuteLeaf { task, handler, semaphore });
				Ok(())
			},
			None => {
				let error = TaskError::invariant(format!(
					"no handler for action {} on queue {}",
					task.action, task.queue
				));
				self.fail(task.id, error, true, deferred).await
			},
		}
	}

	/// Walk a composite and either start the next runnable child or settle
	/// the composite itself.
	fn advance<'a>(
		&'a self,
		id: TaskId,
		deferred: &'a mut Vec<Deferred>,
	) -> BoxFuture<'a, Result<()>> {
		async move {
			let Some(task) = self.store.get(id).await? else {
				return Ok(());
			};
			if task.status.is_terminal() {
				return Ok(());
			}
			let children = self.store.children(id).await?;
			match task.kind {
				// A Simple task with children runs them as a sequence.
				TaskKind::Simple | TaskKind::Sequential => {
					for child in &children {
						match child.status {
							TaskStatus::Finished => continue,
							TaskStatus::Error => {
								let reason = reason_from_output(&child.output);
								return self
									.fail(id, TaskError::Reported(reason), true, deferred)
									.await;
							},
							TaskStatus::Created => {
								return self.dispatch(child.id, deferred).await;
							},
							TaskStatus::Executing | TaskStatus::Waiting => return Ok(()),
						}
					}
					self.finish_composite(&task, &children, deferred).await
				},
				TaskKind::Parallel => {
					for child in &children {
						if child.status == TaskStatus::Created {
							self.dispatch(child.id, deferred).await?;
						}
					}
					let children = self.store.children(id).await?;
					if children.iter().any(|child| !child.status.is_terminal()) {
						return Ok(());
					}
					if let Some(failed) =
						children.iter().find(|child| child.status == TaskStatus::Error)
					{
						let reason = reason_from_output(&failed.output);
						self.fail(id, TaskError::Reported(reason), true, deferred).await
					} else {
						self.finish_composite(&task, &children, deferred).await
					}
				},
				TaskKind::Synchronized => {
					// The barrier releases only when every child succeeded;
					// any child error aborts the whole composite.
					if let Some(failed) =
						children.iter().find(|child| child.status == TaskStatus::Error)
					{
						let reason = reason_from_output(&failed.output);
						return self.fail(id, TaskError::Reported(reason), true, deferred).await;
					}
					for child in &children {
						if child.status == TaskStatus::Created {
							self.dispatch(child.id, deferred).await?;
						}
					}
					let children = self.store.children(id).await?;
					if children.iter().all(|child| child.status == TaskStatus::Finished) {
						self.finish_composite(&task, &children, deferred).await
					} else {
						Ok(())
					}
				},
				TaskKind::External => Ok(()),
			}
		}
		.boxed()
	}

	async fn finish_composite(
		&self,
		task: &TaskRecord,
		children: &[TaskRecord],
		deferred: &mut Vec<Deferred>,
	) -> Result<()> {
		// Fan-out composites aggregate child outputs in sibling order; a
		// sequence keeps whatever output was set on it explicitly.
		if matches!(task.kind, TaskKind::Parallel | TaskKind::Synchronized) {
			let outputs: Vec<Value> =
				children.iter().map(|child| child.output.clone()).collect();
			self.store.set_output(task.id, &Value::Array(outputs)).await?;
		}
		self.store.set_status(task.id, TaskStatus::Finished).await?;
		debug!(task_id = %task.id, kind = task.kind.as_str(), "composite finished");
		self.after_terminal(task, deferred).await
	}

	/// A task settled on this node: wake its parent, or report across the
	/// federation boundary when it was sent to us by a peer.
	fn after_terminal<'a>(
		&'a self,
		task: &'a TaskRecord,
		deferred: &'a mut Vec<Deferred>,
	) -> BoxFuture<'a, Result<()>> {
		async move {
			if let Some(parent_id) = task.parent_id {
				return self.advance(parent_id, deferred).await;
			}
			if task.sender_url != self.identity.root_url {
				let settled = self
					.store
					.get(task.id)
					.await?
					.ok_or_else(|| anyhow!("settled task disappeared"))?;
				deferred.push(Deferred::SendUpdate {
					sender_url: task.sender_url.clone(),
					envelope: UpdateEnvelope {
						task_id: settled.id,
						status: settled.status,
						output: settled.output,
					},
				});
			}
			Ok(())
		}
		.boxed()
	}

	/// Mark a task as failed and walk the failure up the tree. Every
	/// ancestor with a registered error handler sees the failure on the way
	/// up; at the federation boundary the failure is reported to the sender.
	fn fail<'a>(
		&'a self,
		id: TaskId,
		error: TaskError,
		run_handler: bool,
		deferred: &'a mut Vec<Deferred>,
	) -> BoxFuture<'a, Result<()>> {
		async move {
			let Some(task) = self.store.get(id).await? else {
				return Ok(());
			};
			if task.status.is_terminal() {
				return Ok(());
			}
			let output = json!({ "status": "error", "reason": error.reason() });
			self.store.set_output(id, &output).await?;
			self.store.set_status(id, TaskStatus::Error).await?;

			if run_handler && !task.action.is_empty() {
				if let Some(handler) = self.registry.read().unwrap().get(&task.queue, &task.action)
				{
					deferred.push(Deferred::RunOnError {
						task: task.clone(),
						handler,
						error: error.clone(),
					});
				}
			}

			if let Some(parent_id) = task.parent_id {
				self.propagate_child_error(parent_id, error, deferred).await
			} else if task.sender_url != self.identity.root_url {
				deferred.push(Deferred::SendUpdate {
					sender_url: task.sender_url.clone(),
					envelope: UpdateEnvelope {
						task_id: task.id,
						status: TaskStatus::Error,
						output,
					},
				});
				Ok(())
			} else {
				Ok(())
			}
		}
		.boxed()
	}

	fn propagate_child_error<'a>(
		&'a self,
		parent_id: TaskId,
		error: TaskError,
		deferred: &'a mut Vec<Deferred>,
	) -> BoxFuture<'a, Result<()>> {
		async move {
			let Some(parent) = self.store.get(parent_id).await? else {
				return Ok(());
			};
			if parent.status.is_terminal() {
				return Ok(());
			}
			match parent.kind {
				// Parallel composites let the remaining children reach a
				// terminal state before settling.
				TaskKind::Parallel => {
					let children = self.store.children(parent_id).await?;
					if children.iter().all(|child| child.status.is_terminal()) {
						self.fail(parent_id, error, true, deferred).await
					} else {
						Ok(())
					}
				},
				_ => self.fail(parent_id, error, true, deferred).await,
			}
		}
		.boxed()
	}
}

fn reason_from_output(output: &Value) -> String {
	output
		.get("reason")
		.and_then(Value::as_str)
		.unwrap_or("task failed")
		.to_string()
}

#[cfg(test)]
mod tests;
