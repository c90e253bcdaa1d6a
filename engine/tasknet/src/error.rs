use thiserror::Error;

/// Failure classes a task can report. The reason string travels in the
/// task's output data and, for federated tasks, back to the sender node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
	#[error("invalid {0} parameter")]
	Validation(String),
	#[error("{0}")]
	Authorization(String),
	#[error("{0}")]
	Invariant(String),
	#[error("error executing vfork")]
	Subprocess(String),
	#[error("{0}")]
	Network(String),
	#[error("task not accepted")]
	NotAccepted,
	#[error("{0}")]
	HashMismatch(String),
	#[error("{0}")]
	Storage(String),
	/// A failure relayed from a child task or a peer node; carries only
	/// the reported reason.
	#[error("{0}")]
	Reported(String),
}

impl TaskError {
	pub fn validation(field: impl Into<String>) -> Self {
		TaskError::Validation(field.into())
	}

	pub fn invariant(reason: impl Into<String>) -> Self {
		TaskError::Invariant(reason.into())
	}

	pub fn storage(error: impl std::fmt::Display) -> Self {
		TaskError::Storage(error.to_string())
	}

	/// The user-facing reason, as reported in output data and callbacks.
	pub fn reason(&self) -> String {
		self.to_string()
	}
}

impl From<anyhow::Error> for TaskError {
	fn from(error: anyhow::Error) -> Self {
		TaskError::Storage(format!("{error:#}"))
	}
}
