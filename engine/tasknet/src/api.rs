use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use uuid::Uuid;
use warp::{http::StatusCode, Filter, Reply};

use crate::engine::TaskEngine;
use crate::task::{TaskEnvelope, UpdateEnvelope};

/// Routes a node mounts to take part in the federation, rooted at
/// `api/queues` (the path component every node's root url ends with):
///
/// - `POST api/queues/task` — receive a task from a peer
/// - `POST api/queues/update` — receive a completion report for a task we
///   sent out
/// - `POST api/queues/task/{id}/decision` — operator decision for a
///   suspended external task
pub fn routes(
	engine: TaskEngine,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
	let receive = {
		let engine = engine.clone();
		warp::post()
			.and(warp::path!("api" / "queues" / "task"))
			.and(warp::body::json())
			.and_then(move |envelope: TaskEnvelope| {
				let engine = engine.clone();
				async move { receive_task(engine, envelope).await }
			})
	};

	let update = {
		let engine = engine.clone();
		warp::post()
			.and(warp::path!("api" / "queues" / "update"))
			.and(warp::body::json())
			.and_then(move |envelope: UpdateEnvelope| {
				let engine = engine.clone();
				async move { receive_update(engine, envelope).await }
			})
	};

	let decision = {
		let engine = engine.clone();
		warp::post()
			.and(warp::path!("api" / "queues" / "task" / Uuid / "decision"))
			.and(warp::body::json())
			.and_then(move |task_id: Uuid, body: DecisionBody| {
				let engine = engine.clone();
				async move { receive_decision(engine, task_id, body).await }
			})
	};

	let external = warp::get()
		.and(warp::path!("api" / "queues" / "external"))
		.and_then(move || {
			let engine = engine.clone();
			async move { list_external(engine).await }
		});

	receive.or(update).or(decision).or(external)
}

#[derive(Debug, Deserialize)]
struct DecisionBody {
	status: String,
}

async fn receive_task(
	engine: TaskEngine,
	envelope: TaskEnvelope,
) -> Result<impl Reply, Infallible> {
	Ok(match engine.receive_remote(envelope).await {
		Ok(task_id) => warp::reply::with_status(
			warp::reply::json(&json!({ "task_id": task_id })),
			StatusCode::ACCEPTED,
		),
		Err(error) => warp::reply::with_status(
			warp::reply::json(&json!({ "message": format!("{error:#}") })),
			StatusCode::INTERNAL_SERVER_ERROR,
		),
	})
}

async fn receive_update(
	engine: TaskEngine,
	envelope: UpdateEnvelope,
) -> Result<impl Reply, Infallible> {
	Ok(match engine.apply_update(envelope).await {
		Ok(()) => warp::reply::with_status(warp::reply::json(&json!({})), StatusCode::ACCEPTED),
		Err(error) => warp::reply::with_status(
			warp::reply::json(&json!({ "message": format!("{error:#}") })),
			StatusCode::INTERNAL_SERVER_ERROR,
		),
	})
}

async fn list_external(engine: TaskEngine) -> Result<impl Reply, Infallible> {
	Ok(match engine.pending_external().await {
		Ok(pending) => {
			let pending: Vec<_> = pending
				.iter()
				.map(|task| {
					json!({ "id": task.id, "label": task.label, "info": task.input })
				})
				.collect();
			warp::reply::with_status(warp::reply::json(&pending), StatusCode::OK)
		},
		Err(error) => warp::reply::with_status(
			warp::reply::json(&json!({ "message": format!("{error:#}") })),
			StatusCode::INTERNAL_SERVER_ERROR,
		),
	})
}

async fn receive_decision(
	engine: TaskEngine,
	task_id: Uuid,
	body: DecisionBody,
) -> Result<impl Reply, Infallible> {
	let accepted = match body.status.as_str() {
		"accepted" => true,
		"rejected" => false,
		other =>
			return Ok(warp::reply::with_status(
				warp::reply::json(&json!({ "message": format!("invalid status {other}") })),
				StatusCode::BAD_REQUEST,
			)),
	};
	Ok(match engine.decide_external(task_id, accepted).await {
		Ok(()) => warp::reply::with_status(warp::reply::json(&json!({})), StatusCode::ACCEPTED),
		Err(error) => warp::reply::with_status(
			warp::reply::json(&json!({ "message": format!("{error:#}") })),
			StatusCode::BAD_REQUEST,
		),
	})
}
