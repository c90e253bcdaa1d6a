use serde::Deserialize;
use serde_json::{json, Value};
use std::{convert::Infallible, sync::Arc};
use tracing::{info, warn};
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::app::App;
use crate::db::Store;
use crate::keys::{self, EscrowError};
use crate::models::{check_election_data, check_tally_data, ElectionRequest, JobKind, TallyRequest};

/// The public HTTP surface: election and tally submission, callback test
/// sinks, an eager dequeue hook, the key-escrow operations and the public
/// artifact tree. Submissions are validated and queued; no protocol work
/// happens inline.
pub fn routes(
	app: Arc<App>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
	let public_data_path = app.settings.public_data_path.clone();

	let post_election = warp::post()
		.and(warp::path("election"))
		.and(warp::path::end())
		.and(with_app(app.clone()))
		.and(warp::body::json())
		.and_then(post_election);

	let post_tally = warp::post()
		.and(warp::path("tally"))
		.and(warp::path::end())
		.and(with_app(app.clone()))
		.and(warp::body::json())
		.and_then(post_tally);

	let receive_election = warp::post()
		.and(warp::path("receive_election"))
		.and(warp::path::end())
		.and(warp::body::json())
		.map(|body: Value| {
			info!("received election callback: {body}");
			warp::reply::with_status(warp::reply::json(&json!({})), StatusCode::ACCEPTED)
		});

	let receive_tally = warp::post()
		.and(warp::path("receive_tally"))
		.and(warp::path::end())
		.and(warp::body::json())
		.map(|body: Value| {
			info!("received tally callback: {body}");
			warp::reply::with_status(warp::reply::json(&json!({})), StatusCode::ACCEPTED)
		});

	let dequeue = warp::get()
		.and(warp::path("dequeue"))
		.and(warp::path::end())
		.and(with_app(app.clone()))
		.and_then(dequeue);

	let download_share = warp::post()
		.and(warp::path("download_private_share"))
		.and(warp::path::end())
		.and(with_app(app.clone()))
		.and(warp::body::json())
		.and_then(download_private_share);

	let check_share = warp::post()
		.and(warp::path("check_private_share"))
		.and(warp::path::end())
		.and(with_app(app.clone()))
		.and(warp::body::json())
		.and_then(check_private_share);

	let delete_share = warp::post()
		.and(warp::path("delete_private_share"))
		.and(warp::path::end())
		.and(with_app(app.clone()))
		.and(warp::body::json())
		.and_then(delete_private_share);

	let restore_share = warp::post()
		.and(warp::path("restore_private_share"))
		.and(warp::path::end())
		.and(with_app(app))
		.and(warp::body::json())
		.and_then(restore_private_share);

	let public_data = warp::path("public_data").and(warp::fs::dir(public_data_path));

	post_election
		.or(post_tally)
		.or(receive_election)
		.or(receive_tally)
		.or(dequeue)
		.or(download_share)
		.or(check_share)
		.or(delete_share)
		.or(restore_share)
		.or(public_data)
}

fn with_app(app: Arc<App>) -> impl Filter<Extract = (Arc<App>,), Error = Infallible> + Clone {
	warp::any().map(move || app.clone())
}

fn message(status: StatusCode, text: impl Into<String>) -> warp::reply::WithStatus<warp::reply::Json> {
	warp::reply::with_status(warp::reply::json(&json!({ "message": text.into() })), status)
}

async fn post_election(app: Arc<App>, body: Value) -> Result<impl Reply, Infallible> {
	let request: ElectionRequest = match serde_json::from_value(body.clone()) {
		Ok(request) => request,
		Err(_) => return Ok(message(StatusCode::BAD_REQUEST, "invalid json")),
	};
	if let Err(reason) =
		check_election_data(&request, app.settings.max_num_questions_per_election)
	{
		return Ok(message(StatusCode::BAD_REQUEST, reason));
	}
	match app.store.election_exists(request.id).await {
		Ok(false) => {},
		Ok(true) =>
			return Ok(message(
				StatusCode::BAD_REQUEST,
				format!("an election with id {} already exists", request.id),
			)),
		Err(error) =>
			return Ok(message(StatusCode::INTERNAL_SERVER_ERROR, format!("{error:#}"))),
	}
	match app.queue.submit(JobKind::Election, body).await {
		Ok(queue_id) => Ok(warp::reply::with_status(
			warp::reply::json(&json!({ "queue_id": queue_id })),
			StatusCode::ACCEPTED,
		)),
		Err(error) => Ok(message(StatusCode::INTERNAL_SERVER_ERROR, format!("{error:#}"))),
	}
}

async fn post_tally(app: Arc<App>, body: Value) -> Result<impl Reply, Infallible> {
	let request: TallyRequest = match serde_json::from_value(body.clone()) {
		Ok(request) => request,
		Err(_) => return Ok(message(StatusCode::BAD_REQUEST, "invalid json")),
	};
	if let Err(reason) = check_tally_data(&request) {
		return Ok(message(StatusCode::BAD_REQUEST, reason));
	}
	match app.queue.submit(JobKind::Tally, body).await {
		Ok(queue_id) => Ok(warp::reply::with_status(
			warp::reply::json(&json!({ "queue_id": queue_id })),
			StatusCode::ACCEPTED,
		)),
		Err(error) => Ok(message(StatusCode::INTERNAL_SERVER_ERROR, format!("{error:#}"))),
	}
}

async fn dequeue(app: Arc<App>) -> Result<impl Reply, Infallible> {
	match app.queue.dequeue().await {
		Ok(started) => Ok(warp::reply::with_status(
			warp::reply::json(&json!({ "dequeued": started })),
			StatusCode::OK,
		)),
		Err(error) => Ok(message(StatusCode::INTERNAL_SERVER_ERROR, format!("{error:#}"))),
	}
}

#[derive(Debug, Deserialize)]
struct ShareBody {
	election_id: i64,
	#[serde(default)]
	share: String,
}

fn escrow_reply(result: Result<String, EscrowError>) -> warp::reply::WithStatus<String> {
	match result {
		Ok(body) => warp::reply::with_status(body, StatusCode::OK),
		Err(EscrowError::BadRequest(reason)) =>
			warp::reply::with_status(reason, StatusCode::BAD_REQUEST),
		Err(EscrowError::Internal(reason)) => {
			warn!("escrow operation failed: {reason}");
			warp::reply::with_status(reason, StatusCode::INTERNAL_SERVER_ERROR)
		},
	}
}

async fn download_private_share(
	app: Arc<App>,
	body: ShareBody,
) -> Result<impl Reply, Infallible> {
	let result = keys::export(app.store.as_ref(), &app.layout, body.election_id).await;
	Ok(escrow_reply(result))
}

async fn check_private_share(app: Arc<App>, body: ShareBody) -> Result<impl Reply, Infallible> {
	let result = keys::check(app.store.as_ref(), &app.layout, body.election_id, &body.share)
		.await
		.map(|matches| if matches { "True".to_string() } else { "False".to_string() });
	Ok(escrow_reply(result))
}

async fn delete_private_share(app: Arc<App>, body: ShareBody) -> Result<impl Reply, Infallible> {
	let result = keys::delete(app.store.as_ref(), &app.layout, body.election_id, &body.share)
		.await
		.map(|()| String::new());
	Ok(escrow_reply(result))
}

async fn restore_private_share(
	app: Arc<App>,
	body: ShareBody,
) -> Result<impl Reply, Infallible> {
	let result = keys::restore(app.store.as_ref(), &app.layout, body.election_id, &body.share)
		.await
		.map(|()| String::new());
	Ok(escrow_reply(result))
}

/// Top-level rejection handling for the combined route set.
pub async fn handle_rejection(rejection: Rejection) -> Result<impl Reply, Infallible> {
	if rejection.is_not_found() {
		return Ok(message(StatusCode::NOT_FOUND, "not found"));
	}
	if rejection.find::<warp::filters::body::BodyDeserializeError>().is_some() {
		return Ok(message(StatusCode::BAD_REQUEST, "invalid json"));
	}
	warn!("unhandled rejection: {rejection:?}");
	Ok(message(StatusCode::INTERNAL_SERVER_ERROR, "internal error"))
}
