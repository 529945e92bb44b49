/// Chat REST API over hyper
///
/// Endpoints:
///   POST /chats      body: {"action":"create_user"}
///                          {"action":"create_chat","user_id":N}
///                          {"action":"join_chat","user_id":N,"chat_code":"..."}
///   GET  /chats      ?user_id=N
///   GET  /messages   ?chat_id=N&user_id=N   (marks the thread read)
///   POST /messages   body: {"chat_id":N,"user_id":N,"content":"..."}
///
/// Errors are `{"error": "..."}` with the status from `ChatError::status`.
use super::store::Store;
use crate::error::ChatError;
use crate::types::{ChatsRequest, JoinResponse, SendMessageRequest};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use std::convert::Infallible;
use tracing::{debug, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
pub(crate) type Resp = Response<BoxBody>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn empty_resp(status: StatusCode) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .body(Full::new(bytes::Bytes::new()).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok<T: Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

fn chat_err(err: ChatError) -> Resp {
    let status =
        StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!("Chat API request failed: {}", err);
    } else {
        debug!("Chat API request rejected: {}", err);
    }
    json_err(status, &err.to_string())
}

fn respond<T: Serialize>(result: crate::error::Result<T>) -> Resp {
    match result {
        Ok(value) => json_ok(&value),
        Err(e) => chat_err(e),
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

pub(crate) async fn handle(req: Request<hyper::body::Incoming>, store: &Store) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    // CORS preflight
    if method == Method::OPTIONS {
        return empty_resp(StatusCode::NO_CONTENT);
    }

    match (method, path.as_str()) {
        (Method::POST, "/chats") => post_chats(req, store).await,
        (Method::GET, "/chats") => get_chats(&query, store),
        (Method::GET, "/messages") => get_messages(&query, store),
        (Method::POST, "/messages") => post_message(req, store).await,
        (_, "/chats") | (_, "/messages") => {
            json_err(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn post_chats(req: Request<hyper::body::Incoming>, store: &Store) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let action: ChatsRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };

    match action {
        ChatsRequest::CreateUser => respond(store.create_user()),
        ChatsRequest::CreateChat { user_id } => respond(store.create_chat(user_id)),
        ChatsRequest::JoinChat { user_id, chat_code } => respond(
            store
                .join_chat(user_id, &chat_code)
                .map(|chat| JoinResponse {
                    success: true,
                    chat,
                }),
        ),
    }
}

fn get_chats(query: &str, store: &Store) -> Resp {
    let Some(user_id) = parse_query_u64(query, "user_id") else {
        return json_err(StatusCode::BAD_REQUEST, "user_id is required");
    };
    respond(store.list_chats(user_id))
}

fn get_messages(query: &str, store: &Store) -> Resp {
    let (Some(chat_id), Some(user_id)) = (
        parse_query_u64(query, "chat_id"),
        parse_query_u64(query, "user_id"),
    ) else {
        return json_err(StatusCode::BAD_REQUEST, "chat_id and user_id are required");
    };
    respond(store.list_messages(chat_id, user_id))
}

async fn post_message(req: Request<hyper::body::Incoming>, store: &Store) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let r: SendMessageRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    respond(store.send_message(r.chat_id, r.user_id, &r.content))
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn query_param(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return urlencoding::decode(v).ok().map(|v| v.into_owned());
            }
        }
    }
    None
}

fn parse_query_u64(query: &str, key: &str) -> Option<u64> {
    query_param(query, key)?.trim().parse().ok()
}
