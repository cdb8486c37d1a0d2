use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, CONTENT_TYPE,
};
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use log::{error, info};
use serde_json::json;

use crate::connection::handle_connection;
use crate::error::BrokerError;
use crate::state::SharedState;

fn decode_path_segment(seg: &str) -> String {
    match urlencoding::decode(seg) {
        Ok(s) => s.into_owned(),
        Err(_) => seg.to_string(),
    }
}

fn respond(status: StatusCode, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

fn json_response(value: serde_json::Value) -> Response<Body> {
    let mut resp = respond(StatusCode::OK, Body::from(value.to_string()));
    resp.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

fn with_cors(mut resp: Response<Body>, state: &SharedState) -> Response<Body> {
    let headers = resp.headers_mut();
    match HeaderValue::from_str(&state.config.client_url) {
        Ok(origin) => {
            headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        Err(e) => error!("CLIENT_URL is not a valid header value: {}", e),
    }
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Content-Type"));
    resp
}

// ============================================
// Presence API
// ============================================

async fn handle_presence_request(req: &Request<Body>, state: &SharedState) -> Response<Body> {
    if req.method() != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, Body::from("Method not allowed"));
    }

    let path_parts: Vec<&str> = req.uri().path().trim_end_matches('/').split('/').collect();

    match path_parts.as_slice() {
        // GET /api/presence - everyone currently connected
        ["", "api", "presence"] => json_response(json!(state.registry.online_users().await)),
        // GET /api/presence/{userId}
        ["", "api", "presence", user] => {
            let user_id = decode_path_segment(user);
            let is_online = state.registry.is_online(&user_id).await;
            json_response(json!({ "userId": user_id, "isOnline": is_online }))
        }
        _ => respond(StatusCode::NOT_FOUND, Body::from("API endpoint not found")),
    }
}

// ============================================
// Main Request Handler
// ============================================

pub async fn handle_request(
    mut req: Request<Body>,
    state: SharedState,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    // CORS preflight from the web client
    if req.method() == Method::OPTIONS {
        let mut resp = with_cors(respond(StatusCode::NO_CONTENT, Body::empty()), &state);
        resp.headers_mut().insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("86400"));
        return Ok(resp);
    }

    if req.uri().path() == "/health" {
        return Ok(with_cors(respond(StatusCode::OK, Body::from("ok")), &state));
    }

    if req.uri().path().starts_with("/api/presence") {
        let resp = handle_presence_request(&req, &state).await;
        return Ok(with_cors(resp, &state));
    }

    // WebSocket upgrade on any other path
    if hyper_tungstenite::is_upgrade_request(&req) {
        return match hyper_tungstenite::upgrade(&mut req, None) {
            Ok((response, websocket)) => {
                tokio::spawn(async move {
                    match websocket.await {
                        Ok(ws) => handle_connection(ws, remote_addr, state).await,
                        Err(e) => error!("WebSocket handshake with {} failed: {}", remote_addr, e),
                    }
                });
                Ok(response)
            }
            Err(e) => {
                error!("WebSocket upgrade error: {}", e);
                let body = Body::from("Invalid WebSocket upgrade request");
                Ok(with_cors(respond(StatusCode::BAD_REQUEST, body), &state))
            }
        };
    }

    Ok(with_cors(
        respond(
            StatusCode::NOT_FOUND,
            Body::from("Not found. Use /health, /api/presence, or upgrade to WebSocket."),
        ),
        &state,
    ))
}

/// Runs the HTTP/WebSocket server on an already-bound listener until it fails.
pub async fn serve(listener: std::net::TcpListener, state: SharedState) -> Result<(), BrokerError> {
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let state = state.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, state.clone(), remote_addr)
            }))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);

    info!("Signaling server listening on http://{}", addr);
    info!("WebSocket endpoint: ws://{}", addr);
    info!("Health check: http://{}/health", addr);

    server.await?;
    Ok(())
}
