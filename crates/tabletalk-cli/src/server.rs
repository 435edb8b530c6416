//! HTTP entry point.
//!
//! `POST /` or `POST /chat` takes a chat request and returns `{response}` or
//! `{error, response}`. Every response carries permissive CORS headers so a
//! browser client can call the server directly; `OPTIONS` on any path is the
//! preflight and gets an empty 200.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use tabletalk_core::{registry, ChatReply, ChatService};

use crate::ServeArgs;

const CORS_ALLOW_HEADERS: &str = "authorization, x-client-info, apikey, content-type";
const CORS_ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const READY_FILE_VERSION: &str = "tabletalk_server_ready_v1";

pub(crate) fn cmd_serve(args: &ServeArgs, service: ChatService) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;

    let service = Arc::new(service);
    rt.block_on(serve_async(args.clone(), service))
}

async fn serve_async(args: ServeArgs, service: Arc<ChatService>) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .map_err(|e| anyhow!("serve: failed to bind {}: {e}", args.listen))?;
    let bound = listener
        .local_addr()
        .map_err(|e| anyhow!("serve: failed to read bound addr: {e}"))?;

    let config = service.config();
    info!(
        addr = %bound,
        max_tool_rounds = config.max_tool_rounds,
        allowed_hosts = ?config.allowed_hosts,
        "listening"
    );
    if let Some(path) = args.ready_file.as_ref() {
        let payload = serde_json::json!({
            "version": READY_FILE_VERSION,
            "addr": bound.to_string(),
            "pid": std::process::id(),
        });
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(path, serde_json::to_string_pretty(&payload).unwrap_or_default()) {
            warn!(path = %path.display(), error = %e, "failed to write ready file");
        }
    }

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|e| anyhow!("serve: accept failed: {e}"))?;
        let io = TokioIo::new(stream);
        let service = service.clone();

        tokio::spawn(async move {
            let handler = service_fn(move |req| handle_request(req, service.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, handler).await {
                debug!(peer = %peer, error = %e, "connection error");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    service: Arc<ChatService>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = match (&method, path.as_str()) {
        (&Method::OPTIONS, _) => empty_response(StatusCode::OK),
        (&Method::GET, "/healthz") => text_response(StatusCode::OK, "ok\n"),
        (&Method::GET, "/tools") => json_response(StatusCode::OK, &registry::tools_json()),
        (&Method::POST, "/") | (&Method::POST, "/chat") => {
            let body = req.into_body().collect().await?.to_bytes();
            chat_response(service.handle_json(&body).await)
        }
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    info!(method = %method, path = %path, status = resp.status().as_u16(), "request");
    Ok(resp)
}

fn with_cors(mut resp: Response<Full<Bytes>>) -> Response<Full<Bytes>> {
    let headers = resp.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(CORS_ALLOW_HEADERS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(CORS_ALLOW_METHODS),
    );
    resp
}

fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::new()));
    *resp.status_mut() = status;
    with_cors(resp)
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let resp = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::from_static(b"internal error"))));
    with_cors(resp)
}

fn json_bytes_response(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let resp = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap_or_else(|_| {
            Response::new(Full::new(Bytes::from_static(
                b"{\"error\":\"server_error\",\"response\":\"internal\"}",
            )))
        });
    with_cors(resp)
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{\"error\":\"serialize\"}".to_vec());
    json_bytes_response(status, body)
}

fn json_error(status: StatusCode, msg: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": msg }))
}

fn chat_response(reply: ChatReply) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    json_bytes_response(status, reply.to_json().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletalk_core::ErrorKind;

    #[test]
    fn every_response_carries_cors_headers() {
        for resp in [
            empty_response(StatusCode::OK),
            text_response(StatusCode::OK, "ok"),
            json_error(StatusCode::NOT_FOUND, "not found"),
            chat_response(ChatReply::error(ErrorKind::InvalidKey, "nope")),
        ] {
            assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
            assert_eq!(resp.headers()[ACCESS_CONTROL_ALLOW_HEADERS], CORS_ALLOW_HEADERS);
        }
    }

    #[test]
    fn chat_reply_status_is_preserved() {
        let resp = chat_response(ChatReply::error(ErrorKind::RateLimit, "slow down"));
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let resp = chat_response(ChatReply::error(ErrorKind::MissingCredentials, "need creds"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
