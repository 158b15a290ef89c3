use crate::auth::AuthOutcome;
use crate::config::INTERNAL_STATS_BACKEND;
use crate::error::BackplaneError;
use crate::proxy::context::{counting_body, empty_body, full_body, BoxBody, RequestContext};
use crate::routing::{HostMatch, HostSwitch, PathMatch};
use crate::server::GatewayState;
use http::header::{HOST, REFERER, SERVER, USER_AGENT};
use http::HeaderValue;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

/// Handle one inbound HTTP request through the frontend lifecycle:
/// host-switch -> vhost path mux -> route auth -> backend dispatch ->
/// response finalize -> access-log submission.
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
    frontend_bind: String,
    host_switch: Arc<HostSwitch>,
    is_tls: bool,
    sni: Option<String>,
    server_string: String,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().as_str().to_string();
    let uri = req.uri().to_string();
    let host_header = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let mut ctx = RequestContext::new(&frontend_bind, method, uri, peer_addr.ip(), is_tls);
    ctx.log.referrer = header_str(&req, &REFERER);
    ctx.log.user_agent = header_str(&req, &USER_AGENT);
    ctx.log.http_version = format!("{:?}", req.version());

    let vhost = match host_switch.dispatch(&host_header, sni.as_deref()) {
        HostMatch::Vhost(v) => v,
        HostMatch::Forbidden => {
            let (resp, len) = error_response(StatusCode::FORBIDDEN, "forbidden");
            return Ok(finalize(resp, len, 403, &server_string, ctx, &state.log_shipper));
        }
    };
    ctx.log.vhost = vhost.domains.first().cloned().unwrap_or_default();

    let path = req.uri().path().to_string();
    let route = match vhost.mux.match_path(&path) {
        PathMatch::Route(r) => r,
        PathMatch::RedirectSlash(to) => {
            let resp = Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header("location", to)
                .body(empty_body())
                .unwrap();
            return Ok(finalize(resp, 0, 301, &server_string, ctx, &state.log_shipper));
        }
        PathMatch::NotFound => {
            let (resp, len) = error_response(StatusCode::NOT_FOUND, "not found");
            return Ok(finalize(resp, len, 404, &server_string, ctx, &state.log_shipper));
        }
    };
    ctx.log.handler_path = route.path.clone();
    ctx.log.backend_name = route.backend_name.clone();

    if let Some(auth) = &route.auth {
        let header = req
            .headers()
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if let AuthOutcome::Denied { www_authenticate } = auth.check(header) {
            let body = r#"{"error":"unauthorized"}"#;
            let resp = Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .header("www-authenticate", www_authenticate)
                .body(full_body(body))
                .unwrap();
            return Ok(finalize(resp, body.len() as u64, 401, &server_string, ctx, &state.log_shipper));
        }
    }

    if route.backend_name == INTERNAL_STATS_BACKEND {
        let snapshot = crate::stats::build_snapshot(&state);
        let body = serde_json::to_string_pretty(&snapshot).unwrap_or_default();
        let len = body.len() as u64;
        let resp = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(full_body(body))
            .unwrap();
        return Ok(finalize(resp, len, 200, &server_string, ctx, &state.log_shipper));
    }

    let Some(backend) = state.backends.get(&route.backend_name) else {
        warn!(backend = %route.backend_name, "proxy: route references unconfigured backend");
        let (resp, len) = error_response(StatusCode::SERVICE_UNAVAILABLE, "service unavailable");
        return Ok(finalize(resp, len, 503, &server_string, ctx, &state.log_shipper));
    };

    ctx.upstream_start = Some(std::time::Instant::now());
    let boxed_req = req.map(|b| b.boxed());

    let result = backend.round_trip(boxed_req).await;
    match result {
        Ok(resp) => {
            let (mut parts, body) = resp.into_parts();
            let status = parts.status.as_u16();
            if let Ok(value) = HeaderValue::from_str(&server_string) {
                parts.headers.insert(SERVER, value);
            }
            // The response body is streamed out after this function
            // returns, so the byte count isn't known yet; the wrapper
            // finishes and ships the access-log record once the last
            // chunk has actually gone out.
            let counted = counting_body(body.boxed(), ctx, status, state.log_shipper.clone());
            Ok(Response::from_parts(parts, counted))
        }
        Err(e) => {
            let status = status_for(&e);
            let msg = e.to_string();
            let (resp, len) = error_response(status, &msg);
            Ok(finalize(resp, len, status.as_u16(), &server_string, ctx, &state.log_shipper))
        }
    }
}

fn status_for(e: &BackplaneError) -> StatusCode {
    e.status_code()
}

/// Build a JSON error body and return it alongside its exact byte length,
/// so callers can record the real `response_size` without deferring to
/// the body stream.
fn error_response(status: StatusCode, msg: &str) -> (Response<BoxBody>, u64) {
    let body = format!(r#"{{"error":"{msg}"}}"#);
    let len = body.len() as u64;
    let resp = Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap();
    (resp, len)
}

fn set_server_header(resp: &mut Response<BoxBody>, server_string: &str) {
    if let Ok(value) = HeaderValue::from_str(server_string) {
        resp.headers_mut().insert(SERVER, value);
    }
}

/// Set the `Server` header, finish the access-log record with a known
/// body size, ship it, and return the response. Used by every response
/// path whose body is a fully-materialized string (its size is known up
/// front, unlike a streamed upstream body).
fn finalize(
    mut resp: Response<BoxBody>,
    response_size: u64,
    status: u16,
    server_string: &str,
    mut ctx: RequestContext,
    shipper: &Arc<dyn crate::proxy::context::LogShipper>,
) -> Response<BoxBody> {
    set_server_header(&mut resp, server_string);
    ctx.finish(status, response_size);
    shipper.ship(&ctx.log);
    if ctx.trace.error {
        tracing::debug!(key = %ctx.trace.key, "request ended in error");
    }
    resp
}

fn header_str(req: &Request<Incoming>, name: &http::HeaderName) -> String {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}
