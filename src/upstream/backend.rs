use crate::counters::Counters;
use crate::error::BackplaneError;
use crate::upstream::balancer::Balancer;
use crate::upstream::health::Upstream;
use crate::upstream::transport::RESPONSE_HEADER_TIMEOUT;
use bytes::Bytes;
use http::header::HOST;
use http_body_util::combinators::BoxBody;
use hyper::{Request, Response};
use std::sync::Arc;

/// A named group of upstream servers reachable as one logical target.
/// Owns the balancer, its own counters, and rewrites the outgoing
/// request's scheme/host (the "director") before dispatch. One backend
/// may be referenced by many routes.
pub struct Backend {
    pub name: String,
    pub balancer: Balancer,
    pub counters: Counters,
}

impl Backend {
    pub fn new(name: String, upstreams: Vec<Arc<Upstream>>) -> Self {
        Self {
            name,
            balancer: Balancer::new(upstreams),
            counters: Counters::new(),
        }
    }

    /// Select a healthy upstream, apply the director rewrite, admit
    /// against that upstream's EMA limiter, and perform the round trip.
    pub async fn round_trip(
        &self,
        mut req: Request<BoxBody<Bytes, hyper::Error>>,
    ) -> Result<Response<hyper::body::Incoming>, BackplaneError> {
        let _guard = self.counters.enter();
        let upstream = self.balancer.select()?;

        if !upstream.rate_limiter.accept() {
            return Err(BackplaneError::RateLimited);
        }

        direct_request(&mut req);
        let _upstream_guard = upstream.counters.enter();

        let result = tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, upstream.transport.request(req))
            .await;

        match result {
            Err(_elapsed) => Err(BackplaneError::Internal("upstream response timeout".into())),
            Ok(Err(e)) => Err(BackplaneError::Internal(format!("upstream error: {e}"))),
            Ok(Ok(resp)) => Ok(resp),
        }
    }
}

/// Rewrite the outgoing request's scheme to `http` and its URI authority
/// to the inbound `Host` header. The transport always dials the backend's
/// fixed configured address regardless of what's in the URL, so the host
/// here is purely for the upstream's own virtual-host routing, not for
/// connecting to it.
fn direct_request(req: &mut Request<BoxBody<Bytes, hyper::Error>>) {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let new_uri: hyper::Uri = format!("http://{host}{path_and_query}")
        .parse()
        .unwrap_or_else(|_| req.uri().clone());
    *req.uri_mut() = new_uri;
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn round_trip_fails_with_no_healthy_backend_when_active_set_empty() {
        let upstream = Arc::new(Upstream::new("127.0.0.1:1".to_string(), 100, 0, 1_000_000.0));
        let backend = Backend::new("be1".to_string(), vec![upstream]);
        // rebuild_active() never called -> active set stays empty.
        let req = Request::builder()
            .uri("http://example.com/a/b")
            .body(http_body_util::Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap();
        let result = backend.round_trip(req).await;
        assert!(matches!(result, Err(BackplaneError::NoHealthyBackendAvailable)));
    }

    #[test]
    fn director_rewrites_scheme_and_keeps_inbound_host() {
        let mut req = Request::builder()
            .uri("/a/b?x=1")
            .header(HOST, "public.example.com")
            .body(
                http_body_util::Empty::<Bytes>::new()
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap();
        direct_request(&mut req);
        assert_eq!(req.uri().to_string(), "http://public.example.com/a/b?x=1");
    }
}
