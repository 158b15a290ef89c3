use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new()).map_err(|never| match never {}).boxed()
}

/// One access-log record, built up across the request lifecycle and
/// handed to a shipper on completion.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct AccessLogItem {
    pub client_ip: String,
    pub method: String,
    pub request_uri: String,
    pub http_version: String,
    pub referrer: String,
    pub user_agent: String,
    pub frontend: String,
    pub is_tls: bool,
    pub backend_name: String,
    pub server_address: String,
    pub handler_path: String,
    pub vhost: String,
    pub status_code: u16,
    pub response_size: u64,
    pub time_t_ns: i64,
    pub frontend_latency_ns: i64,
    pub server_latency_ns: i64,
}

/// Trace handle keyed by the frontend's HTTP bind string and request
/// URI, carrying only whether the request ended in error.
pub struct TraceHandle {
    pub key: String,
    pub error: bool,
}

impl TraceHandle {
    pub fn new(bind: &str, uri: &str) -> Self {
        Self {
            key: format!("{bind}:{uri}"),
            error: false,
        }
    }
}

/// Per-request context: an access-log item under construction plus a
/// trace handle. Threaded by `&mut` reference through each lifecycle
/// phase rather than stored in any process-wide map — the redesign
/// documented against the source's request-bag pattern.
pub struct RequestContext {
    pub log: AccessLogItem,
    pub trace: TraceHandle,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(frontend_bind: &str, method: String, uri: String, client_ip: IpAddr, is_tls: bool) -> Self {
        let trace = TraceHandle::new(frontend_bind, &uri);
        Self {
            log: AccessLogItem {
                client_ip: client_ip.to_string(),
                method,
                request_uri: uri,
                frontend: frontend_bind.to_string(),
                is_tls,
                time_t_ns: 0,
                ..Default::default()
            },
            trace,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Fill in the final status/size/latency fields and mark the trace
    /// erroneous when the final status isn't 2xx/3xx.
    pub fn finish(&mut self, status: u16, response_size: u64) {
        self.log.status_code = status;
        self.log.response_size = response_size;
        self.log.frontend_latency_ns = self.start.elapsed().as_nanos() as i64;
        if let Some(upstream_start) = self.upstream_start {
            self.log.server_latency_ns = upstream_start.elapsed().as_nanos() as i64;
        }
        self.trace.error = !(200..400).contains(&status);
    }
}

/// Wraps a response body to count the bytes actually written, finishing
/// the access-log record and shipping it once the stream ends — the
/// byte count isn't known until the last chunk has gone out, so it can't
/// be trusted to a content-length computed up front.
struct CountingBody {
    inner: BoxBody,
    counted: u64,
    finish: Option<(RequestContext, u16, Arc<dyn LogShipper>)>,
}

impl CountingBody {
    fn new(inner: BoxBody, ctx: RequestContext, status: u16, shipper: Arc<dyn LogShipper>) -> Self {
        Self {
            inner,
            counted: 0,
            finish: Some((ctx, status, shipper)),
        }
    }
}

impl Body for CountingBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);

        if let Poll::Ready(Some(Ok(ref frame))) = poll {
            if let Some(data) = frame.data_ref() {
                this.counted += data.len() as u64;
            }
        }

        if let Poll::Ready(None) = poll {
            if let Some((mut ctx, status, shipper)) = this.finish.take() {
                ctx.finish(status, this.counted);
                shipper.ship(&ctx.log);
                if ctx.trace.error {
                    tracing::debug!(key = %ctx.trace.key, "request ended in error");
                }
            }
        }

        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Box a response body so the access-log record is finished and shipped
/// when the stream ends, with the real number of bytes written.
pub fn counting_body(
    inner: BoxBody,
    ctx: RequestContext,
    status: u16,
    shipper: Arc<dyn LogShipper>,
) -> BoxBody {
    CountingBody::new(inner, ctx, status, shipper).boxed()
}

/// Out-of-process access-log shipper. The in-process default below logs
/// the record as a structured `tracing` event so the system is runnable
/// standalone; a real time-series shipper is an external collaborator.
pub trait LogShipper: Send + Sync {
    fn ship(&self, item: &AccessLogItem);
}

pub struct TracingLogShipper;

impl LogShipper for TracingLogShipper {
    fn ship(&self, item: &AccessLogItem) {
        tracing::info!(
            client_ip = %item.client_ip,
            method = %item.method,
            uri = %item.request_uri,
            frontend = %item.frontend,
            backend = %item.backend_name,
            vhost = %item.vhost,
            status = item.status_code,
            response_size = item.response_size,
            frontend_latency_ns = item.frontend_latency_ns,
            server_latency_ns = item.server_latency_ns,
            "access log"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_marks_non_2xx_3xx_as_error() {
        let mut ctx = RequestContext::new("0.0.0.0:80", "GET".into(), "/a".into(), "127.0.0.1".parse().unwrap(), false);
        ctx.finish(404, 12);
        assert!(ctx.trace.error);
        assert_eq!(ctx.log.status_code, 404);
    }

    #[test]
    fn finish_does_not_mark_2xx_as_error() {
        let mut ctx = RequestContext::new("0.0.0.0:80", "GET".into(), "/a".into(), "127.0.0.1".parse().unwrap(), false);
        ctx.finish(200, 12);
        assert!(!ctx.trace.error);
    }
}
