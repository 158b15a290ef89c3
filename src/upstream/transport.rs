use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tower_service::Service;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(30);
/// Held for parity with the source's defensive TLS-handshake-timeout field,
/// even though upstream connections in this core are always plain HTTP.
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A `tower` connector that ignores the URI passed to it and always dials
/// one fixed upstream address, per the "backend transport always dials
/// the configured address" rule.
#[derive(Clone)]
pub struct FixedAddrConnector {
    address: String,
}

impl FixedAddrConnector {
    pub fn new(address: String) -> Self {
        Self { address }
    }
}

impl Service<Uri> for FixedAddrConnector {
    type Response = TokioIo<TcpStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let address = self.address.clone();
        Box::pin(async move {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timeout"))??;
            stream.set_nodelay(true)?;
            if let Ok(sock_ref) = <socket2::SockRef>::try_from(&stream) {
                let ka = socket2::TcpKeepalive::new().with_time(TCP_KEEPALIVE);
                let _ = sock_ref.set_tcp_keepalive(&ka);
            }
            Ok(TokioIo::new(stream))
        })
    }
}

pub type UpstreamClient = Client<FixedAddrConnector, BoxBody<Bytes, hyper::Error>>;

/// Build the client used to dial one upstream's fixed address, with the
/// connect/keepalive/TLS-handshake/response-header timeout profile from
/// the component design. The response-header timeout is not a builder
/// knob on `hyper_util`'s legacy client; callers wrap `request()` in
/// `tokio::time::timeout(RESPONSE_HEADER_TIMEOUT, ..)` instead.
pub fn build_upstream_client(address: String) -> UpstreamClient {
    Client::builder(TokioExecutor::new()).build(FixedAddrConnector::new(address))
}
