mod admin;
pub mod bootstrap;
pub mod runtime;
mod state;

pub use state::{FrontendRuntime, GatewayState};

use crate::net::StoppableListener;
use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run every listener configured for one frontend (plain HTTP and/or TLS)
/// until `shutdown` is notified. Both listeners, when both are configured,
/// run concurrently and share the frontend's host-switch and counters.
pub async fn run_frontend(
    frontend: Arc<FrontendRuntime>,
    state: GatewayState,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let mut tasks = Vec::new();

    if let Some(bind) = frontend.bind_http.clone() {
        let addr: SocketAddr = bind.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(frontend = %frontend.name, %addr, "server: proxy http listening");
        let sln = Arc::new(StoppableListener::new(
            listener,
            Some(frontend.max_conn_rate),
            frontend.max_conns,
        ));
        tasks.push(tokio::spawn(accept_plain(
            sln,
            bind,
            frontend.clone(),
            state.clone(),
            shutdown.clone(),
        )));
    }

    if let Some(bind) = frontend.bind_https.clone() {
        let Some(tls_config) = frontend.tls_config.clone() else {
            anyhow::bail!("frontend {} configures bind_https with no tls_config", frontend.name);
        };
        let addr: SocketAddr = bind.parse()?;
        let listener = TcpListener::bind(addr).await?;
        info!(frontend = %frontend.name, %addr, "server: proxy https listening");
        let sln = Arc::new(StoppableListener::new(
            listener,
            Some(frontend.ssl_max_conn_rate),
            frontend.ssl_max_conns,
        ));
        let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
        tasks.push(tokio::spawn(accept_tls(
            sln,
            acceptor,
            bind,
            frontend.clone(),
            state.clone(),
            shutdown.clone(),
        )));
    }

    for task in tasks {
        if let Err(e) = task.await {
            error!(frontend = %frontend.name, "server: proxy: listener task panicked, error={}", e);
        }
    }

    Ok(())
}

async fn accept_plain(
    listener: Arc<StoppableListener>,
    bind: String,
    frontend: Arc<FrontendRuntime>,
    state: GatewayState,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let accepted = match accepted {
                    Ok(a) => a,
                    Err(_stopped) => break,
                };
                metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
                metrics::gauge!("gateway_connections_active").increment(1.0);

                let peer_addr = accepted.peer_addr;
                let bind = bind.clone();
                let state = state.clone();
                let host_switch = frontend.host_switch.clone();
                let server_string = frontend.server_string.clone();
                let guard = accepted.guard;
                tokio::spawn(async move {
                    serve_conn(accepted.stream, peer_addr, bind, host_switch, state, false, None, server_string).await;
                    drop(guard);
                });
            }
            _ = shutdown.notified() => {
                listener.stop(false).await;
                break;
            }
        }
    }
}

async fn accept_tls(
    listener: Arc<StoppableListener>,
    acceptor: tokio_rustls::TlsAcceptor,
    bind: String,
    frontend: Arc<FrontendRuntime>,
    state: GatewayState,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let accepted = match accepted {
                    Ok(a) => a,
                    Err(_stopped) => break,
                };
                metrics::counter!("gateway_connections_total", "status" => "accepted").increment(1);
                metrics::gauge!("gateway_connections_active").increment(1.0);

                let peer_addr = accepted.peer_addr;
                let bind = bind.clone();
                let state = state.clone();
                let host_switch = frontend.host_switch.clone();
                let server_string = frontend.server_string.clone();
                let acceptor = acceptor.clone();
                let guard = accepted.guard;
                tokio::spawn(async move {
                    match acceptor.accept(accepted.stream).await {
                        Ok(tls_stream) => {
                            let sni = tls_stream
                                .get_ref()
                                .1
                                .server_name()
                                .map(|s| s.to_string());
                            serve_conn(tls_stream, peer_addr, bind, host_switch, state, true, sni, server_string).await;
                        }
                        Err(e) => {
                            error!(%peer_addr, "server: proxy: tls handshake failed, error={}", e);
                        }
                    }
                    drop(guard);
                });
            }
            _ = shutdown.notified() => {
                listener.stop(false).await;
                break;
            }
        }
    }
}

async fn serve_conn<IO>(
    io: IO,
    peer_addr: SocketAddr,
    frontend_bind: String,
    host_switch: Arc<crate::routing::HostSwitch>,
    state: GatewayState,
    is_tls: bool,
    sni: Option<String>,
    server_string: String,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(io);

    let svc = service_fn(move |req: Request<Incoming>| {
        let state = state.clone();
        let frontend_bind = frontend_bind.clone();
        let host_switch = host_switch.clone();
        let sni = sni.clone();
        let server_string = server_string.clone();
        async move {
            proxy::handle_request(
                req,
                state,
                peer_addr,
                frontend_bind,
                host_switch,
                is_tls,
                sni,
                server_string,
            )
            .await
        }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .http1()
        .keep_alive(true)
        .http2()
        .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
        .serve_connection_with_upgrades(io, svc)
        .await
    {
        if !e.to_string().contains("connection closed") {
            error!("server: proxy: connection error, peer={}, error={}", peer_addr, e);
        }
    }

    metrics::gauge!("gateway_connections_active").decrement(1.0);
}

/// Run a simple admin server for health/readiness checks and metrics.
pub async fn run_admin_server(listen: &str, state: GatewayState) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state) }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
