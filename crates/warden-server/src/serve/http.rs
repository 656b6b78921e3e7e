//! HTTP serve-loop.

use super::{RequestBudget, ServeLoop};
use crate::config::ServerBindConfig;
use crate::shutdown::{ShutdownCoordinator, ShutdownTrigger};
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use parking_lot::Mutex;
use serde_json::json;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::timeout::TimeoutLayer;
use tracing::info;
use warden_common_log::ACCESS_TARGET;

/// Bind a non-blocking listener with TCP keep-alive on accepted sockets.
pub fn bind_listener(addr: SocketAddr, keepalive: Duration) -> std::io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

#[derive(Clone)]
struct ServeState {
    coordinator: ShutdownCoordinator,
    budget: Option<Arc<RequestBudget>>,
}

/// Serves HTTP until the coordinator tells it to stop accepting.
pub struct HttpServeLoop {
    addr: SocketAddr,
    keepalive: Duration,
    request_timeout: Duration,
    coordinator: ShutdownCoordinator,
    budget: Option<Arc<RequestBudget>>,
    listener: Mutex<Option<std::net::TcpListener>>,
}

impl HttpServeLoop {
    pub fn new(
        config: &ServerBindConfig,
        coordinator: ShutdownCoordinator,
    ) -> Result<Self, std::net::AddrParseError> {
        Ok(Self {
            addr: config.socket_addr()?,
            keepalive: config.keepalive(),
            request_timeout: config.request_timeout(),
            coordinator,
            budget: None,
            listener: Mutex::new(None),
        })
    }

    /// Recycle the worker once `budget` is spent.
    pub fn with_budget(mut self, budget: Option<RequestBudget>) -> Self {
        self.budget = budget.map(Arc::new);
        self
    }

    /// Serve on an already bound listener instead of binding on `serve`.
    pub fn with_listener(self, listener: std::net::TcpListener) -> Self {
        *self.listener.lock() = Some(listener);
        self
    }

    pub fn router(&self) -> Router {
        let state = ServeState {
            coordinator: self.coordinator.clone(),
            budget: self.budget.clone(),
        };

        Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .layer(TimeoutLayer::new(self.request_timeout))
            .layer(middleware::from_fn_with_state(state.clone(), access_log))
            .with_state(state)
    }
}

#[async_trait]
impl ServeLoop for HttpServeLoop {
    async fn serve(&self, stop_accepting: CancellationToken) -> anyhow::Result<()> {
        let prebound = self.listener.lock().take();
        let std_listener = match prebound {
            Some(listener) => listener,
            None => bind_listener(self.addr, self.keepalive)?,
        };
        let listener = TcpListener::from_std(std_listener)?;
        info!(addr = %listener.local_addr()?, "Listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
            .await?;

        info!("Serve-loop stopped accepting and finished in-flight requests");
        Ok(())
    }
}

async fn root() -> &'static str {
    "warden worker\n"
}

async fn health(State(state): State<ServeState>) -> impl IntoResponse {
    let status = if state.coordinator.is_draining() {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "pid": std::process::id(),
        "drain_cycles": state.coordinator.drain_cycles(),
    }))
}

async fn access_log(State(state): State<ServeState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        target: ACCESS_TARGET,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    if let Some(budget) = &state.budget {
        if budget.record() {
            info!(threshold = budget.threshold(), "Request budget spent, recycling worker");
            state.coordinator.trigger(ShutdownTrigger::RequestBudget);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShutdownConfig;
    use crate::shutdown::ChannelSignals;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn local_listener() -> (std::net::TcpListener, SocketAddr) {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5)).unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_health_then_budget_recycles_worker() {
        let config = ShutdownConfig {
            settle_delay_ms: 0,
            ..ShutdownConfig::default()
        };
        let coordinator = ShutdownCoordinator::builder(config)
            .signals(ChannelSignals::new())
            .build();
        let (listener, addr) = local_listener();
        let serve_loop = HttpServeLoop::new(&ServerBindConfig::default(), coordinator.clone())
            .unwrap()
            .with_budget(Some(RequestBudget::with_threshold(2)))
            .with_listener(listener);

        let run = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run(&serve_loop).await })
        };

        let first = http_get(addr, "/health").await;
        assert!(first.starts_with("HTTP/1.1 200"));
        assert!(first.contains(r#""status":"ok""#));
        assert!(!coordinator.stop_accepting_token().is_cancelled());

        let second = http_get(addr, "/").await;
        assert!(second.contains("warden worker"));

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.trigger, Some(ShutdownTrigger::RequestBudget));
        assert_eq!(report.drain_cycles, 1);
        assert!(!report.deadline_exceeded);
    }

    #[tokio::test]
    async fn test_stop_accepting_ends_serve() {
        let coordinator = ShutdownCoordinator::builder(ShutdownConfig::default())
            .signals(ChannelSignals::new())
            .build();
        let (listener, addr) = local_listener();
        let serve_loop = HttpServeLoop::new(&ServerBindConfig::default(), coordinator.clone())
            .unwrap()
            .with_listener(listener);

        let token = CancellationToken::new();
        let serving = {
            let token = token.clone();
            tokio::spawn(async move { serve_loop.serve(token).await })
        };

        assert!(http_get(addr, "/health").await.contains("200 OK"));
        token.cancel();
        serving.await.unwrap().unwrap();
    }
}
