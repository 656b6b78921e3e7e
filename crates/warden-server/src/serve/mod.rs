//! Serve-loops supervised by the shutdown coordinator.

mod budget;
mod http;

pub use budget::RequestBudget;
pub use http::{bind_listener, HttpServeLoop};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The worker's request-dispatch loop.
///
/// `serve` runs until the loop exits on its own or `stop_accepting` is
/// cancelled. After cancellation the loop stops accepting new work and
/// returns once in-flight work has finished.
#[async_trait]
pub trait ServeLoop: Send + Sync {
    async fn serve(&self, stop_accepting: CancellationToken) -> anyhow::Result<()>;
}
