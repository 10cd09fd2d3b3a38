use anyhow::{Context, Result};
use chatlabel_core::CancellationToken;
use tokio::runtime::Runtime;

/// Starts a runtime whose token is cancelled on the first Ctrl-C. Runs stop
/// at their next chunk or document boundary.
pub fn start() -> Result<(Runtime, CancellationToken)> {
    let runtime = Runtime::new().context("failed to start tokio runtime")?;
    let token = CancellationToken::new();
    let trigger = token.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; stopping at the next boundary");
            trigger.cancel();
        }
    });
    Ok((runtime, token))
}
