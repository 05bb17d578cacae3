use std::future::Future;

use landwatch_store::{SpatialError, SpatialStore};

/// Runs `call`, and on a transient failure reconnects and runs it exactly once more.
pub async fn with_reconnect<T, F, Fut>(
    spatial: &dyn SpatialStore,
    operation: &'static str,
    mut call: F,
) -> Result<T, SpatialError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SpatialError>>,
{
    match call().await {
        Err(err) if err.is_transient() => {
            tracing::warn!(operation, error = %err, "transient spatial failure, retrying after reconnect");
            if let Err(reconnect_err) = spatial.reconnect().await {
                tracing::warn!(operation, error = %reconnect_err, "spatial reconnect failed");
            }
            call().await
        }
        other => other,
    }
}
