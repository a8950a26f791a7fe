use std::future::Future;
use std::time::Duration;

use crate::error::RemoteError;

/// Race a remote call against `deadline`.
///
/// The call runs as its own task, so when the deadline wins it keeps going
/// in the background instead of being dropped mid-flight.
pub(crate) async fn with_deadline<F, T>(deadline: Duration, call: F) -> Result<T, RemoteError>
where
  F: Future<Output = Result<T, RemoteError>> + Send + 'static,
  T: Send + 'static,
{
  let handle = tokio::spawn(call);
  match tokio::time::timeout(deadline, handle).await {
    Ok(Ok(result)) => result,
    Ok(Err(join_err)) => Err(RemoteError::other(format!("remote task failed: {}", join_err))),
    Err(_) => Err(RemoteError::timeout(deadline)),
  }
}
