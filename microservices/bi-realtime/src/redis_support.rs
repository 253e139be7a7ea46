//! Shared Redis plumbing for the L2 cache tier and the stream transport

use ehub_core::{EhubError, Result};
use redis::aio::ConnectionManager;
use std::future::Future;
use std::time::Duration;

pub(crate) async fn connect(url: &str) -> Result<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(url).map_err(map_redis_error)?;
    let manager = ConnectionManager::new(client.clone())
        .await
        .map_err(map_redis_error)?;
    Ok((client, manager))
}

pub(crate) fn map_redis_error(err: redis::RedisError) -> EhubError {
    if err.is_timeout() {
        EhubError::Timeout(err.to_string())
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        EhubError::Network(err.to_string())
    } else {
        EhubError::Unavailable(err.to_string())
    }
}

/// Bound a Redis call by `limit`, folding both failure modes into `EhubError`.
pub(crate) async fn bounded<T, F>(limit: Duration, op: &str, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(map_redis_error(e)),
        Err(_) => Err(EhubError::Timeout(format!("redis {} exceeded {:?}", op, limit))),
    }
}
