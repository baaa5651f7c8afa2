use std::future::Future;
use std::time::Duration;

/// Await `fut`, giving up after `limit` when one is configured. `None` means it expired.
pub(crate) async fn within<T>(limit: Option<Duration>, fut: impl Future<Output = T>) -> Option<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::within;
    use std::time::Duration;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn expires_when_limited() {
        let res = within(
            Some(Duration::from_secs(1)),
            tokio::time::sleep(Duration::from_secs(10)),
        )
        .await;
        assert!(res.is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn unlimited_waits_for_completion() {
        let res = within(None, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            7
        })
        .await;
        assert_eq!(res, Some(7));
    }
}
