/*!
Shared helpers for endpoint-agent integration tests
*/

use std::future::Future;
use std::time::Duration;

/// Route `log` output of the stubs to the test harness, once
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Poll `check` until it yields `Some` or `timeout` elapses
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Split a `type:json\n` record into its tag and parsed body
pub fn parse_record(record: &str) -> Option<(String, serde_json::Value)> {
    let (tag, body) = record.split_once(':')?;
    let body = serde_json::from_str(body.trim_end()).ok()?;
    Some((tag.to_string(), body))
}
