/// Resilience patterns for the CDC sink
///
/// - **Retry**: exponential backoff policy object plus a retry executor that
///   stops early on errors classified as permanent
///
/// # Example: Retrying a transient store write
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryPolicy, Retryable};
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct WriteFailed;
///
/// impl std::fmt::Display for WriteFailed {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "write failed")
///     }
/// }
///
/// impl Retryable for WriteFailed {
///     fn is_retryable(&self) -> bool {
///         true
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
///
///     let result = with_retry(&policy, |_attempt| async {
///         // Your store write here
///         Ok::<_, WriteFailed>(())
///     })
///     .await;
/// }
/// ```

pub mod retry;

pub use retry::{with_retry, RetryError, RetryPolicy, Retryable};
