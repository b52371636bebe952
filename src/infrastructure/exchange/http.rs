use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use std::time::Duration;

pub struct HttpClientFactory;

impl HttpClientFactory {
    /// Client for idempotent reads: transient failures retry in the
    /// middleware with exponential backoff.
    pub fn read_client(timeout: Duration) -> ClientWithMiddleware {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        ClientBuilder::new(Self::base_client(timeout))
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build()
    }

    /// Client for order mutations. No middleware retries: retry decisions
    /// for writes belong to the stop-replace coordinator and the retry
    /// queue, which manage idempotency keys.
    pub fn write_client(timeout: Duration) -> ClientWithMiddleware {
        ClientBuilder::new(Self::base_client(timeout)).build()
    }

    fn base_client(timeout: Duration) -> Client {
        Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new())
    }
}
