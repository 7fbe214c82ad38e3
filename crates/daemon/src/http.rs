//! HTTP client construction shared by the transcoder, status and storage clients.

use std::time::Duration;

/// Build a reqwest client whose requests are bounded by `timeout`.
pub fn build_client(timeout: Duration, connect_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .user_agent(concat!("reelforge/", env!("CARGO_PKG_VERSION")))
        .build()
}
