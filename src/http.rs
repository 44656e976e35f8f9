use reqwest::Client;
use std::time::Duration;

/// Client for outbound collaborator calls. `request_timeout` bounds each whole
/// request when set; callers that enforce their own deadlines pass `None`. The
/// connect timeout comes from `HTTP_CONNECT_TIMEOUT_SECS`.
pub fn build_client(request_timeout: Option<Duration>) -> Client {
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    let mut builder = Client::builder().connect_timeout(Duration::from_secs(connect));
    if let Some(timeout) = request_timeout {
        builder = builder.timeout(timeout);
    }
    builder.build()
        .unwrap_or_else(|_| Client::new())
}
