//! Out-of-band liveness poll to the collector.

use std::time::Duration;

use tracing::{debug, instrument};

use super::error::RelayError;

/// Side channel used when the relay link has been quiet for too long.
pub trait PollChannel: Send {
    /// Poll with `message`, returning the collector's reply body.
    fn poll(&mut self, message: &str) -> Result<String, RelayError>;
}

/// `GET /get_polling/<message>` against the collector's HTTP port.
#[derive(Debug, Clone)]
pub struct HttpPoller {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl HttpPoller {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::poll(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, port),
        })
    }

    fn url(&self, message: &str) -> String {
        format!("{}/get_polling/{}", self.base_url, message)
    }
}

impl PollChannel for HttpPoller {
    #[instrument(skip(self), fields(base = %self.base_url))]
    fn poll(&mut self, message: &str) -> Result<String, RelayError> {
        let body = self
            .client
            .get(self.url(message))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| RelayError::poll(e.to_string()))?;
        debug!(body = %body.trim(), "Poll answered");
        Ok(body)
    }
}
