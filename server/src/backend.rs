//! Remote backend reached over HTTP.
//!
//! Calls `GET {base}/backend?value={reply_id}` on another Courier instance
//! (or anything speaking the same contract): 200 with the backend id in the
//! body, or 429 when saturated. Every other outcome counts as unavailable, and
//! the reply handler turns both failure kinds into a 429 reply.

use courier_core::message::Message;
use courier_runtime::{Backend, BackendError};
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// [`Backend`] that delegates each unit of work to a remote `/backend` route.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    endpoint: String,
}

impl HttpBackend {
    /// Create a backend rooted at `base_url` (e.g. `http://backend:8181`).
    ///
    /// `timeout` bounds each call.
    ///
    /// # Errors
    ///
    /// Returns `reqwest::Error` if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/backend", base_url.trim_end_matches('/')),
        })
    }

    /// Full URL of the remote route.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn call(&self, reply_id: i32) -> Result<i32, BackendError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("value", reply_id)])
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| BackendError::Unavailable(e.to_string()))?;
                body.trim().parse().map_err(|_| {
                    BackendError::Unavailable(format!("unexpected backend body: {body:?}"))
                })
            }
            StatusCode::TOO_MANY_REQUESTS => Err(BackendError::Rejected),
            other => Err(BackendError::Unavailable(format!("backend answered {other}"))),
        }
    }
}

impl Backend for HttpBackend {
    fn dispatch(
        &self,
        reply_id: i32,
        _request: &Message,
    ) -> Pin<Box<dyn Future<Output = Result<i32, BackendError>> + Send + '_>> {
        Box::pin(async move {
            let outcome = self.call(reply_id).await;
            debug!(endpoint = %self.endpoint, reply_id, ?outcome, "Remote backend call");
            outcome
        })
    }
}
