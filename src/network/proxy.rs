//! Client-side invocation with retries.

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::network::{Endpoint, OutgoingConnectionFactory, RetryPolicy};
use crate::outgoing::{InvocationFuture, OutgoingAsync, Outcome};
use crate::protocol::message::request_frame;
use crate::protocol::{OperationMode, ReplyStatus, RequestHeader};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// A remote object reachable through one endpoint.
#[derive(Clone)]
pub struct Proxy {
    factory: Arc<OutgoingConnectionFactory>,
    endpoint: Endpoint,
    identity: String,
    facet: String,
    retry: RetryPolicy,
    invocation_timeout: Option<Duration>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint.to_string())
            .finish()
    }
}

/// A failed attempt, and whether the request may have reached the peer.
struct Failure {
    error: Error,
    sent: bool,
}

impl Failure {
    fn unsent(error: Error) -> Self {
        Self { error, sent: false }
    }
}

impl Proxy {
    pub fn new(
        factory: Arc<OutgoingConnectionFactory>,
        endpoint: Endpoint,
        identity: impl Into<String>,
    ) -> Self {
        let retry = RetryPolicy::from_instance(factory.instance());
        Self {
            factory,
            endpoint,
            identity: identity.into(),
            facet: String::new(),
            retry,
            invocation_timeout: None,
        }
    }

    pub fn with_facet(mut self, facet: impl Into<String>) -> Self {
        self.facet = facet.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fail invocations that take longer than `timeout` with
    /// [`Error::Timeout`]. Such failures are never retried.
    pub fn with_invocation_timeout(mut self, timeout: Duration) -> Self {
        self.invocation_timeout = Some(timeout);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The connection invocations currently go through.
    pub async fn connection(&self) -> Result<Arc<Connection>> {
        self.factory.create(&self.endpoint).await
    }

    fn header(&self, operation: &str, mode: OperationMode) -> RequestHeader {
        RequestHeader::new(self.identity.clone(), operation)
            .with_facet(self.facet.clone())
            .with_mode(mode)
    }

    /// Two-way invocation. Returns the reply parameters.
    #[instrument(level = "debug", skip(self, params), fields(identity = %self.identity))]
    pub async fn invoke(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
    ) -> Result<Vec<u8>> {
        let header = self.header(operation, mode);
        match self.invoke_with_retry(&header, params, true).await? {
            Outcome::Reply(reply) => reply.into_result(),
            Outcome::Sent => Err(Error::Unknown("two-way request completed without reply".to_string())),
        }
    }

    /// One-way invocation; completes once the request is written.
    #[instrument(level = "debug", skip(self, params), fields(identity = %self.identity))]
    pub async fn invoke_oneway(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
    ) -> Result<()> {
        let header = self.header(operation, mode);
        self.invoke_with_retry(&header, params, false).await.map(|_| ())
    }

    /// Queue a one-way request in the connection's batch. The returned
    /// future resolves once the batch is written, or with the connection's
    /// error if it closes before that.
    pub async fn invoke_batch(
        &self,
        operation: &str,
        mode: OperationMode,
        params: &[u8],
    ) -> Result<InvocationFuture> {
        let header = self.header(operation, mode);
        let connection = self.connection().await?;
        connection.queue_batch_request(&header, params, self.endpoint.compress)
    }

    /// Send the requests queued by [`invoke_batch`](Self::invoke_batch).
    pub async fn flush_batch(&self) -> Result<()> {
        let connection = self.connection().await?;
        connection.flush_batch_requests()?.await.map(|_| ())
    }

    async fn invoke_with_retry(
        &self,
        header: &RequestHeader,
        params: &[u8],
        response: bool,
    ) -> Result<Outcome> {
        let mut attempt = 0;
        loop {
            let failure = match self.invoke_once(header, params, response).await {
                Ok(outcome) => return Ok(outcome),
                Err(failure) => failure,
            };

            if matches!(failure.error, Error::Timeout { .. }) && self.invocation_timeout.is_some() {
                return Err(failure.error);
            }

            match self.retry.check_retry_after_exception(
                &failure.error,
                failure.sent,
                header.mode,
                attempt,
            ) {
                Some(delay) => {
                    debug!(
                        operation = %header.operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure.error,
                        "Retrying invocation"
                    );
                    attempt += 1;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                None => return Err(failure.error.into_cause()),
            }
        }
    }

    async fn invoke_once(
        &self,
        header: &RequestHeader,
        params: &[u8],
        response: bool,
    ) -> std::result::Result<Outcome, Failure> {
        let connection = self.connection().await.map_err(Failure::unsent)?;
        let (out, future) = OutgoingAsync::new(response);
        let frame = request_frame(header, params);

        if let Err(error) = connection.send_request(&out, frame, self.endpoint.compress, 0) {
            return Err(Failure {
                error,
                sent: out.is_sent(),
            });
        }

        let result = match self.invocation_timeout {
            None => future.await,
            Some(timeout) => {
                tokio::pin!(future);
                match tokio::time::timeout(timeout, &mut future).await {
                    Ok(result) => result,
                    Err(_) => {
                        connection.cancel_request(&out, Error::Timeout { timeout });
                        future.await
                    }
                }
            }
        };
        match result {
            // The peer did not run the operation; worth another attempt.
            Ok(Outcome::Reply(reply)) if reply.status == ReplyStatus::ObjectNotExist => {
                let error = reply.into_result().err().unwrap_or_else(|| {
                    Error::unmarshal("object-not-exist reply without details")
                });
                Err(Failure { error, sent: true })
            }
            Ok(outcome) => Ok(outcome),
            Err(error) => Err(Failure {
                error,
                sent: out.is_sent(),
            }),
        }
    }
}
