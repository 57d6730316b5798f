use futures::future::BoxFuture;
use std::future::IntoFuture;
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::endpoint_pool::PoolShared;
use crate::request::{
    Pending, Request, RequestError, RequestId, RequestState, Response, ResultReceiver, StateCell,
};

/// Caller's handle on a dispatched request
///
/// Resolves exactly once: with the response, or with the error that ended the
/// request. The pool fails the request with `Timeout` once its deadline
/// passes, whether or not anyone is waiting. Dropping an unresolved handle
/// cancels the request.
pub struct PendingResponse {
    id: RequestId,
    rx: ResultReceiver,
    state: Arc<StateCell>,
    timeout: Duration,
    pool: Weak<PoolShared>,
}

impl PendingResponse {
    pub(crate) fn new(
        request: &Request,
        rx: ResultReceiver,
        timeout: Duration,
        pool: Weak<PoolShared>,
    ) -> Self {
        Self {
            id: request.id(),
            rx,
            state: Arc::clone(request.state_cell()),
            timeout,
            pool,
        }
    }

    /// A handle that is already resolved with `error`
    pub(crate) fn failed(request: &Request, error: RequestError) -> Self {
        let (pending, rx) = Pending::new(request);
        pending.resolve(Err(error));
        Self::new(request, rx, Duration::ZERO, Weak::new())
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Current lifecycle state of the request
    pub fn state(&self) -> RequestState {
        self.state.get()
    }

    /// Resolve the request with `Cancelled` if it has not resolved yet
    ///
    /// A queued request leaves the queue; an in-flight one frees its endpoint
    /// slot. Returns false when there was nothing left to cancel.
    pub fn cancel(&self) -> bool {
        match self.pool.upgrade() {
            Some(pool) => pool.abandon(self.id, RequestError::Cancelled),
            None => false,
        }
    }

    /// Wait for the outcome
    pub async fn wait(mut self) -> Result<Response, RequestError> {
        match (&mut self.rx).await {
            Ok(outcome) => outcome,
            // The slot went away unresolved: the pool is gone.
            Err(_) => Err(RequestError::PoolClosed),
        }
    }
}

impl IntoFuture for PendingResponse {
    type Output = Result<Response, RequestError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.state.get().is_terminal() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.abandon(self.id, RequestError::Cancelled);
        }
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_handle_resolves_immediately() {
        let request = Request::get_design_document("beers", false, "beer-sample", "");
        let pending = PendingResponse::failed(&request, RequestError::PoolClosed);

        assert_eq!(pending.state(), RequestState::Failed);
        assert!(!pending.cancel());
        assert_eq!(pending.await, Err(RequestError::PoolClosed));
    }
}
