use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

use super::{Request, RequestError, RequestId, RequestState, Response, StateCell};

/// Receiving half of a pending result
pub(crate) type ResultReceiver = oneshot::Receiver<Result<Response, RequestError>>;

/// The caller's result slot for one outstanding request
///
/// Resolving consumes the slot, so a slot can only be written once.
pub struct Pending {
    tx: oneshot::Sender<Result<Response, RequestError>>,
    state: Arc<StateCell>,
}

impl Pending {
    pub(crate) fn new(request: &Request) -> (Self, ResultReceiver) {
        let (tx, rx) = oneshot::channel();
        let pending = Self {
            tx,
            state: Arc::clone(request.state_cell()),
        };
        (pending, rx)
    }

    /// Deliver the outcome to the caller and move the request to its terminal state
    pub fn resolve(self, outcome: Result<Response, RequestError>) {
        let next = match &outcome {
            Ok(_) => RequestState::Completed,
            Err(RequestError::Cancelled) => RequestState::Cancelled,
            Err(_) => RequestState::Failed,
        };
        if self.state.advance(next) {
            // The caller may have gone away; nothing left to do then.
            let _ = self.tx.send(outcome);
        }
    }
}

/// Maps correlation ids to result slots while requests are outstanding
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<RequestId, Pending>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new outstanding request
    pub fn register(&self, id: RequestId, pending: Pending) {
        let previous = self.pending.lock().insert(id, pending);
        debug_assert!(previous.is_none(), "correlation id {} registered twice", id);
    }

    /// Resolve the slot for `id`; unknown ids are logged and dropped
    pub fn complete(&self, id: RequestId, outcome: Result<Response, RequestError>) -> bool {
        match self.take(id) {
            Some(pending) => {
                pending.resolve(outcome);
                true
            }
            None => {
                debug!(request_id = %id, "no outstanding request for correlation id, dropping");
                false
            }
        }
    }

    /// Remove the slot for `id` without resolving it
    pub fn take(&self, id: RequestId) -> Option<Pending> {
        self.pending.lock().remove(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Number of outstanding requests
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove every outstanding slot
    pub fn drain(&self) -> Vec<(RequestId, Pending)> {
        self.pending.lock().drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::get_design_document("beers", false, "beer-sample", "")
    }

    #[tokio::test]
    async fn test_complete_resolves_once() {
        let correlator = Correlator::new();
        let request = request();
        let (pending, rx) = Pending::new(&request);
        correlator.register(request.id(), pending);
        assert_eq!(correlator.len(), 1);

        assert!(correlator.complete(request.id(), Ok(Response::new(request.id(), "first"))));
        // Duplicate response: the slot is gone, so this is a logged no-op.
        assert!(!correlator.complete(request.id(), Ok(Response::new(request.id(), "second"))));

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.body().as_ref(), b"first");
        assert_eq!(request.state(), RequestState::Completed);
        assert!(correlator.is_empty());
    }

    #[tokio::test]
    async fn test_failure_states() {
        let correlator = Correlator::new();

        let cancelled = request();
        let (pending, rx) = Pending::new(&cancelled);
        correlator.register(cancelled.id(), pending);
        correlator.complete(cancelled.id(), Err(RequestError::Cancelled));
        assert_eq!(rx.await.unwrap(), Err(RequestError::Cancelled));
        assert_eq!(cancelled.state(), RequestState::Cancelled);

        let failed = request();
        let (pending, rx) = Pending::new(&failed);
        correlator.register(failed.id(), pending);
        correlator.complete(failed.id(), Err(RequestError::PoolClosed));
        assert_eq!(rx.await.unwrap(), Err(RequestError::PoolClosed));
        assert_eq!(failed.state(), RequestState::Failed);
    }

    #[test]
    fn test_drain_empties_map() {
        let correlator = Correlator::new();
        let requests: Vec<Request> = (0..3).map(|_| request()).collect();
        for request in &requests {
            let (pending, _rx) = Pending::new(request);
            correlator.register(request.id(), pending);
        }

        let drained = correlator.drain();
        assert_eq!(drained.len(), 3);
        assert!(correlator.is_empty());
        assert!(!correlator.contains(requests[0].id()));
    }
}
