//! Query correlation table.
//!
//! Every query in flight is parked here under its transaction id together
//! with a oneshot completer and the instant it was issued. An entry leaves the
//! table exactly once, through one of:
//!
//! - [`QueryTable::resolve`] when a reply with the same transaction id arrives,
//! - [`QueryTable::sweep_expired`] when it outlives the query timeout,
//! - [`QueryTable::cancel_all`] when the connection closes.
//!
//! Entries are removed under the lock and completed after it is released, so a
//! completer never runs while the table is locked.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::QueryError;
use crate::message::{downcast_message, Message, TransactionId};

type Completion = Result<Arc<dyn Message>, QueryError>;

/// A query waiting for its reply.
#[derive(Debug)]
struct PendingQuery {
    completer: oneshot::Sender<Completion>,
    issued_at: Instant,
}

/// Pending queries keyed by transaction id.
#[derive(Debug, Default)]
pub struct QueryTable {
    pending: Mutex<HashMap<TransactionId, PendingQuery>>,
}

impl QueryTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a query issued now and return the receiving end of its
    /// completion.
    ///
    /// # Errors
    ///
    /// Returns `QueryError::DuplicateTransaction` if `id` is already pending.
    pub fn insert(&self, id: TransactionId) -> Result<oneshot::Receiver<Completion>, QueryError> {
        let mut pending = self.pending.lock().expect("query table lock poisoned");
        if pending.contains_key(&id) {
            return Err(QueryError::DuplicateTransaction(id));
        }
        let (completer, receiver) = oneshot::channel();
        pending.insert(
            id,
            PendingQuery {
                completer,
                issued_at: Instant::now(),
            },
        );
        Ok(receiver)
    }

    /// Complete the query matching `message`'s transaction id.
    ///
    /// Returns the message back if no query was waiting for it, so the caller
    /// can dispatch it instead.
    pub fn resolve(&self, message: Arc<dyn Message>) -> Option<Arc<dyn Message>> {
        let id = message.transaction_id();
        let entry = self
            .pending
            .lock()
            .expect("query table lock poisoned")
            .remove(&id);
        match entry {
            Some(query) => {
                // Receiver may have been dropped by an uninterested caller.
                let _ = query.completer.send(Ok(message));
                None
            }
            None => Some(message),
        }
    }

    /// Remove a pending query and fail it with `error`.
    ///
    /// Returns `false` if `id` was not pending.
    pub fn reject(&self, id: TransactionId, error: QueryError) -> bool {
        let entry = self
            .pending
            .lock()
            .expect("query table lock poisoned")
            .remove(&id);
        match entry {
            Some(query) => {
                let _ = query.completer.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject every query issued at least `timeout` before `now`.
    ///
    /// Returns the number of queries that timed out.
    pub fn sweep_expired(&self, now: Instant, timeout: Duration) -> usize {
        let expired: Vec<(TransactionId, PendingQuery)> = {
            let mut pending = self.pending.lock().expect("query table lock poisoned");
            let ids: Vec<TransactionId> = pending
                .iter()
                .filter(|(_, query)| now.saturating_duration_since(query.issued_at) >= timeout)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|query| (id, query)))
                .collect()
        };

        for (id, query) in &expired {
            log::debug!("Query {} timed out after {:?}", id, now - query.issued_at);
        }
        let count = expired.len();
        for (id, query) in expired {
            let _ = query.completer.send(Err(QueryError::Timeout(id)));
        }
        count
    }

    /// Reject every pending query regardless of age.
    ///
    /// Returns the number of queries cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(TransactionId, PendingQuery)> = self
            .pending
            .lock()
            .expect("query table lock poisoned")
            .drain()
            .collect();

        let count = drained.len();
        for (id, query) in drained {
            let _ = query.completer.send(Err(QueryError::Cancelled(id)));
        }
        count
    }

    /// Whether a query with `id` is pending.
    #[must_use]
    pub fn contains(&self, id: TransactionId) -> bool {
        self.pending
            .lock()
            .expect("query table lock poisoned")
            .contains_key(&id)
    }

    /// Number of pending queries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().expect("query table lock poisoned").len()
    }

    /// Whether no query is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum HandleState {
    Waiting(oneshot::Receiver<Completion>),
    Failed(Option<QueryError>),
}

/// Awaitable result of [`crate::Client::query`], typed by the expected reply.
///
/// Resolves to the reply downcast to `R`, or to the [`QueryError`] that ended
/// the query. Dropping the handle does not remove the pending entry; it is
/// still cleared by its reply, the timeout sweep or a close.
#[must_use = "a query handle does nothing unless awaited"]
pub struct QueryHandle<R> {
    id: Option<TransactionId>,
    state: HandleState,
    _reply: PhantomData<fn() -> R>,
}

impl<R> std::fmt::Debug for QueryHandle<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("transaction_id", &self.id)
            .field("failed", &matches!(self.state, HandleState::Failed(_)))
            .finish()
    }
}

impl<R: Message> QueryHandle<R> {
    /// Handle waiting on a registered query.
    pub(crate) fn pending(id: TransactionId, receiver: oneshot::Receiver<Completion>) -> Self {
        Self {
            id: Some(id),
            state: HandleState::Waiting(receiver),
            _reply: PhantomData,
        }
    }

    /// Handle that fails as soon as it is polled.
    pub(crate) fn failed(id: Option<TransactionId>, error: QueryError) -> Self {
        Self {
            id,
            state: HandleState::Failed(Some(error)),
            _reply: PhantomData,
        }
    }

    /// Transaction id of the query, if it had one.
    #[must_use]
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.id
    }
}

impl<R: Message> Future for QueryHandle<R> {
    type Output = Result<Arc<R>, QueryError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(QueryError::Abandoned)))
            }
            HandleState::Waiting(receiver) => match Pin::new(receiver).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Err(_closed)) => Poll::Ready(Err(QueryError::Abandoned)),
                Poll::Ready(Ok(Err(error))) => Poll::Ready(Err(error)),
                Poll::Ready(Ok(Ok(reply))) => {
                    let id = reply.transaction_id();
                    Poll::Ready(
                        downcast_message::<R>(reply).map_err(|_other| QueryError::UnexpectedReply(id)),
                    )
                }
            },
        }
    }
}
