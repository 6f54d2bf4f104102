//! Typed dispatch of unsolicited inbound items.
//!
//! Handlers are registered per [`Kind`] in an ordered list. Registration
//! order is invocation order and the same handler may be registered more than
//! once, in which case it runs once per registration. Handlers are compared by
//! identity (`Arc::ptr_eq`), which is what [`DispatchTable::cancel`] uses.
//!
//! # Invocation
//!
//! For each inbound item, [`DispatchTable::dispatch`] calls every handler for
//! the item's kind in registration order on the caller's task, then spawns the
//! returned futures so that a slow handler cannot stall the connection.
//! Errors and panics are caught per handler and surfaced through the supplied
//! failure callback.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::error::ClientError;
use crate::message::{Inbound, Kind};

/// Future returned by a [`Handler`].
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// A listener for inbound items of one kind.
pub type Handler = Arc<dyn Fn(Inbound) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
///
/// ```ignore
/// let on_text = handler(|inbound| async move {
///     log::info!("got {:?}", inbound.as_text());
///     Ok(())
/// });
/// ```
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Inbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |inbound: Inbound| -> HandlerFuture { f(inbound).boxed() })
}

/// Ordered handler lists keyed by kind.
#[derive(Default)]
pub struct DispatchTable {
    handlers: Mutex<HashMap<Kind, Vec<Handler>>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.lock().expect("dispatch table lock poisoned");
        f.debug_struct("DispatchTable")
            .field("kinds", &handlers.len())
            .field("handlers", &handlers.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl DispatchTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `handler` to the list for `kind`.
    pub fn listen(&self, kind: Kind, handler: Handler) {
        self.handlers
            .lock()
            .expect("dispatch table lock poisoned")
            .entry(kind)
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler` for `kind`.
    ///
    /// Returns `false`, changing nothing, if it was not registered.
    pub fn cancel(&self, kind: Kind, handler: &Handler) -> bool {
        let mut handlers = self.handlers.lock().expect("dispatch table lock poisoned");
        let Some(list) = handlers.get_mut(&kind) else {
            return false;
        };
        let Some(index) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(index);
        if list.is_empty() {
            handlers.remove(&kind);
        }
        true
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.handlers
            .lock()
            .expect("dispatch table lock poisoned")
            .clear();
    }

    /// Number of registrations for `kind`.
    #[must_use]
    pub fn count(&self, kind: Kind) -> usize {
        self.handlers
            .lock()
            .expect("dispatch table lock poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Snapshot of the handlers for `kind`, in invocation order.
    fn snapshot(&self, kind: Kind) -> Vec<Handler> {
        self.handlers
            .lock()
            .expect("dispatch table lock poisoned")
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Run every handler registered for `inbound`'s kind.
    ///
    /// Must be called from within a tokio runtime. Returns the number of
    /// handlers invoked.
    pub fn dispatch<E>(&self, inbound: &Inbound, on_failure: E) -> usize
    where
        E: Fn(ClientError) + Clone + Send + Sync + 'static,
    {
        let kind = inbound.kind();
        // The lock is released before any handler runs, so handlers may
        // listen/cancel freely.
        let handlers = self.snapshot(kind);
        if handlers.is_empty() {
            log::debug!("No handlers for {} item", kind);
            return 0;
        }

        for handler in &handlers {
            let called = std::panic::catch_unwind(AssertUnwindSafe(|| handler(inbound.clone())));
            let future = match called {
                Ok(future) => future,
                Err(panic) => {
                    on_failure(ClientError::HandlerFailed {
                        kind,
                        message: panic_message(&*panic),
                    });
                    continue;
                }
            };

            let on_failure = on_failure.clone();
            tokio::spawn(async move {
                let message = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => format!("{e:#}"),
                    Err(panic) => panic_message(&*panic),
                };
                log::warn!("Handler for {} failed: {}", kind, message);
                on_failure(ClientError::HandlerFailed { kind, message });
            });
        }
        handlers.len()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
