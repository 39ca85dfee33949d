use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// The outcome stored in an [`Awaitable`]: either a real value, or the
/// cancellation sentinel.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Completion<T> {
    /// The operation finished with this value.
    Value(T),
    /// The operation was canceled before a value was set.
    Canceled,
}

impl<T> Completion<T> {
    /// The contained value, unless canceled.
    pub fn into_value(self) -> Option<T> {
        match self {
            Completion::Value(v) => Some(v),
            Completion::Canceled => None,
        }
    }
}

/// Handle returned by [`Awaitable::add_listener`], used to deregister.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ListenerToken(u64);

type Listener<T> = Box<dyn FnOnce(&Completion<T>) + Send>;

struct Inner<T> {
    state: Option<Arc<Completion<T>>>,
    listeners: Vec<(u64, Listener<T>)>,
    next_token: u64,
}

/// A single-assignment completion cell with listener fan-out.
///
/// The first writer wins: later `set` or `cancel` calls are ignored.
/// Listeners registered before completion fire exactly once, in
/// registration order, after the value is visible to readers; a listener
/// registered after completion is invoked immediately. Waiting is done
/// with [`wait`](Self::wait), which can be raced against a timeout or
/// simply dropped to stop waiting.
pub struct Awaitable<T> {
    inner: Arc<(Mutex<Inner<T>>, Notify)>,
}

impl<T> Clone for Awaitable<T> {
    fn clone(&self) -> Self {
        Awaitable {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Awaitable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let done = self.inner.0.lock().state.is_some();
        f.debug_struct("Awaitable").field("done", &done).finish()
    }
}

impl<T> Default for Awaitable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Awaitable<T> {
    /// A fresh, incomplete cell.
    pub fn new() -> Self {
        Awaitable {
            inner: Arc::new((
                Mutex::new(Inner {
                    state: None,
                    listeners: Vec::new(),
                    next_token: 0,
                }),
                Notify::new(),
            )),
        }
    }

    fn complete(&self, completion: Completion<T>) -> bool {
        let (state, listeners) = {
            let mut inner = self.inner.0.lock();
            if inner.state.is_some() {
                return false;
            }
            let state = Arc::new(completion);
            inner.state = Some(Arc::clone(&state));
            (state, std::mem::take(&mut inner.listeners))
        };
        // Fire outside the lock so a listener may re-enter the cell.
        for (_, listener) in listeners {
            listener(&state);
        }
        self.inner.1.notify_waiters();
        true
    }

    /// Complete the cell with `value`. Returns false if it was already
    /// complete (the call is ignored).
    pub fn set(&self, value: T) -> bool {
        self.complete(Completion::Value(value))
    }

    /// Complete the cell with the canceled sentinel.
    pub fn cancel(&self) -> bool {
        self.complete(Completion::Canceled)
    }

    /// Whether a value (or cancellation) has been stored.
    pub fn is_done(&self) -> bool {
        self.inner.0.lock().state.is_some()
    }

    /// Whether the cell completed by cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self.inner.0.lock().state.as_deref(),
            Some(Completion::Canceled)
        )
    }

    /// Register `listener`. Invoked immediately when already complete.
    pub fn add_listener<F>(&self, listener: F) -> ListenerToken
    where
        F: FnOnce(&Completion<T>) + Send + 'static,
    {
        let (token, fire) = {
            let mut inner = self.inner.0.lock();
            let token = inner.next_token;
            inner.next_token += 1;
            match inner.state {
                Some(ref state) => (token, Some(Arc::clone(state))),
                None => {
                    inner.listeners.push((token, Box::new(listener)));
                    return ListenerToken(token);
                }
            }
        };
        if let Some(state) = fire {
            listener(&state);
        }
        ListenerToken(token)
    }

    /// Deregister a pending listener. A no-op if it already fired.
    pub fn remove_listener(&self, token: ListenerToken) {
        self.inner
            .0
            .lock()
            .listeners
            .retain(|(id, _)| *id != token.0);
    }
}

impl<T: Clone> Awaitable<T> {
    /// The completion, if any, without waiting.
    pub fn peek(&self) -> Option<Completion<T>> {
        self.inner.0.lock().state.as_deref().cloned()
    }

    /// The stored value, if completed with one.
    pub fn value(&self) -> Option<T> {
        self.peek().and_then(Completion::into_value)
    }

    /// Wait until the cell completes.
    pub async fn wait(&self) -> Completion<T> {
        loop {
            let notified = self.inner.1.notified();
            if let Some(c) = self.peek() {
                return c;
            }
            notified.await;
        }
    }

    /// Wait with a deadline; `None` means the timeout elapsed first.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<Completion<T>> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn first_writer_wins() {
        let cell = Awaitable::new();
        assert!(cell.set(1));
        assert!(!cell.set(2));
        assert!(!cell.cancel());
        assert_eq!(cell.value(), Some(1));
        assert!(!cell.is_canceled());
    }

    #[test]
    fn listeners_fire_exactly_once_in_order() {
        let cell = Awaitable::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&log);
            cell.add_listener(move |c: &Completion<i32>| {
                log.lock().push((i, c.clone()));
            });
        }
        cell.set(7);
        cell.set(8);

        let log = log.lock();
        assert_eq!(log.len(), 3);
        for (i, entry) in log.iter().enumerate() {
            assert_eq!(*entry, (i, Completion::Value(7)));
        }
    }

    #[test]
    fn late_listener_fires_immediately() {
        let cell = Awaitable::new();
        cell.set(3);
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        cell.add_listener(move |_: &Completion<i32>| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_never_fires() {
        let cell = Awaitable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let token = cell.add_listener(move |_: &Completion<i32>| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        cell.remove_listener(token);
        cell.set(1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_sees_value_set_from_another_task() {
        let cell = Awaitable::new();
        let writer = cell.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.set("done");
        });
        assert_eq!(cell.wait().await, Completion::Value("done"));
    }

    #[tokio::test]
    async fn wait_timeout_elapses() {
        let cell: Awaitable<()> = Awaitable::new();
        let got = cell.wait_timeout(Duration::from_millis(20)).await;
        assert!(got.is_none());

        cell.cancel();
        assert_eq!(
            cell.wait_timeout(Duration::from_millis(20)).await,
            Some(Completion::Canceled)
        );
        assert!(cell.is_canceled());
    }
}
