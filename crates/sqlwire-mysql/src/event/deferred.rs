//! Single-threaded one-shot result handle.
//!
//! [`deferred`] returns a [`Resolver`] / [`Deferred`] pair. The resolver side
//! is consumed by [`resolve`](Resolver::resolve), so a value is delivered at
//! most once. The receiving side can be polled ([`try_take`](Deferred::try_take)),
//! chained with a callback ([`then`](Deferred::then)) or awaited as a
//! [`Future`].

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

struct Slot<T> {
    value: Option<T>,
    callback: Option<Box<dyn FnOnce(T)>>,
    waker: Option<Waker>,
    resolver_dropped: bool,
}

/// Create a connected resolver/handle pair.
pub fn deferred<T>() -> (Resolver<T>, Deferred<T>) {
    let slot = Rc::new(RefCell::new(Slot {
        value: None,
        callback: None,
        waker: None,
        resolver_dropped: false,
    }));
    (
        Resolver {
            slot: Rc::clone(&slot),
            resolved: false,
        },
        Deferred { slot },
    )
}

/// The sending half. Dropping it without resolving leaves the handle pending
/// and marks it [closed](Deferred::is_closed).
pub struct Resolver<T> {
    slot: Rc<RefCell<Slot<T>>>,
    resolved: bool,
}

impl<T> Resolver<T> {
    /// Deliver `value`. A registered [`then`](Deferred::then) callback runs
    /// immediately; otherwise the value is stored for the handle.
    pub fn resolve(mut self, value: T) {
        self.resolved = true;
        let callback = {
            let mut slot = self.slot.borrow_mut();
            match slot.callback.take() {
                Some(callback) => Some((callback, value)),
                None => {
                    slot.value = Some(value);
                    if let Some(waker) = slot.waker.take() {
                        waker.wake();
                    }
                    None
                }
            }
        };
        if let Some((callback, value)) = callback {
            callback(value);
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let mut slot = self.slot.borrow_mut();
        slot.resolver_dropped = true;
        if let Some(waker) = slot.waker.take() {
            waker.wake();
        }
    }
}

/// The receiving half of a [`deferred`] pair.
pub struct Deferred<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("ready", &self.is_ready())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl<T> Deferred<T> {
    /// Whether a value is waiting to be taken.
    pub fn is_ready(&self) -> bool {
        self.slot.borrow().value.is_some()
    }

    /// Whether the resolver went away without resolving.
    pub fn is_closed(&self) -> bool {
        let slot = self.slot.borrow();
        slot.value.is_none() && slot.resolver_dropped
    }

    /// Take the value if it has arrived.
    pub fn try_take(&mut self) -> Option<T> {
        self.slot.borrow_mut().value.take()
    }
}

impl<T: 'static> Deferred<T> {
    /// An already-resolved handle.
    pub fn ready(value: T) -> Self {
        let (resolver, deferred) = deferred();
        resolver.resolve(value);
        deferred
    }

    /// Run `f` with the value, now if it has arrived, otherwise on resolve.
    pub fn then(self, f: impl FnOnce(T) + 'static) {
        let ready = {
            let mut slot = self.slot.borrow_mut();
            match slot.value.take() {
                Some(value) => Some(value),
                None => {
                    slot.callback = Some(Box::new(f));
                    return;
                }
            }
        };
        if let Some(value) = ready {
            f(value);
        }
    }

    /// Map the eventual value into a new handle.
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Deferred<U> {
        let (resolver, mapped) = deferred();
        self.then(move |value| resolver.resolve(f(value)));
        mapped
    }
}

impl<T> Future for Deferred<T> {
    /// `None` if the resolver was dropped without resolving.
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        if let Some(value) = slot.value.take() {
            return Poll::Ready(Some(value));
        }
        if slot.resolver_dropped {
            return Poll::Ready(None);
        }
        slot.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::task::Wake;
    use std::sync::Arc;

    struct Flag(std::sync::atomic::AtomicBool);

    impl Wake for Flag {
        fn wake(self: Arc<Self>) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[test]
    fn test_take_after_resolve() {
        let (resolver, mut handle) = deferred::<i32>();
        assert!(!handle.is_ready());
        assert_eq!(handle.try_take(), None);
        resolver.resolve(7);
        assert!(handle.is_ready());
        assert_eq!(handle.try_take(), Some(7));
        assert_eq!(handle.try_take(), None);
    }

    #[test]
    fn test_then_before_and_after() {
        let seen = Rc::new(Cell::new(0));

        let (resolver, handle) = deferred::<i32>();
        let s = Rc::clone(&seen);
        handle.then(move |v| s.set(v));
        assert_eq!(seen.get(), 0);
        resolver.resolve(3);
        assert_eq!(seen.get(), 3);

        let s = Rc::clone(&seen);
        Deferred::ready(9).map(|v| v + 1).then(move |v| s.set(v));
        assert_eq!(seen.get(), 10);
    }

    #[test]
    fn test_dropped_resolver_closes() {
        let (resolver, handle) = deferred::<i32>();
        drop(resolver);
        assert!(handle.is_closed());
    }

    #[test]
    fn test_debug_with_borrowed_value() {
        let owned = String::from("row");
        let (resolver, mut handle) = deferred::<&str>();
        assert_eq!(format!("{handle:?}"), "Deferred { ready: false, closed: false }");
        resolver.resolve(owned.as_str());
        assert_eq!(format!("{handle:?}"), "Deferred { ready: true, closed: false }");
        assert_eq!(handle.try_take(), Some("row"));
    }

    #[test]
    fn test_poll_wakes() {
        let (resolver, mut handle) = deferred::<&str>();
        let flag = Arc::new(Flag(std::sync::atomic::AtomicBool::new(false)));
        let waker = Waker::from(Arc::clone(&flag));
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut handle).poll(&mut cx).is_pending());
        resolver.resolve("done");
        assert!(flag.0.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(Pin::new(&mut handle).poll(&mut cx), Poll::Ready(Some("done")));
    }
}
