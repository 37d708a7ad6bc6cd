//! Callback-based, non-blocking transport contract.
//!
//! Handlers are invoked by the host's event loop, never from inside the
//! transport method that registered them. A read handler receives one chunk
//! per delivery; an empty chunk means the peer closed the stream.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

pub type OpenHandler = Box<dyn FnOnce(io::Result<()>)>;
pub type ReadHandler = Box<dyn FnMut(io::Result<Vec<u8>>)>;
pub type WriteHandler = Box<dyn FnOnce(io::Result<()>)>;

/// A non-blocking byte stream driven by readiness callbacks.
pub trait EventTransport: 'static {
    /// Start connecting; `on_result` fires once.
    fn open(&mut self, on_result: OpenHandler);

    /// Register (or replace) the read handler.
    fn read(&mut self, on_chunk: ReadHandler);

    /// Queue `bytes`; `on_complete` fires once they are flushed or failed.
    fn write(&mut self, bytes: Vec<u8>, on_complete: WriteHandler);

    /// Stop delivering read events until [`resume`](Self::resume).
    fn suspend(&mut self);

    fn resume(&mut self);

    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

#[derive(Default)]
struct Loop {
    on_open: Option<OpenHandler>,
    on_read: Option<ReadHandler>,
    completions: Vec<WriteHandler>,
    inbox: VecDeque<Vec<u8>>,
    written: Vec<u8>,
    opened: bool,
    suspended: bool,
    closed: bool,
}

/// In-memory [`EventTransport`] whose far end is a [`LoopbackPeer`].
///
/// Nothing happens until the peer acts: the peer accepts the open, delivers
/// server bytes and inspects what the client wrote. Useful for driving an
/// event connection from a test or from a host that owns the real socket.
pub struct LoopbackTransport {
    state: Rc<RefCell<Loop>>,
}

/// The host-side end of a [`LoopbackTransport`].
#[derive(Clone)]
pub struct LoopbackPeer {
    state: Rc<RefCell<Loop>>,
}

/// Create a connected transport/peer pair.
pub fn loopback() -> (LoopbackTransport, LoopbackPeer) {
    let state = Rc::new(RefCell::new(Loop::default()));
    (
        LoopbackTransport {
            state: Rc::clone(&state),
        },
        LoopbackPeer { state },
    )
}

impl EventTransport for LoopbackTransport {
    fn open(&mut self, on_result: OpenHandler) {
        self.state.borrow_mut().on_open = Some(on_result);
    }

    fn read(&mut self, on_chunk: ReadHandler) {
        self.state.borrow_mut().on_read = Some(on_chunk);
    }

    fn write(&mut self, bytes: Vec<u8>, on_complete: WriteHandler) {
        let mut state = self.state.borrow_mut();
        if !state.closed {
            state.written.extend_from_slice(&bytes);
        }
        state.completions.push(on_complete);
    }

    fn suspend(&mut self) {
        self.state.borrow_mut().suspended = true;
    }

    fn resume(&mut self) {
        self.state.borrow_mut().suspended = false;
    }

    fn close(&mut self) {
        let mut state = self.state.borrow_mut();
        state.closed = true;
        state.on_read = None;
        state.inbox.clear();
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }
}

impl LoopbackPeer {
    /// Complete a pending open successfully.
    pub fn accept(&self) -> bool {
        self.finish_open(Ok(()))
    }

    /// Fail a pending open.
    pub fn refuse(&self, error: io::Error) -> bool {
        self.finish_open(Err(error))
    }

    pub fn has_pending_open(&self) -> bool {
        self.state.borrow().on_open.is_some()
    }

    /// Deliver server bytes as one chunk, then run pending handlers.
    pub fn deliver(&self, bytes: &[u8]) {
        self.state.borrow_mut().inbox.push_back(bytes.to_vec());
        self.run();
    }

    /// Deliver `bytes` split into chunks of at most `size` bytes.
    pub fn deliver_chunked(&self, bytes: &[u8], size: usize) {
        for chunk in bytes.chunks(size.max(1)) {
            self.deliver(chunk);
        }
    }

    /// Signal end of stream to the client.
    pub fn hang_up(&self) {
        self.deliver(&[]);
    }

    /// Fail the stream with `error`.
    pub fn fail(&self, error: io::Error) {
        let handler = self.state.borrow_mut().on_read.take();
        if let Some(mut handler) = handler {
            handler(Err(error));
            self.restore_reader(handler);
        }
    }

    /// Bytes written by the client since the last call.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.borrow_mut().written)
    }

    /// Whether the open was accepted and the client has not closed.
    pub fn is_open(&self) -> bool {
        let state = self.state.borrow();
        state.opened && !state.closed
    }

    /// Whether the client closed its end.
    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn is_suspended(&self) -> bool {
        self.state.borrow().suspended
    }

    /// Fire write completions, then deliver queued chunks until the inbox is
    /// empty, the client suspends, or no reader is registered.
    pub fn run(&self) {
        let completions = std::mem::take(&mut self.state.borrow_mut().completions);
        for complete in completions {
            complete(Ok(()));
        }

        loop {
            let next = {
                let mut state = self.state.borrow_mut();
                if state.suspended || state.closed || state.inbox.is_empty() {
                    None
                } else {
                    state
                        .on_read
                        .take()
                        .and_then(|handler| Some((state.inbox.pop_front()?, handler)))
                }
            };
            let Some((chunk, mut handler)) = next else {
                return;
            };
            handler(Ok(chunk));
            self.restore_reader(handler);
        }
    }

    fn finish_open(&self, result: io::Result<()>) -> bool {
        let handler = {
            let mut state = self.state.borrow_mut();
            state.opened = result.is_ok();
            state.on_open.take()
        };
        match handler {
            Some(handler) => {
                handler(result);
                self.run();
                true
            }
            None => false,
        }
    }

    fn restore_reader(&self, handler: ReadHandler) {
        let mut state = self.state.borrow_mut();
        if state.on_read.is_none() && !state.closed {
            state.on_read = Some(handler);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_loopback_delivery() {
        let (mut transport, peer) = loopback();
        let opened = Rc::new(RefCell::new(None));
        let o = Rc::clone(&opened);
        transport.open(Box::new(move |r| *o.borrow_mut() = Some(r.is_ok())));
        assert!(peer.has_pending_open());
        assert!(peer.accept());
        assert_eq!(*opened.borrow(), Some(true));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        transport.read(Box::new(move |chunk| s.borrow_mut().push(chunk.unwrap())));
        peer.deliver_chunked(b"abcde", 2);
        assert_eq!(*seen.borrow(), vec![b"ab".to_vec(), b"cd".to_vec(), b"e".to_vec()]);

        transport.write(b"xyz".to_vec(), Box::new(|r| assert!(r.is_ok())));
        assert_eq!(peer.take_written(), b"xyz");
    }

    #[test]
    fn test_suspend_holds_chunks() {
        let (mut transport, peer) = loopback();
        let seen = Rc::new(RefCell::new(0));
        let s = Rc::clone(&seen);
        transport.read(Box::new(move |_| *s.borrow_mut() += 1));
        transport.suspend();
        peer.deliver(b"a");
        assert_eq!(*seen.borrow(), 0);
        transport.resume();
        peer.run();
        assert_eq!(*seen.borrow(), 1);
    }
}
