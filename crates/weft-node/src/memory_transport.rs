//! In-process transport for same-machine fabrics and tests.
//!
//! A pair of endpoints delivers messages synchronously on the transmitting
//! thread, which makes it a "fully synchronous driver": a transmit may
//! re-enter the routing core on the far side before it returns. Tests that
//! need deterministic interleavings can pause an endpoint and pump its
//! queue by hand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use weft_router::{Transport, TransportError, TransportListener, TransportMessage};

type Probe = Arc<dyn Fn(&TransportMessage) + Send + Sync>;

pub struct MemoryTransport {
    peer: Mutex<Weak<MemoryTransport>>,
    listener: Mutex<Option<Weak<dyn TransportListener>>>,
    inbound: Mutex<VecDeque<TransportMessage>>,
    paused: AtomicBool,
    active: AtomicBool,
    /// A single delivery loop runs at a time per endpoint, preserving
    /// message order under re-entrant transmits.
    draining: AtomicBool,
    probe: Mutex<Option<Probe>>,
}

impl MemoryTransport {
    /// Create a connected pair of endpoints.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Arc::new(Self::new());
        let b = Arc::new(Self::new());
        *lock(&a.peer) = Arc::downgrade(&b);
        *lock(&b.peer) = Arc::downgrade(&a);
        (a, b)
    }

    fn new() -> Self {
        Self {
            peer: Mutex::new(Weak::new()),
            listener: Mutex::new(None),
            inbound: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            active: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            probe: Mutex::new(None),
        }
    }

    /// Observe every message transmitted FROM this endpoint. Test hook.
    pub fn set_probe(&self, probe: Probe) {
        *lock(&self.probe) = Some(probe);
    }

    /// Hold inbound messages instead of delivering them.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Resume immediate delivery, draining anything held.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.drain();
    }

    /// Deliver exactly one held message, if any. Returns whether one was
    /// delivered. Only meaningful while paused.
    pub fn pump_one(&self) -> bool {
        let Some(message) = lock(&self.inbound).pop_front() else {
            return false;
        };
        self.dispatch(message)
    }

    /// Number of messages currently held.
    pub fn queued(&self) -> usize {
        lock(&self.inbound).len()
    }

    /// Kill the pair as if the underlying channel failed: both listeners
    /// observe a transport error. Test hook for disconnection scenarios.
    pub fn sever(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let peer = std::mem::take(&mut *lock(&self.peer));
        if let Some(listener) = self.current_listener() {
            listener.on_transport_error();
        }
        if let Some(peer) = peer.upgrade() {
            peer.handle_peer_closed();
        }
    }

    fn current_listener(&self) -> Option<Arc<dyn TransportListener>> {
        lock(&self.listener).clone()?.upgrade()
    }

    fn handle_peer_closed(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        *lock(&self.peer) = Weak::new();
        if let Some(listener) = self.current_listener() {
            listener.on_transport_error();
        }
    }

    /// Accept one message from the peer endpoint.
    fn deliver(&self, message: TransportMessage) {
        if !self.active.load(Ordering::Acquire) {
            return;
        }
        lock(&self.inbound).push_back(message);
        if !self.paused.load(Ordering::Acquire) {
            self.drain();
        }
    }

    fn drain(&self) {
        // One drainer at a time; a re-entrant (or concurrent) deliverer
        // leaves its message for the active loop.
        if self.draining.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let Some(message) = lock(&self.inbound).pop_front() else {
                break;
            };
            if !self.dispatch(message) {
                break;
            }
            if self.paused.load(Ordering::Acquire) || !self.active.load(Ordering::Acquire) {
                break;
            }
        }
        self.draining.store(false, Ordering::Release);

        // A message enqueued after our last pop but before the flag
        // cleared would otherwise sit until the next delivery.
        if !self.paused.load(Ordering::Acquire)
            && self.active.load(Ordering::Acquire)
            && !lock(&self.inbound).is_empty()
            && self.current_listener().is_some()
            && !self.draining.swap(true, Ordering::AcqRel)
        {
            loop {
                let Some(message) = lock(&self.inbound).pop_front() else {
                    break;
                };
                if !self.dispatch(message) {
                    break;
                }
            }
            self.draining.store(false, Ordering::Release);
        }
    }

    /// Returns false when no listener is attached yet; the message goes
    /// back to the queue for activation time.
    fn dispatch(&self, message: TransportMessage) -> bool {
        let Some(listener) = self.current_listener() else {
            lock(&self.inbound).push_front(message);
            return false;
        };
        listener.on_transport_message(message);
        true
    }
}

impl Transport for MemoryTransport {
    fn transmit(&self, message: TransportMessage) -> Result<(), TransportError> {
        if !self.active.load(Ordering::Acquire) {
            return Err(TransportError::Disconnected);
        }
        let Some(peer) = lock(&self.peer).upgrade() else {
            return Err(TransportError::Disconnected);
        };
        if let Some(probe) = lock(&self.probe).clone() {
            probe(&message);
        }
        peer.deliver(message);
        Ok(())
    }

    fn set_listener(&self, listener: Weak<dyn TransportListener>) {
        *lock(&self.listener) = Some(listener);
        if !self.paused.load(Ordering::Acquire) {
            self.drain();
        }
    }

    fn deactivate(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        let peer = std::mem::take(&mut *lock(&self.peer));
        if let Some(peer) = peer.upgrade() {
            peer.handle_peer_closed();
        }
    }
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingListener {
        messages: StdMutex<Vec<Vec<u8>>>,
        errors: StdMutex<usize>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                messages: StdMutex::new(Vec::new()),
                errors: StdMutex::new(0),
            })
        }
    }

    impl TransportListener for RecordingListener {
        fn on_transport_message(&self, message: TransportMessage) -> bool {
            self.messages.lock().unwrap().push(message.data);
            true
        }

        fn on_transport_error(&self) {
            *self.errors.lock().unwrap() += 1;
        }
    }

    fn message(byte: u8) -> TransportMessage {
        TransportMessage {
            data: vec![byte],
            objects: Vec::new(),
        }
    }

    #[test]
    fn messages_before_listener_are_buffered() {
        let (a, b) = MemoryTransport::pair();
        a.transmit(message(1)).unwrap();
        a.transmit(message(2)).unwrap();

        let listener = RecordingListener::new();
        let listener_dyn: Arc<dyn TransportListener> = listener.clone();
        b.set_listener(Arc::downgrade(&listener_dyn));
        assert_eq!(
            *listener.messages.lock().unwrap(),
            vec![vec![1u8], vec![2u8]]
        );
    }

    #[test]
    fn paused_endpoint_queues_and_pumps_in_order() {
        let (a, b) = MemoryTransport::pair();
        let listener = RecordingListener::new();
        let listener_dyn: Arc<dyn TransportListener> = listener.clone();
        b.set_listener(Arc::downgrade(&listener_dyn));

        b.pause();
        a.transmit(message(1)).unwrap();
        a.transmit(message(2)).unwrap();
        a.transmit(message(3)).unwrap();
        assert!(listener.messages.lock().unwrap().is_empty());
        assert_eq!(b.queued(), 3);

        assert!(b.pump_one());
        assert_eq!(*listener.messages.lock().unwrap(), vec![vec![1u8]]);

        b.resume();
        assert_eq!(
            *listener.messages.lock().unwrap(),
            vec![vec![1u8], vec![2u8], vec![3u8]]
        );
        assert!(!b.pump_one());
    }

    #[test]
    fn sever_reports_errors_on_both_ends() {
        let (a, b) = MemoryTransport::pair();
        let listener_a = RecordingListener::new();
        let listener_b = RecordingListener::new();
        let listener_a_dyn: Arc<dyn TransportListener> = listener_a.clone();
        let listener_b_dyn: Arc<dyn TransportListener> = listener_b.clone();
        a.set_listener(Arc::downgrade(&listener_a_dyn));
        b.set_listener(Arc::downgrade(&listener_b_dyn));

        a.sever();
        assert_eq!(*listener_a.errors.lock().unwrap(), 1);
        assert_eq!(*listener_b.errors.lock().unwrap(), 1);
        assert!(matches!(
            a.transmit(message(9)),
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            b.transmit(message(9)),
            Err(TransportError::Disconnected)
        ));
    }

    #[test]
    fn deactivate_errors_only_the_peer() {
        let (a, b) = MemoryTransport::pair();
        let listener_a = RecordingListener::new();
        let listener_b = RecordingListener::new();
        let listener_a_dyn: Arc<dyn TransportListener> = listener_a.clone();
        let listener_b_dyn: Arc<dyn TransportListener> = listener_b.clone();
        a.set_listener(Arc::downgrade(&listener_a_dyn));
        b.set_listener(Arc::downgrade(&listener_b_dyn));

        a.deactivate();
        assert_eq!(*listener_a.errors.lock().unwrap(), 0);
        assert_eq!(*listener_b.errors.lock().unwrap(), 1);
    }
}
