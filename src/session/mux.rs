//! Request/response multiplexer: message-id allocation, the confirmable
//! retransmission table, and correlated-response waiters.

use coap_lite::Packet;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

use crate::codec;
use crate::core::{DeviceError, MAX_RETRANSMIT_ATTEMPTS, RETRANSMIT_BASE_TIMEOUT};

/// Source of truth for outbound message ids: 16-bit, strictly monotonic per
/// session, wrapping 65535 -> 0.
#[derive(Debug)]
pub struct MessageIdCounter {
    next_value: u16,
}

impl MessageIdCounter {
    /// Start the counter; the TCP variant seeds it from session material.
    pub fn new(initial: u16) -> Self {
        Self {
            next_value: initial,
        }
    }

    /// Take the next message id.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next_value;
        self.next_value = self.next_value.wrapping_add(1);
        id
    }

    /// Return a speculatively consumed id after a discarded response.
    pub fn rollback(&mut self) {
        self.next_value = self.next_value.wrapping_sub(1);
    }
}

/// One confirmable frame awaiting COMPLETE correlation.
#[derive(Debug)]
struct PendingConfirmable {
    message_id: u16,
    frame: Vec<u8>,
    /// Attempt currently on the wire, 1..=3.
    attempts: u8,
    deadline: Instant,
}

impl PendingConfirmable {
    fn attempt_timeout(attempt: u8) -> Duration {
        RETRANSMIT_BASE_TIMEOUT * 2u32.pow(u32::from(attempt) - 1)
    }
}

/// What to do after a retransmission deadline fires.
#[derive(Debug, Default)]
pub struct RetransmitOutcome {
    /// Frames to rewrite verbatim (same message id, next attempt).
    pub resend: Vec<Vec<u8>>,
    /// A message exhausted its third attempt: the session is broken.
    pub exhausted: bool,
}

/// Tracks every in-flight confirmable message, one entry per message id.
#[derive(Debug, Default)]
pub struct RetransmitTable {
    pending: Vec<PendingConfirmable>,
}

impl RetransmitTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register attempt 1 for a frame that is about to go out.
    pub fn register(&mut self, message_id: u16, frame: Vec<u8>) {
        self.pending.retain(|p| p.message_id != message_id);
        self.pending.push(PendingConfirmable {
            message_id,
            frame,
            attempts: 1,
            deadline: Instant::now() + PendingConfirmable::attempt_timeout(1),
        });
    }

    /// COMPLETE arrived for a message id; drop its entry.
    pub fn complete(&mut self, message_id: u16) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.message_id != message_id);
        self.pending.len() != before
    }

    /// Earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }

    /// Advance all entries whose deadline has passed.
    pub fn on_deadline(&mut self, now: Instant) -> RetransmitOutcome {
        let mut outcome = RetransmitOutcome::default();
        for p in &mut self.pending {
            if p.deadline > now {
                continue;
            }
            if p.attempts >= MAX_RETRANSMIT_ATTEMPTS {
                outcome.exhausted = true;
                continue;
            }
            p.attempts += 1;
            p.deadline = now + PendingConfirmable::attempt_timeout(p.attempts);
            outcome.resend.push(p.frame.clone());
        }
        outcome
    }

    /// Number of in-flight confirmables.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop every entry (session teardown).
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

/// Correlation kind an inbound packet can satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKind {
    /// Empty 0.00 acknowledgement.
    Ack,
    /// Any acknowledgement of a confirmable we sent.
    Complete,
    /// A response (piggybacked or separate) carrying a code and maybe a token.
    Response,
}

/// Filters a waiter applies to candidate packets.
#[derive(Debug, Clone)]
pub struct ListenFilter {
    /// Correlation kind.
    pub kind: ListenKind,
    /// Match the packet message id; implies response code < 4.00.
    pub message_id: Option<u16>,
    /// Match the packet token exactly.
    pub token: Option<Vec<u8>>,
}

impl ListenFilter {
    /// Filter on kind alone.
    pub fn kind(kind: ListenKind) -> Self {
        Self {
            kind,
            message_id: None,
            token: None,
        }
    }

    /// Filter on kind and message id.
    pub fn for_message(kind: ListenKind, message_id: u16) -> Self {
        Self {
            kind,
            message_id: Some(message_id),
            token: None,
        }
    }

    /// Filter on kind and token.
    pub fn for_token(kind: ListenKind, token: Vec<u8>) -> Self {
        Self {
            kind,
            message_id: None,
            token: Some(token),
        }
    }

    fn matches(&self, kind: ListenKind, packet: &Packet) -> bool {
        if self.kind != kind {
            return false;
        }
        if let Some(id) = self.message_id {
            if packet.header.message_id != id || codec::code_byte(packet) >= 0x80 {
                return false;
            }
        }
        if let Some(token) = &self.token {
            if &codec::token(packet) != token {
                return false;
            }
        }
        true
    }
}

/// Sender half a resolved waiter fires into.
pub type MessageWaiter = oneshot::Sender<Result<Packet, DeviceError>>;

struct Waiter {
    filter: ListenFilter,
    deadline: Instant,
    tx: MessageWaiter,
}

/// Pending `listen_for` registrations, resolved by inbound classification.
#[derive(Default)]
pub struct WaiterTable {
    waiters: Vec<Waiter>,
}

impl WaiterTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an externally created waiter with an absolute deadline.
    pub fn insert(&mut self, filter: ListenFilter, deadline: Instant, tx: MessageWaiter) {
        self.waiters.push(Waiter {
            filter,
            deadline,
            tx,
        });
    }

    /// Register a waiter and hand back its receiver.
    pub fn register(
        &mut self,
        filter: ListenFilter,
        deadline: Instant,
    ) -> oneshot::Receiver<Result<Packet, DeviceError>> {
        let (tx, rx) = oneshot::channel();
        self.insert(filter, deadline, tx);
        rx
    }

    /// Feed one classification of an inbound packet; every matching waiter
    /// resolves exactly once.
    pub fn resolve(&mut self, kind: ListenKind, packet: &Packet) -> usize {
        let mut resolved = 0;
        let mut remaining = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.filter.matches(kind, packet) {
                let _ = waiter.tx.send(Ok(packet.clone()));
                resolved += 1;
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
        resolved
    }

    /// Earliest waiter deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.waiters.iter().map(|w| w.deadline).min()
    }

    /// Time out every waiter whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let mut remaining = Vec::with_capacity(self.waiters.len());
        for waiter in self.waiters.drain(..) {
            if waiter.deadline <= now {
                let _ = waiter.tx.send(Err(DeviceError::Timeout));
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
    }

    /// Disconnect: reject every pending waiter.
    pub fn reject_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.tx.send(Err(DeviceError::Disconnected));
        }
    }

    /// Number of registered waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Whether no waiters are registered.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Status;

    #[test]
    fn counter_wraps_at_u16_max() {
        let mut counter = MessageIdCounter::new(65_535);
        assert_eq!(counter.next_id(), 65_535);
        assert_eq!(counter.next_id(), 0);
        assert_eq!(counter.next_id(), 1);
    }

    #[test]
    fn counter_rollback_returns_last_id() {
        let mut counter = MessageIdCounter::new(10);
        assert_eq!(counter.next_id(), 10);
        counter.rollback();
        assert_eq!(counter.next_id(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn retransmit_ladder_follows_backoff() {
        let mut table = RetransmitTable::new();
        let start = Instant::now();
        table.register(100, vec![0xde, 0xad]);

        // Attempt 1 expires 4s after send.
        assert_eq!(table.next_deadline(), Some(start + Duration::from_secs(4)));

        tokio::time::advance(Duration::from_secs(4)).await;
        let outcome = table.on_deadline(Instant::now());
        assert_eq!(outcome.resend, vec![vec![0xde, 0xad]]);
        assert!(!outcome.exhausted);

        // Attempt 2 expires 8s later (t=12s).
        assert_eq!(
            table.next_deadline(),
            Some(start + Duration::from_secs(12))
        );
        tokio::time::advance(Duration::from_secs(8)).await;
        let outcome = table.on_deadline(Instant::now());
        assert_eq!(outcome.resend.len(), 1);
        assert!(!outcome.exhausted);

        // Attempt 3 expires 16s later (t=28s): session broken.
        assert_eq!(
            table.next_deadline(),
            Some(start + Duration::from_secs(28))
        );
        tokio::time::advance(Duration::from_secs(16)).await;
        let outcome = table.on_deadline(Instant::now());
        assert!(outcome.resend.is_empty());
        assert!(outcome.exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn complete_clears_single_entry() {
        let mut table = RetransmitTable::new();
        table.register(1, vec![1]);
        table.register(2, vec![2]);
        // Re-registering the same id keeps exactly one entry.
        table.register(1, vec![3]);
        assert_eq!(table.len(), 2);

        assert!(table.complete(1));
        assert!(!table.complete(1));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_matches_token_and_message_id() {
        let mut table = WaiterTable::new();
        let deadline = Instant::now() + Duration::from_secs(30);

        let mut rx_token = table.register(
            ListenFilter::for_token(ListenKind::Response, vec![0xab]),
            deadline,
        );
        let mut rx_id = table.register(
            ListenFilter::for_message(ListenKind::Response, 42),
            deadline,
        );

        let ok = codec::ack_with(Status::Content, 42, vec![0xab], b"x".to_vec());
        assert_eq!(table.resolve(ListenKind::Response, &ok), 2);
        assert!(rx_token.try_recv().unwrap().is_ok());
        assert!(rx_id.try_recv().unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn message_id_waiter_ignores_error_codes() {
        let mut table = WaiterTable::new();
        let mut rx = table.register(
            ListenFilter::for_message(ListenKind::Response, 42),
            Instant::now() + Duration::from_secs(30),
        );

        let bad = codec::ack_with(Status::BadRequest, 42, vec![], vec![]);
        assert_eq!(table.resolve(ListenKind::Response, &bad), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_expire_and_reject() {
        let mut table = WaiterTable::new();
        let mut rx_soon = table.register(
            ListenFilter::kind(ListenKind::Ack),
            Instant::now() + Duration::from_secs(1),
        );
        let mut rx_later = table.register(
            ListenFilter::kind(ListenKind::Ack),
            Instant::now() + Duration::from_secs(60),
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        table.expire(Instant::now());
        assert!(matches!(
            rx_soon.try_recv().unwrap(),
            Err(DeviceError::Timeout)
        ));

        table.reject_all();
        assert!(matches!(
            rx_later.try_recv().unwrap(),
            Err(DeviceError::Disconnected)
        ));
        assert!(table.is_empty());
    }
}
