//! Waiters and the FIFO queue they wait in
//!
//! A waiter is moved into a pool or semaphore when its request cannot be
//! satisfied and is handed back exactly once: through [`Waiter::signal`] when
//! resources arrive or the request is canceled, or inside a
//! [`RequestError`](iocore_common::RequestError) when it is refused up front.
//! Because the queue owns the waiter by value it cannot sit on two queues at
//! once.

use iocore_common::{Affinity, QueuingClass, Ticket};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// How a queued request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Resources were reserved for the waiter
    Granted,
    /// The request was withdrawn before it could be satisfied
    Canceled,
}

/// A request that may have to wait for resources
pub trait Waiter: Send + Sized {
    /// Units needed; must be at least 1
    fn resources_needed(&self) -> u64 {
        1
    }

    /// Preferred CPU for the resources handed to this waiter
    fn affinity(&self) -> Affinity {
        Affinity::Any
    }

    fn class(&self) -> QueuingClass {
        QueuingClass::Normal
    }

    /// Checked before the request is queued
    fn is_canceled(&self) -> bool {
        false
    }

    /// Deliver the outcome. Called once, with no internal lock held, from
    /// whichever thread satisfied or canceled the request.
    fn signal(self, status: WaitStatus);
}

/// Result of a request that was accepted
#[derive(Debug)]
pub enum Admission<W> {
    /// Satisfied on the spot; the waiter comes straight back
    Granted(W),
    /// Queued; the waiter will be signaled later
    Queued(Ticket),
}

impl<W> Admission<W> {
    pub const fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }

    pub const fn ticket(&self) -> Option<Ticket> {
        match self {
            Self::Granted(_) => None,
            Self::Queued(ticket) => Some(*ticket),
        }
    }
}

/// Shared flag a requester flips to withdraw a request
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Boxed completion callback
pub type SignalFn = Box<dyn FnOnce(WaitStatus) + Send>;

/// Waiter built from a closure
pub struct FnWaiter<F = SignalFn> {
    needed: u64,
    affinity: Affinity,
    class: QueuingClass,
    token: Option<CancelToken>,
    on_signal: F,
}

impl<F: FnOnce(WaitStatus) + Send> FnWaiter<F> {
    pub const fn new(needed: u64, on_signal: F) -> Self {
        Self {
            needed,
            affinity: Affinity::Any,
            class: QueuingClass::Normal,
            token: None,
            on_signal,
        }
    }

    #[must_use]
    pub fn with_affinity(mut self, affinity: Affinity) -> Self {
        self.affinity = affinity;
        self
    }

    #[must_use]
    pub fn with_class(mut self, class: QueuingClass) -> Self {
        self.class = class;
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.token = Some(token);
        self
    }
}

impl<F> std::fmt::Debug for FnWaiter<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnWaiter")
            .field("needed", &self.needed)
            .field("affinity", &self.affinity)
            .field("class", &self.class)
            .field("canceled", &self.token.as_ref().is_some_and(CancelToken::is_canceled))
            .finish_non_exhaustive()
    }
}

impl FnWaiter<SignalFn> {
    /// Type-erased waiter, so waiters with different closures share a queue
    pub fn boxed(needed: u64, on_signal: impl FnOnce(WaitStatus) + Send + 'static) -> Self {
        Self::new(needed, Box::new(on_signal))
    }
}

impl<F: FnOnce(WaitStatus) + Send> Waiter for FnWaiter<F> {
    fn resources_needed(&self) -> u64 {
        self.needed
    }

    fn affinity(&self) -> Affinity {
        self.affinity
    }

    fn class(&self) -> QueuingClass {
        self.class
    }

    fn is_canceled(&self) -> bool {
        self.token.as_ref().is_some_and(CancelToken::is_canceled)
    }

    fn signal(self, status: WaitStatus) {
        (self.on_signal)(status);
    }
}

/// A waiter sitting in a [`WaitQueue`]
#[derive(Debug)]
pub struct QueuedWaiter<W> {
    pub ticket: Ticket,
    pub waiter: W,
    pub enqueued_at: Instant,
}

/// FIFO of waiters with ticket-based removal.
///
/// Insertion at the front is reserved for high-priority requests and for
/// putting back a head waiter that could not be satisfied yet.
#[derive(Debug)]
pub struct WaitQueue<W> {
    entries: VecDeque<QueuedWaiter<W>>,
    next_ticket: u64,
}

impl<W> WaitQueue<W> {
    pub const fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_ticket: 0,
        }
    }

    fn issue(&mut self, waiter: W) -> QueuedWaiter<W> {
        let ticket = Ticket::new(self.next_ticket);
        self.next_ticket += 1;
        QueuedWaiter {
            ticket,
            waiter,
            enqueued_at: Instant::now(),
        }
    }

    /// Queue at the tail
    pub fn push_back(&mut self, waiter: W) -> Ticket {
        let entry = self.issue(waiter);
        let ticket = entry.ticket;
        self.entries.push_back(entry);
        ticket
    }

    /// Queue at the head, ahead of everyone already waiting
    pub fn push_front(&mut self, waiter: W) -> Ticket {
        let entry = self.issue(waiter);
        let ticket = entry.ticket;
        self.entries.push_front(entry);
        ticket
    }

    pub fn pop_front(&mut self) -> Option<QueuedWaiter<W>> {
        self.entries.pop_front()
    }

    /// Put a popped head waiter back where it was
    pub fn requeue_front(&mut self, entry: QueuedWaiter<W>) {
        self.entries.push_front(entry);
    }

    pub fn front(&self) -> Option<&QueuedWaiter<W>> {
        self.entries.front()
    }

    /// Remove a waiter by ticket
    pub fn remove(&mut self, ticket: Ticket) -> Option<QueuedWaiter<W>> {
        let idx = self.entries.iter().position(|entry| entry.ticket == ticket)?;
        self.entries.remove(idx)
    }

    pub fn contains(&self, ticket: Ticket) -> bool {
        self.entries.iter().any(|entry| entry.ticket == ticket)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.entries.iter().map(|entry| entry.ticket)
    }
}

impl<W> Default for WaitQueue<W> {
    fn default() -> Self {
        Self::new()
    }
}
