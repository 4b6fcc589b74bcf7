//! In-process fulfillment queue.
//!
//! [`MemoryQueue`] keeps every published event until a consumer settles it.
//! Subscriptions compete for the same ready list, so any number of workers
//! can share one queue. An event handed out but not acknowledged (nacked, or
//! its delivery dropped because the consumer went away) goes back to the ready
//! list, which is what makes a fresh subscription resume from the oldest
//! unacknowledged event.
//!
//! Capacity bounds *unacknowledged* events, not just buffered ones: a
//! publisher waits once `capacity` events are ready or in flight.

use crate::{
    error::{Error, Result},
    queue::{Delivery, FulfillmentQueue},
    types::AdmissionEvent,
};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Default bound on unacknowledged events.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Artificial redelivery injected after an event is acknowledged.
///
/// Simulates a broker that lost the acknowledgement and hands the event out
/// again. Only original deliveries spawn duplicates; duplicates never
/// duplicate themselves.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum RedeliveryPolicy {
    #[default]
    Never,
    /// Every acknowledged event is delivered `copies` more times.
    Duplicate { copies: u32 },
    /// Each acknowledged event is delivered once more with `probability`.
    Random { probability: f64 },
}

impl RedeliveryPolicy {
    fn duplicates(self) -> u32 {
        match self {
            Self::Never => 0,
            Self::Duplicate { copies } => copies,
            Self::Random { probability } => {
                u32::from(rand::random_bool(probability.clamp(0.0, 1.0)))
            }
        }
    }
}

/// An event removed from circulation after repeated failures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub event: AdmissionEvent,
    pub attempts: u32,
    pub reason: String,
}

struct Envelope {
    event: AdmissionEvent,
    /// Deliveries handed out so far.
    attempt: u32,
    duplicate: bool,
    // Held until the event leaves the queue; releasing it admits the next
    // waiting publisher.
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Envelope>,
    in_flight: HashMap<u64, Envelope>,
    next_tag: u64,
    acknowledged: u64,
    dead_letters: Vec<DeadLetter>,
}

enum Settlement {
    Ack,
    Nack,
    DeadLetter(String),
}

struct Shared {
    topic: String,
    capacity: Arc<Semaphore>,
    policy: RedeliveryPolicy,
    state: Mutex<State>,
    notify: Notify,
    closed: AtomicBool,
}

impl Shared {
    fn closed_error(&self) -> Error {
        Error::QueueClosed {
            topic: self.topic.clone(),
        }
    }

    async fn next_delivery(self: &Arc<Self>) -> Option<MemoryDelivery> {
        loop {
            // Register interest before inspecting state so a publish that
            // lands in between still wakes us.
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(mut envelope) = state.ready.pop_front() {
                    envelope.attempt += 1;
                    let tag = state.next_tag;
                    state.next_tag += 1;

                    let delivery = MemoryDelivery {
                        shared: Arc::clone(self),
                        tag,
                        event: envelope.event,
                        attempt: envelope.attempt,
                        settled: false,
                    };
                    state.in_flight.insert(tag, envelope);
                    return Some(delivery);
                }

                // In-flight events may still come back, so only a closed queue
                // with nothing outstanding ends the subscription.
                if self.closed.load(Ordering::Acquire) && state.in_flight.is_empty() {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn settle(&self, tag: u64, settlement: Settlement) {
        {
            let mut state = self.state.lock();
            let Some(envelope) = state.in_flight.remove(&tag) else {
                return;
            };

            match settlement {
                Settlement::Ack => {
                    state.acknowledged += 1;
                    if !envelope.duplicate {
                        for _ in 0..self.policy.duplicates() {
                            state.ready.push_back(Envelope {
                                event: envelope.event,
                                attempt: envelope.attempt,
                                duplicate: true,
                                _permit: None,
                            });
                        }
                    }
                }
                Settlement::Nack => state.ready.push_back(envelope),
                Settlement::DeadLetter(reason) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        topic = %self.topic,
                        user_id = %envelope.event.user_id,
                        attempts = envelope.attempt,
                        %reason,
                        "Event moved to dead-letter list"
                    );
                    state.dead_letters.push(DeadLetter {
                        event: envelope.event,
                        attempts: envelope.attempt,
                        reason,
                    });
                }
            }
        }

        self.notify.notify_waiters();
    }
}

/// Bounded, at-least-once, in-process queue of [`AdmissionEvent`]s.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct MemoryQueue {
    shared: Arc<Shared>,
}

impl MemoryQueue {
    /// Creates a queue named `topic` holding at most `capacity` (minimum 1)
    /// unacknowledged events.
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        Self::with_redelivery(topic, capacity, RedeliveryPolicy::Never)
    }

    pub fn with_redelivery(
        topic: impl Into<String>,
        capacity: usize,
        policy: RedeliveryPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                topic: topic.into(),
                capacity: Arc::new(Semaphore::new(capacity.max(1))),
                policy,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Stops accepting events.
    ///
    /// Publishers waiting for capacity fail with [`Error::QueueClosed`].
    /// Subscriptions keep delivering whatever is outstanding and end once
    /// nothing is ready or in flight.
    pub fn close(&self) {
        {
            let _state = self.shared.state.lock();
            self.shared.closed.store(true, Ordering::Release);
        }
        self.shared.capacity.close();
        self.shared.notify.notify_waiters();

        #[cfg(feature = "tracing")]
        tracing::debug!(topic = %self.shared.topic, "Queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Events that are ready or in flight.
    pub fn pending(&self) -> usize {
        let state = self.shared.state.lock();
        state.ready.len() + state.in_flight.len()
    }

    /// Total acknowledgements, duplicates included.
    pub fn acknowledged(&self) -> u64 {
        self.shared.state.lock().acknowledged
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state.lock().dead_letters.clone()
    }
}

impl FulfillmentQueue for MemoryQueue {
    type Delivery = MemoryDelivery;
    type Subscription = BoxStream<'static, MemoryDelivery>;

    async fn publish(&self, event: AdmissionEvent) -> Result<()> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(shared.closed_error());
        }

        let permit = Arc::clone(&shared.capacity)
            .acquire_owned()
            .await
            .map_err(|_| shared.closed_error())?;

        {
            let mut state = shared.state.lock();
            // `close` may have won the race while we waited for capacity.
            if shared.closed.load(Ordering::Acquire) {
                return Err(shared.closed_error());
            }
            state.ready.push_back(Envelope {
                event,
                attempt: 0,
                duplicate: false,
                _permit: Some(permit),
            });
        }

        shared.notify.notify_waiters();
        Ok(())
    }

    fn subscribe(&self) -> Self::Subscription {
        stream::unfold(Arc::clone(&self.shared), |shared| async move {
            let delivery = shared.next_delivery().await?;
            Some((delivery, shared))
        })
        .boxed()
    }

    fn topic(&self) -> &str {
        &self.shared.topic
    }
}

/// A delivery handed out by [`MemoryQueue`].
pub struct MemoryDelivery {
    shared: Arc<Shared>,
    tag: u64,
    event: AdmissionEvent,
    attempt: u32,
    settled: bool,
}

impl MemoryDelivery {
    fn settle(&mut self, settlement: Settlement) {
        if !self.settled {
            self.settled = true;
            self.shared.settle(self.tag, settlement);
        }
    }
}

impl Delivery for MemoryDelivery {
    fn event(&self) -> &AdmissionEvent {
        &self.event
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn ack(mut self) {
        self.settle(Settlement::Ack);
    }

    fn nack(mut self) {
        self.settle(Settlement::Nack);
    }

    fn dead_letter(mut self, reason: String) {
        self.settle(Settlement::DeadLetter(reason));
    }
}

impl Drop for MemoryDelivery {
    fn drop(&mut self) {
        self.settle(Settlement::Nack);
    }
}
