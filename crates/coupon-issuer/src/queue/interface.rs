use crate::{error::Result, types::AdmissionEvent};
use core::future::Future;
use futures::Stream;

/// A durable, at-least-once channel of [`AdmissionEvent`]s.
pub trait FulfillmentQueue: Send + Sync {
    /// Handle for one delivered event.
    type Delivery: Delivery;

    /// Lazy, unbounded sequence of deliveries.
    type Subscription: Stream<Item = Self::Delivery> + Send + Unpin;

    /// Hands `event` to the queue.
    ///
    /// Waits while the consumer side is behind (back-pressure) rather than
    /// buffering without bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QueueClosed`] if the queue stopped accepting events.
    ///
    /// [`Error::QueueClosed`]: crate::Error::QueueClosed
    fn publish(&self, event: AdmissionEvent) -> impl Future<Output = Result<()>> + Send;

    /// Opens a subscription starting from the oldest unacknowledged event.
    fn subscribe(&self) -> Self::Subscription;

    /// Name of the topic or channel backing this queue.
    fn topic(&self) -> &str;
}

/// A delivered event awaiting settlement.
///
/// Exactly one of [`ack`](Self::ack), [`nack`](Self::nack) or
/// [`dead_letter`](Self::dead_letter) settles it. Dropping an unsettled
/// delivery has the same effect as `nack`.
pub trait Delivery: Send + 'static {
    fn event(&self) -> &AdmissionEvent;

    /// 1 for the first delivery of an event, incremented on each redelivery.
    fn attempt(&self) -> u32;

    /// Marks the event as processed. It will not be delivered again (unless
    /// the backing queue itself redelivers).
    fn ack(self);

    /// Returns the event to the queue for another attempt.
    fn nack(self);

    /// Removes the event from circulation and records it with `reason`.
    fn dead_letter(self, reason: String);
}
