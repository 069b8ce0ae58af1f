//! The contract between the universe and the work it schedules.

use crate::engine::Universe;
use std::future::Future;
use std::pin::Pin;

/// The future an activated event runs as.
///
/// It is polled on the universe's single-threaded scheduler, so it does not
/// need to be `Send`.
pub type EventFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// A unit of work the universe activates at a tick boundary.
///
/// Activation consumes the event. An event that wants to run again
/// schedules a fresh event through [`Universe::schedule_for_activation`].
///
/// The future returned by [`activate`](Event::activate) must yield back to
/// the scheduler (for example with [`tokio::task::yield_now`] or one of the
/// waiting helpers on [`Universe`]) at least once per unit of work it wants
/// interleaved with the clock. A future that never yields starves the tick
/// loop.
pub trait Event: Send + 'static {
    /// The priority band this event is serviced in. Defaults to band 0.
    fn priority(&self) -> u32 {
        0
    }

    /// A short name used in diagnostics.
    fn label(&self) -> &str {
        "event"
    }

    /// Starts the event's work.
    fn activate(self: Box<Self>, universe: Universe) -> EventFuture;
}

/// An [`Event`] built from a closure. See [`event_fn`].
pub struct FnEvent<F> {
    priority: u32,
    label: String,
    body: F,
}

/// Wraps an async closure as an event in the given priority band.
///
/// ```rust,no_run
/// use universe::prelude::*;
///
/// let universe = Universe::default();
/// universe.schedule_for_activation(event_fn(1, |universe| async move {
///     universe.wait_for_band(1).await;
///     println!("serviced at {}", universe.time());
/// }));
/// ```
pub fn event_fn<F, Fut>(priority: u32, body: F) -> FnEvent<F>
where
    F: FnOnce(Universe) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    FnEvent {
        priority,
        label: "fn_event".to_string(),
        body,
    }
}

impl<F> FnEvent<F> {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

impl<F, Fut> Event for FnEvent<F>
where
    F: FnOnce(Universe) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + 'static,
{
    fn priority(&self) -> u32 {
        self.priority
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn activate(self: Box<Self>, universe: Universe) -> EventFuture {
        Box::pin((self.body)(universe))
    }
}
