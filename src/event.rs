//! Subscriptions to derived events, and the watcher tasks feeding them.
//!
//! Each remote object has one [`Hub`] per event type. The hub owns at most one watcher task that
//! turns raw signals into events, and fans them out to every live [`Subscription`]. The watcher is
//! started by the first subscription and stopped when the last one is dropped.

use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll},
};

use futures_util::Stream;
use tokio::{
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};

use crate::{Device, Result};

/// Spawns `fut` on the runtime, logging its error instead of dropping it silently.
pub(crate) fn spawn_supervised<F>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match fut.await {
            Ok(()) => log::debug!("{} finished", name),
            Err(e) => log::error!("{} failed: {}", name, e),
        }
    })
}

/// A background task that is aborted when dropped.
pub(crate) struct Watcher(JoinHandle<()>);

impl Watcher {
    pub(crate) fn spawn<F>(name: &'static str, fut: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self(spawn_supervised(name, fut))
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct Subscriber<E> {
    id: u64,
    filter: fn(&E) -> bool,
    tx: UnboundedSender<E>,
}

struct HubState<E> {
    subscribers: Vec<Subscriber<E>>,
    next_id: u64,
    watcher: Option<Watcher>,
}

/// Fans events of one remote object out to its subscriptions.
pub(crate) struct Hub<E> {
    state: Mutex<HubState<E>>,
}

impl<E: Clone + Send + 'static> Hub<E> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HubState {
                subscribers: Vec::new(),
                next_id: 0,
                watcher: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState<E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscriber interested in the events selected by `filter`.
    ///
    /// The registration is undone when the returned [`Registration`] is dropped.
    pub(crate) fn register(
        self: &Arc<Self>,
        filter: fn(&E) -> bool,
    ) -> (Registration<E>, UnboundedReceiver<E>) {
        let (tx, rx) = unbounded_channel();
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, filter, tx });
        (
            Registration {
                hub: self.clone(),
                id,
            },
            rx,
        )
    }

    pub(crate) fn has_watcher(&self) -> bool {
        self.lock().watcher.is_some()
    }

    /// Installs `watcher` unless another one won the race, in which case `watcher` is dropped.
    pub(crate) fn install(&self, watcher: Watcher) {
        let mut state = self.lock();
        if state.watcher.is_none() && !state.subscribers.is_empty() {
            state.watcher = Some(watcher);
        }
    }

    /// Delivers `event` to every interested subscriber.
    pub(crate) fn emit(&self, event: E) {
        let mut state = self.lock();
        state.subscribers.retain(|sub| {
            if (sub.filter)(&event) {
                sub.tx.send(event.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
    }

    /// Ends every subscription, eg. because the remote object went away.
    pub(crate) fn close(&self) {
        let (subscribers, watcher) = {
            let mut state = self.lock();
            (
                std::mem::take(&mut state.subscribers),
                state.watcher.take(),
            )
        };
        drop(subscribers);
        drop(watcher);
    }

    fn unregister(&self, id: u64) {
        let watcher = {
            let mut state = self.lock();
            state.subscribers.retain(|sub| sub.id != id);
            if state.subscribers.is_empty() {
                state.watcher.take()
            } else {
                None
            }
        };
        if watcher.is_some() {
            log::debug!("last subscription dropped, stopping watcher");
        }
    }
}

/// Keeps a subscriber registered with its [`Hub`].
pub(crate) struct Registration<E: Clone + Send + 'static> {
    hub: Arc<Hub<E>>,
    id: u64,
}

impl<E: Clone + Send + 'static> Drop for Registration<E> {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

/// A live subscription to events of type `E`.
///
/// The subscription first yields any events replaying the state at the time of subscribing (those
/// have `is_state_change` set to `false`), followed by live events as they happen. Dropping it
/// unsubscribes; once the last subscription of an object is gone, its signal watcher is removed.
pub struct Subscription<E: Clone + Send + 'static> {
    replay: VecDeque<E>,
    rx: UnboundedReceiver<E>,
    _registration: Registration<E>,
}

impl<E: Clone + Send + 'static> Subscription<E> {
    pub(crate) fn new(
        replay: VecDeque<E>,
        (registration, rx): (Registration<E>, UnboundedReceiver<E>),
    ) -> Self {
        Self {
            replay,
            rx,
            _registration: registration,
        }
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the signal stream feeding this subscription has ended, eg. because the
    /// bus connection was lost. A remote object that disappears does not end its subscriptions;
    /// they just stop yielding events. There is no built-in timeout.
    pub async fn next(&mut self) -> Option<E> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }
        self.rx.recv().await
    }

    /// Runs `handler` on a background task for every event of this subscription.
    ///
    /// Errors returned by `handler` are logged and don't stop the subscription. Abort the returned
    /// handle (or let the event source go away) to unsubscribe.
    pub fn dispatch<F, Fut>(mut self, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(E) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        spawn_supervised("event handler", async move {
            while let Some(event) = self.next().await {
                if let Err(e) = handler(event).await {
                    log::error!("event handler failed: {}", e);
                }
            }
            Ok(())
        })
    }
}

// Nothing is pinned structurally; the receiver and replay queue are moved freely.
impl<E: Clone + Send + 'static> Unpin for Subscription<E> {}

impl<E: Clone + Send + 'static> Stream for Subscription<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        if let Some(event) = self.replay.pop_front() {
            return Poll::Ready(Some(event));
        }
        self.rx.poll_recv(cx)
    }
}

/// Events emitted by an [`Adapter`][crate::Adapter].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum AdapterEvent {
    /// A device is known to the adapter.
    ///
    /// `is_state_change` is `false` for devices that were already known when subscribing.
    DeviceFound {
        device: Device,
        is_state_change: bool,
    },
    /// The adapter is powered.
    ///
    /// `is_state_change` is `false` if it already was when subscribing.
    PoweredOn { is_state_change: bool },
    /// The adapter was powered off.
    PoweredOff,
}

/// Events emitted by a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeviceEvent {
    Connected,
    Disconnected,
    /// GATT service discovery has completed.
    ServicesResolved,
}

/// A new value of a [`Characteristic`][crate::gatt::Characteristic].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueChanged {
    pub value: Vec<u8>,
    /// `false` for the value read when subscribing, `true` for notifications.
    pub is_state_change: bool,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;

    fn everything(_: &u32) -> bool {
        true
    }

    fn even(e: &u32) -> bool {
        e % 2 == 0
    }

    #[tokio::test]
    async fn fan_out_and_teardown() {
        let hub = Arc::new(Hub::<u32>::new());
        let mut all = Subscription::new(VecDeque::from([100]), hub.register(everything));
        let mut evens = Subscription::new(VecDeque::new(), hub.register(even));

        let (tx, mut stopped) = unbounded_channel::<()>();
        hub.install(Watcher::spawn("test watcher", async move {
            let _tx = tx;
            std::future::pending::<()>().await;
            Ok(())
        }));
        assert!(hub.has_watcher());

        hub.emit(1);
        hub.emit(2);

        assert_eq!(all.next().await, Some(100));
        assert_eq!(all.next().await, Some(1));
        assert_eq!(all.next().await, Some(2));
        assert_eq!(evens.next().await, Some(2));

        drop(all);
        assert!(hub.has_watcher());
        drop(evens);
        assert!(!hub.has_watcher());

        // The aborted task drops its sender.
        let closed = tokio::time::timeout(Duration::from_secs(5), stopped.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let hub = Arc::new(Hub::<u32>::new());
        let mut sub = Subscription::new(VecDeque::from([7]), hub.register(everything));
        hub.install(Watcher::spawn("test watcher", std::future::pending()));

        hub.close();
        assert!(!hub.has_watcher());
        assert_eq!(sub.next().await, Some(7));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn losing_watcher_is_dropped() {
        let hub = Arc::new(Hub::<u32>::new());
        let _sub = Subscription::new(VecDeque::new(), hub.register(everything));

        let (first_tx, mut first) = unbounded_channel::<()>();
        let (second_tx, mut second) = unbounded_channel::<()>();
        hub.install(Watcher::spawn("first watcher", async move {
            let _tx = first_tx;
            std::future::pending::<()>().await;
            Ok(())
        }));
        hub.install(Watcher::spawn("second watcher", async move {
            let _tx = second_tx;
            std::future::pending::<()>().await;
            Ok(())
        }));

        let closed = tokio::time::timeout(Duration::from_secs(5), second.recv()).await;
        assert_eq!(closed.unwrap(), None);
        assert!(hub.has_watcher());
        assert_eq!(first.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn usable_as_stream() {
        use futures_util::StreamExt;

        let hub = Arc::new(Hub::<u32>::new());
        let mut sub = Subscription::new(VecDeque::from([1]), hub.register(everything));
        hub.emit(2);
        hub.emit(3);
        hub.close();

        assert_eq!(StreamExt::next(&mut sub).await, Some(1));
        let rest: Vec<u32> = sub.collect().await;
        assert_eq!(rest, [2, 3]);
    }

    #[tokio::test]
    async fn handler_errors_are_contained() {
        let hub = Arc::new(Hub::<u32>::new());
        let sub = Subscription::new(VecDeque::new(), hub.register(everything));
        let (seen_tx, mut seen) = unbounded_channel();
        let task = sub.dispatch(move |e| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send(e).ok();
                if e == 1 {
                    return Err(crate::Error::from("handler broke"));
                }
                Ok(())
            }
        });

        hub.emit(1);
        hub.emit(2);
        assert_eq!(seen.recv().await, Some(1));
        assert_eq!(seen.recv().await, Some(2));
        task.abort();
    }
}
