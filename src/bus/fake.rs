//! An in-memory [`Bus`] for unit tests.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::{future::BoxFuture, stream, FutureExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use zbus::zvariant::OwnedObjectPath;

use super::*;
use crate::{
    value::{PropertyBag, Value},
    Error, Result,
};

pub(crate) fn path(s: &str) -> OwnedObjectPath {
    OwnedObjectPath::try_from(s).unwrap()
}

pub(crate) fn bag<const N: usize>(props: [(&str, Value); N]) -> PropertyBag {
    props.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Lets spawned watcher tasks run until they block again.
pub(crate) async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct State {
    objects: ManagedObjects,
    object_manager: Vec<UnboundedSender<ObjectManagerSignal>>,
    watchers: Vec<(OwnedObjectPath, UnboundedSender<PropertiesChanged>)>,
    watches_created: usize,
    calls: Vec<(OwnedObjectPath, MethodCall)>,
    failing_fetches: usize,
    fetches: usize,
    unreadable: HashSet<OwnedObjectPath>,
    read_delay: Option<Duration>,
}

/// A fake daemon. Cloning shares the state.
#[derive(Clone, Default)]
pub(crate) struct FakeBus {
    state: Arc<Mutex<State>>,
}

fn channel<T: Send + 'static>() -> (UnboundedSender<T>, SignalStream<T>) {
    let (tx, rx): (_, UnboundedReceiver<T>) = unbounded_channel();
    let stream = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (Ok(item), rx))
    });
    (tx, stream.boxed())
}

impl FakeBus {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Adds an interface to an object and emits `InterfacesAdded`.
    pub(crate) fn add(&self, p: &str, interface: &str, props: PropertyBag) {
        let mut state = self.state();
        let added = InterfacesAdded {
            path: path(p),
            interfaces: [(interface.to_string(), props)].into_iter().collect(),
        };
        state
            .objects
            .entry(path(p))
            .or_default()
            .extend(added.interfaces.clone());
        let signal = ObjectManagerSignal::Added(added);
        state
            .object_manager
            .retain(|tx| tx.send(signal.clone()).is_ok());
    }

    /// Adds an object without emitting a signal, as if it existed before anyone listened.
    pub(crate) fn insert(&self, p: &str, interface: &str, props: PropertyBag) {
        self.state()
            .objects
            .entry(path(p))
            .or_default()
            .insert(interface.to_string(), props);
    }

    pub(crate) fn remove(&self, p: &str, interfaces: &[&str]) {
        let mut state = self.state();
        if let Some(intfs) = state.objects.get_mut(&path(p)) {
            for i in interfaces {
                intfs.remove(*i);
            }
            if intfs.is_empty() {
                state.objects.remove(&path(p));
            }
        }
        let removed = InterfacesRemoved {
            path: path(p),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
        };
        let signal = ObjectManagerSignal::Removed(removed);
        state
            .object_manager
            .retain(|tx| tx.send(signal.clone()).is_ok());
    }

    /// Changes a property and emits `PropertiesChanged` to every watcher of the object.
    pub(crate) fn set(&self, p: &str, interface: &str, name: &str, value: Value) {
        let mut state = self.state();
        state
            .objects
            .entry(path(p))
            .or_default()
            .entry(interface.to_string())
            .or_default()
            .insert(name.to_string(), value.clone());
        let changed = PropertiesChanged {
            interface: interface.to_string(),
            changed: bag([(name, value)]),
            invalidated: Vec::new(),
        };
        let target = path(p);
        state
            .watchers
            .retain(|(p, tx)| *p != target || tx.send(changed.clone()).is_ok());
    }

    /// Ends every `ObjectManager` signal stream, as if the connection dropped the match rule.
    pub(crate) fn end_object_manager_streams(&self) {
        self.state().object_manager.clear();
    }

    /// Ends every property stream of `p`.
    pub(crate) fn end_property_streams(&self, p: &str) {
        let target = path(p);
        self.state().watchers.retain(|(p, _)| *p != target);
    }

    /// Number of property watchers on `p` whose stream is still alive.
    pub(crate) fn live_watchers(&self, p: &str) -> usize {
        let target = path(p);
        self.state()
            .watchers
            .iter()
            .filter(|(p, tx)| *p == target && !tx.is_closed())
            .count()
    }

    pub(crate) fn watches_created(&self) -> usize {
        self.state().watches_created
    }

    pub(crate) fn calls(&self) -> Vec<(OwnedObjectPath, MethodCall)> {
        self.state().calls.clone()
    }

    pub(crate) fn fail_fetches(&self, n: usize) {
        self.state().failing_fetches = n;
    }

    pub(crate) fn fetches(&self) -> usize {
        self.state().fetches
    }

    pub(crate) fn make_unreadable(&self, p: &str) {
        self.state().unreadable.insert(path(p));
    }

    pub(crate) fn delay_reads(&self, delay: Duration) {
        self.state().read_delay = Some(delay);
    }

    fn lookup(&self, p: &OwnedObjectPath, interface: &str, name: &str) -> Result<Value> {
        self.state()
            .objects
            .get(p)
            .and_then(|intfs| intfs.get(interface))
            .and_then(|props| props.get(name))
            .cloned()
            .ok_or_else(|| {
                Error::from(zbus::Error::Failure(format!(
                    "no property {}.{} on {}",
                    interface,
                    name,
                    p.as_str()
                )))
            })
    }
}

impl Bus for FakeBus {
    fn managed_objects(&self) -> BoxFuture<'_, Result<ManagedObjects>> {
        async move {
            let mut state = self.state();
            state.fetches += 1;
            if state.failing_fetches > 0 {
                state.failing_fetches -= 1;
                return Err(Error::from(zbus::Error::Failure("daemon busy".into())));
            }
            Ok(state.objects.clone())
        }
        .boxed()
    }

    fn watch_object_manager(&self) -> BoxFuture<'_, Result<SignalStream<ObjectManagerSignal>>> {
        async move {
            let (tx, stream) = channel();
            self.state().object_manager.push(tx);
            Ok(stream)
        }
        .boxed()
    }

    fn watch_properties(
        &self,
        path: OwnedObjectPath,
    ) -> BoxFuture<'_, Result<SignalStream<PropertiesChanged>>> {
        async move {
            // Suspend once, like a real match-rule round trip, so racing subscribers interleave.
            tokio::task::yield_now().await;
            let (tx, stream) = channel();
            let mut state = self.state();
            state.watches_created += 1;
            state.watchers.push((path, tx));
            Ok(stream)
        }
        .boxed()
    }

    fn get_property(
        &self,
        path: OwnedObjectPath,
        interface: &'static str,
        name: String,
    ) -> BoxFuture<'_, Result<Value>> {
        async move { self.lookup(&path, interface, &name) }.boxed()
    }

    fn set_property(
        &self,
        path: OwnedObjectPath,
        interface: &'static str,
        name: String,
        value: Value,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            self.set(path.as_str(), interface, &name, value);
            Ok(())
        }
        .boxed()
    }

    fn call(&self, path: OwnedObjectPath, call: MethodCall) -> BoxFuture<'_, Result<Reply>> {
        async move {
            self.state().calls.push((path.clone(), call.clone()));
            match call {
                MethodCall::ReadValue(_) => {
                    let (delay, unreadable) = {
                        let state = self.state();
                        (state.read_delay, state.unreadable.contains(&path))
                    };
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    if unreadable {
                        return Err(Error::from(zbus::Error::Failure("Read not permitted".into())));
                    }
                    let value = self.lookup(&path, GATT_CHARACTERISTIC_INTERFACE, "Value")?;
                    Ok(Reply::Bytes(value.as_bytes().unwrap_or_default().to_vec()))
                }
                MethodCall::WriteValue(value, _) => {
                    self.set(
                        path.as_str(),
                        GATT_CHARACTERISTIC_INTERFACE,
                        "Value",
                        Value::Bytes(value),
                    );
                    Ok(Reply::Unit)
                }
                MethodCall::GetDiscoveryFilters => Ok(Reply::Strings(vec![
                    "UUIDs".into(),
                    "RSSI".into(),
                    "Transport".into(),
                ])),
                MethodCall::StartDiscovery => {
                    let discovering = self
                        .lookup(&path, ADAPTER_INTERFACE, "Discovering")
                        .ok()
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    if discovering {
                        return Err(Error::from(zbus::Error::Failure(
                            "org.bluez.Error.InProgress".into(),
                        )));
                    }
                    self.set(path.as_str(), ADAPTER_INTERFACE, "Discovering", Value::Bool(true));
                    Ok(Reply::Unit)
                }
                MethodCall::StopDiscovery => {
                    self.set(path.as_str(), ADAPTER_INTERFACE, "Discovering", Value::Bool(false));
                    Ok(Reply::Unit)
                }
                MethodCall::Connect => {
                    self.set(path.as_str(), DEVICE_INTERFACE, "Connected", Value::Bool(true));
                    Ok(Reply::Unit)
                }
                MethodCall::Disconnect => {
                    self.set(path.as_str(), DEVICE_INTERFACE, "Connected", Value::Bool(false));
                    Ok(Reply::Unit)
                }
                _ => Ok(Reply::Unit),
            }
        }
        .boxed()
    }
}
