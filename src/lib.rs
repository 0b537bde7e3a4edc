//! A typed view of the BlueZ object model, with live events.
//!
//! BlueZ exposes every adapter, device, GATT service and characteristic as a separate D-Bus
//! object. This crate indexes those objects, projects them into [`Adapter`] → [`Device`] →
//! [`Service`][gatt::Service] → [`Characteristic`][gatt::Characteristic] wrappers, and turns
//! property change signals into [`Subscription`]s of typed events.
//!
//! Everything starts with a [`Session`].

mod adapter;
pub mod address;
pub mod bus;
pub mod device;
mod error;
mod event;
pub mod gatt;
mod index;
mod property;
pub mod uuid;
mod value;

pub use adapter::Adapter;
pub use device::Device;
pub use error::{Error, ErrorKind, Result};
pub use event::{AdapterEvent, DeviceEvent, Subscription, ValueChanged};
pub use index::{is_match, ObjectIndex};
pub use property::{wait_for_property_value, ChangeBatch, PropertyAccess, PropertyChanges};
pub use value::{PropertyBag, Value};

use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
};

use zbus::zvariant::OwnedObjectPath;

use crate::{
    bus::{Bus, SystemBus},
    event::Hub,
};

/// A cloneable handle to a connection to BlueZ.
///
/// This type is used to construct various objects in this library. All clones share one
/// [`ObjectIndex`], and all wrappers created through a session for the same remote object share
/// one signal watcher.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    bus: Arc<dyn Bus>,
    index: ObjectIndex,
    hubs: Mutex<HashMap<OwnedObjectPath, Weak<dyn Any + Send + Sync>>>,
}

impl Session {
    /// Creates a new session on the system D-Bus.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_bus(Arc::new(SystemBus::new().await?)))
    }

    /// Creates a session on top of any [`Bus`] implementation.
    pub fn with_bus(bus: Arc<dyn Bus>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                index: ObjectIndex::new(bus.clone()),
                bus,
                hubs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the [`ObjectIndex`] shared by everything created from this session.
    pub fn index(&self) -> &ObjectIndex {
        &self.inner.index
    }

    pub(crate) fn bus(&self) -> &dyn Bus {
        &*self.inner.bus
    }

    /// Returns the event hub of the object at `path`, creating it if nobody holds one.
    pub(crate) fn hub<E>(&self, path: &OwnedObjectPath) -> Arc<Hub<E>>
    where
        E: Clone + Send + 'static,
    {
        let mut hubs = self
            .inner
            .hubs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        hubs.retain(|_, hub| hub.strong_count() > 0);

        if let Some(hub) = hubs
            .get(path)
            .and_then(Weak::upgrade)
            .and_then(|hub| hub.downcast::<Hub<E>>().ok())
        {
            return hub;
        }

        let hub = Arc::new(Hub::<E>::new());
        let erased: Arc<dyn Any + Send + Sync> = hub.clone();
        hubs.insert(path.clone(), Arc::downgrade(&erased));
        hub
    }
}
