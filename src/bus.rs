//! The transport seam between this library and the BlueZ daemon.
//!
//! Everything above this module talks to BlueZ exclusively through the [`Bus`] trait. The
//! production implementation is [`SystemBus`], which speaks D-Bus via `zbus`.

use std::collections::HashMap;

use futures_util::{future::BoxFuture, stream::BoxStream};
use zbus::zvariant::{OwnedFd, OwnedObjectPath};

use crate::{
    gatt::{ReadOptions, WriteOptions},
    uuid::Uuid,
    value::{PropertyBag, Value},
    Result,
};

mod dbus;
#[cfg(test)]
pub(crate) mod fake;

pub use dbus::SystemBus;

/// Well-known bus name of the BlueZ daemon.
pub const SERVICE: &str = "org.bluez";
/// Interface implemented by local Bluetooth controllers.
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";
/// Interface implemented by remote devices.
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";
/// Interface implemented by GATT services of a connected device.
pub const GATT_SERVICE_INTERFACE: &str = "org.bluez.GattService1";
/// Interface implemented by GATT characteristics.
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// Maps interface names to their properties, for one object.
pub type Interfaces = HashMap<String, PropertyBag>;

/// The complete object graph, as returned by [`Bus::managed_objects`].
pub type ManagedObjects = HashMap<OwnedObjectPath, Interfaces>;

/// A stream of signals. Dropping it removes the underlying subscription.
pub type SignalStream<T> = BoxStream<'static, Result<T>>;

/// An object gained one or more interfaces.
#[derive(Debug, Clone)]
pub struct InterfacesAdded {
    pub path: OwnedObjectPath,
    pub interfaces: Interfaces,
}

/// An object lost one or more interfaces.
#[derive(Debug, Clone)]
pub struct InterfacesRemoved {
    pub path: OwnedObjectPath,
    pub interfaces: Vec<String>,
}

/// A signal of the daemon's `org.freedesktop.DBus.ObjectManager`.
#[derive(Debug, Clone)]
pub enum ObjectManagerSignal {
    Added(InterfacesAdded),
    Removed(InterfacesRemoved),
}

/// A batch of property changes on one interface of one object.
#[derive(Debug, Clone)]
pub struct PropertiesChanged {
    pub interface: String,
    pub changed: PropertyBag,
    pub invalidated: Vec<String>,
}

/// A remote method invocation. The target interface is implied by the method.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MethodCall {
    StartDiscovery,
    StopDiscovery,
    SetDiscoveryFilter(DiscoveryFilter),
    GetDiscoveryFilters,
    RemoveDevice(OwnedObjectPath),
    Connect,
    Disconnect,
    Pair,
    CancelPairing,
    ConnectProfile(Uuid),
    DisconnectProfile(Uuid),
    ReadValue(ReadOptions),
    WriteValue(Vec<u8>, WriteOptions),
    StartNotify,
    StopNotify,
    AcquireWrite,
    AcquireNotify,
}

/// The result of a [`MethodCall`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Reply {
    Unit,
    Bytes(Vec<u8>),
    Strings(Vec<String>),
    /// A file descriptor and the MTU of the link it belongs to.
    Fd(OwnedFd, u16),
}

impl Reply {
    pub(crate) fn into_unit(self) -> Result<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Self::Bytes(b) => Ok(b),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn into_strings(self) -> Result<Vec<String>> {
        match self {
            Self::Strings(s) => Ok(s),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn into_fd(self) -> Result<(OwnedFd, u16)> {
        match self {
            Self::Fd(fd, mtu) => Ok((fd, mtu)),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(reply: &Reply) -> crate::Error {
    crate::Error::from(format!("unexpected method reply {:?}", reply))
}

/// Parameters for [`MethodCall::SetDiscoveryFilter`].
///
/// Unset fields are left at the daemon's defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryFilter {
    /// Only report devices advertising any of these services.
    pub uuids: Vec<Uuid>,
    /// Only report devices with at least this signal strength.
    pub rssi: Option<i16>,
    pub transport: Option<Transport>,
    /// Report every advertisement instead of only changed ones.
    pub duplicate_data: Option<bool>,
}

/// Which transport to scan on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Auto,
    BrEdr,
    Le,
}

impl Transport {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::BrEdr => "bredr",
            Self::Le => "le",
        }
    }
}

/// A connection to the BlueZ daemon.
///
/// Implementations must deliver signals for a given object in the order the daemon emitted them.
pub trait Bus: Send + Sync {
    /// Fetches every object, the interfaces it implements and their current properties.
    fn managed_objects(&self) -> BoxFuture<'_, Result<ManagedObjects>>;

    /// Subscribes to `InterfacesAdded` and `InterfacesRemoved`.
    ///
    /// Both arrive on one stream, in the order the daemon emitted them.
    fn watch_object_manager(&self) -> BoxFuture<'_, Result<SignalStream<ObjectManagerSignal>>>;

    /// Subscribes to property changes of all interfaces of the object at `path`.
    fn watch_properties(
        &self,
        path: OwnedObjectPath,
    ) -> BoxFuture<'_, Result<SignalStream<PropertiesChanged>>>;

    fn get_property(
        &self,
        path: OwnedObjectPath,
        interface: &'static str,
        name: String,
    ) -> BoxFuture<'_, Result<Value>>;

    fn set_property(
        &self,
        path: OwnedObjectPath,
        interface: &'static str,
        name: String,
        value: Value,
    ) -> BoxFuture<'_, Result<()>>;

    fn call(&self, path: OwnedObjectPath, call: MethodCall) -> BoxFuture<'_, Result<Reply>>;
}
