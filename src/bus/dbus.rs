use std::{future::ready, sync::Arc};

use futures_util::{future::BoxFuture, FutureExt, StreamExt};
use zbus::{
    dbus_proxy,
    fdo::{InterfacesAdded, InterfacesRemoved, ObjectManagerProxy, PropertiesProxy},
    names::InterfaceName,
    zvariant::{ObjectPath, OwnedFd, OwnedObjectPath, SerializeDict, Type},
    Connection, Message,
};

use super::{
    Bus, DiscoveryFilter, ManagedObjects, MethodCall, ObjectManagerSignal, PropertiesChanged,
    Reply, SignalStream, SERVICE,
};
use crate::{
    gatt::{ReadOptions, WriteOptions},
    value::{PropertyBag, Value},
    Error, Result,
};

#[dbus_proxy(
    interface = "org.bluez.Adapter1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Adapter {
    async fn start_discovery(&self) -> zbus::Result<()>;
    async fn stop_discovery(&self) -> zbus::Result<()>;
    async fn set_discovery_filter(&self, filter: &DiscoveryFilterDict) -> zbus::Result<()>;
    async fn get_discovery_filters(&self) -> zbus::Result<Vec<String>>;
    async fn remove_device(&self, device: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.Device1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait Device {
    async fn connect(&self) -> zbus::Result<()>;
    async fn disconnect(&self) -> zbus::Result<()>;
    async fn pair(&self) -> zbus::Result<()>;
    async fn cancel_pairing(&self) -> zbus::Result<()>;
    async fn connect_profile(&self, uuid: &str) -> zbus::Result<()>;
    async fn disconnect_profile(&self, uuid: &str) -> zbus::Result<()>;
}

#[dbus_proxy(
    interface = "org.bluez.GattCharacteristic1",
    default_service = "org.bluez",
    assume_defaults = false
)]
trait GattCharacteristic {
    fn read_value(&self, options: &ReadOptionsDict) -> zbus::Result<Vec<u8>>;
    fn write_value(&self, value: &[u8], options: &WriteOptionsDict) -> zbus::Result<()>;

    fn start_notify(&self) -> zbus::Result<()>;
    fn stop_notify(&self) -> zbus::Result<()>;

    fn acquire_write(&self, options: &AcquireOptionsDict) -> zbus::Result<(OwnedFd, u16)>;
    fn acquire_notify(&self, options: &AcquireOptionsDict) -> zbus::Result<(OwnedFd, u16)>;
}

// FIXME: the dict types are `pub` because zbus' `dbus_proxy` macro *always* generates public proxy
// types and methods instead of copying the trait visibility

#[derive(SerializeDict, Type)]
#[zvariant(signature = "dict")]
pub struct DiscoveryFilterDict {
    #[zvariant(rename = "UUIDs")]
    uuids: Option<Vec<String>>,
    #[zvariant(rename = "RSSI")]
    rssi: Option<i16>,
    #[zvariant(rename = "Transport")]
    transport: Option<&'static str>,
    #[zvariant(rename = "DuplicateData")]
    duplicate_data: Option<bool>,
}

impl From<&DiscoveryFilter> for DiscoveryFilterDict {
    fn from(filter: &DiscoveryFilter) -> Self {
        Self {
            uuids: (!filter.uuids.is_empty())
                .then(|| filter.uuids.iter().map(|u| u.to_string()).collect()),
            rssi: filter.rssi,
            transport: filter.transport.map(|t| t.as_str()),
            duplicate_data: filter.duplicate_data,
        }
    }
}

#[derive(SerializeDict, Type)]
#[zvariant(signature = "dict")]
pub struct ReadOptionsDict {
    offset: Option<u16>,
}

#[derive(SerializeDict, Type)]
#[zvariant(signature = "dict")]
pub struct WriteOptionsDict {
    offset: Option<u16>,
    /// `command`, `request`, `reliable`
    #[zvariant(rename = "type")]
    ty: Option<&'static str>,
}

#[derive(Default, SerializeDict, Type)]
#[zvariant(signature = "dict")]
pub struct AcquireOptionsDict {
    mtu: Option<u16>,
}

impl From<&ReadOptions> for ReadOptionsDict {
    fn from(options: &ReadOptions) -> Self {
        Self {
            offset: options.offset,
        }
    }
}

impl From<&WriteOptions> for WriteOptionsDict {
    fn from(options: &WriteOptions) -> Self {
        Self {
            offset: options.offset,
            ty: options.write_type.map(|t| t.as_str()),
        }
    }
}

/// A [`Bus`] backed by a D-Bus connection to the system bus.
#[derive(Clone)]
pub struct SystemBus {
    conn: Connection,
}

impl SystemBus {
    /// Creates a new D-Bus connection to the system bus.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            conn: Connection::system().await.map_err(Error::from)?,
        })
    }

    /// Uses an existing D-Bus connection.
    pub fn with_connection(conn: Connection) -> Self {
        Self { conn }
    }

    /// Connects to the BlueZ D-Bus object manager.
    async fn object_manager(&self) -> Result<ObjectManagerProxy<'static>> {
        ObjectManagerProxy::builder(&self.conn)
            .destination(SERVICE)
            .map_err(Error::from)?
            .path("/")
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)
    }

    async fn properties(&self, path: OwnedObjectPath) -> Result<PropertiesProxy<'static>> {
        PropertiesProxy::builder(&self.conn)
            .destination(SERVICE)
            .map_err(Error::from)?
            .path(path.into_inner())
            .map_err(Error::from)?
            .build()
            .await
            .map_err(Error::from)
    }

    async fn adapter(&self, path: OwnedObjectPath) -> Result<AdapterProxy<'static>> {
        AdapterProxy::new(&self.conn, path.into_inner())
            .await
            .map_err(Error::from)
    }

    async fn device(&self, path: OwnedObjectPath) -> Result<DeviceProxy<'static>> {
        DeviceProxy::new(&self.conn, path.into_inner())
            .await
            .map_err(Error::from)
    }

    async fn characteristic(
        &self,
        path: OwnedObjectPath,
    ) -> Result<GattCharacteristicProxy<'static>> {
        GattCharacteristicProxy::new(&self.conn, path.into_inner())
            .await
            .map_err(Error::from)
    }

    async fn call_impl(&self, path: OwnedObjectPath, call: MethodCall) -> Result<Reply> {
        log::trace!("calling {:?} on {}", call, path.as_str());

        let unit = |res: zbus::Result<()>| res.map(|()| Reply::Unit).map_err(Error::from);
        match call {
            MethodCall::StartDiscovery => {
                let proxy = self.adapter(path).await?;
                unit(proxy.start_discovery().await)
            }
            MethodCall::StopDiscovery => {
                let proxy = self.adapter(path).await?;
                unit(proxy.stop_discovery().await)
            }
            MethodCall::SetDiscoveryFilter(filter) => {
                let proxy = self.adapter(path).await?;
                unit(proxy.set_discovery_filter(&(&filter).into()).await)
            }
            MethodCall::GetDiscoveryFilters => {
                let proxy = self.adapter(path).await?;
                let filters = proxy.get_discovery_filters().await.map_err(Error::from)?;
                Ok(Reply::Strings(filters))
            }
            MethodCall::RemoveDevice(device) => {
                let proxy = self.adapter(path).await?;
                unit(proxy.remove_device(&device).await)
            }
            MethodCall::Connect => {
                let proxy = self.device(path).await?;
                unit(proxy.connect().await)
            }
            MethodCall::Disconnect => {
                let proxy = self.device(path).await?;
                unit(proxy.disconnect().await)
            }
            MethodCall::Pair => {
                let proxy = self.device(path).await?;
                unit(proxy.pair().await)
            }
            MethodCall::CancelPairing => {
                let proxy = self.device(path).await?;
                unit(proxy.cancel_pairing().await)
            }
            MethodCall::ConnectProfile(uuid) => {
                let proxy = self.device(path).await?;
                unit(proxy.connect_profile(&uuid.to_string()).await)
            }
            MethodCall::DisconnectProfile(uuid) => {
                let proxy = self.device(path).await?;
                unit(proxy.disconnect_profile(&uuid.to_string()).await)
            }
            MethodCall::ReadValue(options) => {
                let proxy = self.characteristic(path).await?;
                let value = proxy
                    .read_value(&(&options).into())
                    .await
                    .map_err(Error::from)?;
                Ok(Reply::Bytes(value))
            }
            MethodCall::WriteValue(value, options) => {
                let proxy = self.characteristic(path).await?;
                unit(proxy.write_value(&value, &(&options).into()).await)
            }
            MethodCall::StartNotify => {
                let proxy = self.characteristic(path).await?;
                unit(proxy.start_notify().await)
            }
            MethodCall::StopNotify => {
                let proxy = self.characteristic(path).await?;
                unit(proxy.stop_notify().await)
            }
            MethodCall::AcquireWrite => {
                let proxy = self.characteristic(path).await?;
                let (fd, mtu) = proxy
                    .acquire_write(&AcquireOptionsDict::default())
                    .await
                    .map_err(Error::from)?;
                Ok(Reply::Fd(fd, mtu))
            }
            MethodCall::AcquireNotify => {
                let proxy = self.characteristic(path).await?;
                let (fd, mtu) = proxy
                    .acquire_notify(&AcquireOptionsDict::default())
                    .await
                    .map_err(Error::from)?;
                Ok(Reply::Fd(fd, mtu))
            }
        }
    }
}

fn interface_name(interface: &'static str) -> Result<InterfaceName<'static>> {
    InterfaceName::try_from(interface)
        .map_err(zbus::Error::from)
        .map_err(Error::from)
}

fn object_manager_signal(message: Arc<Message>) -> Option<Result<ObjectManagerSignal>> {
    if let Some(added) = InterfacesAdded::from_message(message.clone()) {
        let args = match added.args() {
            Ok(args) => args,
            Err(e) => return Some(Err(Error::from(e))),
        };
        let interfaces = args
            .interfaces_and_properties
            .iter()
            .map(|(name, props)| {
                let props = props
                    .iter()
                    .map(|(k, v)| (k.to_string(), Value::from(v)))
                    .collect::<PropertyBag>();
                (name.to_string(), props)
            })
            .collect();
        Some(Ok(ObjectManagerSignal::Added(super::InterfacesAdded {
            path: OwnedObjectPath::from(args.object_path.to_owned()),
            interfaces,
        })))
    } else if let Some(removed) = InterfacesRemoved::from_message(message) {
        let args = match removed.args() {
            Ok(args) => args,
            Err(e) => return Some(Err(Error::from(e))),
        };
        Some(Ok(ObjectManagerSignal::Removed(super::InterfacesRemoved {
            path: OwnedObjectPath::from(args.object_path.to_owned()),
            interfaces: args.interfaces.iter().map(|s| s.to_string()).collect(),
        })))
    } else {
        None
    }
}

impl Bus for SystemBus {
    fn managed_objects(&self) -> BoxFuture<'_, Result<ManagedObjects>> {
        async move {
            log::debug!(
                "fetching BlueZ objects on connection {}",
                self.conn.server_guid()
            );

            let objects = self
                .object_manager()
                .await?
                .get_managed_objects()
                .await
                .map_err(Error::from)?;

            Ok(objects
                .into_iter()
                .map(|(path, intfs)| {
                    let intfs = intfs
                        .into_iter()
                        .map(|(name, props)| {
                            let props = props
                                .iter()
                                .map(|(k, v)| (k.clone(), Value::from(&**v)))
                                .collect::<PropertyBag>();
                            (name.to_string(), props)
                        })
                        .collect();
                    (path, intfs)
                })
                .collect())
        }
        .boxed()
    }

    fn watch_object_manager(&self) -> BoxFuture<'_, Result<SignalStream<ObjectManagerSignal>>> {
        async move {
            // One match rule for both signals keeps them in the order the daemon sent them.
            let stream = self
                .object_manager()
                .await?
                .receive_all_signals()
                .await
                .map_err(Error::from)?;
            Ok(stream
                .filter_map(|message| ready(object_manager_signal(message)))
                .boxed())
        }
        .boxed()
    }

    fn watch_properties(
        &self,
        path: OwnedObjectPath,
    ) -> BoxFuture<'_, Result<SignalStream<PropertiesChanged>>> {
        async move {
            // Property changes are signaled via the `PropertiesChanged` signal on the
            // `org.freedesktop.DBus.Properties` interface.
            let stream = self
                .properties(path)
                .await?
                .receive_properties_changed()
                .await
                .map_err(Error::from)?;
            Ok(stream
                .map(|signal| {
                    let args = signal.args().map_err(Error::from)?;
                    Ok(PropertiesChanged {
                        interface: args.interface_name.to_string(),
                        changed: args
                            .changed_properties
                            .iter()
                            .map(|(k, v)| (k.to_string(), Value::from(v)))
                            .collect(),
                        invalidated: args
                            .invalidated_properties
                            .iter()
                            .map(|s| s.to_string())
                            .collect(),
                    })
                })
                .boxed())
        }
        .boxed()
    }

    fn get_property(
        &self,
        path: OwnedObjectPath,
        interface: &'static str,
        name: String,
    ) -> BoxFuture<'_, Result<Value>> {
        async move {
            let value = self
                .properties(path)
                .await?
                .get(interface_name(interface)?, &name)
                .await
                .map_err(Error::from)?;
            Ok(Value::from(&*value))
        }
        .boxed()
    }

    fn set_property(
        &self,
        path: OwnedObjectPath,
        interface: &'static str,
        name: String,
        value: Value,
    ) -> BoxFuture<'_, Result<()>> {
        async move {
            let Some(value) = value.to_zvariant() else {
                return Err(Error::from(format!("cannot write {:?} to {}", value, name)));
            };
            self.properties(path)
                .await?
                .set(interface_name(interface)?, &name, &value)
                .await
                .map_err(Error::from)
        }
        .boxed()
    }

    fn call(&self, path: OwnedObjectPath, call: MethodCall) -> BoxFuture<'_, Result<Reply>> {
        self.call_impl(path, call).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use zbus::{zvariant, MessageBuilder};

    use super::*;

    fn is_bus<B: Bus + 'static>() {}

    #[test]
    fn system_bus_is_a_bus() {
        is_bus::<SystemBus>();
        let _: fn(Arc<SystemBus>) -> Arc<dyn Bus> = |bus| bus;
    }

    fn signal(member: &'static str) -> MessageBuilder<'static> {
        MessageBuilder::signal("/", "org.freedesktop.DBus.ObjectManager", member).unwrap()
    }

    #[test]
    fn object_manager_messages() {
        let dev = ObjectPath::try_from("/org/bluez/hci0/dev_11_22").unwrap();
        let props = HashMap::from([("Alias", zvariant::Value::from("Polar H10"))]);
        let interfaces = HashMap::from([("org.bluez.Device1", props)]);

        let message = signal("InterfacesAdded")
            .build(&(dev.clone(), interfaces))
            .unwrap();
        let added = object_manager_signal(Arc::new(message));
        match added {
            Some(Ok(ObjectManagerSignal::Added(added))) => {
                assert_eq!(added.path.as_str(), "/org/bluez/hci0/dev_11_22");
                assert_eq!(
                    added.interfaces["org.bluez.Device1"]["Alias"],
                    Value::from("Polar H10")
                );
            }
            other => panic!("expected InterfacesAdded, got {:?}", other),
        }

        let message = signal("InterfacesRemoved")
            .build(&(dev, vec!["org.bluez.Device1"]))
            .unwrap();
        let removed = object_manager_signal(Arc::new(message));
        match removed {
            Some(Ok(ObjectManagerSignal::Removed(removed))) => {
                assert_eq!(removed.path.as_str(), "/org/bluez/hci0/dev_11_22");
                assert_eq!(removed.interfaces, ["org.bluez.Device1"]);
            }
            other => panic!("expected InterfacesRemoved, got {:?}", other),
        }
    }
}
