//! BlueZ [`Device`] access.

use core::fmt;
use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::StreamExt;
use zbus::zvariant::OwnedObjectPath;

use crate::{
    address::{Address, AddressType},
    bus::{MethodCall, DEVICE_INTERFACE, GATT_SERVICE_INTERFACE},
    event::{DeviceEvent, Hub, Subscription, Watcher},
    gatt::Service,
    property::{wait_for_property_value, PropertyAccess, RemoteObject},
    uuid::Uuid,
    value::Value,
    Error, Result, Session,
};

/// A reference to a remote BlueZ device.
///
/// Instances of this type can be obtained from [`Adapter::list_devices`][crate::Adapter::list_devices],
/// [`Adapter::get_device`][crate::Adapter::get_device] or from
/// [`AdapterEvent::DeviceFound`][crate::AdapterEvent::DeviceFound] events.
#[derive(Clone)]
pub struct Device {
    session: Session,
    path: OwnedObjectPath,
    hub: Arc<Hub<DeviceEvent>>,
}

impl RemoteObject for Device {
    const INTERFACE: &'static str = DEVICE_INTERFACE;
    const KIND: &'static str = "device";

    fn session(&self) -> &Session {
        &self.session
    }

    fn object_path(&self) -> &OwnedObjectPath {
        &self.path
    }
}

impl Device {
    pub(crate) fn new(session: Session, path: OwnedObjectPath) -> Self {
        let hub = session.hub(&path);
        Self { session, path, hub }
    }

    /// Returns the D-Bus object path of this device.
    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    async fn call(&self, call: MethodCall) -> Result<()> {
        self.session
            .bus()
            .call(self.path.clone(), call)
            .await?
            .into_unit()
    }

    async fn string(&self, name: &str) -> Result<String> {
        match self.get_property(name).await? {
            Value::String(s) => Ok(s),
            other => Err(Error::from(format!("{} is {:?}, not a string", name, other))),
        }
    }

    async fn flag(&self, name: &str) -> Result<bool> {
        self.get_property(name)
            .await?
            .as_bool()
            .ok_or_else(|| Error::from(format!("{} is not a boolean", name)))
    }

    /// Returns the hardware [`Address`] of the device.
    pub async fn address(&self) -> Result<Address> {
        self.string("Address").await?.parse().map_err(Error::from)
    }

    /// Returns the type of the device's hardware [`Address`] returned by [`Device::address`].
    pub async fn address_type(&self) -> Result<AddressType> {
        AddressType::from_str(&self.string("AddressType").await?)
    }

    /// Returns the user-friendly name assigned to the device.
    pub async fn alias(&self) -> Result<String> {
        self.string("Alias").await
    }

    /// Returns the name the device advertises, if any.
    pub async fn name(&self) -> Result<String> {
        self.string("Name").await
    }

    /// Returns the Received Signal Strength Indicator (RSSI) of the remote device.
    ///
    /// Only available while the device is being discovered.
    pub async fn rssi(&self) -> Result<i16> {
        self.get_property("RSSI")
            .await?
            .as_i16()
            .ok_or_else(|| Error::from("RSSI is not an i16"))
    }

    /// Returns whether the adapter is currently connected to this device.
    pub async fn is_connected(&self) -> Result<bool> {
        self.flag("Connected").await
    }

    pub async fn is_paired(&self) -> Result<bool> {
        self.flag("Paired").await
    }

    pub async fn is_trusted(&self) -> Result<bool> {
        self.flag("Trusted").await
    }

    /// Returns whether GATT service discovery has completed.
    pub async fn services_resolved(&self) -> Result<bool> {
        self.flag("ServicesResolved").await
    }

    /// Returns the list of service [`Uuid`]s the device is advertising.
    ///
    /// This list is available without performing full service discovery or connecting to the
    /// device, but is typically truncated unless connected to or paired with the [`Device`].
    pub async fn service_uuids(&self) -> Result<Vec<Uuid>> {
        let uuids = match self.get_property("UUIDs").await? {
            Value::Strings(s) => s,
            // An empty `as` is indistinguishable from an empty `ay`.
            Value::Bytes(b) if b.is_empty() => Vec::new(),
            other => return Err(Error::from(format!("UUIDs is {:?}", other))),
        };
        uuids
            .iter()
            .map(|s| s.parse::<Uuid>().map_err(Error::from))
            .collect()
    }

    /// Establishes a connection to the device.
    pub async fn connect(&self) -> Result<()> {
        log::debug!("connecting to {}", self.path.as_str());
        self.call(MethodCall::Connect).await
    }

    /// Severs the connection to the device.
    pub async fn disconnect(&self) -> Result<()> {
        self.call(MethodCall::Disconnect).await
    }

    pub async fn pair(&self) -> Result<()> {
        self.call(MethodCall::Pair).await
    }

    pub async fn cancel_pairing(&self) -> Result<()> {
        self.call(MethodCall::CancelPairing).await
    }

    /// Connects a specific profile of the device, identified by its service [`Uuid`].
    pub async fn connect_profile(&self, uuid: Uuid) -> Result<()> {
        self.call(MethodCall::ConnectProfile(uuid)).await
    }

    pub async fn disconnect_profile(&self, uuid: Uuid) -> Result<()> {
        self.call(MethodCall::DisconnectProfile(uuid)).await
    }

    /// Waits until GATT service discovery has completed, or `timeout` elapses.
    pub async fn wait_services_resolved(&self, timeout: Duration) -> Result<()> {
        wait_for_property_value(self, "ServicesResolved", true, timeout).await
    }

    /// Returns all GATT services of this device that BlueZ currently knows about.
    ///
    /// Services are only populated once the device is connected and
    /// [`Device::services_resolved`] is `true`.
    pub async fn services(&self) -> Result<Vec<Service>> {
        Ok(self
            .session
            .index()
            .query(GATT_SERVICE_INTERFACE, Some(&*self.path))
            .await?
            .into_iter()
            .map(|path| Service::new(self.session.clone(), path))
            .collect())
    }

    /// Returns the GATT service identified by `uuid`.
    ///
    /// Fails with [`ErrorKind::NotFound`][crate::ErrorKind::NotFound] if the device doesn't offer
    /// such a service.
    pub async fn service(&self, uuid: Uuid) -> Result<Service> {
        for service in self.services().await? {
            if service.uuid().await? == uuid {
                return Ok(service);
            }
        }

        Err(Error::not_found(format!(
            "service {} on device {}",
            uuid,
            self.path.as_str()
        )))
    }

    /// Subscribes to all [`DeviceEvent`]s.
    pub async fn events(&self) -> Result<Subscription<DeviceEvent>> {
        self.subscribe(|_| true).await
    }

    /// Subscribes to [`DeviceEvent::Connected`].
    pub async fn on_connected(&self) -> Result<Subscription<DeviceEvent>> {
        self.subscribe(|e| *e == DeviceEvent::Connected).await
    }

    /// Subscribes to [`DeviceEvent::Disconnected`].
    pub async fn on_disconnected(&self) -> Result<Subscription<DeviceEvent>> {
        self.subscribe(|e| *e == DeviceEvent::Disconnected).await
    }

    /// Subscribes to [`DeviceEvent::ServicesResolved`].
    pub async fn on_services_resolved(&self) -> Result<Subscription<DeviceEvent>> {
        self.subscribe(|e| *e == DeviceEvent::ServicesResolved).await
    }

    async fn subscribe(&self, filter: fn(&DeviceEvent) -> bool) -> Result<Subscription<DeviceEvent>> {
        let registration = self.hub.register(filter);

        if !self.hub.has_watcher() {
            let changes = self.watch_properties().await?;
            let hub = Arc::downgrade(&self.hub);
            let path = self.path.clone();
            self.hub.install(Watcher::spawn("device watcher", async move {
                let mut changes = changes;
                while let Some(batch) = changes.next().await {
                    let batch = match batch {
                        Ok(batch) => batch,
                        Err(e) => {
                            log::warn!("{}: bad property change: {}", path.as_str(), e);
                            continue;
                        }
                    };
                    let Some(hub) = hub.upgrade() else {
                        return Ok(());
                    };
                    for event in device_events(&batch.changed) {
                        log::debug!("{}: {:?}", path.as_str(), event);
                        hub.emit(event);
                    }
                }

                if let Some(hub) = hub.upgrade() {
                    hub.close();
                }
                Err(Error::from(format!(
                    "property change stream of {} ended",
                    path.as_str()
                )))
            }));
        }

        Ok(Subscription::new(VecDeque::new(), registration))
    }
}

/// Translates a batch of `Device1` property changes into events.
fn device_events(changed: &crate::PropertyBag) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    match changed.get("Connected").and_then(Value::as_bool) {
        Some(true) => events.push(DeviceEvent::Connected),
        Some(false) => events.push(DeviceEvent::Disconnected),
        None => {}
    }
    if changed.get("ServicesResolved").and_then(Value::as_bool) == Some(true) {
        events.push(DeviceEvent::ServicesResolved);
    }
    events
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("path", &self.path.as_str())
            .finish()
    }
}
