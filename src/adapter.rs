use core::fmt;
use std::{collections::VecDeque, future::ready, sync::Arc};

use futures_util::{
    stream::{self, select},
    StreamExt,
};
use zbus::zvariant::OwnedObjectPath;

use crate::{
    address::{Address, AddressType, DeviceFilter},
    bus::{DiscoveryFilter, MethodCall, ADAPTER_INTERFACE, DEVICE_INTERFACE},
    event::{AdapterEvent, Hub, Subscription, Watcher},
    property::{ChangeBatch, PropertyAccess, RemoteObject},
    value::Value,
    Device, Error, Result, Session,
};

/// A BlueZ Bluetooth adapter.
#[derive(Clone)]
pub struct Adapter {
    session: Session,
    name: String,
    path: OwnedObjectPath,
    hub: Arc<Hub<AdapterEvent>>,
}

impl RemoteObject for Adapter {
    const INTERFACE: &'static str = ADAPTER_INTERFACE;
    const KIND: &'static str = "adapter";

    fn session(&self) -> &Session {
        &self.session
    }

    fn object_path(&self) -> &OwnedObjectPath {
        &self.path
    }
}

impl Adapter {
    const PATH_PREFIX: &'static str = "/org/bluez/";

    fn new(session: &Session, name: String, path: OwnedObjectPath) -> Self {
        Self {
            hub: session.hub(&path),
            session: session.clone(),
            name,
            path,
        }
    }

    /// Opens the adapter called `name` (eg. `hci0`).
    pub async fn open(session: &Session, name: &str) -> Result<Self> {
        Self::enumerate(session)
            .await?
            .find(|a| a.name == name)
            .ok_or_else(|| Error::not_found(format!("adapter {}", name)))
    }

    /// Opens the system's default Bluetooth adapter, which is the one with the lowest name.
    pub async fn open_default(session: &Session) -> Result<Self> {
        Self::enumerate(session)
            .await?
            .next()
            .ok_or_else(|| Error::not_found("default adapter"))
    }

    /// Returns an iterator yielding all Bluetooth adapters on the system, ordered by name.
    pub async fn enumerate(session: &Session) -> Result<impl Iterator<Item = Self>> {
        log::debug!("enumerating BlueZ adapters");

        let mut adapters = Vec::new();
        for path in session.index().query(ADAPTER_INTERFACE, None).await? {
            if let Some(name) = path.strip_prefix(Self::PATH_PREFIX) {
                log::debug!("found BlueZ adapter at path {}", path.as_str());
                adapters.push(Self::new(session, name.to_string(), path.clone()));
            } else {
                log::warn!("skipping adapter with unexpected path {}", path.as_str());
            }
        }
        adapters.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(adapters.into_iter())
    }

    /// Returns the adapter's device name (eg. `hci0`).
    pub fn name(&self) -> &str {
        &self.name
    }

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

    /// Returns the Bluetooth device [`Address`] of this [`Adapter`].
    pub async fn address(&self) -> Result<Address> {
        self.string("Address").await?.parse().map_err(Error::from)
    }

    /// Returns the type of device [`Address`] used by this [`Adapter`].
    pub async fn address_type(&self) -> Result<AddressType> {
        AddressType::from_str(&self.string("AddressType").await?)
    }

    pub async fn alias(&self) -> Result<String> {
        self.string("Alias").await
    }

    pub async fn is_powered(&self) -> Result<bool> {
        self.flag("Powered").await
    }

    /// Switches the adapter on or off.
    pub async fn set_powered(&self, powered: bool) -> Result<()> {
        self.session
            .bus()
            .set_property(
                self.path.clone(),
                ADAPTER_INTERFACE,
                "Powered".to_string(),
                Value::Bool(powered),
            )
            .await
    }

    /// Starts the device discovery procedure.
    pub async fn start_discovery(&self) -> Result<()> {
        log::debug!("{}: starting discovery", self.name);
        self.call(MethodCall::StartDiscovery).await
    }

    /// Stops the device discovery procedure.
    pub async fn stop_discovery(&self) -> Result<()> {
        log::debug!("{}: stopping discovery", self.name);
        self.call(MethodCall::StopDiscovery).await
    }

    /// Returns whether this [`Adapter`] is currently performing device discovery.
    ///
    /// Device discovery can be started by calling [`Adapter::start_discovery`]. Note that the value
    /// of [`Adapter::is_discovering`] may not immediately change to reflect that discovery has been
    /// requested.
    pub async fn is_discovering(&self) -> Result<bool> {
        self.flag("Discovering").await
    }

    /// Restricts which devices are reported by subsequent discovery sessions.
    pub async fn set_discovery_filter(&self, filter: &DiscoveryFilter) -> Result<()> {
        self.call(MethodCall::SetDiscoveryFilter(filter.clone()))
            .await
    }

    /// Returns the names of the [`DiscoveryFilter`] fields the daemon supports.
    pub async fn discovery_filters(&self) -> Result<Vec<String>> {
        self.session
            .bus()
            .call(self.path.clone(), MethodCall::GetDiscoveryFilters)
            .await?
            .into_strings()
    }

    /// Removes `device` and its pairing information from this adapter.
    pub async fn remove_device(&self, device: &Device) -> Result<()> {
        self.call(MethodCall::RemoveDevice(device.path().clone()))
            .await
    }

    /// Returns all [`Device`]s currently known to this [`Adapter`].
    ///
    /// This includes paired and connected devices, as well as devices found by discovery.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        Ok(self
            .session
            .index()
            .query(DEVICE_INTERFACE, Some(&*self.path))
            .await?
            .into_iter()
            .map(|path| Device::new(self.session.clone(), path))
            .collect())
    }

    /// Returns the device with the given address.
    ///
    /// The address is compared case-insensitively. Fails with
    /// [`ErrorKind::AmbiguousMatch`][crate::ErrorKind::AmbiguousMatch] if more than one device
    /// reports the address, which means the daemon's state is inconsistent.
    pub async fn get_device(&self, address: &str) -> Result<Device> {
        let wanted: Address = address.parse().map_err(Error::from)?;

        let mut matches = Vec::new();
        for device in self.list_devices().await? {
            match device.address().await {
                Ok(addr) if addr == wanted => matches.push(device),
                Ok(_) => {}
                Err(e) => log::warn!("skipping device at {}: {}", device.path().as_str(), e),
            }
        }

        match matches.len() {
            0 => Err(Error::not_found(format!("device {}", wanted))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::ambiguous(wanted.to_string(), n)),
        }
    }

    /// Returns the first known device matching `filter`, if any.
    pub async fn find_device(&self, filter: &DeviceFilter) -> Result<Option<Device>> {
        for device in self.list_devices().await? {
            let address = match device.address().await {
                Ok(addr) => addr,
                Err(e) => {
                    log::warn!("skipping device at {}: {}", device.path().as_str(), e);
                    continue;
                }
            };
            // Devices that haven't resolved a name still have an alias derived from the address.
            let alias = device.alias().await.unwrap_or_default();
            if filter.matches(&address, &alias) {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    /// Subscribes to all [`AdapterEvent`]s.
    ///
    /// Known devices and the current power state are replayed first.
    pub async fn events(&self) -> Result<Subscription<AdapterEvent>> {
        let registration = self.hub.register(|_| true);
        self.ensure_watcher().await?;
        let mut replay = self.replay_devices().await?;
        replay.extend(self.replay_powered().await);
        Ok(Subscription::new(replay, registration))
    }

    /// Subscribes to [`AdapterEvent::DeviceFound`].
    ///
    /// Every device known when subscribing is yielded first (with `is_state_change: false`), so
    /// subscribing in the middle of a scan doesn't miss anything. Afterwards, every newly added
    /// device is yielded as it appears.
    pub async fn device_found(&self) -> Result<Subscription<AdapterEvent>> {
        let registration = self.hub.register(is_device_found);
        self.ensure_watcher().await?;
        let replay = self.replay_devices().await?;
        Ok(Subscription::new(replay, registration))
    }

    /// Subscribes to devices appearing from now on, without replaying known ones.
    ///
    /// Dropping the subscription ends the watch, so it can be scoped to a timed scan.
    pub async fn watch_devices_added(&self) -> Result<Subscription<AdapterEvent>> {
        let registration = self.hub.register(is_device_found);
        self.ensure_watcher().await?;
        Ok(Subscription::new(VecDeque::new(), registration))
    }

    /// Subscribes to [`AdapterEvent::PoweredOn`].
    ///
    /// If the adapter is already powered, this is yielded first with `is_state_change: false`.
    pub async fn powered_on(&self) -> Result<Subscription<AdapterEvent>> {
        let registration = self.hub.register(|e| matches!(e, AdapterEvent::PoweredOn { .. }));
        self.ensure_watcher().await?;
        let replay = self.replay_powered().await;
        Ok(Subscription::new(replay, registration))
    }

    /// Subscribes to [`AdapterEvent::PoweredOff`].
    pub async fn powered_off(&self) -> Result<Subscription<AdapterEvent>> {
        let registration = self.hub.register(|e| matches!(e, AdapterEvent::PoweredOff));
        self.ensure_watcher().await?;
        Ok(Subscription::new(VecDeque::new(), registration))
    }

    async fn replay_devices(&self) -> Result<VecDeque<AdapterEvent>> {
        Ok(self
            .list_devices()
            .await?
            .into_iter()
            .map(|device| AdapterEvent::DeviceFound {
                device,
                is_state_change: false,
            })
            .collect())
    }

    async fn replay_powered(&self) -> VecDeque<AdapterEvent> {
        match self.is_powered().await {
            Ok(true) => VecDeque::from([AdapterEvent::PoweredOn {
                is_state_change: false,
            }]),
            Ok(false) => VecDeque::new(),
            Err(e) => {
                log::warn!("{}: failed to read power state: {}", self.name, e);
                VecDeque::new()
            }
        }
    }

    /// Starts the watcher feeding this adapter's subscriptions, unless it's already running.
    ///
    /// Must be called after registering with the hub and before taking any snapshot. Devices are
    /// taken from the object index, so one the index applied before the snapshot is in it, and
    /// any other one reaches the watcher.
    async fn ensure_watcher(&self) -> Result<()> {
        if self.hub.has_watcher() {
            return Ok(());
        }

        let added = self
            .session
            .index()
            .watch_added(DEVICE_INTERFACE, &self.path)
            .await?;
        let changes = self.watch_properties().await?;

        let signals = select(
            added
                .map(Signal::Added)
                .chain(stream::once(ready(Signal::Ended("device additions")))),
            changes
                .map(Signal::Changed)
                .chain(stream::once(ready(Signal::Ended("property changes")))),
        );

        let hub = Arc::downgrade(&self.hub);
        let session = self.session.clone();
        let path = self.path.clone();
        self.hub.install(Watcher::spawn("adapter watcher", async move {
            let mut signals = signals;
            while let Some(signal) = signals.next().await {
                let events = match signal {
                    Signal::Added(device) => vec![AdapterEvent::DeviceFound {
                        device: Device::new(session.clone(), device),
                        is_state_change: true,
                    }],
                    Signal::Changed(Ok(batch)) => power_events(&batch),
                    Signal::Changed(Err(e)) => {
                        log::warn!("{}: bad signal: {}", path.as_str(), e);
                        continue;
                    }
                    Signal::Ended(what) => {
                        if let Some(hub) = hub.upgrade() {
                            hub.close();
                        }
                        return Err(Error::from(format!(
                            "{} stream of {} ended",
                            what,
                            path.as_str()
                        )));
                    }
                };

                let Some(hub) = hub.upgrade() else {
                    return Ok(());
                };
                for event in events {
                    log::debug!("{}: {:?}", path.as_str(), event);
                    hub.emit(event);
                }
            }
            Ok(())
        }));

        Ok(())
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter").field("name", &self.name).finish()
    }
}

enum Signal {
    Added(OwnedObjectPath),
    Changed(Result<ChangeBatch>),
    Ended(&'static str),
}

fn is_device_found(event: &AdapterEvent) -> bool {
    matches!(event, AdapterEvent::DeviceFound { .. })
}

fn power_events(batch: &ChangeBatch) -> Vec<AdapterEvent> {
    match batch.changed.get("Powered").and_then(Value::as_bool) {
        Some(true) => vec![AdapterEvent::PoweredOn {
            is_state_change: true,
        }],
        Some(false) => vec![AdapterEvent::PoweredOff],
        None => Vec::new(),
    }
}
