//! GATT [`Service`]s and [`Characteristic`]s exported by BLE devices.

use core::fmt;
use std::{collections::VecDeque, sync::Arc, time::Duration};

use futures_util::StreamExt;
use zbus::zvariant::{OwnedFd, OwnedObjectPath};

use crate::{
    bus::{MethodCall, GATT_CHARACTERISTIC_INTERFACE, GATT_SERVICE_INTERFACE},
    event::{Hub, Subscription, ValueChanged, Watcher},
    property::{PropertyAccess, RemoteObject},
    uuid::Uuid,
    value::Value,
    Error, Result, Session,
};

/// Options for reading a [`Characteristic`]'s value.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Byte offset to start reading at.
    pub offset: Option<u16>,
}

/// Options for writing a [`Characteristic`]'s value.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Byte offset to start writing at.
    pub offset: Option<u16>,
    /// Which GATT procedure to use. The daemon picks one based on the characteristic's flags if
    /// unset.
    pub write_type: Option<WriteType>,
}

/// The GATT procedure used to write a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    /// Write without response.
    Command,
    /// Write with response.
    Request,
    /// Reliable write.
    Reliable,
}

impl WriteType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Request => "request",
            Self::Reliable => "reliable",
        }
    }
}

/// Reads the `UUID` of a GATT object.
///
/// BlueZ never changes it, so the snapshot in the object index is used if there is one.
async fn read_uuid<T: RemoteObject + PropertyAccess>(object: &T) -> Result<Uuid> {
    let cached = object
        .session()
        .index()
        .properties(object.object_path(), T::INTERFACE)
        .await?
        .and_then(|props| props.get("UUID").cloned());
    let value = match cached {
        Some(value) => value,
        None => object.get_property("UUID").await?,
    };
    match value.as_str() {
        Some(s) => s.parse().map_err(Error::from),
        None => Err(Error::from(format!("UUID of {} is {:?}", object.describe(), value))),
    }
}

/// A GATT service of a Bluetooth LE device.
///
/// To enumerate [`Service`]s, use [`Device::services`].
///
/// [`Device::services`]: crate::device::Device::services
#[derive(Clone)]
pub struct Service {
    session: Session,
    path: OwnedObjectPath,
}

impl RemoteObject for Service {
    const INTERFACE: &'static str = GATT_SERVICE_INTERFACE;
    const KIND: &'static str = "service";

    fn session(&self) -> &Session {
        &self.session
    }

    fn object_path(&self) -> &OwnedObjectPath {
        &self.path
    }
}

impl Service {
    pub(crate) fn new(session: Session, path: OwnedObjectPath) -> Self {
        Self { session, path }
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    /// Returns the [`Uuid`] identifying this [`Service`].
    pub async fn uuid(&self) -> Result<Uuid> {
        read_uuid(self).await
    }

    /// Returns a [`bool`] indicating whether this [`Service`] is a primary service.
    ///
    /// If `false`, the service is secondary.
    pub async fn is_primary(&self) -> Result<bool> {
        self.get_property("Primary")
            .await?
            .as_bool()
            .ok_or_else(|| Error::from("Primary is not a boolean"))
    }

    /// Returns a list of all [`Characteristic`]s associated with this [`Service`].
    pub async fn characteristics(&self) -> Result<Vec<Characteristic>> {
        Ok(self
            .session
            .index()
            .query(GATT_CHARACTERISTIC_INTERFACE, Some(&*self.path))
            .await?
            .into_iter()
            .map(|path| Characteristic::new(self.session.clone(), path))
            .collect())
    }

    /// Returns the [`Characteristic`] associated with this [`Service`] identified by the given
    /// [`Uuid`].
    ///
    /// Returns an error of kind [`ErrorKind::NotFound`][crate::ErrorKind::NotFound] if the
    /// [`Service`] does not expose any [`Characteristic`] with the given [`Uuid`].
    pub async fn characteristic(&self, uuid: Uuid) -> Result<Characteristic> {
        for characteristic in self.characteristics().await? {
            if characteristic.uuid().await? == uuid {
                return Ok(characteristic);
            }
        }

        Err(Error::not_found(format!(
            "characteristic {} in service {}",
            uuid,
            self.path.as_str()
        )))
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("path", &self.path.as_str())
            .finish()
    }
}

/// A Bluetooth characteristic that is part of some [`Service`].
///
/// A characteristic stores a value that can be (depending on the specific characteristic) read
/// and/or written by the host.
#[derive(Clone)]
pub struct Characteristic {
    session: Session,
    path: OwnedObjectPath,
    hub: Arc<Hub<ValueChanged>>,
}

impl RemoteObject for Characteristic {
    const INTERFACE: &'static str = GATT_CHARACTERISTIC_INTERFACE;
    const KIND: &'static str = "characteristic";

    fn session(&self) -> &Session {
        &self.session
    }

    fn object_path(&self) -> &OwnedObjectPath {
        &self.path
    }
}

impl Characteristic {
    pub(crate) fn new(session: Session, path: OwnedObjectPath) -> Self {
        let hub = session.hub(&path);
        Self { session, path, hub }
    }

    pub fn path(&self) -> &OwnedObjectPath {
        &self.path
    }

    async fn call(&self, call: MethodCall) -> Result<crate::bus::Reply> {
        self.session.bus().call(self.path.clone(), call).await
    }

    /// Returns the [`Uuid`] identifying this [`Characteristic`].
    ///
    /// The returned [`Uuid`] determines the data format of the characteristic's value. For standard
    /// services and characteristics, [`Uuid`]s are assigned by the Bluetooth SIG and documented in
    /// their "Assigned Numbers" document. For vendor-specific characteristics, consult the vendor
    /// for documentation.
    pub async fn uuid(&self) -> Result<Uuid> {
        read_uuid(self).await
    }

    /// Returns the Maximum Transmission Unit (MTU) of this characteristic in Bytes.
    pub async fn mtu(&self) -> Result<u16> {
        self.get_property("MTU")
            .await?
            .as_u16()
            .ok_or_else(|| Error::from("MTU is not a u16"))
    }

    /// Returns the [`CharacteristicFlags`] associated with this [`Characteristic`].
    ///
    /// These flags indicate which operations the [`Characteristic`] supports.
    pub async fn flags(&self) -> Result<CharacteristicFlags> {
        match self.get_property("Flags").await? {
            Value::Strings(flags) => Ok(CharacteristicFlags { flags }),
            other => Err(Error::from(format!("Flags is {:?}", other))),
        }
    }

    /// Reads the current value from the device.
    pub async fn read(&self) -> Result<Vec<u8>> {
        self.read_with(ReadOptions::default()).await
    }

    pub async fn read_with(&self, options: ReadOptions) -> Result<Vec<u8>> {
        self.call(MethodCall::ReadValue(options)).await?.into_bytes()
    }

    /// Reads the current value, giving up after `timeout`.
    ///
    /// Fails with [`ErrorKind::Timeout`][crate::ErrorKind::Timeout] if the device doesn't answer
    /// in time. Errors reported by the daemon are passed through.
    pub async fn read_value(&self, timeout: Duration) -> Result<Vec<u8>> {
        match tokio::time::timeout(timeout, self.read()).await {
            Ok(res) => res,
            Err(_) => Err(Error::timeout(
                format!("reading the value of {}", self.describe()),
                timeout,
            )),
        }
    }

    /// Writes a new value to this [`Characteristic`].
    pub async fn write_value(&self, value: &[u8]) -> Result<()> {
        self.write_with(value, WriteOptions::default()).await
    }

    pub async fn write_with(&self, value: &[u8], options: WriteOptions) -> Result<()> {
        self.call(MethodCall::WriteValue(value.to_vec(), options))
            .await?
            .into_unit()
    }

    /// Asks the device to report value changes.
    ///
    /// [`Characteristic::value_changed`] does this automatically.
    pub async fn start_notify(&self) -> Result<()> {
        self.call(MethodCall::StartNotify).await?.into_unit()
    }

    pub async fn stop_notify(&self) -> Result<()> {
        self.call(MethodCall::StopNotify).await?.into_unit()
    }

    /// Acquires a file descriptor for writing without going through the daemon.
    ///
    /// Returns the descriptor and the link's MTU.
    pub async fn acquire_write(&self) -> Result<(OwnedFd, u16)> {
        self.call(MethodCall::AcquireWrite).await?.into_fd()
    }

    /// Acquires a file descriptor that receives notifications.
    ///
    /// Returns the descriptor and the link's MTU.
    pub async fn acquire_notify(&self) -> Result<(OwnedFd, u16)> {
        self.call(MethodCall::AcquireNotify).await?.into_fd()
    }

    /// Subscribes to changes of this [`Characteristic`]'s value.
    ///
    /// The first subscription enables notifications on the device (if it supports them). Each
    /// subscription then starts with the current value, unless the characteristic can't be read,
    /// followed by every notification.
    pub async fn value_changed(&self) -> Result<Subscription<ValueChanged>> {
        let registration = self.hub.register(|_| true);
        self.ensure_watcher().await?;

        let replay = match self.read().await {
            Ok(value) => VecDeque::from([ValueChanged {
                value,
                is_state_change: false,
            }]),
            Err(e) => {
                log::debug!("not replaying value of {}: {}", self.describe(), e);
                VecDeque::new()
            }
        };
        Ok(Subscription::new(replay, registration))
    }

    async fn ensure_watcher(&self) -> Result<()> {
        if self.hub.has_watcher() {
            return Ok(());
        }

        let mut changes = self.watch_properties().await?;
        if let Err(e) = self.start_notify().await {
            log::warn!("couldn't enable notifications on {}: {}", self.describe(), e);
        }

        let hub = Arc::downgrade(&self.hub);
        let path = self.path.clone();
        self.hub.install(Watcher::spawn("value watcher", async move {
            while let Some(batch) = changes.next().await {
                let batch = match batch {
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("{}: bad property change: {}", path.as_str(), e);
                        continue;
                    }
                };
                let Some(value) = batch.changed.get("Value").and_then(Value::as_bytes) else {
                    continue;
                };
                let Some(hub) = hub.upgrade() else {
                    return Ok(());
                };
                log::trace!("{}: value {:02x?}", path.as_str(), value);
                hub.emit(ValueChanged {
                    value: value.to_vec(),
                    is_state_change: true,
                });
            }

            if let Some(hub) = hub.upgrade() {
                hub.close();
            }
            Err(Error::from(format!(
                "property change stream of {} ended",
                path.as_str()
            )))
        }));

        Ok(())
    }
}

impl fmt::Debug for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("path", &self.path.as_str())
            .finish()
    }
}

/// A set of flags detailing the supported operations on a [`Characteristic`].
#[derive(Debug, Clone)]
pub struct CharacteristicFlags {
    flags: Vec<String>,
}

impl CharacteristicFlags {
    fn has(&self, flag: &str) -> bool {
        self.flags.iter().any(|s| s == flag)
    }

    /// Returns a [`bool`] indicating whether the device can notify the host of changes made to the
    /// [`Characteristic`]'s value.
    ///
    /// If this returns `true`, [`Characteristic::value_changed`] reports every notification.
    pub fn can_notify(&self) -> bool {
        self.has("notify")
    }

    /// Returns a [`bool`] indicating whether the device supports sending *indications* of changes
    /// made to the [`Characteristic`]'s value.
    ///
    /// Indications work almost exactly like notifications, but include an acknowledgement by the
    /// GATT client (host).
    pub fn can_indicate(&self) -> bool {
        self.has("indicate")
    }

    /// Returns a [`bool`] indicating whether the device allows host-initiated reads of the
    /// [`Characteristic`]'s value.
    ///
    /// Note that many [`Characteristic`]s do *not* allow host-initiated reads, but *do* support
    /// device-initiated notifications (see [`CharacteristicFlags::can_notify`]).
    pub fn can_read(&self) -> bool {
        self.has("read")
    }

    /// Returns a [`bool`] indicating whether the device allows the host to set the
    /// [`Characteristic`]'s value.
    pub fn can_write(&self) -> bool {
        self.has("write")
    }

    pub fn can_write_without_response(&self) -> bool {
        self.has("write-without-response")
    }
}
