//! Generic property access, property change streams, and waiting for a property value.

use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures_util::{future::BoxFuture, FutureExt, Stream, StreamExt};
use zbus::zvariant::OwnedObjectPath;

use crate::{
    bus::SignalStream,
    bus::PropertiesChanged,
    value::{PropertyBag, Value},
    Error, Result, Session,
};

/// The properties that changed in one `PropertiesChanged` signal.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    /// Properties with their new values.
    pub changed: PropertyBag,
    /// Properties whose value changed, but wasn't included in the signal.
    pub invalidated: Vec<String>,
}

/// A stream of [`ChangeBatch`]es for one interface of one object.
///
/// Dropping the stream removes the underlying signal subscription.
pub struct PropertyChanges {
    stream: SignalStream<PropertiesChanged>,
    interface: &'static str,
}

impl PropertyChanges {
    pub(crate) async fn watch(
        session: &Session,
        path: &OwnedObjectPath,
        interface: &'static str,
    ) -> Result<Self> {
        let stream = session.bus().watch_properties(path.clone()).await?;
        Ok(Self { stream, interface })
    }
}

impl Stream for PropertyChanges {
    type Item = Result<ChangeBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.stream.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(signal))) => {
                    if signal.interface != self.interface {
                        continue;
                    }
                    log::trace!(
                        "{}: changed {:?}, invalidated {:?}",
                        self.interface,
                        signal.changed.keys(),
                        signal.invalidated,
                    );
                    return Poll::Ready(Some(Ok(ChangeBatch {
                        changed: signal.changed,
                        invalidated: signal.invalidated,
                    })));
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Read and watch access to the properties of a remote object.
///
/// Implemented by every wrapper type ([`Adapter`], [`Device`], [`Service`] and
/// [`Characteristic`]), so [`wait_for_property_value`] works with any of them.
///
/// [`Adapter`]: crate::Adapter
/// [`Device`]: crate::Device
/// [`Service`]: crate::gatt::Service
/// [`Characteristic`]: crate::gatt::Characteristic
pub trait PropertyAccess {
    /// A human readable description of the object, used in error messages.
    fn describe(&self) -> String;

    /// Reads the current value of a property from the daemon.
    fn get_property<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Value>>;

    /// Subscribes to changes of this object's properties.
    fn watch_properties(&self) -> BoxFuture<'_, Result<PropertyChanges>>;
}

/// Implemented by the wrapper types to get [`PropertyAccess`] for free.
pub(crate) trait RemoteObject: Sync {
    const INTERFACE: &'static str;
    const KIND: &'static str;

    fn session(&self) -> &Session;
    fn object_path(&self) -> &OwnedObjectPath;
}

impl<T: RemoteObject> PropertyAccess for T {
    fn describe(&self) -> String {
        format!("{} ({})", T::KIND, self.object_path().as_str())
    }

    fn get_property<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Value>> {
        self.session().bus().get_property(
            self.object_path().clone(),
            T::INTERFACE,
            name.to_string(),
        )
    }

    fn watch_properties(&self) -> BoxFuture<'_, Result<PropertyChanges>> {
        PropertyChanges::watch(self.session(), self.object_path(), T::INTERFACE).boxed()
    }
}

/// Waits until the property `name` of `object` equals `value`, or `timeout` elapses.
///
/// Returns immediately if the property already has the desired value. Errors reading the property
/// or receiving change signals are returned to the caller; if `timeout` elapses first, an error of
/// kind [`ErrorKind::Timeout`][crate::ErrorKind::Timeout] is returned. No signal subscription
/// outlives the call.
pub async fn wait_for_property_value<O>(
    object: &O,
    name: &str,
    value: impl Into<Value>,
    timeout: Duration,
) -> Result<()>
where
    O: PropertyAccess + ?Sized,
{
    let value = value.into();

    // Watch first, so a change between the read and the subscription can't get lost.
    let mut changes = object.watch_properties().await?;
    if object.get_property(name).await? == value {
        log::debug!("{} {:?} is already {:?}", object.describe(), name, value);
        return Ok(());
    }

    let matched = async {
        while let Some(batch) = changes.next().await {
            let batch = batch?;
            if batch.changed.get(name) == Some(&value) {
                return Ok(());
            }
            if batch.invalidated.iter().any(|p| p == name)
                && object.get_property(name).await? == value
            {
                return Ok(());
            }
        }
        Err(Error::from(format!(
            "property change stream of {} ended",
            object.describe()
        )))
    };

    match tokio::time::timeout(timeout, matched).await {
        Ok(res) => res,
        Err(_) => Err(Error::timeout(
            format!(
                "{} property {:?} to equal {:?}",
                object.describe(),
                name,
                value
            ),
            timeout,
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        bus::{fake::*, ADAPTER_INTERFACE, DEVICE_INTERFACE},
        Device, ErrorKind,
    };

    const DEV: &str = "/org/bluez/hci0/dev_11_22";

    fn setup(connected: bool) -> (FakeBus, Device) {
        let bus = FakeBus::new();
        bus.insert("/org/bluez/hci0", ADAPTER_INTERFACE, bag([]));
        bus.insert(
            DEV,
            DEVICE_INTERFACE,
            bag([("Connected", Value::Bool(connected))]),
        );
        let session = Session::with_bus(Arc::new(bus.clone()));
        let device = Device::new(session, path(DEV));
        (bus, device)
    }

    #[tokio::test]
    async fn already_satisfied() {
        let (bus, device) = setup(true);
        wait_for_property_value(&device, "Connected", true, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(bus.watches_created(), 1);
        assert_eq!(bus.live_watchers(DEV), 0);
    }

    #[tokio::test]
    async fn satisfied_by_signal() {
        let (bus, device) = setup(false);
        let wait = wait_for_property_value(&device, "Connected", true, Duration::from_secs(5));
        let change = async {
            settle().await;
            bus.set(DEV, DEVICE_INTERFACE, "Connected", Value::Bool(true));
        };
        let (res, ()) = futures_util::join!(wait, change);
        res.unwrap();
        assert_eq!(bus.live_watchers(DEV), 0);
    }

    #[tokio::test]
    async fn other_interfaces_are_ignored() {
        let (bus, device) = setup(false);
        let wait = wait_for_property_value(&device, "Connected", true, Duration::from_secs(1));
        let change = async {
            settle().await;
            bus.set(DEV, "org.bluez.Battery1", "Connected", Value::Bool(true));
        };
        let (res, ()) = futures_util::join!(wait, change);
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out() {
        let (bus, device) = setup(false);
        let timeout = Duration::from_secs(5);
        let start = tokio::time::Instant::now();
        let err = wait_for_property_value(&device, "Connected", true, timeout)
            .await
            .unwrap_err();
        let elapsed = start.elapsed();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("\"Connected\""));
        assert!(err.to_string().contains("5s"));
        assert!(elapsed >= timeout && elapsed < timeout + Duration::from_millis(100));
        assert_eq!(bus.live_watchers(DEV), 0);
    }

    #[tokio::test]
    async fn read_errors_propagate() {
        let (_bus, device) = setup(false);
        let err = wait_for_property_value(&device, "Paired", true, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Remote);
    }
}
