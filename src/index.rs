//! The process-wide index of BlueZ objects and the interfaces they implement.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    bus::{Bus, Interfaces, ManagedObjects, ObjectManagerSignal},
    event::Watcher,
    value::PropertyBag,
    Error, Result,
};

/// Returns whether the object at `path`, implementing `interfaces`, implements `interface` and
/// lives strictly below `root`.
///
/// An object is never below itself, and `/org/bluez/hci0x` is not below `/org/bluez/hci0`.
pub fn is_match<'a, I>(interface: &str, path: &str, interfaces: I, root: Option<&str>) -> bool
where
    I: IntoIterator<Item = &'a str>,
{
    if let Some(root) = root {
        let Some(rest) = path.strip_prefix(root) else {
            return false;
        };
        // The root object `/` is the one path that already ends in a separator.
        if !(rest.starts_with('/') || (root.ends_with('/') && !rest.is_empty())) {
            return false;
        }
    }

    interfaces.into_iter().any(|i| i == interface)
}

/// Returns the path of the parent of `path`, or `None` for the root path.
fn parent_of(path: &ObjectPath<'_>) -> Option<OwnedObjectPath> {
    let s = path.as_str();
    let idx = s.rfind('/')?;
    if s.len() == 1 {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &s[..idx] };
    OwnedObjectPath::try_from(parent).ok()
}

/// Wants the path of every object below `root` that gains `interface`.
struct Listener {
    interface: &'static str,
    root: OwnedObjectPath,
    tx: UnboundedSender<OwnedObjectPath>,
}

/// The object graph, with objects linked to their parents.
///
/// Intermediate paths that aren't objects themselves (eg. `/org/bluez`) are kept as tree nodes as
/// long as something lives below them.
#[derive(Default)]
struct Tree {
    objects: HashMap<OwnedObjectPath, Interfaces>,
    children: HashMap<OwnedObjectPath, HashSet<OwnedObjectPath>>,
    listeners: Vec<Listener>,
    built: bool,
}

impl Tree {
    fn from_objects(objects: ManagedObjects) -> Self {
        let mut tree = Tree::default();
        for (path, interfaces) in objects {
            tree.add(path, interfaces);
        }
        tree.built = true;
        tree
    }

    fn link(&mut self, path: &OwnedObjectPath) {
        let mut child = path.clone();
        while let Some(parent) = parent_of(&child) {
            let siblings = self.children.entry(parent.clone()).or_default();
            if !siblings.insert(child) {
                break;
            }
            child = parent;
        }
    }

    fn unlink(&mut self, path: &OwnedObjectPath) {
        let mut child = path.clone();
        while let Some(parent) = parent_of(&child) {
            if self.objects.contains_key(&child) || self.children.contains_key(&child) {
                break;
            }
            let Some(siblings) = self.children.get_mut(&parent) else {
                break;
            };
            siblings.remove(&child);
            if !siblings.is_empty() {
                break;
            }
            self.children.remove(&parent);
            child = parent;
        }
    }

    /// Merges newly added interfaces into an object. Interfaces the object already has are kept.
    ///
    /// Returns the names of the interfaces the object didn't have before.
    fn add(&mut self, path: OwnedObjectPath, interfaces: Interfaces) -> Vec<String> {
        if interfaces.is_empty() {
            return Vec::new();
        }
        let known = self.objects.entry(path.clone()).or_default();
        let mut gained = Vec::new();
        for (name, props) in interfaces {
            if !known.contains_key(&name) {
                gained.push(name.clone());
                known.insert(name, props);
            }
        }
        self.link(&path);
        gained
    }

    fn notify(&mut self, path: &OwnedObjectPath, gained: &[String]) {
        self.listeners.retain(|listener| {
            let wanted = is_match(
                listener.interface,
                path.as_str(),
                gained.iter().map(String::as_str),
                Some(listener.root.as_str()),
            );
            if wanted {
                listener.tx.send(path.clone()).is_ok()
            } else {
                !listener.tx.is_closed()
            }
        });
    }

    /// Marks the tree as no longer following the daemon, ending every listener.
    fn go_stale(&mut self) {
        self.built = false;
        self.listeners.clear();
    }

    fn remove(&mut self, path: &OwnedObjectPath, interfaces: &[String]) {
        let Some(known) = self.objects.get_mut(path) else {
            return;
        };
        for name in interfaces {
            known.remove(name);
        }
        if known.is_empty() {
            self.objects.remove(path);
            self.unlink(path);
        }
    }

    fn query(&self, interface: &str, root: Option<&ObjectPath<'_>>) -> Vec<OwnedObjectPath> {
        let implements = |path: &OwnedObjectPath| {
            self.objects
                .get(path)
                .map_or(false, |intfs| intfs.contains_key(interface))
        };

        let mut matches = match root {
            None => self
                .objects
                .keys()
                .filter(|p| implements(*p))
                .cloned()
                .collect::<Vec<_>>(),
            Some(root) => {
                let mut matches = Vec::new();
                let mut stack = match OwnedObjectPath::try_from(root.as_str()) {
                    Ok(root) => vec![root],
                    Err(_) => Vec::new(),
                };
                while let Some(node) = stack.pop() {
                    if let Some(children) = self.children.get(&node) {
                        for child in children {
                            if implements(child) {
                                matches.push(child.clone());
                            }
                            stack.push(child.clone());
                        }
                    }
                }
                matches
            }
        };
        matches.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        matches
    }
}

fn lock(tree: &Mutex<Tree>) -> MutexGuard<'_, Tree> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Knows which objects exist and which interfaces they implement.
///
/// The index is built by the first query and then kept current by listening to the
/// `InterfacesAdded` and `InterfacesRemoved` signals for as long as it lives. If fetching the
/// object graph fails, the query fails and the next query tries again. If the signal stream ends,
/// the index goes stale and the next query rebuilds it.
///
/// Property bags stored here are the ones reported when an interface appeared. They are only
/// suitable for attributes that never change, like GATT UUIDs.
pub struct ObjectIndex {
    bus: Arc<dyn Bus>,
    tree: Arc<Mutex<Tree>>,
    watcher: tokio::sync::Mutex<Option<Watcher>>,
}

impl ObjectIndex {
    pub(crate) fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            tree: Arc::default(),
            watcher: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the paths of all objects implementing `interface`, optionally restricted to
    /// descendants of `root`.
    pub async fn query(
        &self,
        interface: &str,
        root: Option<&ObjectPath<'_>>,
    ) -> Result<Vec<OwnedObjectPath>> {
        self.ensure_built().await?;
        Ok(lock(&self.tree).query(interface, root))
    }

    /// Returns the properties `path` reported for `interface` when the interface appeared.
    pub async fn properties(
        &self,
        path: &ObjectPath<'_>,
        interface: &str,
    ) -> Result<Option<PropertyBag>> {
        self.ensure_built().await?;
        let tree = lock(&self.tree);
        Ok(OwnedObjectPath::try_from(path.as_str())
            .ok()
            .and_then(|p| tree.objects.get(&p))
            .and_then(|intfs| intfs.get(interface))
            .cloned())
    }

    /// Returns whether the index has been built and is being kept current.
    pub fn is_built(&self) -> bool {
        lock(&self.tree).built
    }

    /// Yields the path of every object below `root` that gains `interface` from now on.
    ///
    /// An object applied to the index before this returns shows up in [`ObjectIndex::query`], and
    /// one applied afterwards is yielded here, so a query made after subscribing misses nothing.
    /// The stream ends when the index goes stale.
    pub(crate) async fn watch_added(
        &self,
        interface: &'static str,
        root: &ObjectPath<'_>,
    ) -> Result<BoxStream<'static, OwnedObjectPath>> {
        self.ensure_built().await?;

        let (tx, rx) = unbounded_channel();
        {
            let mut tree = lock(&self.tree);
            if !tree.built {
                return Err(Error::from("object index went stale"));
            }
            tree.listeners.push(Listener {
                interface,
                root: OwnedObjectPath::from(root.to_owned()),
                tx,
            });
        }

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|path| (path, rx))
        })
        .boxed())
    }

    async fn ensure_built(&self) -> Result<()> {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() && self.is_built() {
            return Ok(());
        }

        // Subscribe before fetching, so nothing that happens in between is lost.
        let signals = self.bus.watch_object_manager().await?;
        let objects = self.bus.managed_objects().await?;
        log::debug!("indexed {} BlueZ objects", objects.len());

        *lock(&self.tree) = Tree::from_objects(objects);

        let tree = self.tree.clone();
        *watcher = Some(Watcher::spawn("object index", async move {
            let mut signals = signals;
            while let Some(signal) = signals.next().await {
                apply(&tree, signal);
            }

            lock(&tree).go_stale();
            Err(Error::from("object manager signal stream ended"))
        }));
        Ok(())
    }
}

fn apply(tree: &Mutex<Tree>, signal: Result<ObjectManagerSignal>) {
    match signal {
        Ok(ObjectManagerSignal::Added(added)) => {
            log::trace!(
                "{}: added {:?}",
                added.path.as_str(),
                added.interfaces.keys()
            );
            let mut tree = lock(tree);
            let gained = tree.add(added.path.clone(), added.interfaces);
            if !gained.is_empty() {
                tree.notify(&added.path, &gained);
            }
        }
        Ok(ObjectManagerSignal::Removed(removed)) => {
            log::trace!(
                "{}: removed {:?}",
                removed.path.as_str(),
                removed.interfaces
            );
            lock(tree).remove(&removed.path, &removed.interfaces);
        }
        Err(e) => {
            log::warn!("ignoring malformed object manager signal: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{fake::*, ADAPTER_INTERFACE, DEVICE_INTERFACE, GATT_SERVICE_INTERFACE},
        value::Value,
    };

    fn intfs(names: &[&str]) -> Interfaces {
        names
            .iter()
            .map(|n| (n.to_string(), PropertyBag::new()))
            .collect()
    }

    #[test]
    fn matcher() {
        let dev = [DEVICE_INTERFACE];
        assert!(is_match(
            DEVICE_INTERFACE,
            "/org/bluez/hci0/dev_11_22",
            dev,
            Some("/org/bluez/hci0")
        ));
        assert!(!is_match(
            DEVICE_INTERFACE,
            "/org/bluez/hci0x",
            dev,
            Some("/org/bluez/hci0")
        ));
        assert!(!is_match(
            DEVICE_INTERFACE,
            "/org/bluez/hci0",
            dev,
            Some("/org/bluez/hci0")
        ));
        assert!(!is_match(
            ADAPTER_INTERFACE,
            "/org/bluez/hci0/dev_11_22",
            dev,
            None
        ));
        assert!(is_match(DEVICE_INTERFACE, "/org/bluez/hci0/dev_11_22", dev, Some("/")));
        assert!(is_match(DEVICE_INTERFACE, "/org/bluez/hci0/dev_11_22", dev, None));
    }

    #[test]
    fn tree_agrees_with_matcher() {
        let paths = [
            ("/org/bluez/hci0", ADAPTER_INTERFACE),
            ("/org/bluez/hci0x", ADAPTER_INTERFACE),
            ("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE),
            ("/org/bluez/hci0/dev_33_44", DEVICE_INTERFACE),
            ("/org/bluez/hci0x/dev_55_66", DEVICE_INTERFACE),
            ("/org/bluez/hci0/dev_11_22/service0010", GATT_SERVICE_INTERFACE),
        ];
        let tree = Tree::from_objects(
            paths
                .iter()
                .map(|(p, i)| (path(p), intfs(&[*i])))
                .collect(),
        );

        for root in [None, Some("/"), Some("/org/bluez/hci0"), Some("/org/bluez/hci0/dev_11_22")] {
            for interface in [ADAPTER_INTERFACE, DEVICE_INTERFACE, GATT_SERVICE_INTERFACE] {
                let root_path = root.map(path);
                let got = tree.query(interface, root_path.as_deref());
                let mut expected = paths
                    .iter()
                    .filter(|(p, i)| is_match(interface, p, [*i], root))
                    .map(|(p, _)| path(p))
                    .collect::<Vec<_>>();
                expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                assert_eq!(got, expected, "{} under {:?}", interface, root);
            }
        }
    }

    #[test]
    fn removing_last_interface_drops_object() {
        let mut tree = Tree::default();
        let dev = path("/org/bluez/hci0/dev_11_22");
        tree.add(dev.clone(), intfs(&[DEVICE_INTERFACE, "org.bluez.Battery1"]));

        tree.remove(&dev, &[DEVICE_INTERFACE.to_string()]);
        assert!(tree.objects.contains_key(&dev));
        assert!(tree.query(DEVICE_INTERFACE, None).is_empty());

        tree.remove(&dev, &["org.bluez.Battery1".to_string()]);
        assert!(tree.objects.is_empty());
        assert!(tree.children.is_empty());
    }

    #[test]
    fn added_interfaces_merge() {
        let mut tree = Tree::default();
        let dev = path("/org/bluez/hci0/dev_11_22");
        let mut first = intfs(&[DEVICE_INTERFACE]);
        first
            .get_mut(DEVICE_INTERFACE)
            .unwrap()
            .insert("Alias".into(), Value::from("first"));
        tree.add(dev.clone(), first);

        let mut second = intfs(&[DEVICE_INTERFACE, "org.bluez.Battery1"]);
        second
            .get_mut(DEVICE_INTERFACE)
            .unwrap()
            .insert("Alias".into(), Value::from("second"));
        tree.add(dev.clone(), second);

        let known = &tree.objects[&dev];
        assert_eq!(known.len(), 2);
        assert_eq!(known[DEVICE_INTERFACE]["Alias"], Value::from("first"));
    }

    #[tokio::test]
    async fn follows_signals() {
        let bus = FakeBus::new();
        bus.insert("/org/bluez/hci0", ADAPTER_INTERFACE, PropertyBag::new());
        bus.insert("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE, PropertyBag::new());

        let index = ObjectIndex::new(Arc::new(bus.clone()));
        let hci0 = path("/org/bluez/hci0");
        assert_eq!(
            index.query(DEVICE_INTERFACE, Some(&*hci0)).await.unwrap(),
            vec![path("/org/bluez/hci0/dev_11_22")]
        );

        bus.add("/org/bluez/hci0/dev_33_44", DEVICE_INTERFACE, PropertyBag::new());
        bus.remove("/org/bluez/hci0/dev_11_22", &[DEVICE_INTERFACE]);
        settle().await;

        assert_eq!(
            index.query(DEVICE_INTERFACE, Some(&*hci0)).await.unwrap(),
            vec![path("/org/bluez/hci0/dev_33_44")]
        );
        assert_eq!(bus.fetches(), 1);
    }

    #[tokio::test]
    async fn readding_after_removal_keeps_object() {
        let bus = FakeBus::new();
        bus.insert("/org/bluez/hci0", ADAPTER_INTERFACE, PropertyBag::new());
        bus.insert("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE, PropertyBag::new());

        let index = ObjectIndex::new(Arc::new(bus.clone()));
        index.query(DEVICE_INTERFACE, None).await.unwrap();

        // The device goes out of range and comes back before anyone looks.
        bus.remove("/org/bluez/hci0/dev_11_22", &[DEVICE_INTERFACE]);
        bus.add("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE, PropertyBag::new());
        settle().await;

        assert_eq!(
            index.query(DEVICE_INTERFACE, None).await.unwrap(),
            vec![path("/org/bluez/hci0/dev_11_22")]
        );
    }

    #[tokio::test]
    async fn stale_index_is_rebuilt() {
        let bus = FakeBus::new();
        bus.insert("/org/bluez/hci0", ADAPTER_INTERFACE, PropertyBag::new());

        let index = ObjectIndex::new(Arc::new(bus.clone()));
        let hci0 = path("/org/bluez/hci0");
        assert!(index.query(DEVICE_INTERFACE, None).await.unwrap().is_empty());
        let mut added = index.watch_added(DEVICE_INTERFACE, &hci0).await.unwrap();
        assert!(index.is_built());

        bus.end_object_manager_streams();
        settle().await;
        assert!(!index.is_built());
        assert_eq!(added.next().await, None);

        // Nobody is told about this one, only a fresh fetch can find it.
        bus.insert("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE, PropertyBag::new());
        assert_eq!(
            index.query(DEVICE_INTERFACE, None).await.unwrap(),
            vec![path("/org/bluez/hci0/dev_11_22")]
        );
        assert!(index.is_built());
        assert_eq!(bus.fetches(), 2);
    }

    #[tokio::test]
    async fn listeners_see_new_interfaces_below_root() {
        let bus = FakeBus::new();
        bus.insert("/org/bluez/hci0", ADAPTER_INTERFACE, PropertyBag::new());
        bus.insert("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE, PropertyBag::new());

        let index = ObjectIndex::new(Arc::new(bus.clone()));
        let hci0 = path("/org/bluez/hci0");
        let mut added = index.watch_added(DEVICE_INTERFACE, &hci0).await.unwrap();

        // Already known, on another adapter, and not a device.
        bus.add("/org/bluez/hci0/dev_11_22", DEVICE_INTERFACE, PropertyBag::new());
        bus.add("/org/bluez/hci1/dev_33_44", DEVICE_INTERFACE, PropertyBag::new());
        bus.add("/org/bluez/hci0/dev_11_22/service0010", GATT_SERVICE_INTERFACE, PropertyBag::new());
        bus.add("/org/bluez/hci0/dev_55_66", DEVICE_INTERFACE, PropertyBag::new());

        assert_eq!(added.next().await, Some(path("/org/bluez/hci0/dev_55_66")));
        drop(added);
        bus.add("/org/bluez/hci0/dev_77_88", DEVICE_INTERFACE, PropertyBag::new());
        settle().await;
        assert!(lock(&index.tree).listeners.is_empty());
    }

    #[tokio::test]
    async fn failed_fetch_is_retried() {
        let bus = FakeBus::new();
        bus.insert("/org/bluez/hci0", ADAPTER_INTERFACE, PropertyBag::new());
        bus.fail_fetches(1);

        let index = ObjectIndex::new(Arc::new(bus.clone()));
        let err = index.query(ADAPTER_INTERFACE, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Remote);
        assert!(!index.is_built());

        assert_eq!(
            index.query(ADAPTER_INTERFACE, None).await.unwrap(),
            vec![path("/org/bluez/hci0")]
        );
        assert_eq!(bus.fetches(), 2);
    }
}
