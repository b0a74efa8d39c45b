use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::trace;

use crate::events::ManagerEvent;
use crate::filterable::{BLANK_FILTER, Filterable, STOCK_ALL};
use crate::query::QueryFlags;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug)]
struct Inner<T> {
    objects: BTreeMap<String, Arc<T>>,
    active: Option<Arc<T>>,
}

/// Id-keyed collection of filterable objects with one optional active entry.
///
/// Every mutation that changes state is announced on a broadcast channel.
/// Lagging subscribers lose old events, the manager never blocks on them.
#[derive(Debug)]
pub struct BaseManager<T: Filterable> {
    action_id: String,
    title: String,
    inner: Mutex<Inner<T>>,
    events: broadcast::Sender<ManagerEvent<T>>,
}

impl<T: Filterable> BaseManager<T> {
    pub fn new(action_id: impl Into<String>, title: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            action_id: action_id.into(),
            title: title.into(),
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                active: None,
            }),
            events,
        }
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent<T>> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("manager mutex poisoned")
    }

    fn emit(&self, event: ManagerEvent<T>) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Inserts `object` unless its id is already managed.
    pub fn add_object(&self, object: Arc<T>) -> bool {
        {
            let mut inner = self.lock();
            if inner.objects.contains_key(object.id()) {
                return false;
            }
            inner
                .objects
                .insert(object.id().to_string(), Arc::clone(&object));
        }
        trace!(manager = %self.action_id, id = object.id(), "object added");
        self.emit(ManagerEvent::ObjectAdded(object));
        true
    }

    /// Removes the object with `id`. The active pointer is left alone.
    pub fn remove_object_by_id(&self, id: &str) -> bool {
        let removed = self.lock().objects.remove(id);
        match removed {
            Some(object) => {
                trace!(manager = %self.action_id, id, "object removed");
                self.emit(ManagerEvent::ObjectRemoved(object));
                true
            }
            None => false,
        }
    }

    pub fn get_object_by_id(&self, id: &str) -> Option<Arc<T>> {
        self.lock().objects.get(id).cloned()
    }

    /// Snapshot of every managed object in id order.
    pub fn get_objects(&self) -> Vec<Arc<T>> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn objects_count(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn active_object(&self) -> Option<Arc<T>> {
        self.lock().active.clone()
    }

    /// Returns `true` when the active object actually changed.
    pub fn set_active_object(&self, object: Option<Arc<T>>) -> bool {
        {
            let mut inner = self.lock();
            let same = match (&inner.active, &object) {
                (Some(current), Some(new)) => Arc::ptr_eq(current, new),
                (None, None) => true,
                _ => false,
            };
            if same {
                return false;
            }
            inner.active = object.clone();
        }
        trace!(
            manager = %self.action_id,
            active = object.as_ref().map(|o| o.id()).unwrap_or("<none>"),
            "active object changed"
        );
        self.emit(ManagerEvent::ActiveChanged(object));
        true
    }

    pub fn set_active_object_by_id(&self, id: &str) -> bool {
        match self.get_object_by_id(id) {
            Some(object) => self.set_active_object(Some(object)),
            None => false,
        }
    }

    /// OR-union of every object's filter except `all` and blank ones.
    pub fn get_all_filter(&self) -> String {
        let filters: Vec<String> = self
            .lock()
            .objects
            .iter()
            .filter(|(id, _)| id.as_str() != STOCK_ALL)
            .map(|(_, object)| object.filter())
            .filter(|filter| filter != BLANK_FILTER)
            .collect();

        if filters.is_empty() {
            BLANK_FILTER.to_string()
        } else {
            format!("({})", filters.join(" || "))
        }
    }

    /// Reconciles the managed set against `new_objects`.
    ///
    /// Non-builtin objects missing from `new_objects` are removed and unknown
    /// ids are added. Objects present on both sides are kept as they are, even
    /// when the incoming copy carries different properties.
    pub fn process_new_objects(&self, new_objects: &[Arc<T>]) {
        let new_ids: HashSet<&str> = new_objects.iter().map(|o| o.id()).collect();

        let stale: Vec<String> = self
            .lock()
            .objects
            .values()
            .filter(|o| !o.is_builtin() && !new_ids.contains(o.id()))
            .map(|o| o.id().to_string())
            .collect();
        for id in stale {
            self.remove_object_by_id(&id);
        }

        for object in new_objects {
            if self.get_object_by_id(object.id()).is_none() {
                self.add_object(Arc::clone(object));
            }
        }
    }

    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.objects.clear();
            inner.active = None;
        }
        self.emit(ManagerEvent::Cleared);
    }
}

/// Query-facing view of a manager.
///
/// The defaults read the active object. Concrete managers override them to
/// choose a different entry depending on the query flags.
pub trait Manager {
    type Object: Filterable;

    fn base(&self) -> &BaseManager<Self::Object>;

    fn filter(&self, _flags: QueryFlags) -> String {
        self.base()
            .active_object()
            .map(|o| o.filter())
            .unwrap_or_else(|| BLANK_FILTER.to_string())
    }

    fn where_clause(&self, _flags: QueryFlags) -> String {
        self.base()
            .active_object()
            .map(|o| o.where_clause())
            .unwrap_or_default()
    }
}
