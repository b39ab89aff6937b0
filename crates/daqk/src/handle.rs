//! Counting references on graph nodes.

use std::fmt;

use crate::object::{name_matches, AsAny, Lifecycle, NodeCore, Object};
use crate::sync::{Arc, Weak};

/// A counted reference on an [`Object`].
///
/// Cloning takes a new reference, dropping releases it. An empty handle
/// refers to nothing; acquiring on a node that is already being destructed
/// yields an empty handle.
pub struct Handle<T: ?Sized + Object = dyn Object> {
    obj: Option<Arc<T>>,
}

impl<T: Object> Handle<T> {
    /// Allocates `obj` and returns the first handle on it.
    pub fn new(obj: T) -> Self {
        Self::new_cyclic(|_| obj)
    }

    /// Like [`Handle::new`], giving the constructor a weak reference to the
    /// object being built.
    pub fn new_cyclic(build: impl FnOnce(&Weak<T>) -> T) -> Self {
        let arc = Arc::new_cyclic(build);
        let weak: Weak<T> = Arc::downgrade(&arc);
        let me: Weak<dyn Object> = weak;
        arc.core().complete_construction(me);
        Self { obj: Some(arc) }
    }

    /// Allocates `obj` and attaches it under `parent`.
    pub fn new_in<P: ?Sized + Object>(obj: T, parent: &Handle<P>) -> Self {
        let handle = Self::new(obj);
        if let Some(p) = parent.get() {
            p.core().add_child(handle.clone().erase());
        }
        handle
    }

    /// Forgets the concrete type.
    pub fn erase(self) -> Handle {
        self.map(|arc| arc as Arc<dyn Object>)
    }
}

impl<T: ?Sized + Object> Handle<T> {
    pub const fn null() -> Self {
        Self { obj: None }
    }

    /// Takes a fresh reference on an object kept alive by `arc`.
    pub(crate) fn adopt(arc: Arc<T>) -> Self {
        if arc.acquire() {
            Self { obj: Some(arc) }
        } else {
            Self::null()
        }
    }

    /// Wraps `arc` without acquiring; the reference was already counted.
    pub(crate) fn from_claim(arc: Arc<T>) -> Self {
        Self { obj: Some(arc) }
    }

    /// Transfers the counted reference to another view of the same object.
    pub(crate) fn map<U: ?Sized + Object>(mut self, f: impl FnOnce(Arc<T>) -> Arc<U>) -> Handle<U> {
        Handle {
            obj: self.obj.take().map(f),
        }
    }

    pub(crate) fn arc(&self) -> Option<&Arc<T>> {
        self.obj.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_none()
    }

    pub fn get(&self) -> Option<&T> {
        self.obj.as_deref()
    }

    pub fn core(&self) -> Option<&NodeCore> {
        self.get().map(Object::core)
    }

    /// Name of the referenced node, empty for an empty handle.
    pub fn name(&self) -> String {
        self.core().map(NodeCore::name).unwrap_or_default()
    }

    pub fn num_references(&self) -> u32 {
        self.core().map_or(0, NodeCore::num_references)
    }

    /// Drops the reference now, leaving the handle empty.
    pub fn release(&mut self) {
        if let Some(arc) = self.obj.take() {
            arc.release(false);
        }
    }

    /// Drops the reference and asks the node to destroy itself.
    pub fn destroy(&mut self) {
        if let Some(arc) = self.obj.take() {
            arc.release(true);
        }
    }

    /// Moves the reference out, leaving this handle empty.
    pub fn take(&mut self) -> Self {
        Self {
            obj: self.obj.take(),
        }
    }

    /// Identity comparison, independent of the viewed type.
    pub fn ptr_eq<U: ?Sized + Object>(&self, other: &Handle<U>) -> bool {
        match (&self.obj, &other.obj) {
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            _ => false,
        }
    }

    /// True when this handle refers to `obj`.
    pub fn refers_to(&self, obj: &dyn Object) -> bool {
        self.obj
            .as_ref()
            .map_or(false, |a| Arc::as_ptr(a) as *const () == obj as *const dyn Object as *const ())
    }

    pub fn downcast_ref<U: Object>(&self) -> Option<&U> {
        self.get().and_then(|obj| AsAny::as_any(obj).downcast_ref::<U>())
    }

    /// Converts to a handle on the concrete type, handing the reference over.
    pub fn downcast<U: Object>(mut self) -> Result<Handle<U>, Self> {
        let Some(arc) = self.obj.take() else {
            return Err(self);
        };
        if AsAny::as_any(&*arc).is::<U>() {
            match AsAny::into_any_arc(arc).downcast::<U>() {
                Ok(concrete) => Ok(Handle::from_claim(concrete)),
                Err(_) => unreachable!("type checked before conversion"),
            }
        } else {
            self.obj = Some(arc);
            Err(self)
        }
    }
}

impl<T: ?Sized + Object> Clone for Handle<T> {
    fn clone(&self) -> Self {
        match &self.obj {
            Some(arc) => Self::adopt(arc.clone()),
            None => Self::null(),
        }
    }
}

impl<T: ?Sized + Object> Drop for Handle<T> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<T: ?Sized + Object> Default for Handle<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: ?Sized + Object> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || (self.is_null() && other.is_null())
    }
}

impl<T: ?Sized + Object> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(obj) => write!(
                f,
                "Handle({}:{} refs={})",
                obj.class_name(),
                obj.core().name(),
                obj.core().num_references()
            ),
            None => f.write_str("Handle(null)"),
        }
    }
}

/// Ordered collection of handles, used for child lists and snapshots.
pub struct HandleList<T: ?Sized + Object = dyn Object> {
    items: Vec<Handle<T>>,
}

impl<T: ?Sized + Object> Default for HandleList<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: ?Sized + Object> HandleList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            items: Vec::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends a handle; empty handles are ignored.
    pub fn push(&mut self, handle: Handle<T>) {
        if !handle.is_null() {
            self.items.push(handle);
        }
    }

    /// Inserts at `pos`, appending when `pos` is past the end.
    pub fn insert(&mut self, pos: usize, handle: Handle<T>) {
        if handle.is_null() {
            return;
        }
        let pos = pos.min(self.items.len());
        self.items.insert(pos, handle);
    }

    pub fn get(&self, n: usize) -> Option<&Handle<T>> {
        self.items.get(n)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle<T>> {
        self.items.iter()
    }

    pub(crate) fn arc_at(&self, n: usize) -> Option<Arc<T>> {
        self.items.get(n).and_then(|h| h.arc().cloned())
    }

    /// Index of the first element with exactly this name.
    pub fn find(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|h| h.core().map_or(false, |c| c.is_name(name)))
    }

    /// Indices of all elements whose name matches a `*`/`?` mask.
    pub fn find_mask(&self, mask: &str) -> Vec<usize> {
        self.items
            .iter()
            .enumerate()
            .filter(|(_, h)| name_matches(mask, &h.name()))
            .map(|(n, _)| n)
            .collect()
    }

    pub fn contains(&self, obj: &dyn Object) -> bool {
        self.items.iter().any(|h| h.refers_to(obj))
    }

    /// Removes the handle referring to `obj` and returns it still counted.
    pub fn extract(&mut self, obj: &dyn Object) -> Option<Handle<T>> {
        let pos = self.items.iter().position(|h| h.refers_to(obj))?;
        Some(self.items.remove(pos))
    }

    /// Empties the list, destroying the elements when `destroy` is set.
    pub fn clear(&mut self, destroy: bool) {
        for mut handle in self.items.drain(..) {
            if destroy {
                handle.destroy();
            } else {
                handle.release();
            }
        }
    }
}

impl<T: ?Sized + Object> Drop for HandleList<T> {
    fn drop(&mut self) {
        self.clear(false);
    }
}

impl<T: ?Sized + Object> fmt::Debug for HandleList<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items.iter()).finish()
    }
}
