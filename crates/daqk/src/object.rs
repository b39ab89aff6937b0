//! Reference-counted graph nodes and their destruction state machine.
//!
//! Every kernel entity (plain nodes, parameters, messages, units) embeds a
//! [`NodeCore`] and implements [`Object`]. Memory is owned by `Arc`, while
//! the logical reference count in the core counts live [`Handle`]s and drives
//! teardown:
//!
//! ```text
//! Constructing -> Normal -> [WaitingForOwnerThread] -> TearingDown
//!              -> WaitingForFinalRelease -> Destructing
//! ```
//!
//! Parent links are weak. Only the child list holds counting handles, so a
//! subtree never keeps its root alive.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

use crate::error::contract_violation;
use crate::handle::{Handle, HandleList};
use crate::sync::{unlocked, Arc, Mutex, MutexGuard, Weak};

/// Default bound for retries while a child list is blocked.
pub const DEFAULT_BLOCK_RETRIES: u32 = 1_000_000;

/// Position of a node in its destruction sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeState {
    Constructing,
    Normal,
    WaitingForOwnerThread,
    TearingDown,
    WaitingForFinalRelease,
    Destructing,
}

/// Behaviour flags stored next to the node state.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct NodeFlags(u8);

impl NodeFlags {
    /// Children added to this node get [`NodeFlags::AUTO_DESTROY`] and are
    /// destroyed with it.
    pub const OWNER_OF_CHILDREN: Self = Self(0x01);
    /// Final destruction is routed through an installed [`Reaper`].
    pub const NEEDS_CLEANUP: Self = Self(0x02);
    /// Teardown must run on the owning event loop thread.
    pub const HAS_OWNER_THREAD: Self = Self(0x04);
    /// Tear down as soon as the last handle is released.
    pub const AUTO_DESTROY: Self = Self(0x08);
    pub const LOGGING: Self = Self(0x10);
    pub const HIDDEN: Self = Self(0x20);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(NodeFlags, &str); 6] = [
            (NodeFlags::OWNER_OF_CHILDREN, "OWNER"),
            (NodeFlags::NEEDS_CLEANUP, "CLEANUP"),
            (NodeFlags::HAS_OWNER_THREAD, "THREAD"),
            (NodeFlags::AUTO_DESTROY, "AUTO"),
            (NodeFlags::LOGGING, "LOG"),
            (NodeFlags::HIDDEN, "HIDDEN"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "NodeFlags({})", set.join("|"))
    }
}

/// Type-erasure helpers every [`Object`] gets for free.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A node of the object graph.
///
/// Implementors embed a [`NodeCore`] and may override the teardown hooks.
/// Apart from [`Object::veto_delete`], hooks run with the node unlocked.
pub trait Object: AsAny + Send + Sync + 'static {
    fn core(&self) -> &NodeCore;

    fn class_name(&self) -> &'static str {
        "Object"
    }

    /// Releases references this object holds on other nodes. Runs exactly
    /// once, at the start of teardown, before children are detached.
    fn object_cleanup(&self) {}

    /// Returning true keeps a fully released object in
    /// [`NodeState::WaitingForFinalRelease`] instead of freeing it.
    ///
    /// Called with the node locked: must not take handles on this node.
    fn veto_delete(&self) -> bool {
        false
    }

    /// Hands teardown over to the owning thread. Returns true when the owner
    /// accepted and will call [`Lifecycle::destroy_from_owner_thread`] later.
    fn destroy_by_owner_thread(&self) -> bool {
        false
    }
}

impl dyn Object {
    pub fn downcast_ref<T: Object>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    pub fn is<T: Object>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }
}

/// Receives nodes flagged [`NodeFlags::NEEDS_CLEANUP`] after teardown.
///
/// The handle passed in carries the extra claim taken on behalf of the
/// reaper; dropping it finishes destruction.
pub trait Reaper: Send + Sync {
    fn reap(&self, obj: Handle);
}

/// Acquire/release interface the runtime implements for every [`Object`].
///
/// [`Handle`] is written purely against this trait.
pub trait Lifecycle {
    /// Takes one reference. Fails once the node is being destructed.
    fn acquire(&self) -> bool;

    /// Drops one reference, optionally asking for destruction. Returns true
    /// when this call destructed the node.
    fn release(&self, ask_to_destroy: bool) -> bool;

    /// Asks for destruction without giving up a reference.
    fn request_destroy(&self) -> bool;

    /// Continues a teardown deferred through
    /// [`Object::destroy_by_owner_thread`], consuming the owner's claim.
    fn destroy_from_owner_thread(&self) -> bool;

    /// True when final deletion is taken over by someone else right now.
    fn intercept_delete(&self) -> bool;
}

impl<T: ?Sized + Object> Lifecycle for T {
    fn acquire(&self) -> bool {
        self.core().inc_reference()
    }

    fn release(&self, ask_to_destroy: bool) -> bool {
        finish(self, dec_reference(self, ask_to_destroy, true, false))
    }

    fn request_destroy(&self) -> bool {
        finish(self, dec_reference(self, true, false, false))
    }

    fn destroy_from_owner_thread(&self) -> bool {
        finish(self, dec_reference(self, true, true, true))
    }

    fn intercept_delete(&self) -> bool {
        self.veto_delete()
    }
}

struct NodeInner {
    state: NodeState,
    flags: NodeFlags,
    refcnt: u32,
    block: u32,
    children: Option<HandleList>,
    parent: Option<Weak<dyn Object>>,
    reaper: Option<Arc<dyn Reaper>>,
}

/// State shared by every node: name, counters, flags and the child list.
pub struct NodeCore {
    // Leaf lock: nothing else is acquired while it is held.
    name: Mutex<String>,
    inner: Mutex<NodeInner>,
    me: OnceLock<Weak<dyn Object>>,
    retries: AtomicU32,
}

impl NodeCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_flags(name, NodeFlags::AUTO_DESTROY)
    }

    pub fn with_flags(name: impl Into<String>, flags: NodeFlags) -> Self {
        Self {
            name: Mutex::new(name.into()),
            inner: Mutex::new(NodeInner {
                state: NodeState::Constructing,
                flags,
                refcnt: 0,
                block: 0,
                children: None,
                parent: None,
                reaper: None,
            }),
            me: OnceLock::new(),
            retries: AtomicU32::new(DEFAULT_BLOCK_RETRIES),
        }
    }

    /// Overrides how often a blocked child list is retried before the
    /// operation is declared stuck.
    pub fn with_block_retries(self, retries: u32) -> Self {
        self.set_block_retries(retries);
        self
    }

    pub fn set_block_retries(&self, retries: u32) {
        self.retries.store(retries.max(1), Ordering::Relaxed);
    }

    /// Moves a freshly allocated node to `Normal`, accounting for the first
    /// handle.
    pub(crate) fn complete_construction(&self, me: Weak<dyn Object>) {
        if self.me.set(me).is_err() {
            contract_violation("node constructed twice");
        }
        let mut inner = self.inner.lock();
        if inner.state != NodeState::Constructing {
            contract_violation("node construction completed out of order");
        }
        inner.state = NodeState::Normal;
        inner.refcnt = 1;
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn is_name(&self, name: &str) -> bool {
        !name.is_empty() && *self.name.lock() == name
    }

    /// Renames the node. Only legal while no handle references it.
    pub fn set_name(&self, name: impl Into<String>) {
        let inner = self.inner.lock();
        if inner.refcnt > 0 {
            let current = self.name();
            contract_violation(&format!(
                "rename of `{current}` while {} references are outstanding",
                inner.refcnt
            ));
        }
        *self.name.lock() = name.into();
    }

    pub fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    pub fn is_normal(&self) -> bool {
        self.state() == NodeState::Normal
    }

    pub fn flags(&self) -> NodeFlags {
        self.inner.lock().flags
    }

    pub fn set_flag(&self, flag: NodeFlags, on: bool) {
        self.inner.lock().flags.set(flag, on);
    }

    pub fn is_owner(&self) -> bool {
        self.flags().contains(NodeFlags::OWNER_OF_CHILDREN)
    }

    pub fn set_owner(&self, on: bool) {
        self.set_flag(NodeFlags::OWNER_OF_CHILDREN, on);
    }

    pub fn set_auto_destroy(&self, on: bool) {
        self.set_flag(NodeFlags::AUTO_DESTROY, on);
    }

    pub fn is_logging(&self) -> bool {
        self.flags().contains(NodeFlags::LOGGING)
    }

    pub fn set_logging(&self, on: bool) {
        self.set_flag(NodeFlags::LOGGING, on);
    }

    pub fn is_hidden(&self) -> bool {
        self.flags().contains(NodeFlags::HIDDEN)
    }

    pub fn set_hidden(&self, on: bool) {
        self.set_flag(NodeFlags::HIDDEN, on);
    }

    /// Routes final destruction of this node through `reaper`.
    pub fn set_reaper(&self, reaper: Arc<dyn Reaper>) {
        let mut inner = self.inner.lock();
        inner.reaper = Some(reaper);
        inner.flags.set(NodeFlags::NEEDS_CLEANUP, true);
    }

    pub fn num_references(&self) -> u32 {
        self.inner.lock().refcnt
    }

    pub fn num_children(&self) -> usize {
        self.inner.lock().children.as_ref().map_or(0, HandleList::len)
    }

    /// Takes a new handle on the node owning this core.
    pub fn self_handle(&self) -> Handle {
        match self.me.get().and_then(Weak::upgrade) {
            Some(arc) => Handle::adopt(arc),
            None => Handle::null(),
        }
    }

    pub(crate) fn same_node(&self, other: &Weak<dyn Object>) -> bool {
        self.me.get().map_or(false, |me| Weak::ptr_eq(me, other))
    }

    pub fn has_parent(&self) -> bool {
        self.inner
            .lock()
            .parent
            .as_ref()
            .map_or(false, |p| p.strong_count() > 0)
    }

    /// Returns a handle on the parent, or an empty handle.
    pub fn parent(&self) -> Handle {
        let weak = self.inner.lock().parent.clone();
        match weak.and_then(|w| w.upgrade()) {
            Some(arc) => Handle::adopt(arc),
            None => Handle::null(),
        }
    }

    /// True when `other` is somewhere above this node.
    pub fn is_child_of(&self, other: &NodeCore) -> bool {
        let mut cur = self.parent();
        while let Some(obj) = cur.get() {
            if std::ptr::eq(obj.core(), other) {
                return true;
            }
            let next = obj.core().parent();
            cur = next;
        }
        false
    }

    pub fn is_parent_of(&self, other: &NodeCore) -> bool {
        other.is_child_of(self)
    }

    /// Slash-separated item name from the top of the tree.
    pub fn path(&self) -> String {
        let mut parts = vec![self.name()];
        let mut cur = self.parent();
        while let Some(obj) = cur.get() {
            parts.push(obj.core().name());
            let next = obj.core().parent();
            cur = next;
        }
        parts.reverse();
        parts.join("/")
    }

    fn parent_is(&self, parent: &NodeCore) -> bool {
        let weak = self.inner.lock().parent.clone();
        match (weak, parent.me.get()) {
            (Some(p), Some(me)) => Weak::ptr_eq(&p, me),
            _ => false,
        }
    }

    /// Runs `f` with the child list blocked and the node unlocked.
    ///
    /// While blocked, structural changes of the child list are refused, so
    /// pointers copied out of it stay referenced by the list.
    fn with_blocked<R>(guard: &mut MutexGuard<'_, NodeInner>, f: impl FnOnce() -> R) -> R {
        guard.block += 1;
        let res = unlocked(guard, f);
        guard.block -= 1;
        res
    }

    /// Locks the node once its child list is not blocked.
    fn lock_unblocked(&self, what: &str) -> MutexGuard<'_, NodeInner> {
        let mut attempts = 0u32;
        loop {
            let inner = self.inner.lock();
            if inner.block == 0 {
                if attempts > 1000 {
                    log::warn!(
                        "{}: {what} waited {attempts} times for the child list",
                        self.name()
                    );
                }
                return inner;
            }
            let block = inner.block;
            drop(inner);
            attempts += 1;
            if attempts >= self.retries.load(Ordering::Relaxed) {
                contract_violation(&format!(
                    "{}: child list stuck with block={block} during {what}",
                    self.name()
                ));
            }
            std::thread::yield_now();
        }
    }

    /// Appends `child` to the child list. The child must not belong to
    /// another parent.
    pub fn add_child(&self, child: Handle) -> bool {
        self.insert_child(child, None)
    }

    pub fn add_child_at(&self, child: Handle, pos: usize) -> bool {
        self.insert_child(child, Some(pos))
    }

    fn insert_child(&self, child: Handle, pos: Option<usize>) -> bool {
        let Some(obj) = child.get() else {
            return false;
        };
        let Some(me) = self.me.get().cloned() else {
            contract_violation("child added to a node that was never constructed");
        };
        if std::ptr::eq(obj.core(), self) {
            contract_violation("node cannot be its own child");
        }
        let owner = self.is_owner();
        {
            let mut cinner = obj.core().inner.lock();
            if let Some(prev) = &cinner.parent {
                if prev.strong_count() > 0 && !Weak::ptr_eq(prev, &me) {
                    contract_violation("child still belongs to another parent");
                }
            }
            cinner.parent = Some(me);
            if owner {
                cinner.flags.set(NodeFlags::AUTO_DESTROY, true);
            }
        }
        let mut inner = self.lock_unblocked("add_child");
        let list = inner.children.get_or_insert_with(HandleList::new);
        match pos {
            Some(pos) => list.insert(pos, child),
            None => list.push(child),
        }
        true
    }

    /// Removes `child` from the list. When `cleanup` is set and this node
    /// owns its children, the child is destroyed rather than just released.
    pub fn remove_child(&self, child: &dyn Object, cleanup: bool) -> bool {
        if !child.core().parent_is(self) {
            return false;
        }
        let (extracted, owner) = {
            let mut inner = self.lock_unblocked("remove_child");
            let owner = inner.flags.contains(NodeFlags::OWNER_OF_CHILDREN);
            let Some(list) = inner.children.as_mut() else {
                return false;
            };
            (list.extract(child), owner)
        };
        let Some(mut extracted) = extracted else {
            // Child may have been detached concurrently by remove_children.
            return false;
        };
        {
            let mut cinner = child.core().inner.lock();
            if let (Some(p), Some(me)) = (&cinner.parent, self.me.get()) {
                if Weak::ptr_eq(p, me) {
                    cinner.parent = None;
                }
            }
        }
        if cleanup && owner {
            extracted.destroy();
        } else {
            extracted.release();
        }
        true
    }

    pub fn remove_child_at(&self, n: usize, cleanup: bool) -> bool {
        let child = self.child_ref(n);
        match child.get() {
            Some(obj) => self.remove_child(obj, cleanup),
            None => false,
        }
    }

    /// Detaches every child. Owned children are destroyed when `cleanup` is
    /// set, the rest are released.
    pub fn remove_children(&self, cleanup: bool) {
        let (list, owner) = {
            let mut inner = self.lock_unblocked("remove_children");
            let owner = inner.flags.contains(NodeFlags::OWNER_OF_CHILDREN);
            (inner.children.take(), owner)
        };
        let Some(mut list) = list else {
            return;
        };
        if self.is_logging() {
            log::debug!("{}: removing {} children", self.name(), list.len());
        }
        for child in list.iter() {
            if let Some(obj) = child.get() {
                let mut cinner = obj.core().inner.lock();
                if let Some(p) = &cinner.parent {
                    if self.same_node(p) {
                        cinner.parent = None;
                    }
                }
            }
        }
        list.clear(owner && cleanup);
    }

    /// Returns a handle on the `n`-th child, or an empty handle.
    pub fn child_ref(&self, n: usize) -> Handle {
        let mut inner = self.inner.lock();
        let arc = inner.children.as_ref().and_then(|list| list.arc_at(n));
        match arc {
            Some(arc) => Self::with_blocked(&mut inner, || Handle::adopt(arc)),
            None => Handle::null(),
        }
    }

    /// Consistent snapshot of all children, each with its own handle.
    pub fn child_refs(&self) -> HandleList {
        let mut inner = self.inner.lock();
        let arcs: Vec<Arc<dyn Object>> = match inner.children.as_ref() {
            Some(list) => (0..list.len()).filter_map(|n| list.arc_at(n)).collect(),
            None => return HandleList::new(),
        };
        Self::with_blocked(&mut inner, || {
            let mut snapshot = HandleList::with_capacity(arcs.len());
            for arc in arcs {
                snapshot.push(Handle::adopt(arc));
            }
            snapshot
        })
    }

    /// Looks up a direct child by exact name.
    pub fn child_named(&self, name: &str) -> Handle {
        self.lookup_child(name, false)
    }

    fn lookup_child(&self, name: &str, force: bool) -> Handle {
        let mut inner = self.inner.lock();
        let found = inner
            .children
            .as_ref()
            .and_then(|list| list.find(name))
            .and_then(|n| inner.children.as_ref().and_then(|list| list.arc_at(n)));
        if let Some(arc) = found {
            return Self::with_blocked(&mut inner, || Handle::adopt(arc));
        }
        if !force || inner.block > 0 {
            return Handle::null();
        }
        let Some(me) = self.me.get().cloned() else {
            return Handle::null();
        };
        let folder = Node::create(name).erase();
        if let Some(obj) = folder.get() {
            let mut cinner = obj.core().inner.lock();
            cinner.parent = Some(me);
            if inner.flags.contains(NodeFlags::OWNER_OF_CHILDREN) {
                cinner.flags.set(NodeFlags::AUTO_DESTROY, true);
            }
        }
        let result = folder.clone();
        inner
            .children
            .get_or_insert_with(HandleList::new)
            .push(folder);
        drop(inner);
        result
    }

    /// Resolves a slash-separated path relative to this node.
    ///
    /// A leading `/` starts from the top of the tree, `..` steps to the
    /// parent and `.` stays in place. Returns an empty handle when any step
    /// does not resolve.
    pub fn find_child(&self, path: &str) -> Handle {
        self.search(path, false)
    }

    /// Like [`NodeCore::find_child`], creating missing steps as plain nodes.
    pub fn find_or_create_child(&self, path: &str) -> Handle {
        self.search(path, true)
    }

    fn search(&self, path: &str, force: bool) -> Handle {
        let mut cur = self.self_handle();
        if cur.is_null() || path.is_empty() {
            return cur;
        }
        let mut rest = path;
        if rest.starts_with('/') {
            loop {
                let parent = match cur.get() {
                    Some(obj) => obj.core().parent(),
                    None => return Handle::null(),
                };
                if parent.is_null() {
                    break;
                }
                cur = parent;
            }
            rest = rest.trim_start_matches('/');
        }
        for segment in rest.split('/') {
            let next = match (segment, cur.get()) {
                (_, None) => return Handle::null(),
                ("" | ".", Some(_)) => continue,
                ("..", Some(obj)) => obj.core().parent(),
                (name, Some(obj)) => obj.core().lookup_child(name, force),
            };
            if next.is_null() {
                return next;
            }
            cur = next;
        }
        cur
    }

    fn inc_reference(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == NodeState::Destructing {
            log::error!("{}: reference requested during destruction", self.name());
            return false;
        }
        inner.refcnt += 1;
        if inner.flags.contains(NodeFlags::LOGGING) {
            log::debug!("{}: acquire -> {}", self.name(), inner.refcnt);
        }
        true
    }
}

impl Drop for NodeCore {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.state != NodeState::Destructing && inner.refcnt != 0 {
            log::error!(
                "{}: freed in state {:?} with {} references",
                self.name.get_mut(),
                inner.state,
                inner.refcnt
            );
        }
        // Children of a node freed without teardown are simply released.
        let leftover = inner.children.take();
        drop(leftover);
    }
}

impl fmt::Debug for NodeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("NodeCore")
            .field("name", &*self.name.lock())
            .field("state", &inner.state)
            .field("flags", &inner.flags)
            .field("refcnt", &inner.refcnt)
            .finish()
    }
}

enum Outcome {
    Keep,
    Destruct,
}

fn finish<T: ?Sized + Object>(obj: &T, outcome: Outcome) -> bool {
    match outcome {
        Outcome::Keep => false,
        Outcome::Destruct => {
            finalize(obj);
            true
        }
    }
}

/// The destruction state machine.
///
/// `do_decrement` drops one reference first; `from_thread` marks a call made
/// by the owner thread after [`Object::destroy_by_owner_thread`] accepted.
fn dec_reference<T: ?Sized + Object>(
    obj: &T,
    ask_to_destroy: bool,
    do_decrement: bool,
    from_thread: bool,
) -> Outcome {
    let core = obj.core();
    let via_thread;
    {
        let mut inner = core.inner.lock();
        let logging = inner.flags.contains(NodeFlags::LOGGING);

        if do_decrement {
            if inner.refcnt == 0 {
                drop(inner);
                contract_violation(&format!(
                    "{}: reference counter is already zero",
                    core.name()
                ));
            }
            inner.refcnt -= 1;
            if logging {
                log::debug!("{}: release -> {}", core.name(), inner.refcnt);
            }
        }

        match inner.state {
            NodeState::Constructing => {
                log::error!("{}: released before construction completed", core.name());
                return Outcome::Keep;
            }
            NodeState::Normal => {
                let auto = inner.flags.contains(NodeFlags::AUTO_DESTROY) && inner.refcnt == 0;
                if !(ask_to_destroy || auto) {
                    return Outcome::Keep;
                }
                via_thread = inner.flags.contains(NodeFlags::HAS_OWNER_THREAD);
            }
            NodeState::WaitingForOwnerThread => {
                if !from_thread {
                    return Outcome::Keep;
                }
                via_thread = false;
            }
            NodeState::TearingDown | NodeState::Destructing => return Outcome::Keep,
            NodeState::WaitingForFinalRelease => {
                if inner.refcnt > 0 || obj.intercept_delete() {
                    return Outcome::Keep;
                }
                inner.state = NodeState::Destructing;
                return Outcome::Destruct;
            }
        }

        if via_thread {
            inner.state = NodeState::WaitingForOwnerThread;
            inner.refcnt += 1;
        } else {
            inner.state = NodeState::TearingDown;
        }
        if logging {
            log::debug!("{}: teardown started, state {:?}", core.name(), inner.state);
        }
    }

    if via_thread {
        if obj.destroy_by_owner_thread() {
            return Outcome::Keep;
        }
        let mut inner = core.inner.lock();
        inner.state = NodeState::TearingDown;
        inner.refcnt -= 1;
    }

    teardown(obj);

    let reaper = {
        let mut inner = core.inner.lock();
        let reaper = if inner.flags.contains(NodeFlags::NEEDS_CLEANUP) {
            inner.reaper.take()
        } else {
            None
        };
        match reaper {
            Some(reaper) => {
                inner.refcnt += 1;
                inner.state = NodeState::WaitingForFinalRelease;
                reaper
            }
            None => {
                inner.state = NodeState::WaitingForFinalRelease;
                if inner.refcnt > 0 || obj.intercept_delete() {
                    return Outcome::Keep;
                }
                inner.state = NodeState::Destructing;
                return Outcome::Destruct;
            }
        }
    };

    match core.me.get().and_then(Weak::upgrade) {
        Some(arc) => reaper.reap(Handle::from_claim(arc)),
        None => {
            log::error!("{}: reaper set on a node without storage", core.name());
            core.inner.lock().refcnt -= 1;
        }
    }
    Outcome::Keep
}

/// Releases everything the node holds: hook first, then children, then the
/// parent's reference on it.
fn teardown<T: ?Sized + Object>(obj: &T) {
    let core = obj.core();
    obj.object_cleanup();
    core.remove_children(true);

    let parent = core.parent();
    if let Some(p) = parent.get() {
        if let Some(me) = core.me.get().and_then(Weak::upgrade) {
            p.core().remove_child(&*me, false);
        }
    }
    core.inner.lock().parent = None;

    if core.is_logging() {
        log::debug!(
            "{}: cleanup done, {} references left",
            core.name(),
            core.num_references()
        );
    }
}

fn finalize<T: ?Sized + Object>(obj: &T) {
    let core = obj.core();
    let leftover = {
        let mut inner = core.inner.lock();
        if inner.block > 0 {
            log::error!("{}: destructed while child list is blocked", core.name());
        }
        inner.parent = None;
        inner.reaper = None;
        inner.children.take()
    };
    if let Some(list) = leftover {
        if !list.is_empty() {
            log::error!("{}: {} children survived teardown", core.name(), list.len());
        }
        drop(list);
    }
    if core.is_logging() {
        log::debug!("{}: destructed", core.name());
    }
}

/// Matches `name` against a mask with `*` (any run) and `?` (any char).
pub fn name_matches(mask: &str, name: &str) -> bool {
    if mask.is_empty() {
        return name.is_empty();
    }
    if !mask.contains(['*', '?']) {
        return mask == name;
    }
    let m: Vec<char> = mask.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut mi, mut ni) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if mi < m.len() && (m[mi] == '?' || m[mi] == n[ni]) {
            mi += 1;
            ni += 1;
        } else if mi < m.len() && m[mi] == '*' {
            star = Some((mi, ni));
            mi += 1;
        } else if let Some((smi, sni)) = star {
            mi = smi + 1;
            ni = sni + 1;
            star = Some((smi, sni + 1));
        } else {
            return false;
        }
    }
    m[mi..].iter().all(|c| *c == '*')
}

/// Plain named node used for folders and tests.
pub struct Node {
    core: NodeCore,
}

impl Node {
    pub fn create(name: impl Into<String>) -> Handle<Node> {
        Handle::new(Node {
            core: NodeCore::new(name),
        })
    }

    pub fn with_flags(name: impl Into<String>, flags: NodeFlags) -> Handle<Node> {
        Handle::new(Node {
            core: NodeCore::with_flags(name, flags),
        })
    }

    /// Creates a node and attaches it under `parent`.
    pub fn create_in<P: ?Sized + Object>(parent: &Handle<P>, name: impl Into<String>) -> Handle<Node> {
        let node = Self::create(name);
        if let Some(p) = parent.get() {
            p.core().add_child(node.clone().erase());
        }
        node
    }
}

impl Object for Node {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn class_name(&self) -> &'static str {
        "Node"
    }
}
