//! Liveness registry
//!
//! Correlates host wrappers with the engine handles they keep rooted. The
//! engine collector cannot see host reference counts and the host cannot see
//! engine roots, so this table is the only place with both views.
//!
//! Each entry holds exactly one strong reference to its wrapper. A wrapper
//! whose `ref_count()` is 1 at sweep time is therefore referenced by nothing
//! but the registry. Handles carry an edge count so a handle shared by several
//! wrappers is released only once every referencing entry has been pruned.
//!
//! The engine instance is swept from a GC prologue callback. If that callback
//! lands while the table is borrowed, the sweep is deferred to the next
//! registry access.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::c_void;

use deno_core::v8;
use tandem_runtime::HostValue;

/// Identifier of a rooted engine handle. Never reused.
pub type HandleId = u64;

struct HandleSlot<H> {
    handle: H,
    edges: usize,
}

struct Entry {
    wrapper: HostValue,
    handles: Vec<HandleId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub wrappers_pruned: usize,
    pub handles_released: usize,
}

/// What a sweep removed. Dropping it releases the handles and the registry's
/// references to the pruned wrappers.
pub struct Swept<H> {
    pub wrappers: Vec<HostValue>,
    pub handles: Vec<H>,
}

impl<H> Swept<H> {
    pub fn outcome(&self) -> SweepOutcome {
        SweepOutcome {
            wrappers_pruned: self.wrappers.len(),
            handles_released: self.handles.len(),
        }
    }
}

pub struct LivenessRegistry<H> {
    handles: HashMap<HandleId, HandleSlot<H>>,
    /// Keyed by wrapper address; stable because the entry keeps the wrapper alive
    entries: HashMap<usize, Entry>,
    next_id: HandleId,
}

impl<H> LivenessRegistry<H> {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    /// Root `handle` and register it on the wrapper built by `make_wrapper`,
    /// which receives the new handle's id.
    pub fn root_with<F>(&mut self, handle: H, make_wrapper: F) -> HostValue
    where
        F: FnOnce(HandleId) -> HostValue,
    {
        let id = self.insert_handle(handle);
        let wrapper = make_wrapper(id);
        self.link(&wrapper, id);
        wrapper
    }

    /// Root `handle` on behalf of an existing wrapper.
    pub fn root(&mut self, wrapper: &HostValue, handle: H) -> HandleId {
        let id = self.insert_handle(handle);
        self.link(wrapper, id);
        id
    }

    /// Add an already rooted handle to the wrapper's handle set. Idempotent.
    ///
    /// Returns `false` if the handle has already been released.
    pub fn register(&mut self, wrapper: &HostValue, id: HandleId) -> bool {
        if !self.handles.contains_key(&id) {
            return false;
        }
        self.link(wrapper, id);
        true
    }

    pub fn get(&self, id: HandleId) -> Option<&H> {
        self.handles.get(&id).map(|slot| &slot.handle)
    }

    pub fn contains_handle(&self, id: HandleId) -> bool {
        self.handles.contains_key(&id)
    }

    pub fn is_registered(&self, wrapper: &HostValue) -> bool {
        self.entries.contains_key(&wrapper.addr())
    }

    /// Number of wrapper entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Prune every entry whose wrapper is referenced only by the registry.
    pub fn sweep(&mut self) -> Swept<H> {
        let unreferenced: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.wrapper.ref_count() == 1)
            .map(|(addr, _)| *addr)
            .collect();

        let mut swept = Swept {
            wrappers: Vec::with_capacity(unreferenced.len()),
            handles: Vec::new(),
        };
        for addr in unreferenced {
            let Some(entry) = self.entries.remove(&addr) else {
                continue;
            };
            for id in &entry.handles {
                let released = match self.handles.get_mut(id) {
                    Some(slot) => {
                        slot.edges -= 1;
                        slot.edges == 0
                    }
                    None => false,
                };
                if released {
                    if let Some(slot) = self.handles.remove(id) {
                        swept.handles.push(slot.handle);
                    }
                }
            }
            swept.wrappers.push(entry.wrapper);
        }
        swept
    }

    /// Drop every entry and handle regardless of liveness.
    pub fn clear(&mut self) -> Swept<H> {
        Swept {
            wrappers: self.entries.drain().map(|(_, e)| e.wrapper).collect(),
            handles: self.handles.drain().map(|(_, s)| s.handle).collect(),
        }
    }

    fn insert_handle(&mut self, handle: H) -> HandleId {
        let id = self.next_id;
        self.next_id += 1;
        self.handles.insert(id, HandleSlot { handle, edges: 0 });
        id
    }

    fn link(&mut self, wrapper: &HostValue, id: HandleId) {
        let entry = self.entries.entry(wrapper.addr()).or_insert_with(|| Entry {
            wrapper: wrapper.clone(),
            handles: Vec::new(),
        });
        if entry.handles.contains(&id) {
            return;
        }
        entry.handles.push(id);
        if let Some(slot) = self.handles.get_mut(&id) {
            slot.edges += 1;
        }
    }
}

impl<H> Default for LivenessRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Engine instance
// ---------------------------------------------------------------------------

pub type EngineRegistry = LivenessRegistry<v8::Global<v8::Value>>;

thread_local! {
    static REGISTRY: RefCell<EngineRegistry> = RefCell::new(LivenessRegistry::new());
    static SWEEP_PENDING: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub entries: usize,
    pub handles: usize,
}

/// Run `f` against this thread's registry, honouring a deferred sweep first.
pub(crate) fn with_registry<F, R>(f: F) -> R
where
    F: FnOnce(&mut EngineRegistry) -> R,
{
    let (result, deferred) = REGISTRY.with(|cell| {
        let mut registry = cell.borrow_mut();
        let deferred = SWEEP_PENDING.with(|p| p.replace(false)).then(|| registry.sweep());
        (f(&mut registry), deferred)
    });
    if let Some(swept) = deferred {
        finish_sweep(swept);
    }
    result
}

/// Open a rooted handle in `scope`.
pub(crate) fn local<'s>(
    scope: &mut v8::HandleScope<'s>,
    id: HandleId,
) -> Option<v8::Local<'s, v8::Value>> {
    with_registry(|registry| registry.get(id).map(|global| v8::Local::new(scope, global)))
}

/// Sweep this thread's registry now.
pub fn sweep() -> SweepOutcome {
    SWEEP_PENDING.with(|p| p.set(false));
    let swept = REGISTRY.with(|cell| cell.borrow_mut().sweep());
    finish_sweep(swept)
}

pub fn registry_stats() -> RegistryStats {
    REGISTRY.with(|cell| {
        let registry = cell.borrow();
        RegistryStats {
            entries: registry.len(),
            handles: registry.handle_count(),
        }
    })
}

pub(crate) fn clear() {
    let swept = REGISTRY.with(|cell| cell.borrow_mut().clear());
    SWEEP_PENDING.with(|p| p.set(false));
    log::debug!(
        "Liveness registry cleared: {} wrapper(s), {} handle(s)",
        swept.wrappers.len(),
        swept.handles.len()
    );
}

fn finish_sweep(swept: Swept<v8::Global<v8::Value>>) -> SweepOutcome {
    let outcome = swept.outcome();
    drop(swept);
    let shims = crate::objects::purge_released_functions();
    if outcome.wrappers_pruned > 0 || shims > 0 {
        log::debug!(
            "Registry sweep: {} wrapper(s) pruned, {} handle(s) released, {} host function shim(s) purged",
            outcome.wrappers_pruned,
            outcome.handles_released,
            shims
        );
    }
    outcome
}

/// Registered on the isolate for every GC type.
pub(crate) extern "C" fn gc_prologue(
    _isolate: *mut v8::Isolate,
    _gc_type: v8::GCType,
    _flags: v8::GCCallbackFlags,
    _data: *mut c_void,
) {
    sweep_or_defer();
}

/// Sweep now if the table is free, otherwise leave the sweep to the next
/// `with_registry`.
fn sweep_or_defer() {
    let swept = REGISTRY
        .try_with(|cell| cell.try_borrow_mut().ok().map(|mut registry| registry.sweep()))
        .ok()
        .flatten();
    match swept {
        Some(swept) => {
            finish_sweep(swept);
        }
        None => {
            let _ = SWEEP_PENDING.try_with(|p| p.set(true));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    /// Counts how many handles have been released.
    struct Tracked(Rc<Cell<usize>>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    #[test]
    fn test_sweep_prunes_unreferenced_wrappers() {
        let released = Rc::new(Cell::new(0));
        let mut registry = LivenessRegistry::new();

        let kept = registry.root_with(Tracked(released.clone()), |_| HostValue::list(vec![]));
        let dropped = registry.root_with(Tracked(released.clone()), |_| HostValue::list(vec![]));
        assert_eq!(registry.len(), 2);
        assert_eq!(kept.ref_count(), 2);

        drop(dropped);
        let swept = registry.sweep();
        assert_eq!(
            swept.outcome(),
            SweepOutcome {
                wrappers_pruned: 1,
                handles_released: 1
            }
        );
        drop(swept);
        assert_eq!(released.get(), 1);
        assert!(registry.is_registered(&kept));
        assert_eq!(registry.handle_count(), 1);

        // A second sweep with nothing new to prune is a no-op
        assert_eq!(registry.sweep().outcome(), SweepOutcome::default());
    }

    #[test]
    fn test_shared_handle_outlives_first_wrapper() {
        let released = Rc::new(Cell::new(0));
        let mut registry = LivenessRegistry::new();

        let mut shared = 0;
        let a = registry.root_with(Tracked(released.clone()), |id| {
            shared = id;
            HostValue::list(vec![])
        });
        let b = HostValue::list(vec![]);
        assert!(registry.register(&b, shared));
        // Registering again does not add a second edge
        assert!(registry.register(&b, shared));

        drop(a);
        drop(registry.sweep());
        assert_eq!(released.get(), 0);
        assert!(registry.get(shared).is_some());

        drop(b);
        drop(registry.sweep());
        assert_eq!(released.get(), 1);
        assert!(!registry.contains_handle(shared));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_released_handle_fails() {
        let mut registry: LivenessRegistry<u32> = LivenessRegistry::new();
        let w = HostValue::list(vec![]);
        let id = registry.root(&w, 7);
        drop(w);
        drop(registry.sweep());
        let other = HostValue::list(vec![]);
        assert!(!registry.register(&other, id));
        assert!(!registry.is_registered(&other));
    }

    #[test]
    fn test_one_counted_reference_per_entry() {
        let mut registry: LivenessRegistry<u32> = LivenessRegistry::new();
        let w = HostValue::list(vec![]);
        registry.root(&w, 1);
        registry.root(&w, 2);
        assert_eq!(registry.len(), 1);
        assert_eq!(w.ref_count(), 2);

        let swept = registry.clear();
        assert_eq!(swept.handles.len(), 2);
        drop(swept);
        assert_eq!(w.ref_count(), 1);
    }

    fn setup() {
        let _ = env_logger::builder().is_test(true).try_init();
        crate::js_runtime_init(crate::RuntimeConfig::default(), None).unwrap();
    }

    #[test]
    fn test_engine_collection_sweeps_registry() {
        setup();
        let before = registry_stats();
        let object = crate::js_eval("({ answer: 42 })").unwrap();
        assert_eq!(registry_stats().entries, before.entries + 1);

        drop(object);
        // No explicit sweep: the GC prologue does it
        crate::with_runtime(|state| state.runtime.v8_isolate().low_memory_notification())
            .unwrap();
        assert_eq!(registry_stats(), before);
        crate::js_runtime_shutdown();
    }

    #[test]
    fn test_sweep_deferred_while_registry_borrowed() {
        setup();
        let before = registry_stats().entries;
        let object = crate::js_eval("({})").unwrap();
        drop(object);

        REGISTRY.with(|cell| {
            let _held = cell.borrow();
            sweep_or_defer();
        });
        assert!(SWEEP_PENDING.with(Cell::get));
        assert_eq!(registry_stats().entries, before + 1);

        // The next registry access runs the deferred sweep first
        assert_eq!(with_registry(|registry| registry.len()), before);
        assert!(!SWEEP_PENDING.with(Cell::get));
        crate::js_runtime_shutdown();
    }
}
