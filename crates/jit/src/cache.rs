use quadjit_core::Fingerprint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

type Slot<R> = Arc<Mutex<Option<Arc<R>>>>;

/// Compiled routines keyed by pipeline fingerprint.
///
/// Lookups are byte-wise fingerprint equality. At most one compile is in
/// flight per fingerprint: the per-slot lock is held for the duration of the
/// build, so concurrent requests for the same state wait for the first
/// winner instead of compiling twice. Routines are handed out as `Arc`s;
/// replacing or invalidating an entry never frees code an in-flight
/// execution still holds.
pub struct RoutineCache<R> {
    slots: Mutex<HashMap<Fingerprint, Slot<R>>>,
}

impl<R> RoutineCache<R> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<R>> {
        let slot = self.slots.lock().unwrap().get(fingerprint)?.clone();
        let guard = slot.lock().unwrap();
        guard.clone()
    }

    /// Returns the cached routine for `fingerprint`, building and installing
    /// it if missing. A failed build leaves the slot empty.
    pub fn get_or_compile<E>(
        &self,
        fingerprint: Fingerprint,
        build: impl FnOnce() -> Result<R, E>,
    ) -> Result<Arc<R>, E> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(fingerprint).or_default().clone()
        };

        let mut guard = slot.lock().unwrap();
        if let Some(routine) = guard.as_ref() {
            return Ok(routine.clone());
        }

        debug!(?fingerprint, "compiling routine");
        let routine = Arc::new(build()?);
        *guard = Some(routine.clone());
        Ok(routine)
    }

    /// Installs a routine for `fingerprint`, superseding any previous one.
    /// The old routine is destroyed once its last holder drops it.
    pub fn replace(&self, fingerprint: Fingerprint, routine: R) -> Arc<R> {
        let slot = {
            let mut slots = self.slots.lock().unwrap();
            slots.entry(fingerprint).or_default().clone()
        };
        let routine = Arc::new(routine);
        *slot.lock().unwrap() = Some(routine.clone());
        routine
    }

    pub fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        self.slots.lock().unwrap().remove(fingerprint).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<R> Default for RoutineCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// The compile-on-state-change pattern: one live routine for the most recent
/// fingerprint, rebuilt only when the fingerprint stops matching.
pub struct BoundRoutine<R> {
    key: Option<Fingerprint>,
    routine: Option<Arc<R>>,
}

impl<R> BoundRoutine<R> {
    pub fn new() -> Self {
        Self {
            key: None,
            routine: None,
        }
    }

    /// Returns the routine for `fingerprint`, recompiling if the pipeline
    /// state changed since the last call. The superseded routine is dropped
    /// here; executions holding their own `Arc` finish undisturbed.
    pub fn bind<E>(
        &mut self,
        fingerprint: Fingerprint,
        build: impl FnOnce() -> Result<R, E>,
    ) -> Result<&Arc<R>, E> {
        if self.key != Some(fingerprint) {
            debug!(?fingerprint, "pipeline state changed, recompiling");
            let routine = Arc::new(build()?);
            self.key = Some(fingerprint);
            self.routine = Some(routine);
        }
        Ok(self.routine.as_ref().expect("routine bound"))
    }

    pub fn get(&self) -> Option<&Arc<R>> {
        self.routine.as_ref()
    }

    pub fn reset(&mut self) {
        self.key = None;
        self.routine = None;
    }
}

impl<R> Default for BoundRoutine<R> {
    fn default() -> Self {
        Self::new()
    }
}
