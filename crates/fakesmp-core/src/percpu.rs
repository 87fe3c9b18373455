//! Per-CPU storage.
//!
//! Stands in for the kernel's `DEFINE_PER_CPU` sections: one element per CPU
//! slot, addressed by slot rather than by calling thread. The accessor does no
//! synchronization. Element `i` belongs to whichever thread holds slot `i`,
//! and touching it from elsewhere is the client's bug, exactly as with real
//! per-CPU data.
//!
//! [`PerCpuArena`] is the explicit `(variable, slot) -> storage` table used by
//! a machine to declare its variables by name.

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cpu::CpuSlot;
use crate::error::PerCpuError;

/// One `T` per CPU slot.
pub struct PerCpu<T> {
    cells: Box<[UnsafeCell<T>]>,
}

// SAFETY: elements are only handed out as `&mut T` through the unsafe
// `storage_for`, whose contract makes the caller responsible for exclusive
// access, or through `&mut self`. Shared `&T` access needs `T: Sync`.
unsafe impl<T: Send> Send for PerCpu<T> {}
unsafe impl<T: Send> Sync for PerCpu<T> {}

impl<T> PerCpu<T> {
    /// Build `nr_cpus` elements with `init(slot)`.
    pub fn new(nr_cpus: usize, mut init: impl FnMut(CpuSlot) -> T) -> Self {
        Self {
            cells: (0..nr_cpus)
                .map(|i| UnsafeCell::new(init(CpuSlot::new(i))))
                .collect(),
        }
    }

    /// Build `nr_cpus` default elements.
    pub fn with_default(nr_cpus: usize) -> Self
    where
        T: Default,
    {
        Self::new(nr_cpus, |_| T::default())
    }

    /// Number of elements.
    #[must_use]
    pub fn nr_cpus(&self) -> usize {
        self.cells.len()
    }

    /// `per_cpu_ptr(var, cpu)`: unsynchronized mutable access to `slot`'s element.
    ///
    /// # Safety
    ///
    /// The caller must hold `slot` (or otherwise guarantee exclusive access)
    /// for the lifetime of the returned reference: no other reference to the
    /// same element, from [`Self::get`] or another `storage_for`, may exist.
    ///
    /// # Panics
    ///
    /// When `slot` is not below [`Self::nr_cpus`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn storage_for(&self, slot: CpuSlot) -> &mut T {
        // SAFETY: exclusivity is the caller's obligation (see above).
        unsafe { &mut *self.cells[slot.index()].get() }
    }

    /// Shared access to `slot`'s element, for payloads that synchronize
    /// themselves (atomic cells).
    ///
    /// # Panics
    ///
    /// When `slot` is not below [`Self::nr_cpus`].
    #[must_use]
    pub fn get(&self, slot: CpuSlot) -> &T
    where
        T: Sync,
    {
        // SAFETY: `storage_for` callers promise no `&mut` coexists with this.
        unsafe { &*self.cells[slot.index()].get() }
    }

    /// Exclusive access through an exclusive borrow. Panics like [`Self::get`].
    pub fn get_mut(&mut self, slot: CpuSlot) -> &mut T {
        self.cells[slot.index()].get_mut()
    }

    /// Every element with its slot, through an exclusive borrow.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (CpuSlot, &mut T)> {
        self.cells
            .iter_mut()
            .enumerate()
            .map(|(i, cell)| (CpuSlot::new(i), cell.get_mut()))
    }

    /// Every element with its slot, for self-synchronizing payloads.
    pub fn iter(&self) -> impl Iterator<Item = (CpuSlot, &T)>
    where
        T: Sync,
    {
        (0..self.cells.len()).map(|i| {
            let slot = CpuSlot::new(i);
            (slot, self.get(slot))
        })
    }
}

impl<T: fmt::Debug + Sync> fmt::Debug for PerCpu<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Typed handle to a variable declared in a [`PerCpuArena`].
pub struct PerCpuId<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PerCpuId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PerCpuId<T> {}

impl<T> fmt::Debug for PerCpuId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PerCpuId").field(&self.index).finish()
    }
}

struct Entry {
    name: String,
    var: Arc<dyn Any + Send + Sync>,
}

/// `(variable, slot) -> storage` table of one machine.
pub struct PerCpuArena {
    nr_cpus: usize,
    vars: RwLock<Vec<Entry>>,
}

impl fmt::Debug for PerCpuArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerCpuArena")
            .field("nr_cpus", &self.nr_cpus)
            .field("vars", &self.names())
            .finish()
    }
}

impl PerCpuArena {
    #[must_use]
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            vars: RwLock::new(Vec::new()),
        }
    }

    /// `DEFINE_PER_CPU(T, name)` with default-initialized elements.
    pub fn define<T>(&self, name: &str) -> Result<PerCpuId<T>, PerCpuError>
    where
        T: Default + Send + 'static,
    {
        self.define_with(name, |_| T::default())
    }

    /// `DEFINE_PER_CPU(T, name)` with `init(slot)` per element.
    pub fn define_with<T>(
        &self,
        name: &str,
        init: impl FnMut(CpuSlot) -> T,
    ) -> Result<PerCpuId<T>, PerCpuError>
    where
        T: Send + 'static,
    {
        let mut vars = self.vars.write();
        if vars.iter().any(|entry| entry.name == name) {
            return Err(PerCpuError::Duplicate(name.to_string()));
        }
        let var: Arc<dyn Any + Send + Sync> = Arc::new(PerCpu::new(self.nr_cpus, init));
        vars.push(Entry {
            name: name.to_string(),
            var,
        });
        tracing::debug!(name, nr_cpus = self.nr_cpus, "defined per-CPU variable");
        Ok(PerCpuId {
            index: vars.len() - 1,
            _marker: PhantomData,
        })
    }

    /// `DECLARE_PER_CPU(T, name)`: typed handle to an existing variable.
    pub fn lookup<T>(&self, name: &str) -> Result<PerCpuId<T>, PerCpuError>
    where
        T: Send + 'static,
    {
        let vars = self.vars.read();
        let index = vars
            .iter()
            .position(|entry| entry.name == name)
            .ok_or_else(|| PerCpuError::Unknown(name.to_string()))?;
        if !vars[index].var.is::<PerCpu<T>>() {
            return Err(PerCpuError::TypeMismatch(name.to_string()));
        }
        Ok(PerCpuId {
            index,
            _marker: PhantomData,
        })
    }

    /// The storage array behind `id`.
    pub fn var<T>(&self, id: PerCpuId<T>) -> Result<Arc<PerCpu<T>>, PerCpuError>
    where
        T: Send + 'static,
    {
        let vars = self.vars.read();
        let entry = vars
            .get(id.index)
            .ok_or_else(|| PerCpuError::Unknown(format!("#{}", id.index)))?;
        Arc::clone(&entry.var)
            .downcast::<PerCpu<T>>()
            .map_err(|_| PerCpuError::TypeMismatch(entry.name.clone()))
    }

    /// Run `f` on the element of `id` owned by `slot`. A slot outside the
    /// arena's pool is an error, not a panic.
    ///
    /// # Safety
    ///
    /// Same contract as [`PerCpu::storage_for`]: the caller holds `slot` or
    /// otherwise guarantees exclusive access to that element.
    pub unsafe fn with_storage<T, R>(
        &self,
        id: PerCpuId<T>,
        slot: CpuSlot,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, PerCpuError>
    where
        T: Send + 'static,
    {
        let var = self.var(id)?;
        if slot.index() >= var.nr_cpus() {
            return Err(PerCpuError::SlotOutOfRange {
                slot: slot.index(),
                nr_cpus: var.nr_cpus(),
            });
        }
        // SAFETY: forwarded to the caller.
        Ok(f(unsafe { var.storage_for(slot) }))
    }

    /// Declared variable names, in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.vars.read().iter().map(|e| e.name.clone()).collect()
    }

    /// Number of declared variables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.vars.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
