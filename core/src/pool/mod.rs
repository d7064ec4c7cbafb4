//! Slotted object pool - fixed-capacity entity storage with used/free lists
//! and deferred activation/termination while a loop scope is open.

use std::fmt;

mod index_list;
mod loop_scope;

pub use index_list::IndexList;
pub use loop_scope::LoopScope;

/// Index of a slot in an [`ObjectPool`].
///
/// "No slot" is spelled `Option<Handle>::None`; there is no sentinel value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(usize);

impl Handle {
    pub const fn new(index: usize) -> Self {
        Handle(index)
    }

    pub const fn index(self) -> usize {
        self.0
    }

    /// Handles travel as `u16` on the wire.
    pub fn from_wire(value: u16) -> Self {
        Handle(value as usize)
    }

    pub fn to_wire(self) -> Option<u16> {
        u16::try_from(self.0).ok()
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Payload stored in a pool slot.
///
/// `construct` runs right after a slot is claimed, `destruct` right before the
/// slot is reset to `Default` and handed back to the free list.
pub trait PoolObject: Default {
    fn construct(&mut self, _handle: Handle) {}
    fn destruct(&mut self, _handle: Handle) {}
}

/// Which index list a slot currently sits in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Membership {
    /// Neither list. Only valid while a slot is being built or torn down.
    #[default]
    Detached,
    Used,
    Free,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Activity {
    #[default]
    Off,
    /// Activation requested inside a loop scope, applied at flush.
    PendingActivation,
    On,
}

/// Lifecycle bookkeeping of one slot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SlotState {
    pub allocated: bool,
    pub activity: Activity,
    pub terminate_requested: bool,
    pub membership: Membership,
}

impl SlotState {
    pub fn is_on(&self) -> bool {
        self.activity == Activity::On
    }

    pub fn turn_me_on(&self) -> bool {
        self.activity == Activity::PendingActivation
    }

    pub fn in_used_list(&self) -> bool {
        self.membership == Membership::Used
    }

    pub fn in_free_list(&self) -> bool {
        self.membership == Membership::Free
    }

    /// Allocated and not waiting to be terminated.
    pub fn is_defined(&self) -> bool {
        self.allocated && !self.terminate_requested
    }

    /// Live in the simulation: allocated, on, and not waiting to be terminated.
    pub fn is_in_game(&self) -> bool {
        self.is_defined() && self.is_on()
    }
}

struct Slot<T> {
    state: SlotState,
    object: T,
}

/// Fixed-capacity pool of `T` addressed by [`Handle`].
///
/// Every slot index lives in exactly one of the used list (on in the
/// simulation) and the free list (available), except while it is between
/// allocation and activation. List membership may go stale between ticks;
/// [`ObjectPool::reconcile`] repairs it.
pub struct ObjectPool<T: PoolObject> {
    name: &'static str,
    slots: Vec<Slot<T>>,
    used: IndexList,
    free: IndexList,
    loop_depth: usize,
    activation_queue: Vec<Handle>,
    termination_queue: Vec<Handle>,
}

impl<T: PoolObject> ObjectPool<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            state: SlotState::default(),
            object: T::default(),
        });

        let mut pool = ObjectPool {
            name,
            slots,
            used: IndexList::new(capacity),
            free: IndexList::new(capacity),
            loop_depth: 0,
            activation_queue: Vec::with_capacity(capacity),
            termination_queue: Vec::with_capacity(capacity),
        };

        // Stack order: slot 0 is handed out first.
        for index in (0..capacity).rev() {
            pool.add_to_free(Handle(index));
        }

        pool
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn used_count(&self) -> usize {
        self.used.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn loop_depth(&self) -> usize {
        self.loop_depth
    }

    pub fn pending_activations(&self) -> usize {
        self.activation_queue.len()
    }

    pub fn pending_terminations(&self) -> usize {
        self.termination_queue.len()
    }

    pub fn is_valid(&self, handle: Handle) -> bool {
        handle.0 < self.slots.len()
    }

    /// Converts a raw index, rejecting anything outside the pool.
    pub fn handle(&self, index: usize) -> Option<Handle> {
        (index < self.slots.len()).then_some(Handle(index))
    }

    pub fn state(&self, handle: Handle) -> Option<&SlotState> {
        self.slots.get(handle.0).map(|slot| &slot.state)
    }

    pub fn is_allocated(&self, handle: Handle) -> bool {
        self.state(handle).is_some_and(|state| state.allocated)
    }

    pub fn is_in_game(&self, handle: Handle) -> bool {
        self.state(handle).is_some_and(SlotState::is_in_game)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.0)
            .filter(|slot| slot.state.allocated)
            .map(|slot| &slot.object)
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.0)
            .filter(|slot| slot.state.allocated)
            .map(|slot| &mut slot.object)
    }

    /// Handles currently in the used list, in list order.
    pub fn used_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.used.iter()
    }

    pub fn free_handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.free.iter()
    }

    /// Opens a loop scope over the used list. See [`LoopScope`].
    pub fn begin_loop(&mut self) -> LoopScope<'_, T> {
        LoopScope::new(self)
    }

    /// Runs `f` for every in-game slot inside a loop scope.
    pub fn for_each_in_game<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut ObjectPool<T>, Handle),
    {
        let mut scope = self.begin_loop();
        while let Some(handle) = scope.next_in_game() {
            f(&mut scope, handle);
        }
    }

    /// Claims a slot and constructs a fresh `T` in it.
    ///
    /// A valid `preferred` slot is granted exactly; if something already
    /// occupies it, that occupant is destroyed first. Otherwise the most
    /// recently freed slot is reused. Returns `None` when the pool is full.
    ///
    /// The new slot is allocated but off; see [`ObjectPool::activate`].
    pub fn allocate(&mut self, preferred: Option<Handle>) -> Option<Handle> {
        let handle = match preferred.filter(|handle| self.is_valid(*handle)) {
            Some(handle) => {
                if self.slots[handle.0].state.allocated {
                    log::debug!("{}: replacing occupant of slot {}", self.name, handle);
                    self.destroy_now(handle);
                }
                self.detach(handle);
                handle
            }
            None => {
                if let Some(handle) = preferred {
                    log::warn!(
                        "{}: preferred slot {} is out of range, using any free slot",
                        self.name,
                        handle
                    );
                }
                match self.free.pop() {
                    Some(handle) => {
                        self.slots[handle.0].state.membership = Membership::Detached;
                        handle
                    }
                    None => {
                        log::warn!(
                            "{}: no free slots left (capacity {})",
                            self.name,
                            self.capacity()
                        );
                        return None;
                    }
                }
            }
        };

        let slot = &mut self.slots[handle.0];
        slot.state = SlotState {
            allocated: true,
            ..SlotState::default()
        };
        slot.object = T::default();
        slot.object.construct(handle);

        Some(handle)
    }

    /// Turns an allocated slot on. Queued while a loop scope is open.
    pub fn activate(&mut self, handle: Handle) -> bool {
        if !self.is_allocated(handle) {
            return false;
        }

        match self.slots[handle.0].state.activity {
            Activity::On | Activity::PendingActivation => return true,
            Activity::Off => {}
        }

        if self.loop_depth > 0 {
            if self.activation_queue.len() >= self.capacity() {
                log::warn!("{}: activation queue is full, dropping {}", self.name, handle);
                return false;
            }
            self.activation_queue.push(handle);
            self.slots[handle.0].state.activity = Activity::PendingActivation;
            return true;
        }

        self.slots[handle.0].state.activity = Activity::On;
        if !self.slots[handle.0].state.in_used_list() {
            self.add_to_used(handle);
        }
        true
    }

    /// [`ObjectPool::allocate`] followed by [`ObjectPool::activate`].
    pub fn spawn(&mut self, preferred: Option<Handle>) -> Option<Handle> {
        let handle = self.allocate(preferred)?;
        self.activate(handle);
        Some(handle)
    }

    /// Frees a slot. Returns `false` if it was not allocated.
    ///
    /// While a loop scope is open the slot is only marked and queued; the
    /// outermost scope frees it when it closes. Asking twice in the same loop
    /// returns `false` the second time.
    pub fn release(&mut self, handle: Handle) -> bool {
        if !self.is_allocated(handle) {
            return false;
        }

        if self.loop_depth > 0 {
            if self.slots[handle.0].state.terminate_requested {
                return false;
            }
            if self.termination_queue.len() >= self.capacity() {
                log::warn!("{}: termination queue is full, dropping {}", self.name, handle);
                return false;
            }
            self.termination_queue.push(handle);
            self.slots[handle.0].state.terminate_requested = true;
            return true;
        }

        self.destroy_now(handle);
        if !self.slots[handle.0].state.in_free_list() {
            self.add_to_free(handle);
        }
        true
    }

    pub fn query_used_index(&self, handle: Handle) -> Option<usize> {
        self.used.find(handle)
    }

    pub fn query_free_index(&self, handle: Handle) -> Option<usize> {
        self.free.find(handle)
    }

    /// Puts `handle` in the used list, pulling it out of the free list if needed.
    pub fn add_to_used(&mut self, handle: Handle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        if self.slots[handle.0].state.in_used_list() || self.used.find(handle).is_some() {
            log::warn!("{}: {} is already in the used list", self.name, handle);
            return false;
        }
        if self.used.is_full() {
            log::warn!("{}: used list is full", self.name);
            return false;
        }
        if let Some(index) = self.free.find(handle) {
            self.remove_free_index(index);
        }

        self.used.push(handle);
        self.slots[handle.0].state.membership = Membership::Used;
        true
    }

    /// Puts an unallocated `handle` in the free list, pulling it out of the used list if needed.
    pub fn add_to_free(&mut self, handle: Handle) -> bool {
        if !self.is_valid(handle) {
            return false;
        }
        if self.slots[handle.0].state.allocated {
            log::warn!("{}: refusing to free-list allocated slot {}", self.name, handle);
            return false;
        }
        if self.slots[handle.0].state.in_free_list() || self.free.find(handle).is_some() {
            log::warn!("{}: {} is already in the free list", self.name, handle);
            return false;
        }
        if self.free.is_full() {
            log::warn!("{}: free list is full", self.name);
            return false;
        }
        if let Some(index) = self.used.find(handle) {
            self.remove_used_index(index);
        }

        self.free.push(handle);
        self.slots[handle.0].state.membership = Membership::Free;
        true
    }

    pub fn remove_used_index(&mut self, index: usize) -> bool {
        match self.used.swap_remove(index) {
            Some(handle) => {
                self.slots[handle.0].state.membership = Membership::Detached;
                true
            }
            None => false,
        }
    }

    pub fn remove_free_index(&mut self, index: usize) -> bool {
        match self.free.swap_remove(index) {
            Some(handle) => {
                self.slots[handle.0].state.membership = Membership::Detached;
                true
            }
            None => false,
        }
    }

    /// Once-per-tick repair of list membership. Must run outside any loop scope.
    pub fn reconcile(&mut self) {
        if self.loop_depth > 0 {
            log::warn!(
                "{}: reconcile called inside a loop scope (depth {}), skipping",
                self.name,
                self.loop_depth
            );
            return;
        }

        // Used entries that are no longer allocated and on.
        let mut index = 0;
        while index < self.used.len() {
            let Some(handle) = self.used.get(index) else {
                break;
            };
            let state = self.slots[handle.0].state;
            if state.allocated && state.is_on() {
                index += 1;
                continue;
            }
            self.remove_used_index(index);
            if !state.allocated && !self.slots[handle.0].state.in_free_list() {
                self.add_to_free(handle);
            }
        }

        // Free entries that came back to life.
        let mut index = 0;
        while index < self.free.len() {
            let Some(handle) = self.free.get(index) else {
                break;
            };
            let state = self.slots[handle.0].state;
            if !state.allocated {
                index += 1;
                continue;
            }
            self.remove_free_index(index);
            if state.is_on() {
                self.add_to_used(handle);
            }
        }

        // Slots whose flags drifted away from the lists.
        for index in 0..self.slots.len() {
            let handle = Handle(index);
            let state = self.slots[index].state;
            if state.is_in_game() && !state.in_used_list() {
                log::debug!("{}: re-adding dangling slot {} to used", self.name, handle);
                self.add_to_used(handle);
            } else if !state.allocated && !state.in_free_list() {
                log::debug!("{}: re-adding dangling slot {} to free", self.name, handle);
                self.add_to_free(handle);
            }
        }

        self.used.clear_tail();
        self.free.clear_tail();
    }

    /// Checks the used/free partition and the per-slot membership flags.
    pub fn check_partition(&self) -> Result<(), String> {
        if self.used.len() + self.free.len() > self.capacity() {
            return Err(format!(
                "{}: used ({}) + free ({}) exceeds capacity {}",
                self.name,
                self.used.len(),
                self.free.len(),
                self.capacity()
            ));
        }

        let mut seen = vec![Membership::Detached; self.capacity()];
        for (list, membership) in [(&self.used, Membership::Used), (&self.free, Membership::Free)] {
            for handle in list.iter() {
                if !self.is_valid(handle) {
                    return Err(format!("{}: {} is out of range", self.name, handle));
                }
                if seen[handle.0] != Membership::Detached {
                    return Err(format!("{}: {} is listed twice", self.name, handle));
                }
                seen[handle.0] = membership;
            }
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let handle = Handle(index);
            if slot.state.membership != seen[index] {
                return Err(format!(
                    "{}: {} is flagged {:?} but listed {:?}",
                    self.name, handle, slot.state.membership, seen[index]
                ));
            }
            if seen[index] == Membership::Detached
                && (!slot.state.allocated || slot.state.is_on())
            {
                return Err(format!("{}: {} is in neither list", self.name, handle));
            }
            if seen[index] == Membership::Used && !slot.state.allocated {
                return Err(format!("{}: unallocated {} is in the used list", self.name, handle));
            }
            if seen[index] == Membership::Free && slot.state.allocated {
                return Err(format!("{}: allocated {} is in the free list", self.name, handle));
            }
        }

        if self.used.stale_tail_len() + self.free.stale_tail_len() > 0 {
            return Err(format!("{}: index list tail was not cleared", self.name));
        }

        Ok(())
    }

    /// Applies everything queued while loop scopes were open.
    fn flush_pending(&mut self) {
        debug_assert_eq!(self.loop_depth, 0);

        let activations = std::mem::take(&mut self.activation_queue);
        for handle in activations.iter().copied() {
            let state = &mut self.slots[handle.0].state;
            if !state.allocated || !state.turn_me_on() {
                continue;
            }
            state.activity = Activity::On;
            if !state.in_used_list() {
                self.add_to_used(handle);
            }
        }

        let terminations = std::mem::take(&mut self.termination_queue);
        for handle in terminations.iter().copied() {
            self.release(handle);
        }

        self.activation_queue = activations;
        self.activation_queue.clear();
        self.termination_queue = terminations;
        self.termination_queue.clear();
    }

    /// Runs the destructor and resets the slot, leaving it detached.
    fn destroy_now(&mut self, handle: Handle) {
        self.termination_queue.retain(|queued| *queued != handle);
        self.activation_queue.retain(|queued| *queued != handle);

        if let Some(index) = self.used.find(handle) {
            self.remove_used_index(index);
        }

        let slot = &mut self.slots[handle.0];
        slot.object.destruct(handle);
        slot.object = T::default();
        slot.state = SlotState {
            membership: slot.state.membership,
            ..SlotState::default()
        };
    }

    /// Pulls `handle` out of whichever list holds it.
    fn detach(&mut self, handle: Handle) {
        if let Some(index) = self.free.find(handle) {
            self.remove_free_index(index);
        }
        if let Some(index) = self.used.find(handle) {
            self.remove_used_index(index);
        }
    }
}
