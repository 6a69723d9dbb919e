//! Least-loaded worker pool.
//!
//! A binary min-heap over worker handles keyed on `pending`, with a
//! worker-id → heap-slot table so the balancer can re-heapify a single
//! worker in O(log N) after mutating its key. The pool is owned exclusively
//! by the balancer control loop; nothing here locks.

use crate::executor::worker::WorkerHandle;

/// Slot marker for a worker currently popped out of the heap.
const OUT: usize = usize::MAX;

pub(crate) struct WorkerPool {
    /// Heap-ordered handles; parent pending <= child pending.
    heap: Vec<WorkerHandle>,
    /// Worker id -> current heap slot, `OUT` while popped.
    slots: Vec<usize>,
}

impl WorkerPool {
    pub(crate) fn with_capacity(workers: usize) -> Self {
        Self {
            heap: Vec::with_capacity(workers),
            slots: vec![OUT; workers],
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn push(&mut self, worker: WorkerHandle) {
        let slot = self.heap.len();
        if worker.id >= self.slots.len() {
            self.slots.resize(worker.id + 1, OUT);
        }
        self.slots[worker.id] = slot;
        self.heap.push(worker);
        self.sift_up(slot);
    }

    /// Removes and returns the least-loaded worker.
    pub(crate) fn pop_min(&mut self) -> Option<WorkerHandle> {
        if self.heap.is_empty() {
            return None;
        }
        let last = self.heap.len() - 1;
        self.swap(0, last);
        let worker = self.heap.pop()?;
        self.slots[worker.id] = OUT;
        if !self.heap.is_empty() {
            self.sift_down(0);
        }
        Some(worker)
    }

    /// The heap slot currently holding worker `id`, if it is resident.
    pub(crate) fn slot_of(&self, id: usize) -> Option<usize> {
        self.slots.get(id).copied().filter(|&slot| slot != OUT)
    }

    pub(crate) fn get_mut(&mut self, slot: usize) -> Option<&mut WorkerHandle> {
        self.heap.get_mut(slot)
    }

    /// Restores heap order after the key at `slot` changed.
    pub(crate) fn fix(&mut self, slot: usize) {
        if slot >= self.heap.len() {
            return;
        }
        if !self.sift_down(slot) {
            self.sift_up(slot);
        }
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if self.heap[slot].pending >= self.heap[parent].pending {
                break;
            }
            self.swap(slot, parent);
            slot = parent;
        }
    }

    /// Returns whether the entry moved.
    fn sift_down(&mut self, mut slot: usize) -> bool {
        let start = slot;
        let len = self.heap.len();
        loop {
            let left = 2 * slot + 1;
            if left >= len {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.heap[right].pending < self.heap[left].pending {
                child = right;
            }
            if self.heap[child].pending >= self.heap[slot].pending {
                break;
            }
            self.swap(slot, child);
            slot = child;
        }
        slot != start
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.slots[self.heap[a].id] = a;
        self.slots[self.heap[b].id] = b;
    }
}
