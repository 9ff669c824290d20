//! Kernel stack accounting
//!
//! The real stack of a kernel thread is its host thread's stack. The pool
//! tracks which threads own one and enforces the configured byte budget, so
//! exhausting kernel stacks is an ordinary, reportable failure.

use slab::Slab;

/// A kernel stack owned by one thread
#[derive(Debug, PartialEq, Eq)]
pub struct KernelStack {
    slot: usize,
    size: usize,
}

impl KernelStack {
    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug)]
pub(crate) struct StackPool {
    stacks: spin::Mutex<Slab<usize>>,
    budget: Option<usize>,
}

impl StackPool {
    pub fn new(budget: Option<usize>) -> Self {
        Self {
            stacks: spin::Mutex::new(Slab::new()),
            budget,
        }
    }

    pub fn allocate(&self, size: usize) -> Option<KernelStack> {
        let mut stacks = self.stacks.lock();
        if let Some(budget) = self.budget {
            let in_use: usize = stacks.iter().map(|(_, size)| *size).sum();
            if in_use + size > budget {
                return None;
            }
        }
        let slot = stacks.insert(size);
        Some(KernelStack { slot, size })
    }

    pub fn free(&self, stack: KernelStack) {
        let mut stacks = self.stacks.lock();
        let size = stacks.remove(stack.slot);
        debug_assert_eq!(size, stack.size);
    }

    pub fn in_use(&self) -> usize {
        self.stacks.lock().len()
    }
}
