//! Guest to host register allocation for one unit.
//!
//! Bindings live only while a unit is being compiled. The allocator emits the loads, write-backs,
//! saves and restores itself, so emit routines just ask for a host register and use it until the
//! next call into the allocator (or the next helper call, for volatile registers).

use crate::backend::{CodeEmitter, HostReg, Operand};
use crate::state::GuestSlot;

/// Host registers the allocator hands out, volatile ones first so short units never need a frame.
pub const ALLOCATABLE: [HostReg; 11] = [
    HostReg::Rsi, HostReg::Rdi, HostReg::R8, HostReg::R9, HostReg::R10, HostReg::R11,
    HostReg::Rbx, HostReg::R12, HostReg::R13, HostReg::R14, HostReg::R15,
];

/// Stack slots reserved the first time a unit touches a nonvolatile register, one per register.
pub const NONVOLATILE_SLOTS: u32 = 5;

#[derive(Debug, Copy, Clone)]
struct Binding {
    host: HostReg,
    guest: Option<u8>,
    /// LRU stamp
    access: u64,
    dirty: bool,
    volatile: bool,
    /// The caller's value is on the stack and has to go back before returning
    saved: bool,
    slot: u32,
}

#[derive(Debug, Clone)]
pub struct RegAlloc {
    bindings: [Binding; 11],
    /// guest register -> index into `bindings`
    guest_map: [Option<u8>; 32],
    counter: u64,
    frame_reserved: bool,
    volatile_only: bool,
    closed: bool,
}

impl RegAlloc {
    pub fn new() -> RegAlloc {
        let mut next_slot = 0;
        let bindings = ALLOCATABLE.map(|host| {
            let volatile = host.is_volatile();
            let slot = if volatile { 0 } else { next_slot };
            if !volatile {
                next_slot += 1;
            }
            Binding { host, guest: None, access: 0, dirty: false, volatile, saved: false, slot }
        });
        RegAlloc {
            bindings,
            guest_map: [None; 32],
            counter: 0,
            frame_reserved: false,
            volatile_only: false,
            closed: false,
        }
    }

    pub fn reset(&mut self) {
        *self = RegAlloc::new();
    }

    /// Host register holding `guest`, loading it if needed. `dirty` marks the guest value as
    /// modified so it gets written back.
    pub fn get(&mut self, e: &mut dyn CodeEmitter, guest: u8, dirty: bool) -> HostReg {
        assert!(!self.closed, "register allocator used after the unit's exit was emitted");
        assert!(guest < 32);

        self.counter += 1;
        if let Some(index) = self.guest_map[guest as usize] {
            let binding = &mut self.bindings[index as usize];
            binding.access = self.counter;
            binding.dirty |= dirty;
            return binding.host;
        }

        let index = self.pick();
        self.evict(e, index);

        if !self.bindings[index].volatile && !self.bindings[index].saved {
            if !self.frame_reserved {
                e.reserve_stack(NONVOLATILE_SLOTS);
                self.frame_reserved = true;
            }
            let binding = &mut self.bindings[index];
            e.save(binding.slot, binding.host);
            binding.saved = true;
        }

        let binding = &mut self.bindings[index];
        e.load_guest(binding.host, GuestSlot::Gpr(guest));
        binding.guest = Some(guest);
        binding.access = self.counter;
        binding.dirty = dirty;
        self.guest_map[guest as usize] = Some(index as u8);

        binding.host
    }

    fn eligible(&self, binding: &Binding) -> bool {
        binding.volatile || !self.volatile_only
    }

    /// First free register, otherwise the least recently used one
    fn pick(&self) -> usize {
        let candidates = || self.bindings.iter().enumerate().filter(move |(_, b)| self.eligible(b));

        if let Some((index, _)) = candidates().find(|(_, b)| b.guest.is_none()) {
            return index;
        }
        candidates()
            .min_by_key(|(_, b)| b.access)
            .map(|(index, _)| index)
            .expect("no allocatable host registers")
    }

    fn write_back(e: &mut dyn CodeEmitter, binding: &Binding) {
        if let (Some(guest), true) = (binding.guest, binding.dirty) {
            e.store_guest(GuestSlot::Gpr(guest), Operand::Reg(binding.host));
        }
    }

    /// Unbinds a register, writing it back and handing a nonvolatile one back to the caller.
    fn evict(&mut self, e: &mut dyn CodeEmitter, index: usize) {
        let binding = &mut self.bindings[index];
        Self::write_back(e, binding);
        if let Some(guest) = binding.guest.take() {
            self.guest_map[guest as usize] = None;
        }
        binding.dirty = false;
        if binding.saved {
            e.restore(binding.host, binding.slot);
            binding.saved = false;
        }
    }

    /// Stores `guest` if it's dirty. The binding stays, now clean.
    pub fn writeback(&mut self, e: &mut dyn CodeEmitter, guest: u8) {
        if let Some(index) = self.guest_map[guest as usize] {
            let binding = &mut self.bindings[index as usize];
            Self::write_back(e, binding);
            binding.dirty = false;
        }
    }

    /// Drops the binding for `guest` without writing it back. Used when the guest register gets
    /// overwritten behind the allocator's back.
    pub fn discard(&mut self, e: &mut dyn CodeEmitter, guest: u8) {
        if let Some(index) = self.guest_map[guest as usize] {
            self.bindings[index as usize].dirty = false;
            self.evict(e, index as usize);
        }
    }

    /// Writes back and unbinds every volatile register. Required before any helper call.
    pub fn flush_all_volatile(&mut self, e: &mut dyn CodeEmitter) {
        for index in 0..self.bindings.len() {
            if self.bindings[index].volatile && self.bindings[index].guest.is_some() {
                self.evict(e, index);
            }
        }
    }

    /// Writes back and unbinds everything. Afterwards the guest register file is the only copy,
    /// and the allocator state no longer depends on which path led here.
    pub fn writeback_all(&mut self, e: &mut dyn CodeEmitter) {
        for index in 0..self.bindings.len() {
            self.evict(e, index);
        }
    }

    /// Restricts new bindings to volatile registers, so no saves are emitted on a conditional path.
    pub fn set_volatile_only(&mut self, volatile_only: bool) {
        self.volatile_only = volatile_only;
    }

    /// Emits a unit exit for the current bindings without touching the allocator state. Exception
    /// exits use this on a snapshot taken at the faulting instruction.
    pub fn emit_exit(&self, e: &mut dyn CodeEmitter) {
        for binding in &self.bindings {
            Self::write_back(e, binding);
            if binding.saved {
                e.restore(binding.host, binding.slot);
            }
        }
        if self.frame_reserved {
            e.release_stack(NONVOLATILE_SLOTS);
        }
    }

    /// Normal unit exit: writes back, restores and releases the frame in one pass. Nothing can be
    /// allocated afterwards.
    pub fn flush_and_restore(&mut self, e: &mut dyn CodeEmitter) {
        self.emit_exit(e);
        let closed = RegAlloc { closed: true, ..RegAlloc::new() };
        *self = closed;
    }

    pub fn bound(&self, guest: u8) -> Option<HostReg> {
        self.guest_map[guest as usize].map(|index| self.bindings[index as usize].host)
    }

    pub fn is_dirty(&self, guest: u8) -> bool {
        self.guest_map[guest as usize].map_or(false, |index| self.bindings[index as usize].dirty)
    }

    pub fn bound_count(&self) -> usize {
        self.bindings.iter().filter(|b| b.guest.is_some()).count()
    }

    pub fn frame_reserved(&self) -> bool {
        self.frame_reserved
    }
}

impl Default for RegAlloc {
    fn default() -> Self {
        Self::new()
    }
}
