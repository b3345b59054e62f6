//! R5900 CPU core: a block compiler with its register allocator, code cache and software TLB,
//! driven by a dispatch loop.

use std::sync::Arc;

use common::util::ByteMask8;
use tracing::{debug, info, trace, warn};

pub mod backend;
pub mod branch;
pub mod cache;
pub mod compiler;
pub mod coprocessor0;
pub mod emit;
pub mod instructions;
pub mod joint_tlb;
pub mod memory;
pub mod regalloc;
pub mod regfile;
pub mod runtime;
pub mod state;

use backend::{BackendError, BlockId, HostCode, ThreadedBackend};
use cache::{ArenaPolicy, CacheError, CacheStats, CodeCache, EntryKind, POOL_SIZE};
use compiler::Compiler;
use coprocessor0::Exception;
use joint_tlb::{Access, Tlb};
use memory::{Bus, BusError, LeafOps, ReservedLeaf};
use runtime::{Env, Fetcher};
use state::CpuState;

#[derive(Debug, Copy, Clone)]
pub struct CoreConfig {
    /// The code cache covers physical addresses below `1 << phys_addr_bits`
    pub phys_addr_bits: u32,
    /// Initial pool arena capacity
    pub arena_pools: usize,
    pub arena_policy: ArenaPolicy,
    /// Upper bound for `ArenaPolicy::Grow`
    pub arena_max_pools: usize,
    pub reset_pc: u32,
    /// Units the backend keeps alive at once
    pub max_units: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            phys_addr_bits: 29,
            arena_pools: 4096,
            arena_policy: ArenaPolicy::Grow,
            arena_max_pools: 1 << 21,
            reset_pc: 0xbfc0_0000,
            max_units: 1 << 20,
        }
    }
}

/// Host-side failures. Guest exceptions never end up here.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("code cache: {0}")]
    Cache(#[from] CacheError),
    #[error("backend: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct CoreStats {
    pub units_compiled: u64,
    pub instructions_compiled: u64,
    pub nested_branches: u64,
    pub units_run: u64,
    pub cache_misses: u64,
    /// Exceptions raised by the dispatch loop itself, translating the pc
    pub fetch_exceptions: u64,
    pub live_units: usize,
    pub cache: CacheStats,
}

pub struct Core {
    state: CpuState,
    tlb: Tlb,
    cache: CodeCache,
    backend: ThreadedBackend,
    compiler: Compiler,
    bus: Box<dyn Bus + Send>,
    leaf: Box<dyn LeafOps + Send>,
    config: CoreConfig,
    units_run: u64,
    cache_misses: u64,
    fetch_exceptions: u64,
}

impl Core {
    pub fn new(config: CoreConfig, bus: Box<dyn Bus + Send>) -> Core {
        Core {
            state: CpuState::new(config.reset_pc),
            tlb: Tlb::new(),
            cache: CodeCache::new(config.phys_addr_bits, config.arena_pools, config.arena_policy, config.arena_max_pools),
            backend: ThreadedBackend::new(config.max_units),
            compiler: Compiler::new(),
            bus,
            leaf: Box::new(ReservedLeaf),
            config,
            units_run: 0,
            cache_misses: 0,
            fetch_exceptions: 0,
        }
    }

    /// Replaces the collaborator for MMI/COP1/COP2 and the other leaf opcodes
    pub fn set_leaf_ops(&mut self, leaf: Box<dyn LeafOps + Send>) {
        self.leaf = leaf;
    }

    /// Guest reset: fresh register state, an empty TLB and code cache.
    pub fn reset(&mut self) {
        info!("reset, pc {:#010x}", self.config.reset_pc);
        self.state = CpuState::new(self.config.reset_pc);
        self.tlb.reset();
        self.cache.flush(&mut self.backend);
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    pub fn tlb_mut(&mut self) -> &mut Tlb {
        &mut self.tlb
    }

    /// Direct bus access. Writes made through it bypass code invalidation.
    pub fn bus_mut(&mut self) -> &mut dyn Bus {
        &mut *self.bus
    }

    pub fn stats(&self) -> CoreStats {
        CoreStats {
            units_compiled: self.compiler.units_compiled(),
            instructions_compiled: self.compiler.instructions_compiled(),
            nested_branches: self.compiler.nested_branches(),
            units_run: self.units_run,
            cache_misses: self.cache_misses,
            fetch_exceptions: self.fetch_exceptions,
            live_units: self.backend.live_units(),
            cache: self.cache.stats(),
        }
    }

    /// Writes `bytes` at physical address `paddr` the way a DMA or other bus master would,
    /// dropping any code compiled from that range.
    pub fn write_phys(&mut self, paddr: u32, bytes: &[u8]) -> Result<(), BusError> {
        if paddr as u64 + bytes.len() as u64 > 1 << 32 {
            return Err(BusError::Unmapped(u32::MAX));
        }
        for (i, byte) in bytes.iter().enumerate() {
            let addr = paddr + i as u32;
            let lane = addr & 7;
            self.bus.write64(addr & !7, (*byte as u64) << (lane * 8), ByteMask8::new(1u32, lane))?;
        }
        self.cache.notify_write(paddr, bytes.len() as u32, &mut self.backend);
        Ok(())
    }

    /// Drops every unit compiled from `[lo, hi)`. Returns how many were released.
    pub fn invalidate_range(&mut self, lo: u32, hi: u32) -> usize {
        self.cache.invalidate_range(lo, hi, &mut self.backend)
    }

    /// The cached unit for physical address `paddr`, if there is one
    pub fn cached_unit(&self, paddr: u32, kind: EntryKind) -> Option<Arc<HostCode>> {
        let id = self.cache.lookup(paddr, kind)?;
        self.backend.code(id).ok()
    }

    /// Runs until at least `budget` cycles have elapsed and returns how many did. Units always
    /// run to completion, so this can overshoot.
    pub fn run(&mut self, budget: u64) -> Result<u64, CoreError> {
        let start = self.state.cycles;

        while self.state.cycles - start < budget {
            self.state.exception = false;
            let pc = self.state.pc;
            let before = self.state.cycles;

            match self.unit_at(pc)? {
                Ok(code) => {
                    let mut env = Env {
                        state: &mut self.state,
                        tlb: &mut self.tlb,
                        bus: &mut *self.bus,
                        cache: &mut self.cache,
                        backend: &mut self.backend,
                        leaf: &mut *self.leaf,
                    };
                    code.run(&mut env)?;
                    self.units_run += 1;
                }
                Err(exception) => {
                    trace!("fetch at {:#010x}: {:?}", pc, exception);
                    let in_delay_slot = self.state.branch_pending;
                    self.state.raise(exception, pc, in_delay_slot);
                    self.state.cycles += 1;
                    self.fetch_exceptions += 1;
                }
            }

            let elapsed = self.state.cycles - before;
            self.state.cop0.count = self.state.cop0.count.wrapping_add(elapsed as u32);
        }

        Ok(self.state.cycles - start)
    }

    /// Translates `pc` and finds or compiles its unit. The inner error is a guest exception to
    /// dispatch instead of running anything.
    fn unit_at(&mut self, pc: u32) -> Result<Result<Arc<HostCode>, Exception>, CoreError> {
        if pc & 3 != 0 {
            return Ok(Err(Exception::AddressError { vaddr: pc, store: false }));
        }
        let paddr = match self.tlb.translate(pc, Access::Fetch, &self.state.cop0) {
            Ok(paddr) => paddr,
            Err(exception) => return Ok(Err(exception)),
        };

        let mut kind = EntryKind::Normal;
        if self.state.branch_pending {
            if pc & (POOL_SIZE - 1) == 0 {
                kind = EntryKind::Boundary;
            } else {
                warn!("branch left pending at {:#010x}, which isn't a pool boundary; dropping it", pc);
                self.state.branch_pending = false;
            }
        }

        if let Some(id) = self.cache.lookup(paddr, kind) {
            return Ok(Ok(self.backend.code(id)?));
        }

        match self.compile(pc, paddr, kind) {
            Ok(id) => Ok(Ok(self.backend.code(id)?)),
            Err(CoreError::Cache(CacheError::AddressOutOfRange(_))) => {
                debug!("pc {:#010x} maps to {:#010x}, outside cacheable memory", pc, paddr);
                Ok(Err(Exception::InstructionBusError { vaddr: pc }))
            }
            Err(err) => Err(err),
        }
    }

    fn compile(&mut self, pc: u32, paddr: u32, kind: EntryKind) -> Result<BlockId, CoreError> {
        self.cache_misses += 1;

        // Creates the pool first, so running out of arena (and maybe flushing) happens before the
        // new unit exists
        self.cache.lookup_or_create(paddr, kind, &mut self.backend)?;

        let mut emitter = self.backend.emitter();
        let mut fetcher = Fetcher { tlb: &self.tlb, cop0: &self.state.cop0, bus: &mut *self.bus };
        let info = self.compiler.compile(&mut emitter, &mut fetcher, pc, kind);
        let id = self.backend.install(emitter.finish(pc, info.instructions)?)?;

        *self.cache.lookup_or_create(paddr, kind, &mut self.backend)? = Some(id);
        Ok(id)
    }
}
