use std::ops::ControlFlow;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use common::cli::{ArenaPolicyOpt, RunnerOpts};
use common::{Instance, ThreadAdapter};
use r5900::cache::ArenaPolicy;
use r5900::instructions::MIPS_REG_NAMES;
use r5900::memory::Ram;
use r5900::{Core, CoreConfig};
use scheduler::{Scheduler, SchedulerConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Event {
    /// The cycle budget from the command line is used up
    BudgetExhausted,
}

/// The core and its stepping loop, owned by the emulation thread while running
struct Machine {
    core: Core,
    scheduler: Scheduler<Event>,
}

impl Instance for Machine {
    fn run(&mut self, stop: &AtomicBool) -> Result<(), anyhow::Error> {
        let core = &mut self.core;
        let mut step = |budget: u64| -> Result<u64, anyhow::Error> { Ok(core.run(budget)?) };
        let end = self.scheduler.run(&mut step, stop, |_, event| match event {
            Event::BudgetExhausted => ControlFlow::Break(()),
        })?;
        info!("stopped at cycle {}", end.cycles());
        Ok(())
    }

    fn as_any(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

impl Machine {
    fn report(&self) {
        let state = self.core.state();
        println!("pc {:08x}  cycles {}", state.pc, state.cycles);
        for (reg, name) in MIPS_REG_NAMES.iter().enumerate() {
            let value = state.regs.read(reg as u8);
            if value != 0 {
                println!("  {:>5} {:032x}", name, value);
            }
        }
        println!("{:#?}", self.core.stats());
    }
}

fn main() -> anyhow::Result<()> {
    let opts = RunnerOpts::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let image = std::fs::read(&opts.image).with_context(|| format!("reading {}", opts.image.display()))?;
    let mut ram = Ram::new(opts.ram_size);
    ram.load(opts.load_addr, &image)
        .with_context(|| format!("{} bytes don't fit at {:#010x}", image.len(), opts.load_addr))?;
    info!("loaded {} bytes at {:#010x}, entry {:#010x}", image.len(), opts.load_addr, opts.entry);

    let config = CoreConfig {
        reset_pc: opts.entry,
        arena_policy: match opts.arena_policy {
            ArenaPolicyOpt::Grow => ArenaPolicy::Grow,
            ArenaPolicyOpt::FlushAll => ArenaPolicy::FlushAll,
            ArenaPolicyOpt::Fail => ArenaPolicy::Fail,
        },
        ..CoreConfig::default()
    };
    let mut scheduler = Scheduler::new(SchedulerConfig { quantum: opts.quantum });
    scheduler.queue().add(opts.cycles, Event::BudgetExhausted);

    let machine = Machine { core: Core::new(config, Box::new(ram)), scheduler };
    let mut adapter = ThreadAdapter::new(Box::new(machine));
    adapter.start()?;

    match opts.wall_limit_ms {
        Some(ms) => {
            let deadline = Instant::now() + Duration::from_millis(ms);
            while !adapter.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            if adapter.is_finished() {
                adapter.wait()?;
            } else {
                info!("wall-clock limit of {} ms reached", ms);
                adapter.pause()?;
            }
        }
        None => adapter.wait()?,
    }

    let instance = adapter.instance().context("emulation thread didn't hand the machine back")?;
    let machine = instance.as_any().downcast_mut::<Machine>().context("unexpected instance type")?;
    machine.report();
    Ok(())
}
