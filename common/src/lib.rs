use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

pub mod cli;
pub mod util;

/// Synchronous instance of an emulated machine
pub trait Instance : Send {
    /// Runs until `stop` is raised or the machine has nothing left to do.
    ///
    /// `stop` is only polled between scheduler quanta, so a raised flag takes effect once the
    /// current quantum has been executed.
    fn run(&mut self, stop: &AtomicBool) -> Result<(), anyhow::Error>;

    fn as_any(&mut self) -> &mut dyn std::any::Any;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Running,
    Paused,
    Error,
}

type WorkerResult = (Box<dyn Instance>, Result<(), anyhow::Error>);

/// Takes a raw synchronous Instance and wraps it in a thread
///
/// The instance gets moved to the worker thread when running and then back to the parent thread
/// when paused. This gives the parent full access to the instance while paused without crossing
/// thread boundaries. The only thing shared while running is the stop flag.
pub struct ThreadAdapter {
    instance: Option<Box<dyn Instance>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<WorkerResult>>,
    failed: bool,
}

impl ThreadAdapter
{
    pub fn new(instance: Box<dyn Instance>) -> Self {
        Self {
            instance: Some(instance),
            stop: Arc::new(AtomicBool::new(false)),
            join: None,
            failed: false,
        }
    }

    pub fn start(&mut self) -> Result<(), anyhow::Error> {
        let Some(mut instance) = self.instance.take() else {
            anyhow::bail!("invalid instance state");
        };
        self.stop.store(false, Ordering::Release);
        let stop = self.stop.clone();

        let join = std::thread::Builder::new()
            .name("emulation".into())
            .spawn(move || {
                let result = instance.run(&stop);
                (instance, result)
            })?;
        self.join = Some(join);
        Ok(())
    }

    /// Raises the stop flag and waits for the worker to hand the instance back.
    pub fn pause(&mut self) -> Result<(), anyhow::Error> {
        self.stop.store(true, Ordering::Release);
        self.wait()
    }

    /// Waits for the worker to return on its own.
    pub fn wait(&mut self) -> Result<(), anyhow::Error> {
        let Some(join) = self.join.take() else {
            anyhow::bail!("instance isn't running");
        };
        match join.join() {
            Ok((instance, result)) => {
                self.instance = Some(instance);
                if let Err(e) = &result {
                    tracing::error!("Instance returned error: {:?}", e);
                    self.failed = true;
                }
                result
            }
            Err(_) => {
                self.failed = true;
                Err(anyhow::anyhow!("Instance panicked"))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        match self.join {
            Some(ref join) => join.is_finished(),
            None => true,
        }
    }

    /// Access to the instance while it's paused.
    pub fn instance(&mut self) -> Option<&mut (dyn Instance + 'static)> {
        self.instance.as_deref_mut()
    }

    pub fn status(&self) -> Status {
        if self.failed {
            Status::Error
        } else if self.join.is_some() {
            Status::Running
        } else {
            Status::Paused
        }
    }
}
