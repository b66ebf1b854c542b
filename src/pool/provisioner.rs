// ABOUTME: Growth strategy contract for the service pool
//
// The pool never starts workers itself. It signals growth through a
// ServiceProvisioner; new workers announce themselves later with a
// `serviceReady` broadcast.

use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;
use tracing::{debug, info};

/// Failure to request more capacity
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The backend refused or failed the request
    #[error("Provisioning backend failed: {0}")]
    Backend(String),

    /// The requested count cannot be represented by the backend
    #[error("Cannot scale to {0} instances")]
    OutOfRange(usize),
}

/// Pluggable strategy that grows the pool.
///
/// Calls are growth signals only: returning `Ok` does not mean a worker
/// is ready, just that one was asked for.
#[cfg_attr(test, mockall::automock)]
pub trait ServiceProvisioner: Send + Sync {
    /// Ask for one more worker
    fn provision(&self) -> Result<(), ProvisionError>;

    /// Ask for the initial pool on start-up
    fn provision_initial(&self, count: usize) -> Result<(), ProvisionError> {
        for _ in 0..count {
            self.provision()?;
        }
        Ok(())
    }

    /// A worker was shut down by the pool
    fn on_removed(&self, _socket_id: &str) {}

    /// The pool was disposed
    fn on_dispose(&self) {}
}

/// Provisioner for backends that scale by instance count.
///
/// Keeps the desired count (0 until `provision_initial`), bumps it on
/// every growth signal, and hands each new count to `scale`. Removals do
/// not shrink the count.
pub struct InstanceCountProvisioner<F> {
    instances: AtomicU32,
    scale: F,
}

impl<F> InstanceCountProvisioner<F>
where
    F: Fn(u32) -> Result<(), ProvisionError> + Send + Sync,
{
    /// Start at zero instances, scaling through `scale`
    pub fn new(scale: F) -> Self {
        Self {
            instances: AtomicU32::new(0),
            scale,
        }
    }

    /// Currently requested instance count
    pub fn instances(&self) -> u32 {
        self.instances.load(Ordering::SeqCst)
    }
}

impl<F> ServiceProvisioner for InstanceCountProvisioner<F>
where
    F: Fn(u32) -> Result<(), ProvisionError> + Send + Sync,
{
    fn provision(&self) -> Result<(), ProvisionError> {
        let count = self.instances.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        debug!(instances = count, "Scaling up by one instance");
        (self.scale)(count)
    }

    fn provision_initial(&self, count: usize) -> Result<(), ProvisionError> {
        let count = u32::try_from(count).map_err(|_| ProvisionError::OutOfRange(count))?;
        self.instances.store(count, Ordering::SeqCst);
        info!(instances = count, "Scaling to initial instance count");
        (self.scale)(count)
    }
}

impl<F> std::fmt::Debug for InstanceCountProvisioner<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceCountProvisioner")
            .field("instances", &self.instances.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
