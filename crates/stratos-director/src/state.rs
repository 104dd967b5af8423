//! Typestate pattern for a single VM provisioning attempt.
//!
//! The attempt's phase is encoded in the type system so that, for example, a
//! VM cannot be bound before it was created, and a rollback can only start
//! from the binding phase.
//!
//! ```text
//! Pending ──▶ Creating ──▶ Created ──▶ Binding ──▶ Ready
//!                │                        │
//!                ▼                        ▼
//!              Failed ◀──── RollingBack ◀─┘
//! ```
//!
//! A binding failure with VM preservation configured goes straight from
//! `Binding` to `Failed`.

use std::fmt;
use std::marker::PhantomData;

use tracing::debug;

use crate::types::{InstanceIdentity, VmCid};

// =============================================================================
// State marker types (zero-sized)
// =============================================================================

/// Marker trait for attempt phases.
pub trait AttemptState: private::Sealed + Send + Sync {
    /// Runtime representation of the phase.
    fn phase() -> AttemptPhase;
}

mod private {
    pub trait Sealed {}
}

/// Attempt constructed, nothing done yet.
#[derive(Debug, Clone, Copy)]
pub struct Pending;

/// Calling the cloud driver.
#[derive(Debug, Clone, Copy)]
pub struct Creating;

/// The driver returned a VM cid.
#[derive(Debug, Clone, Copy)]
pub struct Created;

/// Binding the VM to the instance.
#[derive(Debug, Clone, Copy)]
pub struct Binding;

/// VM bound and configured.
#[derive(Debug, Clone, Copy)]
pub struct Ready;

/// Deleting a VM that failed to bind.
#[derive(Debug, Clone, Copy)]
pub struct RollingBack;

/// The attempt failed.
#[derive(Debug, Clone, Copy)]
pub struct Failed;

impl private::Sealed for Pending {}
impl private::Sealed for Creating {}
impl private::Sealed for Created {}
impl private::Sealed for Binding {}
impl private::Sealed for Ready {}
impl private::Sealed for RollingBack {}
impl private::Sealed for Failed {}

impl AttemptState for Pending {
    fn phase() -> AttemptPhase {
        AttemptPhase::Pending
    }
}

impl AttemptState for Creating {
    fn phase() -> AttemptPhase {
        AttemptPhase::Creating
    }
}

impl AttemptState for Created {
    fn phase() -> AttemptPhase {
        AttemptPhase::Created
    }
}

impl AttemptState for Binding {
    fn phase() -> AttemptPhase {
        AttemptPhase::Binding
    }
}

impl AttemptState for Ready {
    fn phase() -> AttemptPhase {
        AttemptPhase::Ready
    }
}

impl AttemptState for RollingBack {
    fn phase() -> AttemptPhase {
        AttemptPhase::RollingBack
    }
}

impl AttemptState for Failed {
    fn phase() -> AttemptPhase {
        AttemptPhase::Failed
    }
}

/// Phase of an attempt as a plain value, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptPhase {
    /// See [`Pending`].
    Pending,
    /// See [`Creating`].
    Creating,
    /// See [`Created`].
    Created,
    /// See [`Binding`].
    Binding,
    /// See [`Ready`].
    Ready,
    /// See [`RollingBack`].
    RollingBack,
    /// See [`Failed`].
    Failed,
}

impl AttemptPhase {
    /// String representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Binding => "binding",
            Self::Ready => "ready",
            Self::RollingBack => "rolling_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AttemptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Attempt struct parameterised by state
// =============================================================================

#[derive(Debug, Clone)]
struct AttemptData {
    instance: String,
    tries: u32,
    vm_cid: Option<VmCid>,
    error: Option<String>,
}

/// A provisioning attempt in a specific phase.
#[derive(Debug)]
pub struct ProvisioningAttempt<S: AttemptState> {
    data: AttemptData,
    _state: PhantomData<S>,
}

impl<S: AttemptState> ProvisioningAttempt<S> {
    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> AttemptPhase {
        S::phase()
    }

    /// Number of `create_vm` calls made so far.
    #[must_use]
    pub const fn tries(&self) -> u32 {
        self.data.tries
    }

    /// The created VM, once known.
    #[must_use]
    pub const fn vm_cid(&self) -> Option<&VmCid> {
        self.data.vm_cid.as_ref()
    }

    /// Failure message, once failed.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.data.error.as_deref()
    }

    fn transition<T: AttemptState>(self) -> ProvisioningAttempt<T> {
        debug!(
            instance = %self.data.instance,
            from = %S::phase(),
            to = %T::phase(),
            tries = self.data.tries,
            "provisioning attempt transition"
        );
        ProvisioningAttempt {
            data: self.data,
            _state: PhantomData,
        }
    }

    fn transition_with<T: AttemptState>(
        mut self,
        f: impl FnOnce(&mut AttemptData),
    ) -> ProvisioningAttempt<T> {
        f(&mut self.data);
        self.transition()
    }
}

// =============================================================================
// State transitions
// =============================================================================

impl ProvisioningAttempt<Pending> {
    /// Start an attempt for an instance.
    #[must_use]
    pub fn new(identity: &InstanceIdentity) -> Self {
        Self {
            data: AttemptData {
                instance: identity.name(),
                tries: 0,
                vm_cid: None,
                error: None,
            },
            _state: PhantomData,
        }
    }

    /// Begin calling the cloud driver.
    #[must_use]
    pub fn start_creating(self) -> ProvisioningAttempt<Creating> {
        self.transition()
    }
}

impl ProvisioningAttempt<Creating> {
    /// Count a `create_vm` call and return the running total.
    pub fn record_try(&mut self) -> u32 {
        self.data.tries += 1;
        self.data.tries
    }

    /// The driver returned a VM.
    #[must_use]
    pub fn created(self, vm_cid: VmCid) -> ProvisioningAttempt<Created> {
        self.transition_with(|data| data.vm_cid = Some(vm_cid))
    }

    /// The driver gave up.
    #[must_use]
    pub fn fail(self, error: impl Into<String>) -> ProvisioningAttempt<Failed> {
        let error = error.into();
        self.transition_with(|data| data.error = Some(error))
    }
}

impl ProvisioningAttempt<Created> {
    /// Begin binding the VM.
    #[must_use]
    pub fn start_binding(self) -> ProvisioningAttempt<Binding> {
        self.transition()
    }
}

impl ProvisioningAttempt<Binding> {
    /// Binding finished.
    #[must_use]
    pub fn ready(self) -> ProvisioningAttempt<Ready> {
        self.transition()
    }

    /// Binding failed; the VM will be deleted.
    #[must_use]
    pub fn roll_back(self, error: impl Into<String>) -> ProvisioningAttempt<RollingBack> {
        let error = error.into();
        self.transition_with(|data| data.error = Some(error))
    }

    /// Binding failed; the VM is kept.
    #[must_use]
    pub fn fail(self, error: impl Into<String>) -> ProvisioningAttempt<Failed> {
        let error = error.into();
        self.transition_with(|data| data.error = Some(error))
    }
}

impl ProvisioningAttempt<RollingBack> {
    /// Rollback finished.
    #[must_use]
    pub fn finish(self) -> ProvisioningAttempt<Failed> {
        self.transition()
    }
}
