use thiserror::Error;

use crate::{domain::DomainId, sync::SyncError, thread::NativeThreadId};

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Deadlocks and timeouts are deliberately absent: a blocking wait that ends without acquiring
/// its primitive reports that through [`crate::sync::WaitOutcome`], never through this type.
///
/// # Error Categories
///
/// ## Admission Denials
/// - [`Error::ThreadLimit`] - A domain reached its configured thread cap
/// - [`Error::OutOfMemory`] - Memory budget exceeded or the allocation itself failed
///
/// ## Lookup Failures
/// - [`Error::DomainNotFound`] - No live domain with the given id
/// - [`Error::ThreadNotBound`] - The thread is not bound to any domain
/// - [`Error::TaskNotFound`] - The task registry has no entry for the thread
/// - [`Error::AssemblyNotFound`] - The assembly store has no matching entry
/// - [`Error::NotFound`] - A generic lookup miss (regions, ports, modules)
///
/// ## Resource Failures
/// - [`Error::ThreadCreation`] - The OS refused to create a thread
/// - [`Error::WaitFailed`] - A wait could not be performed at all
/// - [`Error::PortLimit`] - All completion port slots are in use
/// - [`Error::Io`] - Filesystem or mapping errors
///
/// ## Usage Errors
/// - [`Error::DomainExists`] - A domain id was registered twice
/// - [`Error::InvalidArgument`] - A parameter was out of range
/// - [`Error::Sync`] - Lock released by a non-owner, semaphore overflow
/// - [`Error::NotSupported`] - The operation is intentionally not provided
/// - [`Error::LockError`] - Internal synchronization invariant broken
///
/// # Examples
///
/// ```rust
/// use hostrt::{Error, HostConfig, HostControl};
///
/// let host = HostControl::new(HostConfig::default())?;
/// match host.domains().thread_release(hostrt::thread::NativeThreadId::new(9999)) {
///     Err(Error::ThreadNotBound(thread)) => println!("{} was never bound", thread),
///     Err(e) => println!("Error: {}", e),
///     Ok(()) => {}
/// }
/// # Ok::<(), hostrt::Error>(())
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The domain the request originates from has reached its thread cap.
    ///
    /// This is an expected admission outcome, not a fault.
    #[error("Domain {domain} reached its limit of {limit} threads")]
    ThreadLimit {
        /// The domain whose cap was hit
        domain: DomainId,
        /// The configured cap
        limit: usize,
    },

    /// An allocation was refused.
    ///
    /// Policy denials and physical exhaustion are reported identically.
    #[error("Out of memory - {requested} bytes could not be provided")]
    OutOfMemory {
        /// Number of bytes the caller asked for
        requested: usize,
    },

    /// No live domain carries this id.
    #[error("Domain {0} not found")]
    DomainNotFound(DomainId),

    /// A domain with this id is already registered.
    #[error("Domain {0} already exists")]
    DomainExists(DomainId),

    /// The thread has no domain binding.
    #[error("Thread {0} is not bound to any domain")]
    ThreadNotBound(NativeThreadId),

    /// The task registry has no entry for this thread.
    #[error("No task registered for thread {0}")]
    TaskNotFound(NativeThreadId),

    /// The assembly store has no entry for this identity.
    #[error("Assembly not found - {0}")]
    AssemblyNotFound(String),

    /// A generic lookup miss.
    #[error("Not found - {0}")]
    NotFound(String),

    /// Spawning an OS thread failed.
    ///
    /// The underlying I/O error carries the OS error code.
    #[error("Failed to create thread - {0}")]
    ThreadCreation(#[source] std::io::Error),

    /// The wait could not be performed.
    #[error("Wait failed - {0}")]
    WaitFailed(String),

    /// Every completion port slot is occupied.
    #[error("Completion port limit of {0} reached")]
    PortLimit(usize),

    /// A parameter was outside its valid range.
    #[error("Invalid argument - {0}")]
    InvalidArgument(String),

    /// Misuse of a lock, event or semaphore.
    #[error("{0}")]
    Sync(#[from] SyncError),

    /// The operation is not provided by this host.
    #[error("Operation not supported - {0}")]
    NotSupported(&'static str),

    /// Internal synchronization invariant broken.
    #[error("{0}")]
    LockError(String),

    /// Filesystem and memory mapping errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns `true` for failures that represent a policy decision rather than a fault.
    #[must_use]
    pub fn is_admission_denial(&self) -> bool {
        matches!(self, Error::ThreadLimit { .. } | Error::OutOfMemory { .. })
    }

    /// Returns `true` for lookup misses.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::DomainNotFound(_)
                | Error::ThreadNotBound(_)
                | Error::TaskNotFound(_)
                | Error::AssemblyNotFound(_)
                | Error::NotFound(_)
        )
    }

    /// Returns the raw OS error code, if this error originated from the OS.
    #[must_use]
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Error::ThreadCreation(err) | Error::Io(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_classification() {
        let err = Error::ThreadLimit {
            domain: DomainId(2),
            limit: 4,
        };
        assert!(err.is_admission_denial());
        assert!(!err.is_not_found());
        assert!(Error::OutOfMemory { requested: 16 }.is_admission_denial());
    }

    #[test]
    fn test_not_found_classification() {
        assert!(Error::DomainNotFound(DomainId(7)).is_not_found());
        assert!(Error::ThreadNotBound(NativeThreadId::new(3)).is_not_found());
        assert!(!Error::PortLimit(16).is_not_found());
    }

    #[test]
    fn test_os_error_code_preserved() {
        let err = Error::ThreadCreation(std::io::Error::from_raw_os_error(11));
        assert_eq!(err.os_error_code(), Some(11));
        assert_eq!(Error::WaitFailed("x".into()).os_error_code(), None);
    }

    #[test]
    fn test_display() {
        let err = Error::from(SyncError::NotOwner);
        assert_eq!(err.to_string(), "thread does not own the lock");
        assert_eq!(Error::PortLimit(16).to_string(), "Completion port limit of 16 reached");
    }
}
