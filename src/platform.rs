//! Platform capabilities the core asks for instead of calling OS identity APIs.

use crate::error::AppResult;
use tracing::debug;

/// Runs an operation under a given OS identity.
///
/// The pipeline only uses it around file access of the persistent queues. Hosts that
/// need impersonation provide their own implementation.
pub trait RunAs: Send + Sync {
    /// Run `operation` as `identity` (`None` = current identity).
    fn run_as(
        &self,
        identity: Option<&str>,
        operation: &mut dyn FnMut() -> AppResult<()>,
    ) -> AppResult<()>;
}

/// Runs everything under the current process identity.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentIdentity;

impl RunAs for CurrentIdentity {
    fn run_as(
        &self,
        identity: Option<&str>,
        operation: &mut dyn FnMut() -> AppResult<()>,
    ) -> AppResult<()> {
        if let Some(identity) = identity {
            debug!(identity, "impersonation not available, using the current identity");
        }
        operation()
    }
}
