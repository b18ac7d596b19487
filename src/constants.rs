//! Timeouts and tunables.

use std::time::Duration;

/// Bound on each discovery cascade phase: the service enumeration, and the
/// characteristic enumeration of one service.
pub const DISCOVERY_PHASE_TIMEOUT: Duration = Duration::from_secs(4);

/// A reasonable default deadline for `connect` when the caller has no
/// stricter requirement.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
