//! Prelude module for common re-exports.
//!
//! Consumers can `use canmon_common::prelude::*;` and get the types that
//! appear in almost every signature without listing individual paths.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigFile, MonitorConfig};

// ─── Identities & severities ───────────────────────────────────────
pub use crate::ecu::EcuId;
pub use crate::level::Severity;

// ─── Time ──────────────────────────────────────────────────────────
pub use crate::clock::{Clock, SystemClock};

// ─── System constants ──────────────────────────────────────────────
pub use crate::consts::{MAX_ID_LEN, MAX_MSG_LEN, MAX_SUBSCRIBERS};
