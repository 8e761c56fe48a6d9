//! Hook aliases for the diagnostics surface.

use std::sync::Arc;

/// Receives one formatted line per dispatch-logging event.
///
/// Installed on a [`Looper`](crate::Looper) via
/// [`set_message_logging`](crate::Looper::set_message_logging); the looper
/// emits a line before and after every message dispatch.
pub type Printer = Arc<dyn Fn(&str) + Send + Sync>;
