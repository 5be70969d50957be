//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server, health endpoint, and initialization

pub mod events;
pub mod server;

pub use server::{HealthState, init_global, init_test};

/// Macro for emitting metric events (Vector-style pattern).
///
/// This macro calls the `InternalEvent::emit()` method on the given event,
/// which records the corresponding Prometheus metric.
///
/// # Example
///
/// ```ignore
/// use permafrost::metrics::events::BytesUploaded;
///
/// emit!(BytesUploaded { bytes: 1024 });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

// Re-export the macro at crate root
pub use emit;
