// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod resolver;
pub mod sources;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, AppState};
pub use crate::config::{PipelineConfig, SourceConfig, SourceConfigPatch};
pub use crate::error::{ExtractError, ExtractResult};
pub use crate::limiter::{LimiterEvent, Priority, RateLimiterService, SourceStats};
pub use crate::resolver::{ExtractionMethod, ProductResolver, ResolvedProduct};
