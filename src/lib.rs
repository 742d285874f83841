// lib.rs
//
// batchpress: a bounded-concurrency batch image compression engine.
//
// Design goals:
// - At most `max_parallel` images transcoding at once, never more
// - Submit/cancel never block the caller
// - Per-item failures stay per-item
// - State transitions observable exactly once, in order

// Memory allocator optimization - jemalloc for better performance
// Note: jemalloc is not supported on Windows/MSVC, so we exclude it on that platform
#[cfg(all(feature = "jemalloc", not(target_env = "msvc")))]
#[global_allocator]
static ALLOC: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

pub mod engine;
pub mod error;
pub mod ops;
pub mod scheduler;

pub use engine::service::{
    CodecTranscoder, TranscodeMetrics, TranscodeOutput, TranscodeRequest, TranscodeService,
};
pub use error::{BatchError, ErrorCategory, Result};
pub use ops::{EncodeOptions, OutputFormat, ResizeFit, SourceFormat};
pub use scheduler::{
    ItemId, ItemSnapshot, ItemState, Scheduler, SchedulerConfig, StateChange, Submission,
    Subscription, MAX_PARALLEL,
};

/// Get library version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Source formats the decode stage accepts.
pub fn supported_input_formats() -> Vec<&'static str> {
    vec!["jpeg", "jpg", "png", "webp"]
}

/// Target formats the encode stage produces.
pub fn supported_output_formats() -> Vec<&'static str> {
    vec!["jpeg", "jpg", "png", "webp"]
}
