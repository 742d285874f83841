// src/engine.rs
//
// The transcode pipeline: decode -> optional resize -> encode.
// Each stage runs under a panic policy so a crashing codec surfaces as a
// typed error for that one image instead of taking the process down.
//
// This file is a facade over the decomposed modules in engine/

// =============================================================================
// SECURITY LIMITS
// =============================================================================

/// Maximum allowed image dimension (width or height).
/// Images larger than 16384x16384 are rejected to prevent decompression bombs.
pub const MAX_DIMENSION: u32 = 16384;

/// Maximum allowed total pixels (width * height).
/// 100 megapixels = 400MB uncompressed RGBA. Beyond this is likely malicious.
pub const MAX_PIXELS: u64 = 100_000_000;

// =============================================================================
// MODULE DECOMPOSITION
// =============================================================================

pub(crate) mod common;
pub mod decoder;
pub mod encoder;
pub mod pipeline;
pub mod pool;
pub mod service;

pub use decoder::{check_dimensions, decode_image, ensure_dimensions_safe};
pub use encoder::{encode_image, encode_jpeg, encode_png, encode_webp, QualitySettings};
pub use pipeline::{calc_cover_dimensions, calc_fit_dimensions, fast_resize, plan_resize};
pub use pool::get_pool;
pub use service::{CodecTranscoder, TranscodeOutput, TranscodeRequest, TranscodeService};
