// src/engine/service.rs
//
// The transcode contract consumed by the scheduler, plus the default
// codec-backed implementation: decode -> optional resize -> encode.

use crate::engine::{decoder, encoder, pipeline};
use crate::error::Result;
use crate::ops::{EncodeOptions, SourceFormat};
use std::sync::Arc;
use std::time::Instant;

/// One transcode invocation. The byte buffer is shared by Arc so the item
/// table keeps its copy for retries without duplicating payloads.
#[derive(Clone, Debug)]
pub struct TranscodeRequest {
    pub bytes: Arc<Vec<u8>>,
    pub source_format: SourceFormat,
    pub options: EncodeOptions,
}

impl TranscodeRequest {
    pub fn new(bytes: Arc<Vec<u8>>, source_format: SourceFormat, options: EncodeOptions) -> Self {
        Self {
            bytes,
            source_format,
            options,
        }
    }
}

/// Stage timings and sizes for one completed transcode.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TranscodeMetrics {
    /// Decode stage duration in milliseconds
    pub decode_ms: f64,
    /// Resize stage duration in milliseconds (0 when the stage was skipped)
    pub resize_ms: f64,
    /// Encode stage duration in milliseconds
    pub encode_ms: f64,
    /// Total wall-clock duration in milliseconds
    pub total_ms: f64,
    /// Input size in bytes
    pub bytes_in: u64,
    /// Output size in bytes
    pub bytes_out: u64,
    /// bytes_out / bytes_in
    pub compression_ratio: f64,
}

/// Result of a successful transcode.
#[derive(Clone, Debug)]
pub struct TranscodeOutput {
    pub bytes: Vec<u8>,
    pub metrics: TranscodeMetrics,
}

impl TranscodeOutput {
    /// Wrap raw bytes without stage metrics. Useful for test doubles.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            metrics: TranscodeMetrics::default(),
        }
    }
}

/// The single capability the scheduler consumes.
///
/// Implementations must be safe to call from several workers at once and must
/// not share mutable codec state across invocations. A failure belongs to the
/// one request that produced it.
pub trait TranscodeService: Send + Sync + 'static {
    fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeOutput>;
}

/// Tracks stage boundaries for one transcode run.
struct StageTimer {
    start_total: Instant,
    stage_start: Instant,
    metrics: TranscodeMetrics,
}

impl StageTimer {
    fn new(bytes_in: u64) -> Self {
        let now = Instant::now();
        Self {
            start_total: now,
            stage_start: now,
            metrics: TranscodeMetrics {
                bytes_in,
                ..TranscodeMetrics::default()
            },
        }
    }

    fn mark_decode_done(&mut self) {
        self.metrics.decode_ms = self.stage_start.elapsed().as_secs_f64() * 1000.0;
        self.stage_start = Instant::now();
    }

    fn mark_resize_done(&mut self) {
        self.metrics.resize_ms = self.stage_start.elapsed().as_secs_f64() * 1000.0;
        self.stage_start = Instant::now();
    }

    fn finalize(mut self, bytes_out: u64) -> TranscodeMetrics {
        self.metrics.encode_ms = self.stage_start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.total_ms = self.start_total.elapsed().as_secs_f64() * 1000.0;
        self.metrics.bytes_out = bytes_out;
        self.metrics.compression_ratio = if self.metrics.bytes_in > 0 {
            bytes_out as f64 / self.metrics.bytes_in as f64
        } else {
            0.0
        };
        self.metrics
    }
}

/// Default production transcoder backed by the engine codecs.
///
/// Stateless; every invocation decodes, resizes and encodes from scratch, so
/// concurrent calls never contend on shared codec instances.
#[derive(Clone, Copy, Debug, Default)]
pub struct CodecTranscoder;

impl CodecTranscoder {
    pub fn new() -> Self {
        Self
    }
}

impl TranscodeService for CodecTranscoder {
    fn transcode(&self, request: &TranscodeRequest) -> Result<TranscodeOutput> {
        let mut timer = StageTimer::new(request.bytes.len() as u64);

        let decoded = decoder::decode_image(&request.bytes, request.source_format)?;
        timer.mark_decode_done();

        let sized = if request.options.wants_resize() {
            let sized = pipeline::plan_resize(decoded, &request.options)?;
            timer.mark_resize_done();
            sized
        } else {
            decoded
        };

        let encoded = encoder::encode_image(&sized, &request.options.format)?;

        let metrics = timer.finalize(encoded.len() as u64);
        tracing::debug!(
            source = request.source_format.name(),
            target = request.options.format.name(),
            quality = request.options.format.effective_quality(),
            decode_ms = metrics.decode_ms,
            resize_ms = metrics.resize_ms,
            encode_ms = metrics.encode_ms,
            ratio = metrics.compression_ratio,
            "transcode complete"
        );

        Ok(TranscodeOutput {
            bytes: encoded,
            metrics,
        })
    }
}
