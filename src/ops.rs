// src/ops.rs
//
// Encode settings carried by each submitted item.
// Cheap to create and copy - the expensive work happens in the transcode stages.

use crate::error::BatchError;

/// Declared format of the source bytes.
///
/// Intake validation happens upstream; the decode stage trusts this tag for
/// codec routing and fails with a decode error when the bytes disagree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceFormat {
    Jpeg,
    Png,
    WebP,
}

impl SourceFormat {
    pub fn from_str(format: &str) -> Result<Self, BatchError> {
        match format.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP),
            other => Err(BatchError::unsupported_format(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::WebP => "webp",
        }
    }
}

/// Output format for encoding.
///
/// Lossless formats carry no quality knob; `effective_quality` reports the
/// canonical maximum for them so callers and logs see the forced value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg { quality: u8 },
    Png,
    WebP { quality: u8 },
}

impl OutputFormat {
    pub fn from_str(format: &str, quality: Option<u8>) -> Result<Self, BatchError> {
        let q = quality.unwrap_or(80).min(100);
        match format.to_lowercase().as_str() {
            "jpeg" | "jpg" => Ok(Self::Jpeg { quality: q }),
            "png" => Ok(Self::Png),
            "webp" => Ok(Self::WebP { quality: q }),
            other => Err(BatchError::unsupported_format(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg { .. } => "jpeg",
            Self::Png => "png",
            Self::WebP { .. } => "webp",
        }
    }

    pub fn is_lossless(&self) -> bool {
        matches!(self, Self::Png)
    }

    /// Quality actually used by the encode stage.
    /// Lossless formats ignore the requested value and always run at maximum.
    pub fn effective_quality(&self) -> u8 {
        match self {
            Self::Jpeg { quality } | Self::WebP { quality } => (*quality).min(100),
            Self::Png => 100,
        }
    }
}

/// How target dimensions are honored when both axes are given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizeFit {
    /// Fit inside the target box, preserving aspect ratio. No cropping.
    Inside,
    /// Stretch to exactly the target dimensions.
    Fill,
    /// Scale to cover the target box, then center-crop the overflow.
    Cover,
}

impl Default for ResizeFit {
    fn default() -> Self {
        Self::Inside
    }
}

/// Per-item encode options, fixed at submission time.
#[derive(Clone, Copy, Debug)]
pub struct EncodeOptions {
    pub format: OutputFormat,
    /// Target width; None keeps the source width (subject to `height` scaling).
    pub width: Option<u32>,
    /// Target height; None keeps the source height (subject to `width` scaling).
    pub height: Option<u32>,
    pub fit: ResizeFit,
}

impl EncodeOptions {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            width: None,
            height: None,
            fit: ResizeFit::default(),
        }
    }

    pub fn with_dimensions(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_fit(mut self, fit: ResizeFit) -> Self {
        self.fit = fit;
        self
    }

    pub fn wants_resize(&self) -> bool {
        self.width.is_some() || self.height.is_some()
    }
}
