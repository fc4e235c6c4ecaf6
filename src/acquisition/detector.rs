//! Detector contract, frame type and the factory map that builds detectors
//! from configuration.

use super::mock::MockDetector;
use crate::config::DetectorConfig;
use crate::error::{Result, ScanError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One captured image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Row-major pixel data, `width * height` values
    pub pixels: Vec<u16>,
    /// Capture counter, monotonic per detector
    pub sequence: u64,
    /// First frame after a detector switch
    pub init: bool,
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

impl Frame {
    /// Create a frame captured now.
    pub fn new(width: u32, height: u32, pixels: Vec<u16>, sequence: u64) -> Self {
        Self {
            width,
            height,
            pixels,
            sequence,
            init: false,
            timestamp: Utc::now(),
        }
    }

    /// Number of pixels the geometry implies.
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Check that pixel data matches the geometry.
    pub fn is_consistent(&self) -> bool {
        self.pixels.len() == self.pixel_count()
    }
}

/// Frames drained from a detector buffer in capture order.
pub type FrameBatch = Vec<Frame>;

/// A camera or other imaging detector.
///
/// Methods take `&self`; implementations synchronize internally because the
/// poll loop and callers share one instance.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Unique detector name.
    fn name(&self) -> &str;

    /// Frame geometry as `(width, height)`.
    fn shape(&self) -> (u32, u32);

    /// Physical pixel size in micrometres.
    fn pixel_size_um(&self) -> f64;

    /// Detector takes part in acquisition polling.
    fn for_acquisition(&self) -> bool;

    /// Begin continuous capture.
    async fn start_capture(&self) -> Result<()>;

    /// End continuous capture.
    async fn stop_capture(&self) -> Result<()>;

    /// Most recent frame, if any was captured.
    async fn latest_frame(&self) -> Result<Option<Frame>>;

    /// Frames captured since the previous call, oldest first.
    async fn buffered_frames(&self) -> Result<Vec<Frame>>;
}

/// Detector driver selector used in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    /// Simulated sensor producing test-pattern frames
    #[default]
    Mock,
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mock => f.write_str("mock"),
        }
    }
}

/// Builds detectors of one kind.
pub trait DetectorFactory: Send + Sync {
    /// Kind this factory handles.
    fn kind(&self) -> DetectorKind;

    /// Human-readable driver name.
    fn name(&self) -> &'static str;

    /// Reject configurations the driver cannot run with.
    fn validate(&self, config: &DetectorConfig) -> Result<()> {
        if config.width == 0 || config.height == 0 {
            return Err(ScanError::Config(format!(
                "Detector '{}' must have a non-zero frame size",
                config.name
            )));
        }
        Ok(())
    }

    /// Create a detector from configuration.
    fn build(&self, config: &DetectorConfig) -> Result<Arc<dyn Detector>>;
}

/// Factory for [`MockDetector`].
pub struct MockDetectorFactory;

impl DetectorFactory for MockDetectorFactory {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Mock
    }

    fn name(&self) -> &'static str {
        "Mock Detector"
    }

    fn build(&self, config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
        self.validate(config)?;
        Ok(Arc::new(MockDetector::from_config(config)))
    }
}

/// Kind → factory map.
pub struct DetectorFactories {
    factories: HashMap<DetectorKind, Box<dyn DetectorFactory>>,
}

impl Default for DetectorFactories {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl DetectorFactories {
    /// Map with no factories.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Map with every built-in driver.
    pub fn with_builtin() -> Self {
        let mut factories = Self::empty();
        factories.register(Box::new(MockDetectorFactory));
        factories
    }

    /// Add or replace the factory for its kind.
    pub fn register(&mut self, factory: Box<dyn DetectorFactory>) {
        self.factories.insert(factory.kind(), factory);
    }

    /// Build one detector.
    pub fn build(&self, config: &DetectorConfig) -> Result<Arc<dyn Detector>> {
        let factory = self.factories.get(&config.kind).ok_or_else(|| {
            ScanError::Config(format!("No driver registered for detector kind '{}'", config.kind))
        })?;
        tracing::debug!(detector = %config.name, driver = factory.name(), "Building detector");
        factory.build(config)
    }

    /// Build every configured detector, in configuration order.
    pub fn build_all(&self, configs: &[DetectorConfig]) -> Result<Vec<Arc<dyn Detector>>> {
        configs.iter().map(|c| self.build(c)).collect()
    }
}
