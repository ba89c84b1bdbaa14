//! Tracker configuration.
//!
//! All recognised options of the optical-flow front end, validated once at
//! construction. Per-keypoint failures at runtime are silent; only
//! configuration mistakes surface as errors.

/// How the initial guess for cross-camera matching is formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchingGuessType {
    /// Start the solver at the same pixel as in the source camera.
    SamePixel,
    /// Reproject under the configured default depth.
    ReprojFixDepth,
    /// Reproject under the most recent scene-depth estimate.
    ReprojAvgDepth,
}

/// Optional capabilities negotiated with downstream consumers. The tracker
/// behaves identically apart from emitting the gated diagnostic output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFeature {
    /// Emit per-keypoint temporal tracking guesses on each result.
    TrackingGuesses,
    /// Emit per-keypoint cross-camera matching guesses on each result.
    MatchingGuesses,
}

/// Configuration of the patch optical-flow tracker.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    /// Number of additional pyramid levels (L).
    pub levels: usize,
    /// Per-level solver iteration cap.
    pub max_iterations: usize,
    /// Forward-backward acceptance threshold, in pixels squared.
    pub max_recovered_dist2: f64,
    /// Publish every k-th processed frame.
    pub skip_frames: u64,
    /// Cell size of the detection grid, in pixels.
    pub detection_grid_size: u32,
    /// Maximum corners kept per cell.
    pub detection_num_points_cell: usize,
    /// Lower bound of the adaptive FAST threshold.
    pub detection_min_threshold: i32,
    /// Upper bound of the adaptive FAST threshold.
    pub detection_max_threshold: i32,
    /// Depth prior when no estimate is available.
    pub matching_default_depth: f64,
    pub matching_guess_type: MatchingGuessType,
    /// Stereo rejection threshold on the epipolar residual.
    pub epipolar_error: f64,
    /// Optional horizon (in frames) after which reference patches of
    /// keypoints absent from the result are erased. `None` keeps them
    /// forever.
    pub patch_gc_frames: Option<u64>,
    /// Enabled optional capabilities.
    pub features: Vec<FlowFeature>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            max_iterations: 5,
            max_recovered_dist2: 0.04,
            skip_frames: 1,
            detection_grid_size: 50,
            detection_num_points_cell: 1,
            detection_min_threshold: 5,
            detection_max_threshold: 40,
            matching_default_depth: 2.0,
            matching_guess_type: MatchingGuessType::SamePixel,
            epipolar_error: 0.005,
            patch_gc_frames: None,
            features: Vec::new(),
        }
    }
}

impl FlowConfig {
    /// Check option consistency. Called once when the runtime is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.levels > 12 {
            return Err(ConfigError::InvalidLevels(self.levels));
        }
        if self.skip_frames == 0 {
            return Err(ConfigError::ZeroSkipFrames);
        }
        if self.detection_grid_size == 0 {
            return Err(ConfigError::ZeroGridSize);
        }
        if self.detection_num_points_cell == 0 {
            return Err(ConfigError::ZeroPointsPerCell);
        }
        if self.detection_min_threshold < 1
            || self.detection_max_threshold < self.detection_min_threshold
        {
            return Err(ConfigError::InvalidThresholds {
                min: self.detection_min_threshold,
                max: self.detection_max_threshold,
            });
        }
        if !(self.matching_default_depth > 0.0) {
            return Err(ConfigError::InvalidDefaultDepth(self.matching_default_depth));
        }
        if !(self.epipolar_error > 0.0) {
            return Err(ConfigError::InvalidEpipolarError(self.epipolar_error));
        }
        Ok(())
    }

    /// Whether this build understands a capability at all.
    pub fn supports_feature(feature: FlowFeature) -> bool {
        matches!(
            feature,
            FlowFeature::TrackingGuesses | FlowFeature::MatchingGuesses
        )
    }

    /// Enable a capability.
    pub fn use_feature(&mut self, feature: FlowFeature) {
        if !self.features.contains(&feature) {
            self.features.push(feature);
        }
    }

    pub fn feature_enabled(&self, feature: FlowFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// Construction-time configuration errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    InvalidLevels(usize),
    ZeroSkipFrames,
    ZeroGridSize,
    ZeroPointsPerCell,
    InvalidThresholds { min: i32, max: i32 },
    InvalidDefaultDepth(f64),
    InvalidEpipolarError(f64),
    NoCameras,
    CalibrationMismatch { intrinsics: usize, extrinsics: usize },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidLevels(l) => {
                write!(f, "Invalid pyramid depth: {} (must be <= 12)", l)
            }
            ConfigError::ZeroSkipFrames => write!(f, "skip_frames must be at least 1"),
            ConfigError::ZeroGridSize => write!(f, "Detection grid size must be nonzero"),
            ConfigError::ZeroPointsPerCell => {
                write!(f, "Detection must keep at least one point per cell")
            }
            ConfigError::InvalidThresholds { min, max } => {
                write!(f, "Invalid FAST threshold bracket: min {} max {}", min, max)
            }
            ConfigError::InvalidDefaultDepth(d) => {
                write!(f, "Default matching depth must be positive, got {}", d)
            }
            ConfigError::InvalidEpipolarError(e) => {
                write!(f, "Epipolar error threshold must be positive, got {}", e)
            }
            ConfigError::NoCameras => write!(f, "Calibration contains no cameras"),
            ConfigError::CalibrationMismatch {
                intrinsics,
                extrinsics,
            } => write!(
                f,
                "Calibration mismatch: {} intrinsics, {} extrinsics",
                intrinsics, extrinsics
            ),
        }
    }
}

impl std::error::Error for ConfigError {}
