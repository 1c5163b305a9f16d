use std::time::Duration;

use crate::error::AppError;
use crate::images::ImagePolicy;

/// Tunables for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Maximum documents processed at once. Mostly bounds concurrent hydration calls.
    pub max_concurrency: usize,
    /// Per-document deadline for the hydration call.
    pub hydration_timeout: Duration,
    pub image_policy: ImagePolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            hydration_timeout: Duration::from_secs(120),
            image_policy: ImagePolicy::default(),
        }
    }
}

impl PipelineConfig {
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_hydration_timeout(mut self, timeout: Duration) -> Self {
        self.hydration_timeout = timeout;
        self
    }

    pub fn with_image_cap(mut self, max_candidates: usize) -> Self {
        self.image_policy.max_candidates = max_candidates;
        self
    }

    pub fn with_min_image_area(mut self, min_pixel_area: u64) -> Self {
        self.image_policy.min_pixel_area = min_pixel_area;
        self
    }

    pub fn with_max_aspect_ratio(mut self, max_aspect_ratio: f64) -> Self {
        self.image_policy.max_aspect_ratio = max_aspect_ratio;
        self
    }

    /// Reject values that would make a run meaningless.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.max_concurrency == 0 {
            return Err(AppError::ConfigError(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.hydration_timeout.is_zero() {
            return Err(AppError::ConfigError(
                "hydration_timeout must be greater than zero".into(),
            ));
        }
        if self.image_policy.max_candidates == 0 {
            return Err(AppError::ConfigError(
                "image candidate cap must be at least 1".into(),
            ));
        }
        let ratio = self.image_policy.max_aspect_ratio;
        if ratio.is_nan() || ratio < 1.0 {
            return Err(AppError::ConfigError(format!(
                "max_aspect_ratio must be >= 1.0, got {}",
                self.image_policy.max_aspect_ratio
            )));
        }
        Ok(())
    }
}
