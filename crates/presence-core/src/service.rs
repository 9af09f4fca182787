//! End-to-end attendance flow over opaque model collaborators.
//!
//! The embedding model and the landmark detector live outside this crate;
//! the service only sees them through [`EmbeddingExtractor`] and
//! [`LandmarkDetector`].

use crate::ledger::{AttendanceLedger, AttendanceSession, LedgerConfig, LedgerError, SessionEvent};
use crate::liveness::LivenessChallenge;
use crate::matcher::{CosineDistanceMatcher, MatchOutcome, Matcher, MatcherConfig};
use crate::pose::{FaceLandmarks, LumaFrame, PoseError, PoseEstimator, PoseResult};
use crate::storage::{AttendanceStore, BoxError, EmbeddingRepository, StoreError};
use crate::types::{Embedding, EnrollError, EnrolledIdentity};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("no face detected")]
    NotDetected,
    #[error("extraction failed: {0}")]
    Failed(BoxError),
}

/// Face embedding model: one image in, one embedding out.
pub trait EmbeddingExtractor {
    type Image: ?Sized;

    fn extract(&mut self, image: &Self::Image) -> Result<Embedding, ExtractError>;
}

/// Facial landmark model producing the six pose points.
pub trait LandmarkDetector {
    fn detect(&mut self, frame: &LumaFrame) -> Option<FaceLandmarks>;
}

/// One logical camera stream: its own detector and its own motion history.
pub struct CaptureStream<D> {
    detector: D,
    estimator: PoseEstimator,
}

impl<D: LandmarkDetector> CaptureStream<D> {
    pub fn new(detector: D) -> Self {
        Self {
            detector,
            estimator: PoseEstimator::new(),
        }
    }

    /// Score motion, detect landmarks, then solve the head pose.
    pub fn process(&mut self, frame: &LumaFrame) -> Result<PoseResult, PoseError> {
        let landmarks = self.detector.detect(frame);
        self.estimator.estimate(frame, landmarks.as_ref())
    }

    /// Forget the previous frame, e.g. when the camera is reopened.
    pub fn reset(&mut self) {
        self.estimator.reset();
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("enrollment needs at least {required} images, got {provided}")]
    NotEnoughImages { required: usize, provided: usize },
    #[error("no face detected in enrollment image {index}")]
    NoFaceInImage { index: usize },
    #[error("extractor: {0}")]
    Extractor(BoxError),
    #[error("enrollment rejected: {0}")]
    Enroll(#[from] EnrollError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("liveness challenge not passed")]
    LivenessNotPassed,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub matcher: MatcherConfig,
    pub ledger: LedgerConfig,
    /// Minimum number of images accepted by [`AttendanceService::register`].
    pub min_enroll_images: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            ledger: LedgerConfig::default(),
            min_enroll_images: 1,
        }
    }
}

/// Result of a check-in attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckinOutcome {
    NotDetected,
    NoMatch {
        closest_distance: Option<f32>,
        similarity_pct: f32,
    },
    Recorded {
        display_name: String,
        similarity_pct: f32,
        event: SessionEvent,
    },
}

pub struct AttendanceService<R, S, M = CosineDistanceMatcher> {
    repository: R,
    ledger: AttendanceLedger<S>,
    matcher: M,
    config: ServiceConfig,
}

impl<R, S> AttendanceService<R, S>
where
    R: EmbeddingRepository,
    S: AttendanceStore,
{
    pub fn new(repository: R, store: S, config: ServiceConfig) -> Self {
        Self::with_matcher(repository, store, CosineDistanceMatcher, config)
    }
}

impl<R, S, M> AttendanceService<R, S, M>
where
    R: EmbeddingRepository,
    S: AttendanceStore,
    M: Matcher,
{
    pub fn with_matcher(repository: R, store: S, matcher: M, config: ServiceConfig) -> Self {
        let ledger = AttendanceLedger::with_config(store, config.ledger.clone());
        Self {
            repository,
            ledger,
            matcher,
            config,
        }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn ledger(&self) -> &AttendanceLedger<S> {
        &self.ledger
    }

    /// Extract one embedding per image and enroll them as one record.
    ///
    /// A face missing from any image aborts the whole registration.
    pub fn register<X>(
        &self,
        extractor: &mut X,
        identity_id: &str,
        display_name: &str,
        images: &[&X::Image],
        now: DateTime<Utc>,
    ) -> Result<EnrolledIdentity, ServiceError>
    where
        X: EmbeddingExtractor,
    {
        let required = self.config.min_enroll_images.max(1);
        if images.len() < required {
            return Err(ServiceError::NotEnoughImages {
                required,
                provided: images.len(),
            });
        }

        let mut embeddings = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            match extractor.extract(image) {
                Ok(embedding) => embeddings.push(embedding),
                Err(ExtractError::NotDetected) => {
                    tracing::warn!(identity = identity_id, index, "no face in enrollment image");
                    return Err(ServiceError::NoFaceInImage { index });
                }
                Err(ExtractError::Failed(err)) => return Err(ServiceError::Extractor(err)),
            }
        }

        self.enroll(identity_id, display_name, embeddings, now)
    }

    /// Enroll pre-extracted embeddings as a new record.
    pub fn enroll(
        &self,
        identity_id: &str,
        display_name: &str,
        embeddings: Vec<Embedding>,
        now: DateTime<Utc>,
    ) -> Result<EnrolledIdentity, ServiceError> {
        let record = EnrolledIdentity::new(identity_id, display_name, embeddings, now)?;
        self.repository.append(&record)?;
        tracing::info!(
            identity = %record.id,
            record = %record.record_id,
            embeddings = record.embeddings.len(),
            dim = record.dim(),
            "identity enrolled"
        );
        Ok(record)
    }

    /// Match a probe against every enrolled record. Never touches the ledger.
    pub fn identify(&self, probe: &Embedding) -> Result<MatchOutcome, ServiceError> {
        let gallery = self.repository.snapshot()?;
        Ok(self
            .matcher
            .compare(probe, &gallery, self.config.matcher.threshold))
    }

    /// Extract, identify, then toggle attendance for the matched identity.
    ///
    /// No liveness check happens here; callers that need one go through
    /// [`AttendanceService::checkin_live`].
    pub fn checkin<X>(
        &self,
        extractor: &mut X,
        image: &X::Image,
        now: NaiveDateTime,
    ) -> Result<CheckinOutcome, ServiceError>
    where
        X: EmbeddingExtractor,
    {
        match extractor.extract(image) {
            Ok(probe) => self.checkin_embedding(&probe, now),
            Err(ExtractError::NotDetected) => {
                tracing::debug!("check-in frame has no face");
                Ok(CheckinOutcome::NotDetected)
            }
            Err(ExtractError::Failed(err)) => Err(ServiceError::Extractor(err)),
        }
    }

    /// Check in only if `challenge` was completed on the same capture.
    pub fn checkin_live(
        &self,
        challenge: &LivenessChallenge,
        probe: &Embedding,
        now: NaiveDateTime,
    ) -> Result<CheckinOutcome, ServiceError> {
        if !challenge.is_passed() {
            tracing::warn!(
                pending = ?challenge.current_action(),
                "check-in refused, liveness challenge not passed"
            );
            return Err(ServiceError::LivenessNotPassed);
        }
        self.checkin_embedding(probe, now)
    }

    pub fn checkin_embedding(
        &self,
        probe: &Embedding,
        now: NaiveDateTime,
    ) -> Result<CheckinOutcome, ServiceError> {
        match self.identify(probe)? {
            MatchOutcome::Matched {
                identity_id,
                display_name,
                similarity_pct,
                ..
            } => {
                let event = self.ledger.toggle(&identity_id, &display_name, now)?;
                Ok(CheckinOutcome::Recorded {
                    display_name,
                    similarity_pct,
                    event,
                })
            }
            MatchOutcome::NoMatch {
                closest_distance,
                similarity_pct,
            } => {
                tracing::info!(?closest_distance, similarity_pct, "check-in rejected, no match");
                Ok(CheckinOutcome::NoMatch {
                    closest_distance,
                    similarity_pct,
                })
            }
        }
    }

    pub fn report(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceSession>, ServiceError> {
        Ok(self.ledger.report(from, to)?)
    }
}
