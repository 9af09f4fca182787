//! Active liveness challenge built on pose and motion.
//!
//! The subject is asked to perform a short random sequence of head
//! movements. Each step must show the requested pose *and* enough frame
//! motion; a still photograph held in front of the camera fails the motion
//! check even if it happens to match the pose.
//!
//! This is simple gating, not anti-spoofing: a video replay passes.

use crate::pose::PoseResult;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const DEFAULT_CHALLENGE_STEPS: usize = 3;
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(40);
pub const DEFAULT_MOTION_THRESHOLD: f32 = 3.0;

/// Requested head movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoseAction {
    LookCenter,
    LookLeft,
    LookRight,
    LookUp,
    LookDown,
}

impl PoseAction {
    pub const ALL: [PoseAction; 5] = [
        PoseAction::LookCenter,
        PoseAction::LookLeft,
        PoseAction::LookRight,
        PoseAction::LookUp,
        PoseAction::LookDown,
    ];

    /// Whether `pose` satisfies this action.
    ///
    /// Center uses a tighter yaw band than the ±15° direction classifier,
    /// and up/down accept a smaller pitch (10°).
    pub fn is_satisfied_by(self, pose: &PoseResult) -> bool {
        match self {
            PoseAction::LookCenter => pose.yaw.abs() < 10.0,
            PoseAction::LookLeft => pose.yaw < -15.0,
            PoseAction::LookRight => pose.yaw > 15.0,
            PoseAction::LookUp => pose.pitch < -10.0,
            PoseAction::LookDown => pose.pitch > 10.0,
        }
    }

    pub fn instruction(self) -> &'static str {
        match self {
            PoseAction::LookCenter => "look straight at the camera",
            PoseAction::LookLeft => "turn your head left",
            PoseAction::LookRight => "turn your head right",
            PoseAction::LookUp => "tilt your head up",
            PoseAction::LookDown => "tilt your head down",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub steps: usize,
    pub timeout: Duration,
    pub motion_threshold: f32,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            steps: DEFAULT_CHALLENGE_STEPS,
            timeout: DEFAULT_CHALLENGE_TIMEOUT,
            motion_threshold: DEFAULT_MOTION_THRESHOLD,
        }
    }
}

/// Result of feeding one pose into a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    /// Current step completed; `step` more remain out of `of`.
    Advanced { step: usize, of: usize },
    /// All steps completed.
    Passed,
    /// Frame too still to count.
    NoMotion,
    /// Pose does not match the requested action.
    WrongPose { expected: PoseAction },
    /// The challenge ran out of time and is no longer active.
    Expired,
    /// No challenge in progress.
    Inactive,
}

/// A single random pose-sequence challenge.
#[derive(Debug, Clone)]
pub struct LivenessChallenge {
    actions: Vec<PoseAction>,
    current: usize,
    started_at: Instant,
    active: bool,
    config: LivenessConfig,
}

impl LivenessChallenge {
    /// Start a challenge with a random action sequence.
    pub fn start(config: LivenessConfig, now: Instant) -> Self {
        let actions = random_actions(&mut rand::thread_rng(), config.steps);
        Self::with_actions(actions, config, now)
    }

    /// Start a challenge with a fixed action sequence.
    pub fn with_actions(actions: Vec<PoseAction>, config: LivenessConfig, now: Instant) -> Self {
        let active = !actions.is_empty();
        tracing::debug!(?actions, "liveness challenge started");
        Self {
            actions,
            current: 0,
            started_at: now,
            active,
            config,
        }
    }

    pub fn actions(&self) -> &[PoseAction] {
        &self.actions
    }

    pub fn current_action(&self) -> Option<PoseAction> {
        if self.active {
            self.actions.get(self.current).copied()
        } else {
            None
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_passed(&self) -> bool {
        !self.actions.is_empty() && self.current >= self.actions.len()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.active && now.saturating_duration_since(self.started_at) > self.config.timeout
    }

    /// Evaluate one pose sample against the current step.
    pub fn submit(&mut self, pose: &PoseResult, now: Instant) -> ChallengeStatus {
        if !self.active {
            return if self.is_passed() {
                ChallengeStatus::Passed
            } else {
                ChallengeStatus::Inactive
            };
        }
        if self.is_expired(now) {
            self.active = false;
            tracing::info!(step = self.current, "liveness challenge expired");
            return ChallengeStatus::Expired;
        }

        let expected = self.actions[self.current];
        if pose.motion < self.config.motion_threshold {
            return ChallengeStatus::NoMotion;
        }
        if !expected.is_satisfied_by(pose) {
            return ChallengeStatus::WrongPose { expected };
        }

        self.current += 1;
        if self.current >= self.actions.len() {
            self.active = false;
            tracing::info!(steps = self.actions.len(), "liveness challenge passed");
            ChallengeStatus::Passed
        } else {
            ChallengeStatus::Advanced {
                step: self.current,
                of: self.actions.len(),
            }
        }
    }
}

/// Draw `count` distinct actions (reusing the pool once exhausted), then
/// make sure `LookCenter` is among them.
fn random_actions<R: Rng + ?Sized>(rng: &mut R, count: usize) -> Vec<PoseAction> {
    let mut pool: Vec<PoseAction> = Vec::new();
    let mut actions = Vec::with_capacity(count);

    for _ in 0..count {
        if pool.is_empty() {
            pool = PoseAction::ALL.to_vec();
            pool.shuffle(rng);
        }
        if let Some(action) = pool.pop() {
            actions.push(action);
        }
    }

    if !actions.is_empty() && !actions.contains(&PoseAction::LookCenter) {
        let slot = rng.gen_range(0..actions.len());
        actions[slot] = PoseAction::LookCenter;
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::HeadDirection;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn pose(yaw: f32, pitch: f32, motion: f32) -> PoseResult {
        PoseResult {
            yaw,
            pitch,
            roll: 0.0,
            motion,
            direction: HeadDirection::classify(yaw, pitch),
        }
    }

    #[test]
    fn test_random_actions_distinct_and_include_center() {
        for seed in 0..200 {
            let mut rng = StdRng::seed_from_u64(seed);
            let actions = random_actions(&mut rng, 3);
            assert_eq!(actions.len(), 3);
            assert!(actions.contains(&PoseAction::LookCenter), "seed {seed}: {actions:?}");
            for (i, a) in actions.iter().enumerate() {
                assert!(!actions[i + 1..].contains(a), "seed {seed}: duplicate in {actions:?}");
            }
        }
    }

    #[test]
    fn test_random_actions_longer_than_pool() {
        let mut rng = StdRng::seed_from_u64(7);
        let actions = random_actions(&mut rng, 7);
        assert_eq!(actions.len(), 7);
        assert!(actions.contains(&PoseAction::LookCenter));
    }

    #[test]
    fn test_action_rules() {
        assert!(PoseAction::LookCenter.is_satisfied_by(&pose(9.9, 30.0, 5.0)));
        assert!(!PoseAction::LookCenter.is_satisfied_by(&pose(10.0, 0.0, 5.0)));
        assert!(PoseAction::LookLeft.is_satisfied_by(&pose(-16.0, 0.0, 5.0)));
        assert!(!PoseAction::LookLeft.is_satisfied_by(&pose(-15.0, 0.0, 5.0)));
        assert!(PoseAction::LookRight.is_satisfied_by(&pose(16.0, 0.0, 5.0)));
        assert!(PoseAction::LookUp.is_satisfied_by(&pose(0.0, -11.0, 5.0)));
        assert!(PoseAction::LookDown.is_satisfied_by(&pose(0.0, 11.0, 5.0)));
        assert!(!PoseAction::LookDown.is_satisfied_by(&pose(0.0, 10.0, 5.0)));
    }

    #[test]
    fn test_challenge_passes_in_order() {
        let t0 = Instant::now();
        let mut c = LivenessChallenge::with_actions(
            vec![PoseAction::LookLeft, PoseAction::LookCenter, PoseAction::LookDown],
            LivenessConfig::default(),
            t0,
        );

        assert_eq!(c.current_action(), Some(PoseAction::LookLeft));
        assert_eq!(
            c.submit(&pose(-20.0, 0.0, 5.0), t0),
            ChallengeStatus::Advanced { step: 1, of: 3 }
        );
        assert_eq!(
            c.submit(&pose(0.0, 0.0, 5.0), t0),
            ChallengeStatus::Advanced { step: 2, of: 3 }
        );
        assert_eq!(c.submit(&pose(0.0, 12.0, 5.0), t0), ChallengeStatus::Passed);
        assert!(c.is_passed());
        assert!(!c.is_active());
        assert_eq!(c.submit(&pose(0.0, 0.0, 5.0), t0), ChallengeStatus::Passed);
    }

    #[test]
    fn test_still_frame_does_not_advance() {
        let t0 = Instant::now();
        let mut c = LivenessChallenge::with_actions(
            vec![PoseAction::LookCenter],
            LivenessConfig::default(),
            t0,
        );
        assert_eq!(c.submit(&pose(0.0, 0.0, 1.0), t0), ChallengeStatus::NoMotion);
        assert_eq!(c.current_action(), Some(PoseAction::LookCenter));
    }

    #[test]
    fn test_wrong_pose_reports_expected_action() {
        let t0 = Instant::now();
        let mut c = LivenessChallenge::with_actions(
            vec![PoseAction::LookUp],
            LivenessConfig::default(),
            t0,
        );
        assert_eq!(
            c.submit(&pose(0.0, 20.0, 5.0), t0),
            ChallengeStatus::WrongPose { expected: PoseAction::LookUp }
        );
    }

    #[test]
    fn test_challenge_expires() {
        let t0 = Instant::now();
        let mut c = LivenessChallenge::with_actions(
            vec![PoseAction::LookCenter],
            LivenessConfig::default(),
            t0,
        );
        let late = t0 + DEFAULT_CHALLENGE_TIMEOUT + Duration::from_millis(1);
        assert!(c.is_expired(late));
        assert_eq!(c.submit(&pose(0.0, 0.0, 5.0), late), ChallengeStatus::Expired);
        assert!(!c.is_active());
        assert_eq!(c.submit(&pose(0.0, 0.0, 5.0), late), ChallengeStatus::Inactive);
    }

    #[test]
    fn test_random_start_is_active() {
        let c = LivenessChallenge::start(LivenessConfig::default(), Instant::now());
        assert!(c.is_active());
        assert_eq!(c.actions().len(), DEFAULT_CHALLENGE_STEPS);
    }
}
