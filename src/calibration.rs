//! Per-agent accuracy tracking and global calibration error.
//!
//! Profiles live in an arena (`Vec` plus id index). The tracker is the only
//! writer of profile state; the engine serializes access behind one lock.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::agent::Vote;
use crate::config::CalibrationConfig;
use crate::phi::{is_unit_interval, PHI_INV};

/// Accuracy assigned to agents with no track record.
pub const INITIAL_ACCURACY: f64 = PHI_INV;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub agent_id: String,
    pub rolling_accuracy: f64,
    pub voting_weight: f64,
    pub vote_count: u64,
}

impl AgentProfile {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            rolling_accuracy: INITIAL_ACCURACY,
            voting_weight: INITIAL_ACCURACY * INITIAL_ACCURACY,
            vote_count: 0,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.agent_id.is_empty()
            && is_unit_interval(self.rolling_accuracy)
            && is_unit_interval(self.voting_weight)
    }

    fn update(&mut self, correct: bool, alpha: f64) {
        let hit = if correct { 1.0 } else { 0.0 };
        self.rolling_accuracy = ((1.0 - alpha) * self.rolling_accuracy + alpha * hit).clamp(0.0, 1.0);
        self.voting_weight = self.rolling_accuracy * self.rolling_accuracy;
        self.vote_count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecalibrationNeeded {
    pub ece: f64,
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct CalibrationTracker {
    config: CalibrationConfig,
    profiles: Vec<AgentProfile>,
    index: HashMap<String, usize>,
    window: VecDeque<(f64, f64)>,
}

impl CalibrationTracker {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            profiles: Vec::new(),
            index: HashMap::new(),
            window: VecDeque::new(),
        }
    }

    /// Rebuild from persisted profiles. Later duplicates win.
    pub fn with_profiles(config: CalibrationConfig, profiles: Vec<AgentProfile>) -> Self {
        let mut tracker = Self::new(config);
        for profile in profiles {
            match tracker.index.get(&profile.agent_id) {
                Some(&slot) => tracker.profiles[slot] = profile,
                None => {
                    tracker.index.insert(profile.agent_id.clone(), tracker.profiles.len());
                    tracker.profiles.push(profile);
                }
            }
        }
        tracker
    }

    pub fn profile(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.index.get(agent_id).map(|&slot| &self.profiles[slot])
    }

    pub fn profiles(&self) -> &[AgentProfile] {
        &self.profiles
    }

    /// Voting weight used in aggregation. Unknown agents get the initial weight.
    pub fn weight_of(&self, agent_id: &str) -> f64 {
        self.profile(agent_id)
            .map(|p| p.voting_weight)
            .unwrap_or(INITIAL_ACCURACY * INITIAL_ACCURACY)
    }

    fn slot(&mut self, agent_id: &str) -> usize {
        if let Some(&slot) = self.index.get(agent_id) {
            return slot;
        }
        let slot = self.profiles.len();
        self.profiles.push(AgentProfile::new(agent_id));
        self.index.insert(agent_id.to_string(), slot);
        slot
    }

    /// Profiles as they would be after scoring `votes` against the observed
    /// outcome. Nothing changes until [`merge_profiles`](Self::merge_profiles).
    pub fn preview_votes(&self, votes: &[Vote], observed: f64) -> Vec<AgentProfile> {
        let observed_good = observed >= 0.5;
        let alpha = self.config.ema_alpha;
        votes
            .iter()
            .map(|vote| {
                let mut profile = self
                    .profile(vote.agent_id())
                    .cloned()
                    .unwrap_or_else(|| AgentProfile::new(vote.agent_id()));
                profile.update(vote.position().is_approving() == observed_good, alpha);
                profile
            })
            .collect()
    }

    /// Replace (or add) the given profiles.
    pub fn merge_profiles(&mut self, profiles: &[AgentProfile]) {
        for profile in profiles {
            let slot = self.slot(&profile.agent_id);
            self.profiles[slot] = profile.clone();
        }
    }

    /// Score every vote against the observed outcome. Returns the updated profiles.
    pub fn record_votes(&mut self, votes: &[Vote], observed: f64) -> Vec<AgentProfile> {
        let updated = self.preview_votes(votes, observed);
        self.merge_profiles(&updated);
        updated
    }

    /// Add one (confidence, observed) pair to the calibration window.
    pub fn record_prediction(&mut self, confidence: f64, observed: f64) -> Option<RecalibrationNeeded> {
        self.window.push_back((confidence, observed));
        while self.window.len() > self.config.ece_window {
            self.window.pop_front();
        }
        let samples = self.window.len();
        if samples < self.config.ece_min_samples {
            return None;
        }
        let ece = self.ece()?;
        (ece > self.config.ece_threshold).then_some(RecalibrationNeeded { ece, samples })
    }

    /// Expected calibration error over the current window.
    pub fn ece(&self) -> Option<f64> {
        expected_calibration_error(self.window.iter().copied(), self.config.ece_bins)
    }

    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Restore an agent to its initial accuracy and weight.
    pub fn reset_profile(&mut self, agent_id: &str) -> AgentProfile {
        let slot = self.slot(agent_id);
        self.profiles[slot] = AgentProfile::new(agent_id);
        self.profiles[slot].clone()
    }
}

/// Binned ECE: `Σ (n_b / N) · |mean confidence_b − mean observed_b|`.
pub fn expected_calibration_error<I>(pairs: I, bins: usize) -> Option<f64>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let bins = bins.max(1);
    let mut acc = vec![(0.0f64, 0.0f64, 0usize); bins];
    let mut total = 0usize;
    for (confidence, observed) in pairs {
        let idx = ((confidence.clamp(0.0, 1.0) * bins as f64) as usize).min(bins - 1);
        acc[idx].0 += confidence;
        acc[idx].1 += observed;
        acc[idx].2 += 1;
        total += 1;
    }
    if total == 0 {
        return None;
    }
    let ece = acc
        .iter()
        .filter(|(_, _, n)| *n > 0)
        .map(|&(c, o, n)| {
            let n_f = n as f64;
            (n_f / total as f64) * (c / n_f - o / n_f).abs()
        })
        .sum();
    Some(ece)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_profile_weight_is_accuracy_squared() {
        let p = AgentProfile::new("a");
        assert!((p.voting_weight - PHI_INV * PHI_INV).abs() < 1e-12);
    }

    #[test]
    fn perfectly_calibrated_window_has_zero_ece() {
        let pairs = vec![(0.25, 0.25), (0.55, 0.55)];
        assert!(expected_calibration_error(pairs, 10).unwrap().abs() < 1e-12);
        assert_eq!(expected_calibration_error(Vec::new(), 10), None);
    }

    #[test]
    fn recalibration_waits_for_min_samples() {
        let mut tracker = CalibrationTracker::new(CalibrationConfig::default());
        for _ in 0..20 {
            assert!(tracker.record_prediction(0.6, 0.0).is_none());
        }
        let signal = tracker.record_prediction(0.6, 0.0).unwrap();
        assert_eq!(signal.samples, 21);
        assert!((signal.ece - 0.6).abs() < 1e-9);
    }

    #[test]
    fn preview_leaves_profiles_untouched() {
        use crate::agent::Position;
        use std::collections::BTreeMap;

        let mut tracker = CalibrationTracker::new(CalibrationConfig::default());
        let votes = vec![Vote::new("a", Position::Yes, 0.5, "", BTreeMap::new()).unwrap()];
        let preview = tracker.preview_votes(&votes, 1.0);
        assert_eq!(preview[0].vote_count, 1);
        assert!(tracker.profile("a").is_none());

        tracker.merge_profiles(&preview);
        assert_eq!(tracker.profile("a"), Some(&preview[0]));
    }

    #[test]
    fn window_is_bounded() {
        let mut tracker = CalibrationTracker::new(CalibrationConfig::default());
        for _ in 0..80 {
            tracker.record_prediction(0.5, 1.0);
        }
        assert_eq!(tracker.window_len(), 55);
    }
}
