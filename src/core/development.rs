//! Critical periods: learning-rate scaling by accumulated experience.

use tracing::info;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::hebbian::{PlasticityEngine, PlasticityRates};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DevelopmentalPhase {
    Infant,
    Juvenile,
    Adolescent,
    Adult,
}

impl DevelopmentalPhase {
    pub fn from_experience(count: u64) -> Self {
        match count {
            0..=999 => Self::Infant,
            1_000..=9_999 => Self::Juvenile,
            10_000..=99_999 => Self::Adolescent,
            _ => Self::Adult,
        }
    }

    pub fn plasticity_multiplier(&self) -> f32 {
        match self {
            Self::Infant => 2.0,
            Self::Juvenile => 1.5,
            Self::Adolescent => 1.2,
            Self::Adult => 0.8,
        }
    }

    pub fn pruning_resistance(&self) -> f32 {
        match self {
            Self::Infant => 0.1,
            Self::Juvenile => 0.3,
            Self::Adolescent => 0.5,
            Self::Adult => 0.8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Infant => "infant",
            Self::Juvenile => "juvenile",
            Self::Adolescent => "adolescent",
            Self::Adult => "adult",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DevelopmentalController {
    experience_count: u64,
    phase: DevelopmentalPhase,
}

impl Default for DevelopmentalController {
    fn default() -> Self {
        Self::with_experience(0)
    }
}

impl DevelopmentalController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_experience(experience_count: u64) -> Self {
        Self {
            experience_count,
            phase: DevelopmentalPhase::from_experience(experience_count),
        }
    }

    pub fn experience_count(&self) -> u64 {
        self.experience_count
    }

    pub fn phase(&self) -> DevelopmentalPhase {
        self.phase
    }

    /// Count one experience. Returns the new phase when this crossed a
    /// boundary.
    pub fn record_experience(&mut self) -> Option<DevelopmentalPhase> {
        self.experience_count = self.experience_count.saturating_add(1);
        let next = DevelopmentalPhase::from_experience(self.experience_count);
        if next == self.phase {
            return None;
        }
        info!(
            from = self.phase.as_str(),
            to = next.as_str(),
            experience = self.experience_count,
            "developmental phase change"
        );
        self.phase = next;
        Some(next)
    }

    /// Phase-scaled rates derived from the engine's base config.
    pub fn effective_rates(&self, engine: &PlasticityEngine) -> PlasticityRates {
        let base = engine.base();
        let m = self.phase.plasticity_multiplier();
        PlasticityRates {
            strengthening_rate: base.strengthening_rate * m,
            weakening_rate: base.weakening_rate * (2.0 - m),
            pruning_threshold: base.pruning_threshold * self.phase.pruning_resistance(),
        }
    }

    /// Install the phase-scaled rates. Always recomputed from base rates, so
    /// calling this repeatedly does not compound.
    pub fn modulate(&self, engine: &mut PlasticityEngine) {
        let rates = self.effective_rates(engine);
        engine.set_rates(rates);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hebbian::HebbianConfig;

    #[test]
    fn phase_table() {
        let cases = [
            (0, DevelopmentalPhase::Infant, 2.0, 0.1),
            (999, DevelopmentalPhase::Infant, 2.0, 0.1),
            (1_000, DevelopmentalPhase::Juvenile, 1.5, 0.3),
            (10_000, DevelopmentalPhase::Adolescent, 1.2, 0.5),
            (100_000, DevelopmentalPhase::Adult, 0.8, 0.8),
        ];
        for (count, phase, mult, resist) in cases {
            let c = DevelopmentalController::with_experience(count);
            assert_eq!(c.phase(), phase);
            assert_eq!(c.phase().plasticity_multiplier(), mult);
            assert_eq!(c.phase().pruning_resistance(), resist);
        }
    }

    #[test]
    fn record_experience_reports_transitions() {
        let mut c = DevelopmentalController::with_experience(998);
        assert_eq!(c.record_experience(), None);
        assert_eq!(c.record_experience(), Some(DevelopmentalPhase::Juvenile));
        assert_eq!(c.experience_count(), 1_000);
        assert_eq!(c.record_experience(), None);
    }

    #[test]
    fn modulate_is_idempotent() {
        let mut engine = PlasticityEngine::new(HebbianConfig::default(), 1);
        let c = DevelopmentalController::new();
        c.modulate(&mut engine);
        let once = engine.rates();
        c.modulate(&mut engine);
        c.modulate(&mut engine);
        assert_eq!(engine.rates(), once);

        assert!((once.strengthening_rate - 0.2).abs() < 1e-6);
        assert!((once.weakening_rate - 0.0).abs() < 1e-6);
        assert!((once.pruning_threshold - 0.0001).abs() < 1e-7);
        assert_eq!(engine.base().strengthening_rate, 0.1);
    }

    #[test]
    fn adult_rates() {
        let mut engine = PlasticityEngine::new(HebbianConfig::default(), 1);
        DevelopmentalController::with_experience(250_000).modulate(&mut engine);
        let r = engine.rates();
        assert!((r.strengthening_rate - 0.08).abs() < 1e-6);
        assert!((r.weakening_rate - 0.06).abs() < 1e-6);
        assert!((r.pruning_threshold - 0.0008).abs() < 1e-7);
    }
}
