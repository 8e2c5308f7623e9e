//! Multi-factor scoring and allocation math
//!
//! Pure functions: the allocation loop feeds observed candidates in and
//! publishes the returned allocations. Weights and factor definitions:
//!
//! `score = 0.40·priority + 0.15·log2(1+size) + 0.15·type + 0.15·activity
//!          + 0.15·responsiveness`

use crate::config::ArbiterConfig;
use crate::types::{Allocation, DownloadId};
use std::collections::HashMap;

const WEIGHT_PRIORITY: f64 = 0.40;
const WEIGHT_SIZE: f64 = 0.15;
const WEIGHT_TYPE: f64 = 0.15;
const WEIGHT_ACTIVITY: f64 = 0.15;
const WEIGHT_RESPONSIVENESS: f64 = 0.15;

/// Activity normalization ceiling: 100 MiB of recent I/O saturates the factor
const ACTIVITY_CEILING: f64 = 100.0 * 1024.0 * 1024.0;

/// Candidate class, which fixes the type factor and the default priority
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CandidateKind {
    /// Tracked download below the large threshold
    Small,
    /// This system's own in-flight work
    Installer,
    /// Known large downloader process
    Large,
}

impl CandidateKind {
    fn type_factor(self) -> f64 {
        match self {
            CandidateKind::Small => 1.0,
            CandidateKind::Installer => 1.5,
            CandidateKind::Large => 2.0,
        }
    }

    fn default_priority(self) -> u8 {
        match self {
            CandidateKind::Small => 2,
            CandidateKind::Installer => 2,
            CandidateKind::Large => 3,
        }
    }
}

/// One allocation candidate as observed this tick
#[derive(Clone, Debug)]
pub struct Candidate {
    /// Record id for pool-tracked downloads
    pub id: Option<DownloadId>,
    /// Process name, or `"installer"`
    pub name: String,
    /// PID for observed processes
    pub pid: Option<u32>,
    /// Candidate class
    pub kind: CandidateKind,
    /// Cumulative transferred bytes (size factor input)
    pub size_bytes: u64,
    /// Recent I/O bytes (activity factor input)
    pub recent_io_bytes: u64,
    /// CPU-user saturation in 0..=1; responsiveness is its complement
    pub cpu_saturation: f64,
}

impl Candidate {
    /// The synthetic candidate representing this system's own work.
    pub fn installer() -> Self {
        Self {
            id: None,
            name: "installer".to_string(),
            pid: None,
            kind: CandidateKind::Installer,
            size_bytes: 0,
            recent_io_bytes: 0,
            cpu_saturation: 0.0,
        }
    }

    fn priority(&self, overrides: &HashMap<String, u8>) -> f64 {
        overrides
            .get(&self.name)
            .copied()
            .unwrap_or_else(|| self.kind.default_priority())
            .min(10) as f64
    }

    fn size_factor(&self) -> f64 {
        if self.size_bytes == 0 {
            0.0
        } else {
            ((self.size_bytes + 1) as f64).log2()
        }
    }

    fn activity_factor(&self) -> f64 {
        match self.kind {
            // The installer's activity is represented as a neutral midpoint
            CandidateKind::Installer => 0.5,
            _ => (self.recent_io_bytes as f64 / ACTIVITY_CEILING).min(1.0),
        }
    }

    fn responsiveness_factor(&self) -> f64 {
        match self.kind {
            CandidateKind::Installer => 1.0,
            _ => (1.0 - self.cpu_saturation.clamp(0.0, 1.0)).max(0.0),
        }
    }

    /// The weighted multi-factor score.
    pub fn score(&self, overrides: &HashMap<String, u8>) -> f64 {
        WEIGHT_PRIORITY * self.priority(overrides)
            + WEIGHT_SIZE * self.size_factor()
            + WEIGHT_TYPE * self.kind.type_factor()
            + WEIGHT_ACTIVITY * self.activity_factor()
            + WEIGHT_RESPONSIVENESS * self.responsiveness_factor()
    }
}

/// Inputs that modulate a tick's allocation
#[derive(Clone, Copy, Debug, Default)]
pub struct AllocationMods {
    /// System is idle: lift every assignment to the burst floor
    pub idle_burst: bool,
    /// Interactive override: shrink non-game assignments to reserve the
    /// configured game band
    pub game_override: bool,
}

/// Apportion `available_bps` across candidates.
///
/// Every candidate is guaranteed the configured minimum; idle burst may push
/// the sum past `available_bps` intentionally.
pub fn allocate(
    candidates: &[Candidate],
    available_bps: u64,
    overrides: &HashMap<String, u8>,
    config: &ArbiterConfig,
    mods: AllocationMods,
) -> Vec<Allocation> {
    let scores: Vec<f64> = candidates.iter().map(|c| c.score(overrides)).collect();
    let total_score: f64 = scores.iter().sum();

    let game_scale = if mods.game_override {
        let usable = available_bps.saturating_sub(config.game_reserved_bps);
        usable as f64 / available_bps.max(1) as f64
    } else {
        1.0
    };

    candidates
        .iter()
        .zip(scores)
        .map(|(c, score)| {
            let base = if total_score > 0.0 {
                (available_bps as f64 * (score / total_score)) as u64
            } else {
                0
            };
            let mut assigned = base.max(config.min_allocation_bps);
            if mods.idle_burst {
                assigned = assigned.max(config.burst_allocation_bps);
            }
            if mods.game_override {
                assigned = ((assigned as f64 * game_scale) as u64)
                    .max(config.min_allocation_bps);
            }
            Allocation {
                id: c.id,
                name: c.name.clone(),
                pid: c.pid,
                score,
                assigned_bps: assigned,
                assigned_percent: if available_bps > 0 {
                    (assigned as f64 / available_bps as f64 * 10_000.0).round() / 100.0
                } else {
                    0.0
                },
            }
        })
        .collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;

    fn small(name: &str) -> Candidate {
        Candidate {
            id: Some(DownloadId::new()),
            name: name.to_string(),
            pid: None,
            kind: CandidateKind::Small,
            size_bytes: 10 * MIB,
            recent_io_bytes: 0,
            cpu_saturation: 0.5,
        }
    }

    #[test]
    fn test_installer_candidate_score_components() {
        let c = Candidate::installer();
        let overrides = HashMap::new();
        // 0.4*2 + 0.15*0 + 0.15*1.5 + 0.15*0.5 + 0.15*1.0
        let expected = 0.4 * 2.0 + 0.15 * 1.5 + 0.15 * 0.5 + 0.15;
        assert!((c.score(&overrides) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_priority_override_applies() {
        let c = small("curl");
        let mut overrides = HashMap::new();
        let base = c.score(&overrides);
        overrides.insert("curl".to_string(), 10);
        let boosted = c.score(&overrides);
        assert!((boosted - base - 0.4 * 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_priority_override_clamped_to_ten() {
        let c = small("x");
        let mut overrides = HashMap::new();
        overrides.insert("x".to_string(), 200);
        let clamped = c.score(&overrides);
        overrides.insert("x".to_string(), 10);
        assert_eq!(clamped, c.score(&overrides));
    }

    #[test]
    fn test_allocation_proportional_to_score() {
        let config = ArbiterConfig::default();
        let mut a = small("a");
        let mut b = small("b");
        a.cpu_saturation = 0.0;
        b.cpu_saturation = 0.0;
        let mut overrides = HashMap::new();
        overrides.insert("a".to_string(), 5);
        overrides.insert("b".to_string(), 3);

        let available = 100 * MIB;
        let allocs = allocate(
            &[a, b],
            available,
            &overrides,
            &config,
            AllocationMods::default(),
        );

        // Identical apart from priority, so shares track scores
        let ratio = allocs[0].assigned_bps as f64 / allocs[1].assigned_bps as f64;
        let score_ratio = allocs[0].score / allocs[1].score;
        assert!(
            (ratio - score_ratio).abs() / score_ratio < 0.05,
            "assignment ratio {ratio:.3} should track score ratio {score_ratio:.3}"
        );
        assert!(allocs.iter().all(|x| x.assigned_bps >= config.min_allocation_bps));
        assert!(
            allocs.iter().map(|x| x.assigned_bps).sum::<u64>() <= available + MIB,
            "steady allocation must not exceed measured bandwidth"
        );
    }

    #[test]
    fn test_minimum_guarantee() {
        let config = ArbiterConfig::default();
        let candidates: Vec<Candidate> = (0..100).map(|i| small(&format!("c{i}"))).collect();
        let allocs = allocate(
            &candidates,
            10 * MIB,
            &HashMap::new(),
            &config,
            AllocationMods::default(),
        );
        for a in &allocs {
            assert!(
                a.assigned_bps >= 2 * MIB,
                "{} got {} < 2 MiB/s minimum",
                a.name,
                a.assigned_bps
            );
        }
    }

    #[test]
    fn test_idle_burst_lifts_to_floor() {
        let config = ArbiterConfig::default();
        let allocs = allocate(
            &[small("only")],
            5 * MIB,
            &HashMap::new(),
            &config,
            AllocationMods {
                idle_burst: true,
                game_override: false,
            },
        );
        assert!(
            allocs[0].assigned_bps >= config.burst_allocation_bps,
            "idle burst must lift the assignment to at least 20 MiB/s"
        );
    }

    #[test]
    fn test_game_override_shrinks_assignments() {
        let config = ArbiterConfig::default();
        let available = 100 * MIB;
        let steady = allocate(
            &[small("dl")],
            available,
            &HashMap::new(),
            &config,
            AllocationMods::default(),
        );
        let gamed = allocate(
            &[small("dl")],
            available,
            &HashMap::new(),
            &config,
            AllocationMods {
                idle_burst: false,
                game_override: true,
            },
        );
        assert!(
            gamed[0].assigned_bps < steady[0].assigned_bps,
            "interactive override must reduce non-game assignments"
        );
        assert!(gamed[0].assigned_bps >= config.min_allocation_bps);
    }

    #[test]
    fn test_zero_total_score_degenerates_to_minimum() {
        let config = ArbiterConfig::default();
        let allocs = allocate(&[], 100 * MIB, &HashMap::new(), &config, AllocationMods::default());
        assert!(allocs.is_empty());
    }
}
