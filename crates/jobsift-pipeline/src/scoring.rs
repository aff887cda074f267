//! Score to verdict mapping, the heuristic fallback scorer and the deterministic sort order.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use jobsift_core::{JobRecord, MatchType, Verdict};
use serde::{Deserialize, Serialize};

use crate::filter::KeywordSet;

pub const AUTO_APPLY_MIN: u8 = 85;
pub const STRONG_MATCH_MIN: u8 = 70;
pub const WORTH_CONSIDERING_MIN: u8 = 50;

/// The only place a numeric score becomes a verdict.
pub fn score_to_verdict(score: u8) -> Verdict {
    match score {
        s if s >= AUTO_APPLY_MIN => Verdict::AutoApply,
        s if s >= STRONG_MATCH_MIN => Verdict::StrongMatch,
        s if s >= WORTH_CONSIDERING_MIN => Verdict::WorthConsidering,
        _ => Verdict::No,
    }
}

/// Fallback-scorer constants, region priorities and role-affinity markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub points_per_keyword: u32,
    pub overlap_cap: u32,
    pub top_region_bonus: u32,
    pub secondary_region_bonus: u32,
    pub top_regions: Vec<String>,
    pub secondary_regions: Vec<String>,
    /// Keyword overlap at which the prompt tells the model to rate at least the second tier.
    pub overlap_nudge_threshold: usize,
    /// Title phrases of the core target roles.
    pub core_title_markers: Vec<String>,
    /// Recommended-role tokens of the core target roles.
    pub core_role_markers: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            points_per_keyword: 10,
            overlap_cap: 50,
            top_region_bonus: 20,
            secondary_region_bonus: 10,
            top_regions: ["texas", "tx", "dallas", "austin", "houston", "san antonio"]
                .into_iter()
                .map(String::from)
                .collect(),
            secondary_regions: ["remote", "dubai", "uae"]
                .into_iter()
                .map(String::from)
                .collect(),
            overlap_nudge_threshold: 5,
            core_title_markers: ["product manager", "tpm", "product owner"]
                .into_iter()
                .map(String::from)
                .collect(),
            core_role_markers: ["tpm", "po"].into_iter().map(String::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationPriority {
    Top,
    Secondary,
    Standard,
}

impl LocationPriority {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Top => "Top priority region",
            Self::Secondary => "Secondary priority region",
            Self::Standard => "Standard region",
        }
    }
}

/// Compiled [`ScoringConfig`].
#[derive(Debug, Clone)]
pub struct Scorer {
    config: ScoringConfig,
    top_regions: KeywordSet,
    secondary_regions: KeywordSet,
    core_titles: KeywordSet,
    core_roles: KeywordSet,
}

impl Default for Scorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            top_regions: KeywordSet::new(&config.top_regions, false),
            secondary_regions: KeywordSet::new(&config.secondary_regions, false),
            core_titles: KeywordSet::new(&config.core_title_markers, false),
            core_roles: KeywordSet::new(&config.core_role_markers, true),
            config,
        }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn location_priority(&self, location: &str) -> LocationPriority {
        let location = location.to_lowercase();
        if self.top_regions.first_in(&location).is_some() {
            LocationPriority::Top
        } else if self.secondary_regions.first_in(&location).is_some() {
            LocationPriority::Secondary
        } else {
            LocationPriority::Standard
        }
    }

    /// Number of profile keywords occurring in `description`.
    pub fn keyword_overlap(&self, description: &str, keywords: &BTreeSet<String>) -> usize {
        if keywords.is_empty() {
            return 0;
        }
        let description = description.to_lowercase();
        keywords
            .iter()
            .filter(|kw| description.contains(kw.as_str()))
            .count()
    }

    /// Deterministic score used whenever the model did not provide one.
    pub fn fallback_score(
        &self,
        description: &str,
        location: &str,
        keywords: &BTreeSet<String>,
    ) -> u8 {
        let overlap = self.keyword_overlap(description, keywords) as u32;
        let overlap_points = overlap
            .saturating_mul(self.config.points_per_keyword)
            .min(self.config.overlap_cap);
        let bonus = match self.location_priority(location) {
            LocationPriority::Top => self.config.top_region_bonus,
            LocationPriority::Secondary => self.config.secondary_region_bonus,
            LocationPriority::Standard => 0,
        };
        overlap_points.saturating_add(bonus).min(100) as u8
    }

    pub fn needs_overlap_nudge(&self, overlap: usize) -> bool {
        self.config.overlap_nudge_threshold > 0 && overlap >= self.config.overlap_nudge_threshold
    }

    /// `0` for core target roles, `1` for everything else.
    pub fn role_affinity(&self, record: &JobRecord) -> u8 {
        let title = record.title.to_lowercase();
        let recommended = record
            .evaluation
            .as_ref()
            .map(|e| e.recommended_role.to_lowercase())
            .unwrap_or_default();
        if self.core_titles.first_in(&title).is_some()
            || self.core_roles.first_in(&recommended).is_some()
        {
            0
        } else {
            1
        }
    }

    /// Score descending, then verdict tier, then role affinity.
    pub fn sort_key(&self, record: &JobRecord) -> (Reverse<u8>, u8, u8) {
        let score = record
            .evaluation
            .as_ref()
            .and_then(|e| e.score)
            .unwrap_or(0);
        let priority = record
            .match_type
            .as_ref()
            .map(MatchType::sort_priority)
            .unwrap_or(99);
        (Reverse(score), priority, self.role_affinity(record))
    }

    /// Stable, so rows with equal keys keep their stored order.
    pub fn sort_records(&self, records: &mut [JobRecord]) {
        records.sort_by_key(|r| self.sort_key(r));
    }
}
