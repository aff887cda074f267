//! Per-run summary and the `reports/<run_id>/` artifacts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobsift_core::{Verdict, ALREADY_SEEN_LABEL};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

/// Share of third-tier verdicts above which the run is flagged as poorly calibrated.
pub const CALIBRATION_WARNING_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Rows pulled from the store for this run.
    pub candidates: usize,
    pub already_seen: usize,
    pub filtered: usize,
    /// Rows sent to inference.
    pub evaluated: usize,
    pub fallback_scored: usize,
    pub inference_failed: usize,
    pub checkpoints: usize,
    /// Verdict label -> count, rule rejections included.
    pub verdicts: BTreeMap<String, usize>,
    /// Provider id -> jobs it answered for.
    pub providers: BTreeMap<String, usize>,
}

impl RunSummary {
    pub fn new(run_id: Uuid, mode: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            mode: mode.into(),
            started_at: now,
            finished_at: now,
            candidates: 0,
            already_seen: 0,
            filtered: 0,
            evaluated: 0,
            fallback_scored: 0,
            inference_failed: 0,
            checkpoints: 0,
            verdicts: BTreeMap::new(),
            providers: BTreeMap::new(),
        }
    }

    pub fn record_verdict(&mut self, verdict: Verdict) {
        *self.verdicts.entry(verdict.label().to_string()).or_default() += 1;
    }

    pub fn verdict_count(&self, verdict: Verdict) -> usize {
        self.verdicts.get(verdict.label()).copied().unwrap_or(0)
    }

    pub fn high_tier_count(&self) -> usize {
        Verdict::ALL
            .iter()
            .filter(|v| v.is_high_tier())
            .map(|v| self.verdict_count(*v))
            .sum()
    }

    fn total_verdicts(&self) -> usize {
        self.verdicts.values().sum()
    }

    pub fn calibration_warning(&self) -> Option<String> {
        let total = self.total_verdicts();
        if total == 0 {
            return None;
        }
        let share = self.verdict_count(Verdict::WorthConsidering) as f64 / total as f64;
        (share > CALIBRATION_WARNING_SHARE).then(|| {
            format!(
                "{:.0}% of jobs landed in {}. Consider few-shot examples or a tighter overlap rule in the prompt.",
                share * 100.0,
                Verdict::WorthConsidering.label()
            )
        })
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn daily_brief(&self) -> String {
        let total = self.total_verdicts();
        let distribution = Verdict::ALL
            .iter()
            .map(|v| {
                let n = self.verdict_count(*v);
                let pct = if total == 0 { 0.0 } else { 100.0 * n as f64 / total as f64 };
                format!("- {}: {} ({:.0}%)", v.label(), n, pct)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let providers = if self.providers.is_empty() {
            "- none".to_string()
        } else {
            self.providers
                .iter()
                .map(|(k, v)| format!("- {k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let mut brief = format!(
            "# Jobsift Daily Brief\n\n- Run ID: `{}`\n- Mode: {}\n- Started: {}\n- Finished: {}\n- Candidates: {}\n- {}: {}\n- Filtered: {}\n- Evaluated: {}\n- Fallback scored: {}\n- Inference failed: {}\n\n## Verdict Distribution\n{}\n\n## Providers\n{}\n",
            self.run_id,
            self.mode,
            self.started_at,
            self.finished_at,
            self.candidates,
            ALREADY_SEEN_LABEL,
            self.already_seen,
            self.filtered,
            self.evaluated,
            self.fallback_scored,
            self.inference_failed,
            distribution,
            providers,
        );
        if let Some(warning) = self.calibration_warning() {
            brief.push_str(&format!("\n## Calibration Warning\n{warning}\n"));
        }
        brief
    }
}

/// Write `daily_brief.md` and `run_summary.json` under `reports_dir/<run_id>/`.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    fs::write(dir.join("daily_brief.md"), summary.daily_brief())
        .await
        .context("writing daily_brief.md")?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn warns_when_third_tier_dominates() {
        let mut summary = RunSummary::new(Uuid::new_v4(), "NEW");
        for _ in 0..9 {
            summary.record_verdict(Verdict::WorthConsidering);
        }
        summary.record_verdict(Verdict::StrongMatch);
        assert!(summary.calibration_warning().is_some());
        assert_eq!(summary.high_tier_count(), 1);

        summary.record_verdict(Verdict::AutoApply);
        summary.record_verdict(Verdict::No);
        assert!(summary.calibration_warning().is_none(), "9 of 12 is 75%");
    }

    #[tokio::test]
    async fn report_files_land_in_run_directory() {
        let dir = tempdir().expect("tempdir");
        let mut summary = RunSummary::new(Uuid::new_v4(), "NEW");
        summary.record_verdict(Verdict::AutoApply);
        summary.providers.insert("GEMINI".into(), 1);
        summary.finish();

        let out = write_run_report(dir.path(), &summary).await.expect("report");
        assert!(out.ends_with(summary.run_id.to_string()));
        let brief = std::fs::read_to_string(out.join("daily_brief.md")).unwrap();
        assert!(brief.contains("- 🔥 Auto-Apply: 1 (100%)"));
        assert!(brief.contains("- GEMINI: 1"));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(out.join("run_summary.json")).unwrap()).unwrap();
        assert_eq!(json["verdicts"]["🔥 Auto-Apply"], 1);
    }
}
