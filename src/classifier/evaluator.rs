//! Thresholding of classifier output, and project-name canonicalization.
//!
//! Both are pure: the evaluator never fails, it degrades. Anything the backend
//! returned that does not make sense (a confidence outside 0..=1, NaN, an
//! empty label) is treated as absent, which leaves the related flags unset.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ClassifierOutput;
use crate::db::models::EventClassification;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfidenceThresholds {
    /// At or above: set the flag without asking.
    pub auto_track: f64,
    /// At or above (and below `auto_track`): ask the user.
    pub candidate: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self {
            auto_track: 0.8,
            candidate: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Auto,
    Candidate,
    Below,
}

impl ConfidenceThresholds {
    fn band(&self, confidence: f64) -> Band {
        if confidence >= self.auto_track {
            Band::Auto
        } else if confidence >= self.candidate {
            Band::Candidate
        } else {
            Band::Below
        }
    }
}

fn valid_confidence(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && (0.0..=1.0).contains(v))
}

fn clean_label(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn clean_list(values: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(values.len());
    for value in values {
        let value = value.trim();
        if !value.is_empty() && !out.iter().any(|seen| seen.eq_ignore_ascii_case(value)) {
            out.push(value.to_string());
        }
    }
    out
}

pub fn addiction_prompt(candidate: &str) -> String {
    format!("Was this time spent on {candidate}?")
}

pub fn evaluate(output: &ClassifierOutput, thresholds: &ConfidenceThresholds) -> EventClassification {
    let mut result = EventClassification {
        category: clean_label(&output.category),
        subcategories: clean_list(&output.subcategories),
        caption: clean_label(&output.caption),
        tags: clean_list(&output.tags),
        confidence: valid_confidence(output.confidence),
        ..EventClassification::default()
    };

    let addiction = clean_label(&output.addiction_candidate);
    let addiction_confidence = valid_confidence(output.addiction_confidence);
    if let (Some(name), Some(confidence)) = (addiction, addiction_confidence) {
        result.addiction_confidence = Some(confidence);
        match thresholds.band(confidence) {
            Band::Auto => result.tracked_addiction = Some(name),
            Band::Candidate => {
                result.addiction_prompt = Some(addiction_prompt(&name));
                result.addiction_candidate = Some(name);
            }
            Band::Below => {}
        }
    }

    let project = clean_label(&output.project);
    let progress_confidence =
        valid_confidence(output.project_progress_confidence).or(result.confidence);
    if let (Some(project), Some(confidence)) = (project, progress_confidence) {
        result.project_progress_confidence = Some(confidence);
        match thresholds.band(confidence) {
            Band::Auto => {
                result.project = Some(project);
                result.project_progress = output.project_progress.unwrap_or(true);
                result.project_progress_evidence = clean_list(&output.evidence);
            }
            Band::Candidate => {
                result.project_progress_evidence = clean_list(&output.evidence);
            }
            Band::Below => {}
        }
    }

    result
}

/// Grouping key: trimmed, inner whitespace collapsed, lowercased.
pub fn normalization_key(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectNormalizationPlan {
    /// `(event_id, canonical_label)` for every row whose label changes.
    pub updates: Vec<(String, String)>,
    /// Groups that had at least one row re-pointed.
    pub groups: usize,
}

/// `rows` are `(event_id, project)` pairs in chronological order. The
/// canonical label of a group is its most frequent spelling, ties going to
/// the spelling seen first.
pub fn plan_project_normalization(rows: &[(String, String)]) -> ProjectNormalizationPlan {
    struct Group<'a> {
        spellings: Vec<(&'a str, usize)>,
        members: Vec<(&'a str, &'a str)>,
    }

    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Group> = HashMap::new();

    for (event_id, project) in rows {
        let key = normalization_key(project);
        if key.is_empty() {
            continue;
        }
        let group = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            Group {
                spellings: Vec::new(),
                members: Vec::new(),
            }
        });
        match group.spellings.iter_mut().find(|(s, _)| *s == project.as_str()) {
            Some((_, count)) => *count += 1,
            None => group.spellings.push((project.as_str(), 1)),
        }
        group.members.push((event_id.as_str(), project.as_str()));
    }

    let mut plan = ProjectNormalizationPlan::default();
    for key in order {
        let Some(group) = groups.get(&key) else {
            continue;
        };
        // `spellings` is in first-seen order; strict `>` keeps the earliest on ties
        let mut canonical = group.spellings[0];
        for spelling in &group.spellings[1..] {
            if spelling.1 > canonical.1 {
                canonical = *spelling;
            }
        }
        let canonical = canonical.0.trim();

        let before = plan.updates.len();
        for (event_id, project) in &group.members {
            if *project != canonical {
                plan.updates.push((event_id.to_string(), canonical.to_string()));
            }
        }
        if plan.updates.len() > before {
            plan.groups += 1;
        }
    }

    plan
}
