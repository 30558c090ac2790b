//! Screening and heuristic scoring of raw permits.
//!
//! Local, synchronous and deterministic; the pipeline calls these between
//! its IO steps.

use crate::config::DiscoveryConfig;
use crate::identity::normalize_address;
use crate::staging::PropertySource;

use super::RawPermit;

const BASE_SCORE: i32 = 5;

const SCAFFOLDING_TERMS: &[&str] = &["stillads", "scaffold", "facade"];

/// Result of screening one raw permit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screening {
    Accept,
    /// Malformed source data
    Invalid(String),
    /// Valid but not a lead
    Filtered(String),
}

pub fn screen(permit: &RawPermit, config: &DiscoveryConfig) -> Screening {
    if normalize_address(&permit.address).is_empty() {
        return Screening::Invalid("missing address".into());
    }
    if let Some(days) = permit.duration_days() {
        if days < 0 {
            return Screening::Invalid("permit ends before it starts".into());
        }
        if days < config.min_permit_days {
            return Screening::Filtered(format!(
                "permit runs {} days, minimum is {}",
                days, config.min_permit_days
            ));
        }
    }

    if !config.permit_keywords.is_empty() {
        let text = permit_text(permit);
        let matched = config
            .permit_keywords
            .iter()
            .any(|k| text.contains(&k.to_lowercase()));
        if !matched {
            return Screening::Filtered(format!("permit type {:?} not targeted", permit.permit_type));
        }
    }

    Screening::Accept
}

fn permit_text(permit: &RawPermit) -> String {
    let mut text = permit.permit_type.to_lowercase();
    if let Some(description) = &permit.description {
        text.push(' ');
        text.push_str(&description.to_lowercase());
    }
    text
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicScore {
    /// 1-10
    pub score: u8,
    pub reasons: Vec<String>,
}

impl HeuristicScore {
    pub fn reason(&self) -> String {
        self.reasons.join("; ")
    }
}

/// Outdoor advertising potential from traffic, permit duration and
/// visible scaffolding.
pub fn heuristic_score(permit: &RawPermit, source: PropertySource) -> HeuristicScore {
    let mut score = BASE_SCORE;
    let mut reasons = vec![format!("base {}", BASE_SCORE)];

    match permit.traffic_estimate {
        Some(t) if t >= 20_000 => {
            score += 3;
            reasons.push(format!("very high traffic ({}/day) +3", t));
        }
        Some(t) if t >= 10_000 => {
            score += 2;
            reasons.push(format!("high traffic ({}/day) +2", t));
        }
        Some(t) if t >= 5_000 => {
            score += 1;
            reasons.push(format!("moderate traffic ({}/day) +1", t));
        }
        _ => {}
    }

    match permit.duration_days() {
        Some(d) if d >= 180 => {
            score += 2;
            reasons.push(format!("long permit ({} days) +2", d));
        }
        Some(d) if d >= 90 => {
            score += 1;
            reasons.push(format!("permit {} days +1", d));
        }
        _ => {}
    }

    let text = permit_text(permit);
    if source == PropertySource::Scaffolding || SCAFFOLDING_TERMS.iter().any(|t| text.contains(t)) {
        score += 1;
        reasons.push("scaffolding on facade +1".into());
    }

    HeuristicScore {
        score: score.clamp(1, 10) as u8,
        reasons,
    }
}
