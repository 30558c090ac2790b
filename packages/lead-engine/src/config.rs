use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use typed_builder::TypedBuilder;

/// Engine configuration loaded from environment variables
#[derive(Debug, Clone, Default, TypedBuilder)]
pub struct Config {
    #[builder(default)]
    pub dispatch: DispatchConfig,
    #[builder(default)]
    pub workflow: WorkflowConfig,
    #[builder(default)]
    pub discovery: DiscoveryConfig,
    /// Only used by the Postgres staging store
    #[builder(default, setter(into, strip_option))]
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct DispatchConfig {
    #[builder(default = 200)]
    pub rate_limit_per_hour: u32,
    /// Send attempts before a message is marked failed
    #[builder(default = 3)]
    pub max_attempts: u32,
    /// Sent and failed messages kept for `message(id)` lookups
    #[builder(default = 10_000)]
    pub retained_messages: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct WorkflowConfig {
    /// Attempts per collaborator call on transient errors
    #[builder(default = 3)]
    pub step_max_attempts: u32,
    /// Multiplied by the attempt number between retries
    #[builder(default = Duration::from_millis(500))]
    pub retry_backoff: Duration,
    #[builder(default = chrono::Duration::minutes(30))]
    pub stale_run_timeout: chrono::Duration,
    #[builder(default = 0.7)]
    pub contact_confidence_threshold: f32,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[derive(Debug, Clone, TypedBuilder)]
pub struct DiscoveryConfig {
    #[builder(default = 6)]
    pub min_outdoor_score: u8,
    /// Shorter permits are not worth a campaign
    #[builder(default = 14)]
    pub min_permit_days: i64,
    /// LLM scores below this confidence fall back to the heuristic
    #[builder(default = 0.6)]
    pub llm_confidence_threshold: f32,
    #[builder(default = default_permit_keywords(), setter(into))]
    pub permit_keywords: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn default_permit_keywords() -> Vec<String> {
    ["stillads", "facade", "byggeplads", "tagrenovering", "afspaerring"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", key, raw)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same parsing as [`Config::from_env`] over any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let dispatch_defaults = DispatchConfig::default();
        let workflow_defaults = WorkflowConfig::default();
        let discovery_defaults = DiscoveryConfig::default();

        let dispatch = DispatchConfig {
            rate_limit_per_hour: parse_or(
                &lookup,
                "DISPATCH_RATE_LIMIT_PER_HOUR",
                dispatch_defaults.rate_limit_per_hour,
            )?,
            max_attempts: parse_or(&lookup, "DISPATCH_MAX_ATTEMPTS", dispatch_defaults.max_attempts)?,
            retained_messages: parse_or(
                &lookup,
                "DISPATCH_RETAINED_MESSAGES",
                dispatch_defaults.retained_messages,
            )?,
        };

        let workflow = WorkflowConfig {
            step_max_attempts: parse_or(
                &lookup,
                "WORKFLOW_STEP_MAX_ATTEMPTS",
                workflow_defaults.step_max_attempts,
            )?,
            retry_backoff: Duration::from_millis(parse_or(
                &lookup,
                "WORKFLOW_RETRY_BACKOFF_MS",
                workflow_defaults.retry_backoff.as_millis() as u64,
            )?),
            stale_run_timeout: chrono::Duration::minutes(parse_or(
                &lookup,
                "WORKFLOW_STALE_RUN_MINUTES",
                workflow_defaults.stale_run_timeout.num_minutes(),
            )?),
            contact_confidence_threshold: parse_or(
                &lookup,
                "WORKFLOW_CONTACT_CONFIDENCE",
                workflow_defaults.contact_confidence_threshold,
            )?,
        };

        let min_outdoor_score: u8 = parse_or(
            &lookup,
            "DISCOVERY_MIN_OUTDOOR_SCORE",
            discovery_defaults.min_outdoor_score,
        )?;
        if !(1..=10).contains(&min_outdoor_score) {
            anyhow::bail!("DISCOVERY_MIN_OUTDOOR_SCORE must be between 1 and 10");
        }

        let discovery = DiscoveryConfig {
            min_outdoor_score,
            min_permit_days: parse_or(
                &lookup,
                "DISCOVERY_MIN_PERMIT_DAYS",
                discovery_defaults.min_permit_days,
            )?,
            llm_confidence_threshold: parse_or(
                &lookup,
                "DISCOVERY_LLM_CONFIDENCE",
                discovery_defaults.llm_confidence_threshold,
            )?,
            permit_keywords: lookup("DISCOVERY_PERMIT_KEYWORDS")
                .map(|raw| {
                    raw.split(',')
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect()
                })
                .unwrap_or(discovery_defaults.permit_keywords),
        };

        Ok(Self {
            dispatch,
            workflow,
            discovery,
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.dispatch.rate_limit_per_hour, 200);
        assert_eq!(config.dispatch.max_attempts, 3);
        assert_eq!(config.dispatch.retained_messages, 10_000);
        assert_eq!(config.workflow.retry_backoff, Duration::from_millis(500));
        assert_eq!(config.workflow.stale_run_timeout, chrono::Duration::minutes(30));
        assert_eq!(config.discovery.min_outdoor_score, 6);
        assert!(config.discovery.permit_keywords.contains(&"stillads".to_string()));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("DISPATCH_RATE_LIMIT_PER_HOUR", "50"),
            ("WORKFLOW_RETRY_BACKOFF_MS", "0"),
            ("DISCOVERY_PERMIT_KEYWORDS", "Stillads, kran ,,"),
            ("DATABASE_URL", "postgres://localhost/leads"),
        ]))
        .unwrap();

        assert_eq!(config.dispatch.rate_limit_per_hour, 50);
        assert_eq!(config.workflow.retry_backoff, Duration::ZERO);
        assert_eq!(config.discovery.permit_keywords, vec!["stillads", "kran"]);
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/leads")
        );
    }

    #[test]
    fn bad_numbers_are_reported_with_the_key() {
        let err = Config::from_lookup(lookup(&[("DISPATCH_MAX_ATTEMPTS", "three")])).unwrap_err();
        assert!(err.to_string().contains("DISPATCH_MAX_ATTEMPTS"));

        assert!(Config::from_lookup(lookup(&[("DISCOVERY_MIN_OUTDOOR_SCORE", "11")])).is_err());
    }
}
