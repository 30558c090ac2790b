//! Property identity and deduplication.
//!
//! Every property is keyed by a [`CanonicalKey`]: `bfe:<number>` when the
//! national BFE identifier is known, otherwise `addr:<normalized address>`.
//! Normalization rules:
//! - Lowercase and trim
//! - Collapse runs of whitespace into single spaces
//! - Strip a trailing country suffix (`Danmark`, `Denmark`, `DK`)
//! - Remove trailing commas
//! - Expand a fixed set of Danish street abbreviations (`gl.` -> `gammel`, `pl.` -> `plads`, ...)

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

lazy_static! {
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();

    // Country suffix, only when separated from the address by a comma or space
    static ref COUNTRY_SUFFIX: Regex =
        Regex::new(r"(?:^|[,\s])\s*(?:danmark|denmark|dk)$").unwrap();
}

/// Abbreviation -> canonical token. Outputs never match an input, so the
/// expansion is idempotent.
const STREET_ABBREVIATIONS: &[(&str, &str)] = &[
    ("gl.", "gammel"),
    ("skt.", "sankt"),
    ("sct.", "sankt"),
    ("kgs.", "kongens"),
    ("ndr.", "nørre"),
    ("nr.", "nørre"),
    ("sdr.", "søndre"),
    ("vj.", "vej"),
    ("gd.", "gade"),
    ("pl.", "plads"),
    ("bvd.", "boulevard"),
    ("boul.", "boulevard"),
    ("alle", "allé"),
];

/// Normalize an address into its comparison form.
///
/// Deterministic and idempotent: `normalize_address(&normalize_address(x)) == normalize_address(x)`.
pub fn normalize_address(address: &str) -> String {
    let lowered = address.to_lowercase();
    let mut text = WHITESPACE.replace_all(lowered.trim(), " ").into_owned();

    loop {
        let stripped = COUNTRY_SUFFIX.replace(&text, "").into_owned();
        let stripped = stripped.trim_end_matches([',', ' ']).to_string();
        if stripped == text {
            break;
        }
        text = stripped;
    }

    text.split(' ')
        .filter(|token| !token.is_empty())
        .map(expand_abbreviation)
        .collect::<Vec<_>>()
        .join(" ")
}

fn expand_abbreviation(token: &str) -> &str {
    STREET_ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, full)| *full)
        .unwrap_or(token)
}

/// Derived deduplication key for a property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the key was derived from a BFE number.
    pub fn is_bfe(&self) -> bool {
        self.0.starts_with("bfe:")
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the canonical key. A present BFE always wins over the address.
pub fn canonical_key(address: &str, bfe: Option<&str>) -> CanonicalKey {
    match clean_bfe(bfe) {
        Some(bfe) => CanonicalKey(format!("bfe:{}", bfe)),
        None => CanonicalKey(format!("addr:{}", normalize_address(address))),
    }
}

fn clean_bfe(bfe: Option<&str>) -> Option<&str> {
    bfe.map(str::trim).filter(|b| !b.is_empty())
}

/// Anything that carries property identity fields.
pub trait PropertyIdentity {
    fn address(&self) -> &str;

    fn bfe(&self) -> Option<&str>;

    fn canonical_key(&self) -> CanonicalKey {
        canonical_key(self.address(), self.bfe())
    }
}

impl<T: PropertyIdentity + ?Sized> PropertyIdentity for &T {
    fn address(&self) -> &str {
        (**self).address()
    }

    fn bfe(&self) -> Option<&str> {
        (**self).bfe()
    }
}

/// Whether two records describe the same physical property.
///
/// When both carry a BFE the BFEs decide, even if the addresses agree.
/// Otherwise the normalized addresses decide.
pub fn same_property<A, B>(a: &A, b: &B) -> bool
where
    A: PropertyIdentity + ?Sized,
    B: PropertyIdentity + ?Sized,
{
    match (clean_bfe(a.bfe()), clean_bfe(b.bfe())) {
        (Some(left), Some(right)) => left == right,
        _ => normalize_address(a.address()) == normalize_address(b.address()),
    }
}

/// Stable dedup: the first record for each canonical key survives, later
/// duplicates are dropped, relative order is preserved.
pub fn deduplicate<T, I>(records: I) -> Vec<T>
where
    T: PropertyIdentity,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|record| seen.insert(record.canonical_key()))
        .collect()
}
