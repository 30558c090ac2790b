//! Contact details scraped from website HTML.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

const EXCERPT_CHARS: usize = 2000;

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"(?i)\b[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}\b").unwrap();

    // Danish numbers: optional +45, then eight digits in pairs or a block
    static ref PHONE_REGEX: Regex =
        Regex::new(r"(?:\+45[\s-]?)?\b(?:\d{2}[\s-]?){3}\d{2}\b").unwrap();

    static ref TITLE_REGEX: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>").unwrap();

    static ref SCRIPT_STYLE_REGEX: Regex =
        Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>").unwrap();

    static ref TAG_REGEX: Regex = Regex::new(r"(?s)<[^>]+>").unwrap();

    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

/// Asset filenames that look like addresses, e.g. `logo@2x.png`
const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteContent {
    pub url: String,
    pub title: Option<String>,
    /// Lowercased, first-seen order
    pub emails: Vec<String>,
    /// Eight-digit national numbers, first-seen order
    pub phones: Vec<String>,
    pub text_excerpt: String,
}

impl WebsiteContent {
    pub fn from_html(url: &str, html: &str) -> Self {
        let title = TITLE_REGEX
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| collapse(m.as_str()))
            .filter(|t| !t.is_empty());

        let mut emails: Vec<String> = Vec::new();
        for m in EMAIL_REGEX.find_iter(html) {
            let email = m.as_str().to_lowercase();
            if ASSET_SUFFIXES.iter().any(|s| email.ends_with(s)) {
                continue;
            }
            if !emails.contains(&email) {
                emails.push(email);
            }
        }

        let text = collapse(&TAG_REGEX.replace_all(&SCRIPT_STYLE_REGEX.replace_all(html, " "), " "));

        let mut phones: Vec<String> = Vec::new();
        for m in PHONE_REGEX.find_iter(&text) {
            let digits: String = m.as_str().chars().filter(char::is_ascii_digit).collect();
            let national = digits.strip_prefix("45").filter(|d| d.len() == 8).unwrap_or(&digits);
            if national.len() == 8 && !phones.iter().any(|p| p == national) {
                phones.push(national.to_string());
            }
        }

        Self {
            url: url.to_string(),
            title,
            emails,
            phones,
            text_excerpt: text.chars().take(EXCERPT_CHARS).collect(),
        }
    }

    pub fn has_contact_details(&self) -> bool {
        !self.emails.is_empty() || !self.phones.is_empty()
    }
}

fn collapse(s: &str) -> String {
    WHITESPACE_REGEX.replace_all(s, " ").trim().to_string()
}
