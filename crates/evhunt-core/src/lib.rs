//! Core domain model and classification rules for EV Price Hunt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "evhunt-core";

/// Sentinel model tag used when no model keyword matches.
pub const UNIVERSAL: &str = "universal";

/// Sentinel category used when no category keyword matches.
pub const OTHER_CATEGORY: &str = "other";

/// Match keys are capped so pathological titles cannot blow up the catalog key space.
pub const MATCH_KEY_MAX_LEN: usize = 100;

/// Canonical catalog entry. Serialized camelCase to match the on-disk
/// `latest.json` schema shared with the storefront.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub url: String,
    pub image: String,
    pub source: String,
    pub source_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub models: Vec<String>,
    pub category: String,
    pub match_key: String,
    pub scraped_at: DateTime<Utc>,
}

/// Raw price representation as it comes off the wire. The structured API
/// reports a decimal string, DOM extraction yields display text with
/// currency symbols, and either may be absent entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawPrice {
    Amount(f64),
    Text(String),
}

impl Default for RawPrice {
    fn default() -> Self {
        RawPrice::Text(String::new())
    }
}

/// Pre-normalization handoff contract from acquisition strategies into the
/// sync pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawListing {
    pub title: String,
    #[serde(default)]
    pub price: RawPrice,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub product_type: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A group of comparable listings sold by more than one store, annotated
/// with the spread between the cheapest and the most expensive offer.
/// Serialized camelCase to match the on-disk `matches.json` schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceMatch {
    pub match_key: String,
    pub category: String,
    pub models: Vec<String>,
    pub lowest_price: f64,
    pub highest_price: f64,
    pub savings: f64,
    pub savings_percent: u32,
    /// Member listings, cheapest first.
    pub products: Vec<Product>,
}

/// One vehicle-model compatibility rule: the tag plus the substrings that
/// imply it.
#[derive(Debug, Clone, Copy)]
pub struct ModelRule {
    pub tag: &'static str,
    pub keywords: &'static [&'static str],
}

/// One product-category rule. Declaration order is the priority order:
/// `detect_category` returns the first rule that matches.
#[derive(Debug, Clone, Copy)]
pub struct CategoryRule {
    pub tag: &'static str,
    pub keywords: &'static [&'static str],
}

/// Vehicle-model keyword table.
pub const MODEL_RULES: &[ModelRule] = &[
    ModelRule { tag: "model-3", keywords: &["model 3", "model3", "m3", "tesla 3"] },
    ModelRule { tag: "model-y", keywords: &["model y", "modely", "my", "tesla y"] },
    ModelRule { tag: "model-s", keywords: &["model s", "models", "ms", "tesla s"] },
    ModelRule { tag: "model-x", keywords: &["model x", "modelx", "mx", "tesla x"] },
    ModelRule { tag: "cybertruck", keywords: &["cybertruck", "cyber truck", "ct"] },
    ModelRule { tag: "highland", keywords: &["highland", "2024 model 3", "new model 3"] },
    ModelRule { tag: "juniper", keywords: &["juniper", "2025 model y", "new model y"] },
];

/// Product-category keyword table, most specific categories first.
pub const CATEGORY_RULES: &[CategoryRule] = &[
    CategoryRule {
        tag: "floor-mats",
        keywords: &["floor mat", "floor liner", "carpet", "all-weather mat"],
    },
    CategoryRule {
        tag: "screen-protector",
        keywords: &["screen protector", "tempered glass", "display protector"],
    },
    CategoryRule {
        tag: "center-console",
        keywords: &["center console", "console wrap", "armrest"],
    },
    CategoryRule {
        tag: "charging",
        keywords: &["charger", "charging", "wall connector", "mobile connector"],
    },
    CategoryRule {
        tag: "sunshade",
        keywords: &["sunshade", "sun shade", "windshield shade", "roof shade"],
    },
    CategoryRule { tag: "spoiler", keywords: &["spoiler", "wing", "lip spoiler"] },
    CategoryRule {
        tag: "wheel-covers",
        keywords: &["wheel cover", "hub cap", "aero cover"],
    },
    CategoryRule {
        tag: "lighting",
        keywords: &["led", "light", "puddle light", "ambient"],
    },
    CategoryRule {
        tag: "cargo-mats",
        keywords: &["cargo mat", "trunk liner", "cargo liner"],
    },
    CategoryRule { tag: "seat-covers", keywords: &["seat cover", "seat protector"] },
    CategoryRule { tag: "mud-flaps", keywords: &["mud flap", "splash guard"] },
    CategoryRule {
        tag: "phone-mount",
        keywords: &["phone mount", "phone holder", "magsafe"],
    },
];

/// Detect every vehicle model a listing is compatible with by substring
/// matching over the lowercased title + description. Returns the
/// `universal` sentinel when nothing matches, so the result is never empty.
pub fn detect_models(rules: &[ModelRule], title: &str, description: &str) -> Vec<String> {
    let text = format!("{} {}", title, description).to_lowercase();
    let matched: Vec<String> = rules
        .iter()
        .filter(|rule| rule.keywords.iter().any(|kw| text.contains(kw)))
        .map(|rule| rule.tag.to_string())
        .collect();
    if matched.is_empty() {
        vec![UNIVERSAL.to_string()]
    } else {
        matched
    }
}

/// Classify a listing into exactly one category. Categories are mutually
/// exclusive; ties resolve to the earliest-declared rule.
pub fn detect_category(rules: &[CategoryRule], title: &str, product_type: &str) -> String {
    let text = format!("{} {}", title, product_type).to_lowercase();
    rules
        .iter()
        .find(|rule| rule.keywords.iter().any(|kw| text.contains(kw)))
        .map(|rule| rule.tag.to_string())
        .unwrap_or_else(|| OTHER_CATEGORY.to_string())
}

/// Normalize a title into the dedup match key: lowercase, strip everything
/// outside `[a-z0-9 ]`, collapse whitespace, cap the length. Idempotent.
pub fn canonicalize_title(title: &str) -> String {
    let cleaned: String = title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect();
    let capped: String = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(MATCH_KEY_MAX_LEN)
        .collect();
    // Truncation can land on a word boundary and leave a trailing space.
    capped.trim_end().to_string()
}

/// Composite catalog key. Two records are the same product iff their keys
/// are equal.
pub fn product_key(source_id: &str, match_key: &str) -> String {
    format!("{source_id}:{match_key}")
}
