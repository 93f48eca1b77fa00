use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::types::Item;

/// Keyword rules deciding whether a device counts as a speaker.
///
/// Loaded from TOML, e.g.:
///
/// ```toml
/// type_attribute = "InformaCastDeviceType"
/// exclude_types = ["CISCO"]
/// exclude_descriptions = ["SEP"]
/// include_types = ["ADVANCED", "IPSPEAKER", "SPEAKER"]
/// include_descriptions = ["AND ", "SPEAKER", "CLOCK"]
/// name_fallback = "Unnamed device"
/// ```
///
/// Missing keys fall back to the defaults. Keywords are matched
/// case-insensitively and are not trimmed, so `"AND "` keeps its space.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierRules {
    /// Attribute holding the device type label.
    pub type_attribute: String,
    /// Attribute holding the device IP address.
    pub ip_attribute: String,
    pub exclude_types: Vec<String>,
    pub exclude_descriptions: Vec<String>,
    pub include_types: Vec<String>,
    pub include_descriptions: Vec<String>,
    /// Dashboard name for a device without a description.
    pub name_fallback: String,
    /// Dashboard model for a device without a type label.
    pub model_fallback: String,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        fn owned(words: &[&str]) -> Vec<String> {
            words.iter().map(|w| w.to_string()).collect()
        }
        Self {
            type_attribute: "InformaCastDeviceType".to_string(),
            ip_attribute: "IPAddress".to_string(),
            exclude_types: owned(&["CISCO"]),
            exclude_descriptions: owned(&["SEP"]),
            include_types: owned(&["ADVANCED", "IPSPEAKER", "SPEAKER"]),
            include_descriptions: owned(&["AND ", "SPEAKER", "CLOCK"]),
            name_fallback: "Unnamed device".to_string(),
            model_fallback: "Unknown".to_string(),
        }
    }
}

/// Parse rules from TOML text.
pub fn parse_rules_str(s: &str) -> Result<ClassifierRules> {
    let rules: ClassifierRules = toml::from_str(s).context("invalid classifier rules")?;
    Ok(rules)
}

/// Load rules from a file path. Errors if the file cannot be read or parsed.
pub fn load_rules_from_path(path: impl AsRef<Path>) -> Result<ClassifierRules> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read rules file: {}", path.as_ref().display()))?;
    parse_rules_str(&content)
        .with_context(|| format!("in rules file: {}", path.as_ref().display()))
}

/// Compiled, case-folded form of [`ClassifierRules`].
#[derive(Debug, Clone)]
pub struct ClassificationFilter {
    type_attribute: String,
    exclude_types: Vec<String>,
    exclude_descriptions: Vec<String>,
    include_types: Vec<String>,
    include_descriptions: Vec<String>,
}

impl ClassificationFilter {
    pub fn new(rules: &ClassifierRules) -> Self {
        Self {
            type_attribute: rules.type_attribute.clone(),
            exclude_types: fold(&rules.exclude_types),
            exclude_descriptions: fold(&rules.exclude_descriptions),
            include_types: fold(&rules.include_types),
            include_descriptions: fold(&rules.include_descriptions),
        }
    }

    /// First matching rule wins: exclusions, then inclusions, then `false`.
    pub fn classify(&self, item: &Item) -> bool {
        let label = item
            .attribute_str(&self.type_attribute)
            .unwrap_or_default()
            .to_uppercase();
        let desc = item
            .description
            .as_deref()
            .unwrap_or_default()
            .to_uppercase();

        if contains_any(&label, &self.exclude_types)
            || contains_any(&desc, &self.exclude_descriptions)
        {
            return false;
        }
        contains_any(&label, &self.include_types) || contains_any(&desc, &self.include_descriptions)
    }
}

impl Default for ClassificationFilter {
    fn default() -> Self {
        Self::new(&ClassifierRules::default())
    }
}

fn fold(words: &[String]) -> Vec<String> {
    words
        .iter()
        .filter(|w| !w.is_empty())
        .map(|w| w.to_uppercase())
        .collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}
