use crate::listing::fields::{DraftListing, ListingField};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::error;

const CANONICAL_OPTIONS_YAML: &str = include_str!("../../data/canonical_options.yaml");

/// One accepted value for a field plus the free-text keywords that map to it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CanonicalFieldOption {
    pub value: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Immutable reference data: the closed value set for every matchable field.
#[derive(Debug, Clone, Default)]
pub struct CanonicalValues {
    options: HashMap<ListingField, Vec<CanonicalFieldOption>>,
}

pub static CANONICAL_VALUES: Lazy<CanonicalValues> = Lazy::new(|| {
    CanonicalValues::from_yaml(CANONICAL_OPTIONS_YAML).unwrap_or_else(|err| {
        error!(target = "closet.conversation", error = %err, "canonical_options_parse_failed");
        CanonicalValues::default()
    })
});

impl CanonicalValues {
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        let parsed: HashMap<String, Vec<CanonicalFieldOption>> = serde_yaml::from_str(raw)?;
        let options = parsed
            .into_iter()
            .filter_map(|(key, mut values)| {
                let field = ListingField::from_key(&key)?;
                for option in &mut values {
                    option.keywords = option
                        .keywords
                        .iter()
                        .map(|k| k.trim().to_lowercase())
                        .filter(|k| !k.is_empty())
                        .collect();
                }
                Some((field, values))
            })
            .collect();
        Ok(Self { options })
    }

    pub fn options(&self, field: ListingField) -> &[CanonicalFieldOption] {
        self.options.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_closed_set(&self, field: ListingField) -> bool {
        !self.options(field).is_empty()
    }

    /// Exact case-insensitive match on the canonical value first, then the
    /// first option whose keyword occurs in the text. Empty string on no match.
    pub fn match_to_dropdown(&self, text: &str, field: ListingField) -> String {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return String::new();
        }
        let options = self.options(field);
        if let Some(exact) = options.iter().find(|o| o.value.to_lowercase() == needle) {
            return exact.value.clone();
        }
        options
            .iter()
            .find(|o| o.keywords.iter().any(|k| needle.contains(k.as_str())))
            .map(|o| o.value.clone())
            .unwrap_or_default()
    }

    /// Maps every closed-set field of an extracted draft onto its canonical
    /// value. Unmatched values are dropped so the field counts as missing.
    pub fn canonicalize(&self, draft: &DraftListing) -> DraftListing {
        let mut out = draft.clone();
        for field in ListingField::ALL {
            if !self.has_closed_set(field) {
                continue;
            }
            match draft.get(field) {
                Some(raw) => {
                    let matched = self.match_to_dropdown(&raw, field);
                    if matched.is_empty() {
                        out.clear(field);
                    } else {
                        let _ = out.set(field, &matched);
                    }
                }
                None => out.clear(field),
            }
        }
        out
    }
}

pub fn match_to_dropdown(text: &str, field: ListingField) -> String {
    CANONICAL_VALUES.match_to_dropdown(text, field)
}

/// Choice id used for option buttons: `field:<field>:<value>`.
pub fn option_id(field: ListingField, value: &str) -> String {
    format!("field:{}:{}", field.key(), value)
}

pub fn parse_option_id(id: &str) -> Option<(ListingField, String)> {
    let rest = id.strip_prefix("field:")?;
    let (key, value) = rest.split_once(':')?;
    let field = ListingField::from_key(key)?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some((field, value.to_string()))
    }
}
