use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fmt;
use thiserror::Error;

/// Every field a listing can carry. The first five are required before photo
/// collection starts; the rest are optional enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingField {
    Designer,
    ItemType,
    Size,
    Condition,
    AskingPrice,
    Color,
    Material,
    Details,
}

impl ListingField {
    pub const ALL: [ListingField; 8] = [
        ListingField::Designer,
        ListingField::ItemType,
        ListingField::Size,
        ListingField::Condition,
        ListingField::AskingPrice,
        ListingField::Color,
        ListingField::Material,
        ListingField::Details,
    ];

    /// Required fields, in the order they are asked for.
    pub const REQUIRED: [ListingField; 5] = [
        ListingField::Designer,
        ListingField::ItemType,
        ListingField::Size,
        ListingField::Condition,
        ListingField::AskingPrice,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            ListingField::Designer => "designer",
            ListingField::ItemType => "item_type",
            ListingField::Size => "size",
            ListingField::Condition => "condition",
            ListingField::AskingPrice => "asking_price",
            ListingField::Color => "color",
            ListingField::Material => "material",
            ListingField::Details => "details",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ListingField::Designer => "Designer",
            ListingField::ItemType => "Item",
            ListingField::Size => "Size",
            ListingField::Condition => "Condition",
            ListingField::AskingPrice => "Asking price",
            ListingField::Color => "Color",
            ListingField::Material => "Material",
            ListingField::Details => "Details",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.key().eq_ignore_ascii_case(key.trim()))
    }

    pub fn is_required(&self) -> bool {
        Self::REQUIRED.contains(self)
    }
}

impl fmt::Display for ListingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum FieldError {
    #[error("`{0}` is not a valid price")]
    InvalidPrice(String),
    #[error("value for {0} is empty")]
    Empty(ListingField),
}

/// Partial structured listing. A field is "empty" when it is `None` or blank.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DraftListing {
    pub designer: Option<String>,
    pub item_type: Option<String>,
    pub size: Option<String>,
    pub condition: Option<String>,
    pub asking_price: Option<f64>,
    pub color: Option<String>,
    pub material: Option<String>,
    pub details: Option<String>,
}

impl DraftListing {
    pub fn get(&self, field: ListingField) -> Option<String> {
        let value = match field {
            ListingField::AskingPrice => {
                return self
                    .asking_price
                    .filter(|p| p.is_finite() && *p > 0.0)
                    .map(format_price);
            }
            ListingField::Designer => &self.designer,
            ListingField::ItemType => &self.item_type,
            ListingField::Size => &self.size,
            ListingField::Condition => &self.condition,
            ListingField::Color => &self.color,
            ListingField::Material => &self.material,
            ListingField::Details => &self.details,
        };
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    pub fn is_set(&self, field: ListingField) -> bool {
        self.get(field).is_some()
    }

    /// Writes `raw` into `field`, overwriting whatever was there. Only direct
    /// answers to a question go through here; extraction output is merged with
    /// [`safe_merge`] instead.
    pub fn set(&mut self, field: ListingField, raw: &str) -> Result<(), FieldError> {
        let value = raw.trim();
        if value.is_empty() {
            return Err(FieldError::Empty(field));
        }
        let slot = match field {
            ListingField::AskingPrice => {
                self.asking_price = Some(parse_price(value)?);
                return Ok(());
            }
            ListingField::Designer => &mut self.designer,
            ListingField::ItemType => &mut self.item_type,
            ListingField::Size => &mut self.size,
            ListingField::Condition => &mut self.condition,
            ListingField::Color => &mut self.color,
            ListingField::Material => &mut self.material,
            ListingField::Details => &mut self.details,
        };
        *slot = Some(value.to_string());
        Ok(())
    }

    pub fn clear(&mut self, field: ListingField) {
        match field {
            ListingField::Designer => self.designer = None,
            ListingField::ItemType => self.item_type = None,
            ListingField::Size => self.size = None,
            ListingField::Condition => self.condition = None,
            ListingField::AskingPrice => self.asking_price = None,
            ListingField::Color => self.color = None,
            ListingField::Material => self.material = None,
            ListingField::Details => self.details = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        ListingField::ALL.iter().all(|field| !self.is_set(*field))
    }

    pub fn missing_required(&self) -> Vec<ListingField> {
        ListingField::REQUIRED
            .into_iter()
            .filter(|field| !self.is_set(*field))
            .collect()
    }

    /// Title used for the catalog draft, e.g. "Elan Kurta (M)".
    pub fn title(&self) -> String {
        let mut parts = Vec::new();
        if let Some(designer) = self.get(ListingField::Designer) {
            parts.push(designer);
        }
        parts.push(
            self.get(ListingField::ItemType)
                .unwrap_or_else(|| "Listing".to_string()),
        );
        let mut title = parts.join(" ");
        if let Some(size) = self.get(ListingField::Size) {
            title.push_str(&format!(" ({size})"));
        }
        title
    }

    /// Human-readable summary of every populated field.
    pub fn summary(&self) -> String {
        let lines = ListingField::ALL
            .iter()
            .filter_map(|field| {
                self.get(*field).map(|value| match field {
                    ListingField::AskingPrice => format!("• {}: ${value}", field.label()),
                    _ => format!("• {}: {value}", field.label()),
                })
            })
            .collect::<Vec<_>>();
        if lines.is_empty() {
            "I couldn't pick out any details yet.".to_string()
        } else {
            format!("Here's what I have so far:\n{}", lines.join("\n"))
        }
    }
}

/// Merge-if-empty: copies each non-empty `incoming` field into a clone of
/// `existing` only where `existing` is still empty. Never overwrites.
pub fn safe_merge(existing: &DraftListing, incoming: &DraftListing) -> DraftListing {
    let mut merged = existing.clone();
    for field in ListingField::ALL {
        if merged.is_set(field) {
            continue;
        }
        if field == ListingField::AskingPrice {
            if incoming.is_set(field) {
                merged.asking_price = incoming.asking_price;
            }
            continue;
        }
        if let Some(value) = incoming.get(field) {
            // Non-empty string fields always parse.
            let _ = merged.set(field, &value);
        }
    }
    merged
}

/// The next required field to ask for, or `None` when the draft is complete.
pub fn next_missing_field(draft: &DraftListing) -> Option<ListingField> {
    ListingField::REQUIRED
        .into_iter()
        .find(|field| !draft.is_set(*field))
}

pub fn parse_price(raw: &str) -> Result<f64, FieldError> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches(|c: char| c == '$' || c.is_whitespace())
        .chars()
        .filter(|c| *c != ',')
        .collect();
    let cleaned = cleaned
        .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c.is_whitespace())
        .trim();
    match cleaned.parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Ok((value * 100.0).round() / 100.0),
        _ => Err(FieldError::InvalidPrice(raw.trim().to_string())),
    }
}

fn format_price(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft_with_designer(designer: &str) -> DraftListing {
        DraftListing {
            designer: Some(designer.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn safe_merge_keeps_existing_values() {
        let existing = draft_with_designer("Elan");
        let incoming = DraftListing {
            designer: Some("Sabyasachi".into()),
            size: Some("M".into()),
            asking_price: Some(80.0),
            ..Default::default()
        };
        let merged = safe_merge(&existing, &incoming);
        assert_eq!(merged.designer.as_deref(), Some("Elan"));
        assert_eq!(merged.size.as_deref(), Some("M"));
        assert_eq!(merged.asking_price, Some(80.0));
        // inputs untouched
        assert_eq!(existing.size, None);
    }

    #[test]
    fn safe_merge_treats_blank_as_empty() {
        let existing = DraftListing {
            designer: Some("   ".into()),
            ..Default::default()
        };
        let incoming = draft_with_designer("Elan");
        let merged = safe_merge(&existing, &incoming);
        assert_eq!(merged.designer.as_deref(), Some("Elan"));
    }

    #[test]
    fn safe_merge_ignores_empty_incoming() {
        let existing = draft_with_designer("Elan");
        let incoming = DraftListing {
            color: Some(String::new()),
            asking_price: Some(0.0),
            ..Default::default()
        };
        let merged = safe_merge(&existing, &incoming);
        assert_eq!(merged, existing);
    }

    #[test]
    fn next_missing_field_follows_required_order() {
        let mut draft = DraftListing::default();
        assert_eq!(next_missing_field(&draft), Some(ListingField::Designer));
        draft.set(ListingField::Designer, "Elan").unwrap();
        draft.set(ListingField::ItemType, "Kurta").unwrap();
        assert_eq!(next_missing_field(&draft), Some(ListingField::Size));
        draft.set(ListingField::Size, "M").unwrap();
        draft.set(ListingField::Condition, "Like New").unwrap();
        draft.set(ListingField::AskingPrice, "$80").unwrap();
        assert_eq!(next_missing_field(&draft), None);
    }

    #[test]
    fn set_overwrites_for_direct_answers() {
        let mut draft = draft_with_designer("Elan");
        draft.set(ListingField::Designer, "Anita Dongre").unwrap();
        assert_eq!(draft.designer.as_deref(), Some("Anita Dongre"));
    }

    #[test]
    fn price_parsing_accepts_currency_noise() {
        assert_eq!(parse_price("$80").unwrap(), 80.0);
        assert_eq!(parse_price("1,250").unwrap(), 1250.0);
        assert_eq!(parse_price("45.5 usd").unwrap(), 45.5);
        assert!(parse_price("free").is_err());
        assert!(parse_price("-3").is_err());
    }

    #[test]
    fn summary_lists_known_fields() {
        let mut draft = draft_with_designer("Elan");
        draft.asking_price = Some(80.0);
        let summary = draft.summary();
        assert!(summary.contains("Designer: Elan"));
        assert!(summary.contains("Asking price: $80"));
        assert!(!summary.contains("Size"));
    }

    #[test]
    fn field_keys_round_trip() {
        for field in ListingField::ALL {
            assert_eq!(ListingField::from_key(field.key()), Some(field));
        }
        assert_eq!(ListingField::from_key("nope"), None);
    }
}
