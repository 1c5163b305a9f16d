//! Provenance-ranked product facts harvested from machine-readable page signals.
//!
//! Signals from different sources are expressed as [`FieldWrite`]s and applied
//! through a [`TruthSheetBuilder`] together with their [`Provenance`]. A write
//! only lands when the field is empty or currently held by a strictly lower
//! tier, so the final sheet does not depend on the order sources were read in.

use std::collections::BTreeMap;

use serde::Serialize;

/// Trust rank of a signal source, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    MetaTag,
    ScriptState,
    LinkedData,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::MetaTag => "meta_tag",
            Provenance::ScriptState => "script_state",
            Provenance::LinkedData => "linked_data",
        }
    }
}

/// Canonical truth sheet fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Name,
    Brand,
    Price,
    Currency,
    CompareAtPrice,
    Description,
    Category,
    Colors,
    Sku,
    Variants,
    Images,
}

/// One purchasable variant (size/color/SKU combination).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Variant {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl Variant {
    pub fn is_empty(&self) -> bool {
        self.sku.is_none()
            && self.color.is_none()
            && self.size.is_none()
            && self.price.is_none()
            && self.image_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    List(Vec<String>),
    Variants(Vec<Variant>),
}

/// A single candidate value for a field, not yet ranked.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldWrite {
    pub field: Field,
    pub value: FieldValue,
}

impl FieldWrite {
    /// Text write; blank strings produce nothing.
    pub fn text(field: Field, value: &str) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        Some(Self {
            field,
            value: FieldValue::Text(value.to_string()),
        })
    }

    pub fn number(field: Field, value: f64) -> Option<Self> {
        if !value.is_finite() || value < 0.0 {
            return None;
        }
        Some(Self {
            field,
            value: FieldValue::Number(value),
        })
    }

    /// List write; blank entries are dropped, duplicates collapse, empty lists produce nothing.
    pub fn list(field: Field, values: impl IntoIterator<Item = String>) -> Option<Self> {
        let mut out: Vec<String> = Vec::new();
        for value in values {
            let value = value.trim().to_string();
            if !value.is_empty() && !out.contains(&value) {
                out.push(value);
            }
        }
        if out.is_empty() {
            return None;
        }
        Some(Self {
            field,
            value: FieldValue::List(out),
        })
    }

    pub fn variants(variants: Vec<Variant>) -> Option<Self> {
        let variants: Vec<Variant> = variants.into_iter().filter(|v| !v.is_empty()).collect();
        if variants.is_empty() {
            return None;
        }
        Some(Self {
            field: Field::Variants,
            value: FieldValue::Variants(variants),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourcedValue {
    pub value: FieldValue,
    pub source: Provenance,
}

/// Normalized, provenance-ranked product facts for one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TruthSheet {
    fields: BTreeMap<Field, SourcedValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    attributes: BTreeMap<String, String>,
    #[serde(skip)]
    skipped_blocks: usize,
}

impl TruthSheet {
    pub fn builder() -> TruthSheetBuilder {
        TruthSheetBuilder::default()
    }

    pub fn get(&self, field: Field) -> Option<&SourcedValue> {
        self.fields.get(&field)
    }

    pub fn provenance(&self, field: Field) -> Option<Provenance> {
        self.fields.get(&field).map(|v| v.source)
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        match self.fields.get(&field).map(|v| &v.value) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn number(&self, field: Field) -> Option<f64> {
        match self.fields.get(&field).map(|v| &v.value) {
            Some(FieldValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn list(&self, field: Field) -> &[String] {
        match self.fields.get(&field).map(|v| &v.value) {
            Some(FieldValue::List(items)) => items,
            _ => &[],
        }
    }

    pub fn variants(&self) -> &[Variant] {
        match self.fields.get(&Field::Variants).map(|v| &v.value) {
            Some(FieldValue::Variants(items)) => items,
            _ => &[],
        }
    }

    pub fn image_urls(&self) -> &[String] {
        self.list(Field::Images)
    }

    /// Harvested `data-*` product attributes.
    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Number of structured blocks that were skipped as malformed.
    pub fn skipped_blocks(&self) -> usize {
        self.skipped_blocks
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Accumulates writes; [`build`](Self::build) freezes the sheet.
#[derive(Debug, Default)]
pub struct TruthSheetBuilder {
    sheet: TruthSheet,
}

impl TruthSheetBuilder {
    /// Apply one write. Returns true if the field now holds this value.
    pub fn apply(&mut self, source: Provenance, write: FieldWrite) -> bool {
        let held_by_lower_tier = match self.sheet.fields.get(&write.field) {
            None => true,
            Some(existing) => existing.source < source,
        };
        if held_by_lower_tier {
            self.sheet.fields.insert(
                write.field,
                SourcedValue {
                    value: write.value,
                    source,
                },
            );
        }
        held_by_lower_tier
    }

    pub fn apply_all(&mut self, source: Provenance, writes: impl IntoIterator<Item = FieldWrite>) {
        for write in writes {
            self.apply(source, write);
        }
    }

    /// Record a `data-*` attribute; the first occurrence of a key wins.
    pub fn attribute(&mut self, key: &str, value: &str) {
        self.sheet
            .attributes
            .entry(key.to_string())
            .or_insert_with(|| value.trim().to_string());
    }

    pub fn skip_block(&mut self) {
        self.sheet.skipped_blocks += 1;
    }

    pub fn build(self) -> TruthSheet {
        self.sheet
    }
}

/// Parse a price from a JSON number or a display string.
///
/// Accepts currency symbols and both `1,299.00` and `1.299,00` separators. A
/// lone separator followed by exactly three digits groups thousands.
pub fn parse_price(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|p| p.is_finite() && *p >= 0.0),
        serde_json::Value::String(s) => parse_price_str(s),
        _ => None,
    }
}

fn parse_price_str(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let normalized = match (cleaned.rfind('.'), cleaned.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (None, Some(comma)) if cleaned.len() - comma - 1 == 2 => cleaned.replace(',', "."),
        (None, Some(_)) => cleaned.replace(',', ""),
        // `1.299` and `12.500.000` group thousands; `0.125` stays fractional.
        (Some(dot), None)
            if cleaned.matches('.').count() > 1
                || (cleaned.len() - dot - 1 == 3 && !cleaned.starts_with("0.")) =>
        {
            cleaned.replace('.', "")
        }
        _ => cleaned,
    };

    normalized
        .parse::<f64>()
        .ok()
        .filter(|p| p.is_finite() && *p >= 0.0)
}
