use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::{Map, Value};
use sift_core::error::AppError;
use sift_core::traits::SignalExtractor;
use sift_core::truth_sheet::{
    Field, FieldWrite, Provenance, TruthSheet, TruthSheetBuilder, Variant, parse_price,
};

const PRODUCT_TYPES: &[&str] = &["Product", "ProductGroup", "IndividualProduct"];

/// Keys that mark an untyped JSON-LD node as a product.
const PRODUCT_SHAPED_KEYS: &[&str] = &["offers", "price", "sku"];

/// Keys that, next to a name or title, mark a script-state object as a product.
const STATE_PRODUCT_KEYS: &[&str] = &["price", "sku", "variants", "offers"];

const DATA_ATTRIBUTE_HINTS: &[&str] = &["product", "price", "sku", "id", "image", "brand"];

const MAX_LD_DEPTH: usize = 6;
const MAX_STATE_DEPTH: usize = 12;

static LD_JSON: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("static selector")
});

static JSON_SCRIPT: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/json"]"#).expect("static selector")
});

static SCRIPT: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("script:not([src])").expect("static selector"));

static META: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[content]").expect("static selector"));

static ANY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("*").expect("static selector"));

/// `window.__INITIAL_STATE__ = {`, `var __APOLLO_STATE__ = {`, `window["__NUXT__"] = {`, ...
static STATE_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(__[A-Z][A-Z0-9_]*__)["']?\]?\s*=\s*\{"#).expect("valid regex")
});

/// Builds truth sheets from JSON-LD, script state, meta tags, and `data-*`
/// attributes, in descending order of trust.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlSignalExtractor;

impl HtmlSignalExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl SignalExtractor for HtmlSignalExtractor {
    fn extract(&self, html: &str) -> TruthSheet {
        let doc = Html::parse_document(html);
        let mut sheet = TruthSheet::builder();

        linked_data(&doc, &mut sheet);
        script_state(&doc, &mut sheet);
        meta_tags(&doc, &mut sheet);
        data_attributes(&doc, &mut sheet);

        let sheet = sheet.build();
        tracing::debug!(
            fields = sheet.len(),
            attributes = sheet.attributes().len(),
            skipped_blocks = sheet.skipped_blocks(),
            "Signals extracted"
        );
        sheet
    }
}

fn skip(sheet: &mut TruthSheetBuilder, source_kind: &'static str, message: String) {
    let err = AppError::MalformedSignal {
        source_kind,
        message,
    };
    tracing::debug!(error = %err, "Skipping signal block");
    sheet.skip_block();
}

// ---------------------------------------------------------------------------
// JSON-LD
// ---------------------------------------------------------------------------

fn linked_data(doc: &Html, sheet: &mut TruthSheetBuilder) {
    for script in doc.select(&LD_JSON) {
        let raw = script.text().collect::<String>();
        if raw.trim().is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(raw.trim()) {
            Ok(value) => value,
            Err(e) => {
                skip(sheet, "json-ld", e.to_string());
                continue;
            }
        };

        let mut products = Vec::new();
        find_ld_products(&value, 0, &mut products);
        for node in products {
            sheet.apply_all(Provenance::LinkedData, ld_product_writes(node));
        }
    }
}

fn find_ld_products<'a>(value: &'a Value, depth: usize, out: &mut Vec<&'a Map<String, Value>>) {
    if depth > MAX_LD_DEPTH {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                find_ld_products(item, depth + 1, out);
            }
        }
        Value::Object(node) => {
            if is_ld_product(node) {
                out.push(node);
                return;
            }
            for key in ["@graph", "mainEntity"] {
                if let Some(inner) = node.get(key) {
                    find_ld_products(inner, depth + 1, out);
                }
            }
        }
        _ => {}
    }
}

fn is_ld_product(node: &Map<String, Value>) -> bool {
    match node.get("@type") {
        Some(Value::String(t)) => PRODUCT_TYPES.contains(&t.as_str()),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| PRODUCT_TYPES.contains(&t)),
        Some(_) => false,
        None => PRODUCT_SHAPED_KEYS.iter().any(|k| node.contains_key(*k)),
    }
}

fn ld_product_writes(node: &Map<String, Value>) -> Vec<FieldWrite> {
    let variants: Vec<Variant> = node
        .get("hasVariant")
        .map(as_items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(Value::as_object)
        .map(ld_variant)
        .collect();

    let mut offer = node.get("offers").map(read_offers).unwrap_or_default();
    offer.fill_from(&read_offer(node));
    if offer.price.is_none() {
        offer.price = variants.iter().find_map(|v| v.price);
    }

    let mut colors = node.get("color").map(text_list).unwrap_or_default();
    if colors.is_empty() {
        colors = variants.iter().filter_map(|v| v.color.clone()).collect();
    }

    let mut writes = vec![
        text_write(Field::Name, node.get("name")),
        text_write(Field::Brand, node.get("brand")),
        text_write(Field::Description, node.get("description")),
        text_write(Field::Category, node.get("category")),
        text_write(Field::Sku, node.get("sku")),
        FieldWrite::list(Field::Colors, colors),
        FieldWrite::list(
            Field::Images,
            node.get("image").map(image_list).unwrap_or_default(),
        ),
        FieldWrite::variants(variants),
    ];
    writes.extend(offer.writes());
    writes.into_iter().flatten().collect()
}

fn ld_variant(node: &Map<String, Value>) -> Variant {
    let mut offer = node.get("offers").map(read_offers).unwrap_or_default();
    offer.fill_from(&read_offer(node));
    Variant {
        sku: node.get("sku").and_then(text_of),
        color: node.get("color").and_then(text_of),
        size: node.get("size").and_then(text_of),
        price: offer.price,
        image_url: node
            .get("image")
            .map(image_list)
            .and_then(|images| images.into_iter().next()),
    }
}

/// Price facts read from an offer-like node.
#[derive(Debug, Default)]
struct Offer {
    price: Option<f64>,
    currency: Option<String>,
    compare_at: Option<f64>,
}

impl Offer {
    fn fill_from(&mut self, other: &Offer) {
        if self.price.is_none() {
            self.price = other.price;
        }
        if self.currency.is_none() {
            self.currency.clone_from(&other.currency);
        }
        if self.compare_at.is_none() {
            self.compare_at = other.compare_at;
        }
    }

    fn writes(self) -> [Option<FieldWrite>; 3] {
        [
            self.price.and_then(|p| FieldWrite::number(Field::Price, p)),
            self.currency
                .and_then(|c| FieldWrite::text(Field::Currency, &c)),
            self.compare_at
                .and_then(|p| FieldWrite::number(Field::CompareAtPrice, p)),
        ]
    }
}

/// `offers` may be a single offer, a list, or an `AggregateOffer`.
fn read_offers(offers: &Value) -> Offer {
    match offers {
        Value::Object(node) => {
            let mut offer = read_offer(node);
            if let Some(nested) = node.get("offers") {
                offer.fill_from(&read_offers(nested));
            }
            offer
        }
        Value::Array(items) => {
            let offers: Vec<Offer> = items
                .iter()
                .filter_map(Value::as_object)
                .map(read_offer)
                .collect();
            let mut merged = Offer::default();
            if let Some(priced) = offers.iter().find(|o| o.price.is_some()) {
                merged.fill_from(priced);
            }
            for offer in &offers {
                merged.fill_from(offer);
            }
            merged
        }
        _ => Offer::default(),
    }
}

fn read_offer(node: &Map<String, Value>) -> Offer {
    let mut offer = Offer {
        price: node
            .get("price")
            .and_then(parse_price)
            .or_else(|| node.get("lowPrice").and_then(parse_price)),
        currency: node.get("priceCurrency").and_then(text_of),
        compare_at: None,
    };

    let specs = node
        .get("priceSpecification")
        .map(as_items)
        .unwrap_or_default();
    for spec in specs.into_iter().filter_map(Value::as_object) {
        let price = spec.get("price").and_then(parse_price);
        if is_list_price(spec) {
            if offer.compare_at.is_none() {
                offer.compare_at = price;
            }
        } else if offer.price.is_none() {
            offer.price = price;
        }
        if offer.currency.is_none() {
            offer.currency = spec.get("priceCurrency").and_then(text_of);
        }
    }
    offer
}

fn is_list_price(spec: &Map<String, Value>) -> bool {
    ["priceType", "@type"]
        .iter()
        .filter_map(|k| spec.get(*k).and_then(Value::as_str))
        .any(|t| t.ends_with("ListPrice") || t.ends_with("StrikethroughPrice"))
}

// ---------------------------------------------------------------------------
// Script state
// ---------------------------------------------------------------------------

fn script_state(doc: &Html, sheet: &mut TruthSheetBuilder) {
    let mut blobs = Vec::new();

    for script in doc.select(&JSON_SCRIPT) {
        let raw = script.text().collect::<String>();
        if raw.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(raw.trim()) {
            Ok(value) => blobs.push(value),
            Err(e) => skip(sheet, "script-json", e.to_string()),
        }
    }

    for script in doc.select(&SCRIPT) {
        let is_js = script
            .value()
            .attr("type")
            .is_none_or(|t| t.is_empty() || t.contains("javascript"));
        if !is_js {
            continue;
        }
        let raw = script.text().collect::<String>();
        for caps in STATE_ASSIGNMENT.captures_iter(&raw) {
            let Some(whole) = caps.get(0) else { continue };
            let start = whole.end() - 1;
            let Some(object) = balanced_object(&raw[start..]) else {
                skip(sheet, "script-state", format!("unterminated {}", &caps[1]));
                continue;
            };
            match serde_json::from_str::<Value>(object) {
                Ok(value) => blobs.push(value),
                Err(e) => skip(sheet, "script-state", format!("{}: {e}", &caps[1])),
            }
        }
    }

    if let Some(product) = blobs.iter().find_map(|blob| find_state_product(blob, 0)) {
        sheet.apply_all(Provenance::ScriptState, state_product_writes(product));
    }
}

/// The JSON object starting at the first byte of `text`, with braces balanced.
fn balanced_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    if bytes.first() != Some(&b'{') {
        return None;
    }

    let mut depth = 0usize;
    let mut quote: Option<u8> = None;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'"' | b'\'' => quote = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn find_state_product(value: &Value, depth: usize) -> Option<&Map<String, Value>> {
    if depth > MAX_STATE_DEPTH {
        return None;
    }
    match value {
        Value::Object(node) => {
            if looks_like_state_product(node) {
                return Some(node);
            }
            node.values()
                .find_map(|v| find_state_product(v, depth + 1))
        }
        Value::Array(items) => items
            .iter()
            .find_map(|v| find_state_product(v, depth + 1)),
        _ => None,
    }
}

fn looks_like_state_product(node: &Map<String, Value>) -> bool {
    let named = ["title", "name"].iter().any(|k| {
        node.get(*k)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.trim().is_empty())
    });
    named && STATE_PRODUCT_KEYS.iter().any(|k| node.contains_key(*k))
}

fn first_key<'a>(node: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| node.get(*k).filter(|v| !v.is_null()))
}

/// A price as a number, a display string, or `{amount, currencyCode}`.
fn state_price(value: &Value) -> (Option<f64>, Option<String>) {
    match value {
        Value::Object(money) => (
            first_key(money, &["amount", "value", "price"]).and_then(parse_price),
            first_key(money, &["currencyCode", "currency"]).and_then(text_of),
        ),
        other => (parse_price(other), None),
    }
}

fn state_product_writes(node: &Map<String, Value>) -> Vec<FieldWrite> {
    let variants: Vec<Variant> = node
        .get("variants")
        .map(as_items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(Value::as_object)
        .map(state_variant)
        .collect();

    let (mut price, mut currency) = first_key(node, &["price", "priceRange"])
        .map(state_price)
        .unwrap_or_default();
    if price.is_none() {
        price = variants.iter().find_map(|v| v.price);
    }
    if currency.is_none() {
        currency = first_key(node, &["currency", "currencyCode", "priceCurrency"]).and_then(text_of);
    }
    let compare_at = first_key(
        node,
        &["compare_at_price", "compareAtPrice", "listPrice", "originalPrice"],
    )
    .and_then(|v| state_price(v).0);

    let mut colors = node.get("colors").map(text_list).unwrap_or_default();
    if colors.is_empty() {
        colors = variants.iter().filter_map(|v| v.color.clone()).collect();
    }

    let images = first_key(node, &["images", "image", "media"])
        .map(image_list)
        .unwrap_or_default();

    [
        text_write(Field::Name, first_key(node, &["title", "name"])),
        text_write(Field::Brand, first_key(node, &["brand", "vendor"])),
        text_write(Field::Description, node.get("description")),
        text_write(Field::Category, first_key(node, &["product_type", "category"])),
        text_write(Field::Sku, node.get("sku")),
        price.and_then(|p| FieldWrite::number(Field::Price, p)),
        currency.and_then(|c| FieldWrite::text(Field::Currency, &c)),
        compare_at.and_then(|p| FieldWrite::number(Field::CompareAtPrice, p)),
        FieldWrite::list(Field::Colors, colors),
        FieldWrite::list(Field::Images, images),
        FieldWrite::variants(variants),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn state_variant(node: &Map<String, Value>) -> Variant {
    let mut color = node.get("color").and_then(text_of);
    let mut size = node.get("size").and_then(text_of);

    // Storefront APIs: selectedOptions: [{name: "Color", value: "Red"}]
    for option in node
        .get("selectedOptions")
        .map(as_items)
        .unwrap_or_default()
        .into_iter()
        .filter_map(Value::as_object)
    {
        let name = option
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let value = option.get("value").and_then(text_of);
        match name.as_str() {
            "color" | "colour" if color.is_none() => color = value,
            "size" if size.is_none() => size = value,
            _ => {}
        }
    }

    Variant {
        sku: node.get("sku").and_then(text_of),
        color,
        size,
        price: node.get("price").and_then(|v| state_price(v).0),
        image_url: first_key(node, &["featured_image", "image"])
            .map(image_list)
            .and_then(|images| images.into_iter().next()),
    }
}

// ---------------------------------------------------------------------------
// Meta tags
// ---------------------------------------------------------------------------

fn meta_field(key: &str) -> Option<Field> {
    let field = match key {
        "product:price:amount" | "og:price:amount" => Field::Price,
        "product:price:currency" | "og:price:currency" => Field::Currency,
        "product:original_price:amount" => Field::CompareAtPrice,
        "og:title" => Field::Name,
        "og:description" | "description" => Field::Description,
        "product:brand" => Field::Brand,
        "product:category" => Field::Category,
        "product:color" => Field::Colors,
        "product:retailer_item_id" => Field::Sku,
        "og:image" | "og:image:secure_url" | "twitter:image" => Field::Images,
        _ => return None,
    };
    Some(field)
}

fn meta_tags(doc: &Html, sheet: &mut TruthSheetBuilder) {
    let mut seen = HashSet::new();
    let mut images = Vec::new();

    for meta in doc.select(&META) {
        let attrs = meta.value();
        let Some(key) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let content = attrs.attr("content").unwrap_or_default().trim();
        if key.is_empty() || content.is_empty() || !seen.insert(key.clone()) {
            continue;
        }
        let Some(field) = meta_field(&key) else {
            continue;
        };

        let write = match field {
            Field::Images => {
                images.push(content.to_string());
                None
            }
            Field::Price | Field::CompareAtPrice => parse_price(&Value::String(content.into()))
                .and_then(|p| FieldWrite::number(field, p)),
            Field::Colors => FieldWrite::list(field, [content.to_string()]),
            _ => FieldWrite::text(field, content),
        };
        if let Some(write) = write {
            sheet.apply(Provenance::MetaTag, write);
        }
    }

    if let Some(write) = FieldWrite::list(Field::Images, images) {
        sheet.apply(Provenance::MetaTag, write);
    }
}

// ---------------------------------------------------------------------------
// data-* attributes
// ---------------------------------------------------------------------------

fn data_attributes(doc: &Html, sheet: &mut TruthSheetBuilder) {
    for el in doc.select(&ANY) {
        for (name, value) in el.value().attrs() {
            let Some(suffix) = name.strip_prefix("data-") else {
                continue;
            };
            let suffix = suffix.to_ascii_lowercase();
            if value.trim().is_empty() || !DATA_ATTRIBUTE_HINTS.iter().any(|h| suffix.contains(h)) {
                continue;
            }
            sheet.attribute(name, value.trim());
        }
    }
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

fn as_items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Text of a string, number, `{name}` object, or the first usable list entry.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(node) => node.get("name").and_then(text_of),
        Value::Array(items) => items.iter().find_map(text_of),
        _ => None,
    }
}

fn text_list(value: &Value) -> Vec<String> {
    as_items(value).into_iter().filter_map(text_of).collect()
}

fn text_write(field: Field, value: Option<&Value>) -> Option<FieldWrite> {
    value
        .and_then(text_of)
        .and_then(|text| FieldWrite::text(field, &text))
}

/// Image URLs from a string, an `ImageObject`, or a list of either.
fn image_list(value: &Value) -> Vec<String> {
    as_items(value)
        .into_iter()
        .filter_map(|item| match item {
            Value::String(url) => Some(url.trim().to_string()),
            Value::Object(node) => first_key(node, &["url", "contentUrl", "src"])
                .and_then(Value::as_str)
                .map(|url| url.trim().to_string()),
            _ => None,
        })
        .filter(|url| !url.is_empty())
        .collect()
}
