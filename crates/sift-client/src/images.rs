use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;
use sift_core::images::{ImageSource, RawImage};
use sift_core::traits::ImageCollector;
use url::Url;

const LAZY_ATTRS: &[&str] = &["data-src", "data-lazy-src", "data-original", "data-zoom-image"];
const SRCSET_ATTRS: &[&str] = &["srcset", "data-srcset"];
const META_IMAGE_KEYS: &[&str] = &["og:image", "og:image:secure_url", "twitter:image"];
const LD_IMAGE_KEYS: &[&str] = &["image", "images"];
const MAX_LD_DEPTH: usize = 8;

static IMG: LazyLock<Selector> = LazyLock::new(|| Selector::parse("img").expect("static selector"));

static PICTURE_SOURCE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("picture source[srcset]").expect("static selector"));

static META: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[content]").expect("static selector"));

static LD_JSON: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("static selector")
});

static STYLED: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[style]").expect("static selector"));

static BASE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("base[href]").expect("static selector"));

static BACKGROUND_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)background(?:-image)?\s*:[^;]*?url\(\s*['"]?([^'")]+?)['"]?\s*\)"#)
        .expect("valid regex")
});

/// Collects image references from markup, resolved to absolute URLs.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlImageCollector;

impl HtmlImageCollector {
    pub fn new() -> Self {
        Self
    }
}

impl ImageCollector for HtmlImageCollector {
    fn collect(&self, html: &str, page_url: Option<&str>) -> Vec<RawImage> {
        let doc = Html::parse_document(html);
        let mut found = Found::new(document_base(&doc, page_url));

        for img in doc.select(&IMG) {
            let attrs = img.value();
            let width = attrs.attr("width").and_then(parse_dimension);
            let height = attrs.attr("height").and_then(parse_dimension);

            if let Some(src) = attrs.attr("src") {
                found.add(src, ImageSource::Img, width, height);
            }
            for attr in LAZY_ATTRS {
                if let Some(src) = attrs.attr(attr) {
                    found.add(src, ImageSource::Lazy, width, height);
                }
            }
            for attr in SRCSET_ATTRS {
                if let Some((src, w)) = attrs.attr(attr).and_then(best_from_srcset) {
                    found.add(src, ImageSource::Srcset, w, None);
                }
            }
        }

        for source in doc.select(&PICTURE_SOURCE) {
            if let Some((src, w)) = source.value().attr("srcset").and_then(best_from_srcset) {
                found.add(src, ImageSource::Srcset, w, None);
            }
        }

        for meta in doc.select(&META) {
            let attrs = meta.value();
            let key = attrs
                .attr("property")
                .or_else(|| attrs.attr("name"))
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            if META_IMAGE_KEYS.contains(&key.as_str()) {
                if let Some(src) = attrs.attr("content") {
                    found.add(src, ImageSource::Meta, None, None);
                }
            }
        }

        for script in doc.select(&LD_JSON) {
            let raw = script.text().collect::<String>();
            // Malformed blocks are already counted by the signal extractor.
            let Ok(value) = serde_json::from_str::<Value>(raw.trim()) else {
                continue;
            };
            let mut urls = Vec::new();
            ld_images(&value, 0, &mut urls);
            for src in urls {
                found.add(src, ImageSource::LinkedData, None, None);
            }
        }

        for el in doc.select(&STYLED) {
            let Some(style) = el.value().attr("style") else {
                continue;
            };
            for caps in BACKGROUND_URL.captures_iter(style) {
                found.add(&caps[1], ImageSource::Background, None, None);
            }
        }

        tracing::debug!(images = found.images.len(), "Collected image references");
        found.images
    }
}

/// Resolved, de-duplicated image references in document order.
struct Found {
    base: Option<Url>,
    index: HashMap<String, usize>,
    images: Vec<RawImage>,
}

impl Found {
    fn new(base: Option<Url>) -> Self {
        Self {
            base,
            index: HashMap::new(),
            images: Vec::new(),
        }
    }

    fn add(&mut self, raw: &str, source: ImageSource, width: Option<u32>, height: Option<u32>) {
        let Some(url) = resolve(self.base.as_ref(), raw) else {
            return;
        };
        match self.index.get(&url) {
            Some(&i) => {
                let existing = &mut self.images[i];
                if source.score_bonus() > existing.source.score_bonus() {
                    existing.source = source;
                }
                // Dimensions always come from a single element.
                if known_sides(width, height) > known_sides(existing.width, existing.height) {
                    existing.width = width;
                    existing.height = height;
                }
            }
            None => {
                self.index.insert(url.clone(), self.images.len());
                self.images
                    .push(RawImage::new(url, source).with_dimensions(width, height));
            }
        }
    }
}

fn known_sides(width: Option<u32>, height: Option<u32>) -> usize {
    usize::from(width.is_some()) + usize::from(height.is_some())
}

/// `<base href>` resolved against the page URL, else the page URL itself.
fn document_base(doc: &Html, page_url: Option<&str>) -> Option<Url> {
    let page = page_url.and_then(|u| Url::parse(u).ok());
    let declared = doc
        .select(&BASE)
        .next()
        .and_then(|el| el.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty());

    match declared {
        Some(href) => match Url::parse(href) {
            Ok(url) => Some(url),
            Err(_) => page.as_ref().and_then(|p| p.join(href).ok()).or(page),
        },
        None => page,
    }
}

/// Absolute http(s) URL with a non-empty path, or nothing.
fn resolve(base: Option<&Url>, raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return None;
    }

    let url = if let Some(rest) = raw.strip_prefix("//") {
        Url::parse(&format!("https://{rest}")).ok()?
    } else {
        match Url::parse(raw) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => base?.join(raw).ok()?,
            Err(_) => return None,
        }
    };

    if !matches!(url.scheme(), "http" | "https") || url.path().trim_matches('/').is_empty() {
        return None;
    }
    Some(url.to_string())
}

/// Highest-resolution entry of a `srcset`, with its width when given as a `w` descriptor.
///
/// Ties keep the first entry.
fn best_from_srcset(srcset: &str) -> Option<(&str, Option<u32>)> {
    let mut best: Option<(&str, f64, Option<u32>)> = None;
    for entry in srcset.split(',') {
        let mut parts = entry.split_whitespace();
        let Some(url) = parts.next() else {
            continue;
        };
        let descriptor = parts.next().unwrap_or_default().to_ascii_lowercase();
        let (score, width) = if let Some(w) = descriptor.strip_suffix('w') {
            let w = w.parse::<u32>().ok();
            (w.map(f64::from).unwrap_or(0.0), w)
        } else if let Some(x) = descriptor.strip_suffix('x') {
            (x.parse::<f64>().unwrap_or(0.0), None)
        } else {
            (0.0, None)
        };

        if best.is_none_or(|(_, top, _)| score > top) {
            best = Some((url, score, width));
        }
    }
    best.map(|(url, _, width)| (url, width))
}

fn parse_dimension(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    let digits = raw.strip_suffix("px").unwrap_or(raw).trim();
    digits.parse().ok()
}

fn ld_images<'a>(value: &'a Value, depth: usize, out: &mut Vec<&'a str>) {
    if depth > MAX_LD_DEPTH {
        return;
    }
    match value {
        Value::Array(items) => {
            for item in items {
                ld_images(item, depth + 1, out);
            }
        }
        Value::Object(node) => {
            for (key, inner) in node {
                if LD_IMAGE_KEYS.contains(&key.as_str()) {
                    image_refs(inner, out);
                } else {
                    ld_images(inner, depth + 1, out);
                }
            }
        }
        _ => {}
    }
}

/// A URL string, an `ImageObject`, or a list of either.
fn image_refs<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(url) => out.push(url),
        Value::Object(node) => {
            if let Some(url) = ["url", "contentUrl"]
                .iter()
                .find_map(|k| node.get(*k).and_then(Value::as_str))
            {
                out.push(url);
            }
        }
        Value::Array(items) => {
            for item in items {
                image_refs(item, out);
            }
        }
        _ => {}
    }
}
