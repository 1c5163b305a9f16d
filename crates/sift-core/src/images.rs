//! Image candidate filtering, scoring, and deduplication.
//!
//! Works purely on URLs and declared dimensions; collecting raw references
//! from markup happens in the client crate.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use url::Url;

const VALID_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "gif", "avif"];

const NON_PRODUCT_TOKENS: &[&str] = &[
    "icon", "icons", "favicon", "logo", "logos", "sprite", "sprites", "pixel", "tracking",
    "badge", "badges", "banner", "banners", "placeholder", "spinner", "loader", "avatar",
    "payment", "payments", "flag", "flags", "social", "1x1",
];

const AD_DOMAINS: &[&str] = &[
    "doubleclick.net",
    "googlesyndication.com",
    "google-analytics.com",
    "googletagmanager.com",
    "facebook.com",
    "adsrvr.org",
    "criteo.com",
    "criteo.net",
    "amazon-adsystem.com",
    "bat.bing.com",
    "scorecardresearch.com",
    "adnxs.com",
    "taboola.com",
    "outbrain.com",
];

const PRODUCT_TOKENS: &[&str] = &["product", "products", "gallery", "catalog", "pdp", "zoom"];

const WIDTH_PARAMS: &[&str] = &["w", "width", "wid", "sw", "imwidth"];
const HEIGHT_PARAMS: &[&str] = &["h", "height", "hei", "sh"];
const SIZE_PARAMS: &[&str] = &["size", "resize"];

static DIMENSION_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_](\d{2,5})x(\d{2,5})\b").expect("valid regex"));

static VARIANT_SUFFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:[-_](?:\d+x\d*|thumb|thumbnail|small|medium|large|grande|master|original|max)\b|@\dx)",
    )
    .expect("valid regex")
});

static CLOUDINARY_WIDTH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/w_\d+").expect("valid regex"));

/// Where in the markup an image reference was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Img,
    Lazy,
    Srcset,
    Meta,
    LinkedData,
    Background,
}

impl ImageSource {
    /// Ranking bonus for references found in this source.
    pub fn score_bonus(&self) -> i32 {
        match self {
            ImageSource::LinkedData => 20,
            ImageSource::Meta => 10,
            ImageSource::Srcset => 5,
            ImageSource::Img | ImageSource::Lazy => 0,
            ImageSource::Background => -5,
        }
    }
}

/// An absolute image URL as found in a document, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawImage {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub source: ImageSource,
}

impl RawImage {
    pub fn new(url: impl Into<String>, source: ImageSource) -> Self {
        Self {
            url: url.into(),
            width: None,
            height: None,
            source,
        }
    }

    pub fn with_dimensions(mut self, width: Option<u32>, height: Option<u32>) -> Self {
        self.width = width;
        self.height = height;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageCandidate {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip)]
    pub identity_key: String,
    pub score: i32,
    #[serde(skip)]
    pub source: ImageSource,
}

impl ImageCandidate {
    fn from_raw(raw: &RawImage) -> Option<Self> {
        let url = Url::parse(&raw.url).ok()?;
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        let (inferred_w, inferred_h) = infer_dimensions(&url);
        let width = raw.width.or(inferred_w);
        let height = raw.height.or(inferred_h);

        let mut candidate = Self {
            url: raw.url.clone(),
            width,
            height,
            identity_key: identity_key(&raw.url),
            score: 0,
            source: raw.source,
        };
        candidate.score = candidate.compute_score(&url);
        Some(candidate)
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        self.width.zip(self.height)
    }

    /// Pixel area, or the square of the long side when only one side is known.
    fn estimated_area(&self) -> Option<u64> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some(u64::from(w) * u64::from(h)),
            (Some(side), None) | (None, Some(side)) => Some(u64::from(side).pow(2)),
            (None, None) => None,
        }
    }

    fn passes_hard_rules(&self) -> bool {
        has_valid_image_type(&self.url) && self.width != Some(0) && self.height != Some(0)
    }

    fn passes_soft_rules(&self, policy: &ImagePolicy) -> bool {
        if is_non_product_url(&self.url) {
            return false;
        }
        match self.dimensions() {
            Some((w, h)) => {
                let area = u64::from(w) * u64::from(h);
                area >= policy.min_pixel_area && aspect_ratio(w, h) <= policy.max_aspect_ratio
            }
            None => true,
        }
    }

    fn compute_score(&self, url: &Url) -> i32 {
        let mut score = self.source.score_bonus();
        if let Some(area) = self.estimated_area() {
            score += (area / 20_000).min(60) as i32;
        }
        if let Some((w, h)) = self.dimensions() {
            if w > 0 && h > 0 && aspect_ratio(w, h) <= 1.25 {
                score += 10;
            }
        }
        if path_tokens(url).any(|t| PRODUCT_TOKENS.contains(&t.as_str())) {
            score += 25;
        }
        if has_cdn_size_param(url) {
            score += 15;
        }
        if is_non_product_url(url.as_str()) {
            score -= 50;
        }
        score
    }
}

/// Thresholds for image candidate selection.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePolicy {
    /// Minimum width × height, applied only when both are known.
    pub min_pixel_area: u64,
    /// Largest allowed long-side / short-side ratio.
    pub max_aspect_ratio: f64,
    /// Maximum number of candidates handed to hydration.
    pub max_candidates: usize,
}

impl Default for ImagePolicy {
    fn default() -> Self {
        Self {
            min_pixel_area: 250_000,
            max_aspect_ratio: 3.0,
            max_candidates: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageSelection {
    pub candidates: Vec<ImageCandidate>,
    /// Set when every hard-rule survivor failed a soft rule and the best one was kept anyway.
    pub starved: bool,
}

/// Filter, score, deduplicate, and rank raw image references.
pub fn select_candidates(raw: &[RawImage], policy: &ImagePolicy) -> ImageSelection {
    let hard: Vec<ImageCandidate> = raw
        .iter()
        .filter_map(ImageCandidate::from_raw)
        .filter(ImageCandidate::passes_hard_rules)
        .collect();

    let soft: Vec<ImageCandidate> = hard
        .iter()
        .filter(|c| c.passes_soft_rules(policy))
        .cloned()
        .collect();

    let starved = soft.is_empty() && !hard.is_empty();
    let pool = if starved {
        let best = hard
            .into_iter()
            .reduce(|best, c| if c.score > best.score { c } else { best });
        best.into_iter().collect()
    } else {
        soft
    };

    let mut candidates = dedupe(pool);
    candidates.truncate(policy.max_candidates);

    if starved {
        tracing::debug!(url = ?candidates.first().map(|c| &c.url), "Image starvation fallback");
    }

    ImageSelection {
        candidates,
        starved,
    }
}

/// Keep the highest-scoring candidate per identity key and order by score, descending.
///
/// Ties keep first-seen order, so the function is idempotent.
pub fn dedupe(candidates: Vec<ImageCandidate>) -> Vec<ImageCandidate> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<ImageCandidate> = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        match slots.get(&candidate.identity_key) {
            Some(&i) => {
                if candidate.score > kept[i].score {
                    kept[i] = candidate;
                }
            }
            None => {
                slots.insert(candidate.identity_key.clone(), kept.len());
                kept.push(candidate);
            }
        }
    }

    kept.sort_by(|a, b| b.score.cmp(&a.score));
    kept
}

/// Normalized identity of an image URL: host and path, without scheme, query,
/// fragment, or size/variant suffixes, lowercase.
///
/// Example: `https://cdn.shop.com/img/shoe_800x800.jpg?v=3` → `cdn.shop.com/img/shoe.jpg`
pub fn identity_key(raw_url: &str) -> String {
    let (host, path) = match Url::parse(raw_url) {
        Ok(url) => (
            url.host_str().unwrap_or_default().to_string(),
            url.path().to_string(),
        ),
        Err(_) => {
            let base = raw_url.split(['?', '#']).next().unwrap_or_default();
            (String::new(), base.to_string())
        }
    };

    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", path.as_str()),
    };
    let (stem, ext) = match file.rsplit_once('.') {
        Some((stem, ext)) => (stem, Some(ext)),
        None => (file, None),
    };
    let stem = VARIANT_SUFFIX.replace_all(stem, "");
    let ext = ext.map(|e| match e.to_ascii_lowercase().as_str() {
        "jpeg" => "jpg".to_string(),
        other => other.to_string(),
    });

    let mut key = format!("{host}{dir}/{stem}");
    if let Some(ext) = ext {
        key.push('.');
        key.push_str(&ext);
    }
    key.to_lowercase()
}

/// Hard file-type rule: a known raster extension on the last path segment,
/// or a `format`/`fm` query parameter naming one.
pub fn has_valid_image_type(raw_url: &str) -> bool {
    let Ok(url) = Url::parse(raw_url) else {
        return false;
    };
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    if let Some((_, ext)) = last.rsplit_once('.') {
        return VALID_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str());
    }
    url.query_pairs().any(|(k, v)| {
        matches!(&*k, "format" | "fm")
            && VALID_EXTENSIONS.contains(&v.to_ascii_lowercase().as_str())
    })
}

/// True for icons, logos, tracking pixels, and ad-network assets.
pub fn is_non_product_url(raw_url: &str) -> bool {
    let Ok(url) = Url::parse(raw_url) else {
        return false;
    };
    let host = url.host_str().unwrap_or_default();
    if AD_DOMAINS
        .iter()
        .any(|d| host == *d || host.ends_with(&format!(".{d}")))
    {
        return true;
    }
    path_tokens(&url).any(|t| NON_PRODUCT_TOKENS.contains(&t.as_str()))
}

fn aspect_ratio(w: u32, h: u32) -> f64 {
    let (long, short) = if w >= h { (w, h) } else { (h, w) };
    if short == 0 {
        return f64::INFINITY;
    }
    f64::from(long) / f64::from(short)
}

fn path_tokens(url: &Url) -> impl Iterator<Item = String> + '_ {
    url.path()
        .split(['/', '-', '_', '.'])
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_lowercase())
}

fn query_dimension(url: &Url, keys: &[&str]) -> Option<u32> {
    url.query_pairs()
        .find(|(k, _)| keys.contains(&&**k))
        .and_then(|(_, v)| v.parse::<u32>().ok())
}

/// Best-effort dimensions from the URL: `_800x600` suffixes or CDN query
/// parameters. Either side may be missing.
fn infer_dimensions(url: &Url) -> (Option<u32>, Option<u32>) {
    let last = url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .unwrap_or_default();
    if let Some(caps) = DIMENSION_SUFFIX.captures(last) {
        let w = caps.get(1).and_then(|m| m.as_str().parse().ok());
        let h = caps.get(2).and_then(|m| m.as_str().parse().ok());
        if w.is_some() && h.is_some() {
            return (w, h);
        }
    }

    (
        query_dimension(url, WIDTH_PARAMS),
        query_dimension(url, HEIGHT_PARAMS),
    )
}

fn has_cdn_size_param(url: &Url) -> bool {
    url.query_pairs().any(|(k, _)| {
        let k: &str = &k;
        WIDTH_PARAMS.contains(&k) || HEIGHT_PARAMS.contains(&k) || SIZE_PARAMS.contains(&k)
    }) || url
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .is_some_and(|last| DIMENSION_SUFFIX.is_match(last))
        || CLOUDINARY_WIDTH.is_match(url.path())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn img(url: &str) -> RawImage {
        RawImage::new(url, ImageSource::Img)
    }

    fn sized(url: &str, w: u32, h: u32) -> RawImage {
        img(url).with_dimensions(Some(w), Some(h))
    }

    #[test]
    fn no_references_yields_empty_selection() {
        let selection = select_candidates(&[], &ImagePolicy::default());
        assert!(selection.candidates.is_empty());
        assert!(!selection.starved);
    }

    #[test]
    fn identity_equal_references_collapse_to_one() {
        let raw = vec![
            img("https://cdn.shop.com/images/shoe.jpg?v=1"),
            img("https://cdn.shop.com/images/shoe-large.jpg"),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert_eq!(selection.candidates.len(), 1);
        assert!(!selection.starved);
    }

    #[test]
    fn dedupe_keeps_highest_scoring_variant() {
        let raw = vec![
            img("https://cdn.shop.com/shoe.jpg"),
            sized("https://cdn.shop.com/shoe_1200x1200.jpg", 1200, 1200),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(
            selection.candidates[0].url,
            "https://cdn.shop.com/shoe_1200x1200.jpg"
        );
    }

    #[test]
    fn dedupe_is_idempotent() {
        let raw = vec![
            sized("https://cdn.shop.com/products/a_1000x1000.jpg", 1000, 1000),
            img("https://cdn.shop.com/products/a.jpg"),
            img("https://cdn.shop.com/b.png?width=900"),
            img("https://cdn.shop.com/c.webp"),
        ];
        let once = select_candidates(&raw, &ImagePolicy::default()).candidates;
        let twice = dedupe(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn small_and_banner_images_are_rejected() {
        let raw = vec![
            sized("https://shop.com/products/mug.jpg", 800, 800),
            sized("https://shop.com/thumb.jpg", 100, 100),
            sized("https://shop.com/hero.jpg", 2400, 400),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        let urls: Vec<_> = selection.candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://shop.com/products/mug.jpg"]);
    }

    #[test]
    fn non_product_patterns_are_rejected() {
        let raw = vec![
            img("https://shop.com/assets/logo.png"),
            img("https://ad.doubleclick.net/pixel.gif"),
            img("https://shop.com/products/chair.jpg"),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(selection.candidates[0].url, "https://shop.com/products/chair.jpg");
    }

    #[test]
    fn starvation_keeps_single_best_hard_survivor() {
        let raw = vec![
            img("https://shop.com/assets/logo.png"),
            sized("https://shop.com/tiny.jpg", 50, 50),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert!(selection.starved);
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(selection.candidates[0].url, "https://shop.com/tiny.jpg");
    }

    #[test]
    fn starvation_never_bypasses_hard_rules() {
        let raw = vec![
            img("https://shop.com/logo.svg"),
            sized("https://shop.com/blank.jpg", 0, 300),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert!(selection.candidates.is_empty());
        assert!(!selection.starved);
    }

    #[test]
    fn output_is_ranked_and_capped() {
        let policy = ImagePolicy {
            max_candidates: 2,
            ..ImagePolicy::default()
        };
        let raw = vec![
            img("https://shop.com/a.jpg"),
            img("https://shop.com/products/b.jpg"),
            sized("https://shop.com/products/c.jpg", 1500, 1500),
        ];
        let selection = select_candidates(&raw, &policy);
        let urls: Vec<_> = selection.candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://shop.com/products/c.jpg", "https://shop.com/products/b.jpg"]
        );
        assert!(selection.candidates[0].score > selection.candidates[1].score);
    }

    #[test]
    fn dimensions_inferred_from_url() {
        let raw = vec![
            img("https://cdn.shop.com/files/shoe_90x90.jpg"),
            img("https://cdn.shop.com/files/boot.jpg?w=1000&h=1000"),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(selection.candidates[0].width, Some(1000));
        assert_eq!(selection.candidates[0].height, Some(1000));
    }

    #[test]
    fn width_only_query_prefers_larger_rendition() {
        let raw = vec![
            img("https://cdn.shop.com/files/shoe.jpg?width=200"),
            img("https://cdn.shop.com/files/shoe.jpg?width=1600"),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(
            selection.candidates[0].url,
            "https://cdn.shop.com/files/shoe.jpg?width=1600"
        );
        assert_eq!(selection.candidates[0].width, Some(1600));
        assert_eq!(selection.candidates[0].height, None);
    }

    #[test]
    fn srcset_width_prefers_larger_rendition() {
        let raw = vec![
            RawImage::new("https://cdn.shop.com/files/boot-small.jpg", ImageSource::Srcset)
                .with_dimensions(Some(300), None),
            RawImage::new("https://cdn.shop.com/files/boot-large.jpg", ImageSource::Srcset)
                .with_dimensions(Some(2000), None),
        ];
        let selection = select_candidates(&raw, &ImagePolicy::default());
        assert_eq!(selection.candidates.len(), 1);
        assert_eq!(
            selection.candidates[0].url,
            "https://cdn.shop.com/files/boot-large.jpg"
        );
    }

    #[test]
    fn test_valid_image_types() {
        for ext in ["jpg", "jpeg", "png", "webp", "gif", "avif"] {
            assert!(has_valid_image_type(&format!("https://x.com/img.{ext}")));
        }
        assert!(has_valid_image_type("https://x.com/img.JPEG"));
        assert!(has_valid_image_type("https://x.com/image.jpg?size=large"));
        assert!(has_valid_image_type("https://x.com/image.png#section"));
        assert!(has_valid_image_type("https://x.com/i/abc123?fm=webp"));
        assert!(!has_valid_image_type("https://x.com/logo.svg"));
        assert!(!has_valid_image_type("https://x.com/photo.bmp"));
        assert!(!has_valid_image_type("https://x.com/image"));
        assert!(!has_valid_image_type("https://x.com/path/"));
        assert!(!has_valid_image_type("https://x.com/image.tar.gz"));
    }

    #[test]
    fn test_identity_key() {
        assert_eq!(
            identity_key("https://cdn.shop.com/img/shoe_800x800.jpg?v=3"),
            "cdn.shop.com/img/shoe.jpg"
        );
        assert_eq!(
            identity_key("http://CDN.shop.com/img/Shoe-thumb.JPEG"),
            "cdn.shop.com/img/shoe.jpg"
        );
        assert_eq!(
            identity_key("https://cdn.shop.com/img/shoe@2x.jpg#zoom"),
            "cdn.shop.com/img/shoe.jpg"
        );
        assert_ne!(
            identity_key("https://cdn.shop.com/img/shoe-maximum.jpg"),
            identity_key("https://cdn.shop.com/img/shoe.jpg")
        );
    }

    #[test]
    fn test_non_product_urls() {
        assert!(is_non_product_url("https://shop.com/static/icons/cart.png"));
        assert!(is_non_product_url("https://stats.g.doubleclick.net/x.gif"));
        assert!(is_non_product_url("https://shop.com/img/payment-visa.png"));
        assert!(!is_non_product_url("https://shop.com/img/silicone-spatula.jpg"));
        assert!(!is_non_product_url("https://shop.com/products/mug.jpg"));
    }
}
