use std::sync::{Arc, LazyLock};

use htmd::HtmlToMarkdown;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use sift_core::error::AppError;
use sift_core::traits::Distiller;

/// Candidate main-content regions, most specific first.
const REGION_SELECTORS: &[&str] = &[
    "main",
    "article",
    "[role=main]",
    "#main-content",
    "#content",
    "[itemtype*=Product]",
];

/// A region needs at least this much text to be taken as the main content.
const MIN_REGION_CHARS: usize = 200;

/// Shorter output carries no usable product story.
const MIN_USABLE_CHARS: usize = 40;

static REGIONS: LazyLock<Vec<Selector>> = LazyLock::new(|| {
    REGION_SELECTORS
        .iter()
        .map(|s| Selector::parse(s).expect("static selector"))
        .collect()
});

static BODY: LazyLock<Selector> = LazyLock::new(|| Selector::parse("body").expect("static selector"));

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*(?:\n[ \t]*){2,}").expect("valid regex"));

/// HTML-to-Markdown distiller using htmd.
///
/// Picks the page's main content region, then converts it into Markdown
/// with chrome elements (script, style, nav, forms, etc.) stripped to
/// minimize LLM token usage.
pub struct HtmdDistiller {
    converter: Arc<HtmlToMarkdown>,
}

impl Clone for HtmdDistiller {
    fn clone(&self) -> Self {
        Self {
            converter: Arc::clone(&self.converter),
        }
    }
}

impl HtmdDistiller {
    pub fn new() -> Self {
        let converter = HtmlToMarkdown::builder()
            .skip_tags(vec![
                "script", "style", "nav", "footer", "header", "aside", "noscript", "iframe", "svg",
                "form", "button",
            ])
            .build();

        Self {
            converter: Arc::new(converter),
        }
    }
}

impl Default for HtmdDistiller {
    fn default() -> Self {
        Self::new()
    }
}

fn text_len(el: &ElementRef<'_>) -> usize {
    el.text().map(|t| t.trim().chars().count()).sum()
}

/// Outer HTML of the main content region, or the whole document.
fn main_region(html: &str) -> String {
    let doc = Html::parse_document(html);
    REGIONS
        .iter()
        .flat_map(|sel| doc.select(sel))
        .find(|el| text_len(el) >= MIN_REGION_CHARS)
        .or_else(|| doc.select(&BODY).next())
        .map(|el| el.html())
        .unwrap_or_else(|| html.to_string())
}

fn collapse_blank_lines(text: &str) -> String {
    BLANK_RUNS.replace_all(text.trim(), "\n\n").into_owned()
}

impl Distiller for HtmdDistiller {
    fn distill(&self, html: &str) -> Result<String, AppError> {
        if html.trim().is_empty() {
            return Err(AppError::DistillationError("Document is empty".into()));
        }

        let region = main_region(html);
        let markdown = self
            .converter
            .convert(&region)
            .map_err(|e| AppError::DistillationError(e.to_string()))?;
        let markdown = collapse_blank_lines(&markdown);

        let usable = markdown.chars().filter(|c| !c.is_whitespace()).count();
        if usable < MIN_USABLE_CHARS {
            return Err(AppError::DistillationError(format!(
                "Distilled content too sparse ({usable} characters)"
            )));
        }
        Ok(markdown)
    }
}
