//! Field extraction from raw book pages.
//!
//! Pure functions over a parsed document: no network access, no shared state.
//! Selectors come from [`SelectorConfig`] and are parsed once.

use scraper::{ElementRef, Html, Selector};

use crate::config::SelectorConfig;
use crate::types::{EnrichError, EnrichResult, EnrichedFields, ExtractionGap, TERM_LEVEL_SEPARATOR};

/// Whatever could be found on one page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedFields {
    pub taxonomy: Vec<String>,
    pub image: Option<String>,
}

impl ExtractedFields {
    /// Both fields present, or the gap describing what is missing.
    pub fn complete(self) -> Result<EnrichedFields, ExtractionGap> {
        match self.image {
            Some(image) if !self.taxonomy.is_empty() => Ok(EnrichedFields {
                taxonomy: self.taxonomy,
                image,
            }),
            image => Err(ExtractionGap {
                missing_taxonomy: self.taxonomy.is_empty(),
                missing_image: image.is_none(),
            }),
        }
    }
}

/// Compiled selectors for the taxonomy and primary image.
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    taxonomy_group: Selector,
    taxonomy_label: Selector,
    image_meta: Selector,
    image_element: Selector,
}

impl FieldExtractor {
    pub fn new(config: &SelectorConfig) -> EnrichResult<Self> {
        Ok(Self {
            taxonomy_group: parse_selector(&config.taxonomy_group)?,
            taxonomy_label: parse_selector(&config.taxonomy_label)?,
            image_meta: parse_selector(&config.image_meta)?,
            image_element: parse_selector(&config.image_element)?,
        })
    }

    /// Parse `body` and extract both fields.
    pub fn extract(&self, body: &str) -> ExtractedFields {
        let document = Html::parse_document(body);
        ExtractedFields {
            taxonomy: self.extract_taxonomy(&document),
            image: self.extract_primary_image(&document),
        }
    }

    /// Hierarchical terms in document order. Each group's labels are joined
    /// with `" > "`; groups without labels are skipped; duplicates are kept.
    pub fn extract_taxonomy(&self, document: &Html) -> Vec<String> {
        document
            .select(&self.taxonomy_group)
            .filter_map(|group| {
                let labels: Vec<String> = group
                    .select(&self.taxonomy_label)
                    .map(element_text)
                    .filter(|label| !label.is_empty())
                    .collect();
                (!labels.is_empty()).then(|| labels.join(TERM_LEVEL_SEPARATOR))
            })
            .collect()
    }

    /// Metadata image tag first, then the named image element.
    pub fn extract_primary_image(&self, document: &Html) -> Option<String> {
        first_attr(document, &self.image_meta, &["content"])
            .or_else(|| first_attr(document, &self.image_element, &["src", "content"]))
    }
}

fn parse_selector(selector: &str) -> EnrichResult<Selector> {
    Selector::parse(selector).map_err(|e| EnrichError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// Text content with whitespace runs collapsed.
fn element_text(el: ElementRef<'_>) -> String {
    let text: String = el.text().collect();
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// First non-empty value of any of `attrs` across the matches of `sel`.
fn first_attr(document: &Html, sel: &Selector, attrs: &[&str]) -> Option<String> {
    document.select(sel).find_map(|el| {
        attrs.iter().find_map(|attr| {
            el.value()
                .attr(attr)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        })
    })
}
