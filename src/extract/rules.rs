//! Site markup rules used by the extractor.
//!
//! The defaults describe Avito search result pages. Markup changes often, so
//! every rule can be overridden from a YAML file; fields left out of the file
//! keep their defaults.
//!
//! ```yaml
//! card_selectors:
//!   - 'div[data-marker="item"]'
//! key_pattern: '_(\d{5,})/?(?:[?#]|$)'
//! duplicate_policy: prefer_images
//! ```

use crate::error::{IngestError, Result};
use regex::Regex;
use scraper::Selector;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, instrument};

/// How to resolve two records with the same natural key on one page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// The later occurrence replaces the earlier one.
    #[default]
    KeepLast,
    /// The first occurrence wins; later ones are dropped.
    KeepFirst,
    /// Like `KeepLast`, except an occurrence without images never replaces
    /// one that has them.
    PreferImages,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractRules {
    /// Tried in order; the first selector matching anything defines the cards.
    pub card_selectors: Vec<String>,
    /// Anchor carrying the title and the listing link.
    pub title_selectors: Vec<String>,
    pub price_selectors: Vec<String>,
    pub location_selectors: Vec<String>,
    pub description_selectors: Vec<String>,
    pub image_selectors: Vec<String>,
    /// Line of rental terms such as `Залог 50 000 ₽ · Комиссия 50%`, split on `·`.
    pub params_selectors: Vec<String>,
    /// Attributes holding the ad id, checked on the card and then its descendants.
    pub key_attributes: Vec<String>,
    /// Applied to listing URLs when no key attribute is present; group 1 is the key.
    pub key_pattern: String,
    pub duplicate_policy: DuplicatePolicy,
    /// Base for relative links on pages that were not fetched from a URL.
    pub base_url: String,
}

impl Default for ExtractRules {
    fn default() -> Self {
        fn owned(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        Self {
            card_selectors: owned(&[
                r#"div[data-marker="item"]"#,
                "div.iva-item-root",
                ".js-catalog-item",
            ]),
            title_selectors: owned(&[
                r#"a[data-marker="item-title"][href]"#,
                ".iva-item-title a[href]",
                r#"a[href*="/item/"]"#,
                "a[title][href]",
            ]),
            price_selectors: owned(&[
                r#"[data-marker="item-price"]"#,
                ".iva-item-price",
                r#"[itemprop="price"]"#,
                ".price-price",
            ]),
            location_selectors: owned(&[
                r#"[data-marker="item-address"]"#,
                ".iva-item-address",
                r#"[itemprop="address"]"#,
            ]),
            description_selectors: owned(&[
                r#"[data-marker="item-description"]"#,
                r#"[itemprop="description"]"#,
            ]),
            image_selectors: owned(&[
                r#"img[data-marker="image"]"#,
                ".iva-item-image img",
                r#"[data-marker*="image"] img"#,
            ]),
            params_selectors: owned(&[
                r#"p[data-marker="item-specific-params"]"#,
                r#"[data-marker="item-specific-params"]"#,
            ]),
            key_attributes: owned(&["data-item-id", "data-id"]),
            key_pattern: r"[_/](\d{5,})/?(?:[?#]|$)".to_string(),
            duplicate_policy: DuplicatePolicy::KeepLast,
            base_url: "https://www.avito.ru".to_string(),
        }
    }
}

impl ExtractRules {
    /// Load rules from a YAML file, falling back to defaults for missing fields.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = match tokio::fs::read_to_string(path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IngestError::NotFound(path.to_path_buf()));
            }
            Err(e) => {
                return Err(IngestError::Validation(format!(
                    "cannot read rules {}: {e}",
                    path.display()
                )));
            }
        };
        let rules = Self::from_yaml_str(&text)?;
        info!(
            cards = rules.card_selectors.len(),
            policy = ?rules.duplicate_policy,
            "Loaded extraction rules"
        );
        Ok(rules)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| IngestError::Validation(format!("invalid extraction rules: {e}")))
    }
}

/// [`ExtractRules`] with selectors and the key pattern compiled.
#[derive(Debug)]
pub(crate) struct CompiledRules {
    pub cards: Vec<Selector>,
    pub titles: Vec<Selector>,
    pub prices: Vec<Selector>,
    pub locations: Vec<Selector>,
    pub descriptions: Vec<Selector>,
    pub images: Vec<Selector>,
    pub params: Vec<Selector>,
    pub key_attributes: Vec<String>,
    pub key_pattern: Regex,
    pub duplicate_policy: DuplicatePolicy,
    pub base_url: url::Url,
}

fn compile_all(selectors: &[String]) -> Result<Vec<Selector>> {
    selectors
        .iter()
        .map(|s| {
            Selector::parse(s)
                .map_err(|e| IngestError::Validation(format!("invalid selector {s:?}: {e:?}")))
        })
        .collect()
}

impl CompiledRules {
    pub fn compile(rules: &ExtractRules) -> Result<Self> {
        let key_pattern = Regex::new(&rules.key_pattern).map_err(|e| {
            IngestError::Validation(format!("invalid key pattern {:?}: {e}", rules.key_pattern))
        })?;
        if key_pattern.captures_len() < 2 {
            return Err(IngestError::Validation(format!(
                "key pattern {:?} needs a capture group",
                rules.key_pattern
            )));
        }
        let base_url = url::Url::parse(&rules.base_url).map_err(|e| {
            IngestError::Validation(format!("invalid base url {:?}: {e}", rules.base_url))
        })?;

        Ok(Self {
            cards: compile_all(&rules.card_selectors)?,
            titles: compile_all(&rules.title_selectors)?,
            prices: compile_all(&rules.price_selectors)?,
            locations: compile_all(&rules.location_selectors)?,
            descriptions: compile_all(&rules.description_selectors)?,
            images: compile_all(&rules.image_selectors)?,
            params: compile_all(&rules.params_selectors)?,
            key_attributes: rules.key_attributes.clone(),
            key_pattern,
            duplicate_policy: rules.duplicate_policy,
            base_url,
        })
    }

    /// The ad id embedded in a listing URL, if the key pattern finds one.
    pub fn key_from_url(&self, url: &str) -> Option<String> {
        self.key_pattern
            .captures(url)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_compile() {
        let compiled = CompiledRules::compile(&ExtractRules::default()).unwrap();
        assert_eq!(compiled.cards.len(), 3);
        assert_eq!(compiled.params.len(), 2);
        assert_eq!(compiled.duplicate_policy, DuplicatePolicy::KeepLast);
    }

    #[test]
    fn test_key_from_url() {
        let compiled = CompiledRules::compile(&ExtractRules::default()).unwrap();
        assert_eq!(
            compiled
                .key_from_url("https://www.avito.ru/moskva/kvartiry/2-k._kvartira_54m_3578421570")
                .as_deref(),
            Some("3578421570")
        );
        assert_eq!(
            compiled
                .key_from_url("/moskva/kvartiry/studiya_25m_1234567?context=abc")
                .as_deref(),
            Some("1234567")
        );
        assert_eq!(compiled.key_from_url("/moskva/kvartiry"), None);
        assert_eq!(compiled.key_from_url("/item/12"), None);
    }

    #[test]
    fn test_yaml_overrides_keep_defaults() {
        let yaml = r#"
card_selectors:
  - "article.listing"
duplicate_policy: prefer_images
"#;
        let rules = ExtractRules::from_yaml_str(yaml).unwrap();
        assert_eq!(rules.card_selectors, vec!["article.listing"]);
        assert_eq!(rules.duplicate_policy, DuplicatePolicy::PreferImages);
        assert_eq!(rules.key_attributes, ExtractRules::default().key_attributes);
    }

    #[test]
    fn test_invalid_params_selector_is_validation_error() {
        let rules = ExtractRules::from_yaml_str("params_selectors: ['p[']").unwrap();
        assert!(matches!(
            CompiledRules::compile(&rules),
            Err(IngestError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_selector_is_validation_error() {
        let rules = ExtractRules {
            card_selectors: vec!["div[".to_string()],
            ..ExtractRules::default()
        };
        let err = CompiledRules::compile(&rules).unwrap_err();
        assert!(matches!(err, IngestError::Validation(_)));
    }

    #[test]
    fn test_key_pattern_needs_group() {
        let rules = ExtractRules {
            key_pattern: r"\d+".to_string(),
            ..ExtractRules::default()
        };
        assert!(matches!(
            CompiledRules::compile(&rules),
            Err(IngestError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_from_yaml_file_missing() {
        let err = ExtractRules::from_yaml_file("/definitely/not/here.yaml")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
