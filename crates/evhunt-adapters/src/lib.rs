//! Acquisition strategies: how raw listings get off a storefront and into
//! the pipeline. Two paths exist per store, tried in order: the Shopify
//! JSON catalog endpoint, then generic DOM extraction from the listing page.

use std::time::Duration;

use async_trait::async_trait;
use evhunt_core::{RawListing, RawPrice};
use evhunt_storage::HttpFetcher;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "evhunt-adapters";

/// Static per-store configuration, loaded from `stores.yaml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub products_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub affiliate: bool,
    #[serde(default)]
    pub discount_percent: u32,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// One way of acquiring raw listings from a store. The pipeline tries
/// strategies in order and takes the first non-empty result.
#[async_trait]
pub trait AcquisitionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        store: &StoreConfig,
    ) -> Result<Vec<RawListing>, AdapterError>;
}

#[derive(Debug, Clone, Deserialize)]
struct ShopifyCatalogPage {
    #[serde(default)]
    products: Vec<ShopifyProduct>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShopifyProduct {
    #[serde(default)]
    title: String,
    #[serde(default)]
    handle: String,
    #[serde(default)]
    body_html: Option<String>,
    #[serde(default)]
    vendor: String,
    #[serde(default)]
    product_type: String,
    #[serde(default)]
    tags: ShopifyTags,
    #[serde(default)]
    variants: Vec<ShopifyVariant>,
    #[serde(default)]
    images: Vec<ShopifyImage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ShopifyVariant {
    #[serde(default)]
    price: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ShopifyImage {
    #[serde(default)]
    src: String,
}

/// Shopify serializes tags either as an array or as one comma-joined string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ShopifyTags {
    List(Vec<String>),
    Joined(String),
}

impl Default for ShopifyTags {
    fn default() -> Self {
        ShopifyTags::List(Vec::new())
    }
}

impl ShopifyTags {
    fn into_vec(self) -> Vec<String> {
        match self {
            ShopifyTags::List(tags) => tags,
            ShopifyTags::Joined(joined) => joined
                .split(',')
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }
}

/// Acquisition collaborator A: pages through `/products.json` until the
/// storefront returns an empty page or the page cap is reached.
#[derive(Debug, Clone)]
pub struct ShopifyApiStrategy {
    pub max_pages: usize,
    pub page_size: usize,
    pub page_delay: Duration,
}

impl Default for ShopifyApiStrategy {
    fn default() -> Self {
        Self {
            max_pages: 20,
            page_size: 250,
            page_delay: Duration::from_millis(500),
        }
    }
}

impl ShopifyApiStrategy {
    /// Parse one catalog page into raw listings. Public so tests can run it
    /// against fixture payloads without a network.
    pub fn parse_catalog_page(
        store: &StoreConfig,
        bytes: &[u8],
    ) -> Result<Vec<RawListing>, AdapterError> {
        let page: ShopifyCatalogPage = serde_json::from_slice(bytes)
            .map_err(|e| AdapterError::Message(format!("invalid catalog payload: {e}")))?;

        let base = store.base_url.trim_end_matches('/');
        Ok(page
            .products
            .into_iter()
            .map(|product| {
                let price = product
                    .variants
                    .first()
                    .map(|v| RawPrice::Text(v.price.clone()))
                    .unwrap_or_default();
                let description = product
                    .body_html
                    .as_deref()
                    .map(|html| strip_html(html).chars().take(200).collect())
                    .unwrap_or_default();
                RawListing {
                    title: product.title,
                    price,
                    url: format!("{base}/products/{}", product.handle),
                    image: product
                        .images
                        .first()
                        .map(|i| i.src.clone())
                        .unwrap_or_default(),
                    description,
                    vendor: product.vendor,
                    product_type: product.product_type,
                    tags: product.tags.into_vec(),
                }
            })
            .collect())
    }

    /// Fold one fetched page into the accumulator. Returns `false` when
    /// pagination should stop: an empty page, or a payload that fails to
    /// parse. Pages gathered so far are kept either way.
    fn accumulate_page(
        store: &StoreConfig,
        listings: &mut Vec<RawListing>,
        body: &[u8],
        page: usize,
    ) -> bool {
        match Self::parse_catalog_page(store, body) {
            Ok(page_listings) if page_listings.is_empty() => false,
            Ok(page_listings) => {
                listings.extend(page_listings);
                true
            }
            Err(err) => {
                warn!(store = %store.id, page, error = %err, "catalog page parse failed");
                false
            }
        }
    }
}

#[async_trait]
impl AcquisitionStrategy for ShopifyApiStrategy {
    fn name(&self) -> &'static str {
        "shopify-api"
    }

    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        store: &StoreConfig,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let base = store.base_url.trim_end_matches('/');
        let mut listings = Vec::new();

        for page in 1..=self.max_pages {
            let url = format!("{base}/products.json?limit={}&page={page}", self.page_size);
            let response = match http.fetch_bytes(&store.id, &url).await {
                Ok(response) => response,
                Err(err) => {
                    // A 404 on page 1 just means this store has no JSON API;
                    // mid-pagination failures keep whatever we already have.
                    warn!(store = %store.id, page, error = %err, "catalog page fetch failed");
                    break;
                }
            };

            if !Self::accumulate_page(store, &mut listings, &response.body, page) {
                break;
            }

            tokio::time::sleep(self.page_delay).await;
        }

        Ok(listings)
    }
}

/// CSS selectors driving generic listing-page extraction. Each field may be
/// a selector list; the first matching element wins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractionSchema {
    pub product_list: String,
    pub title: String,
    pub price: String,
    pub url: String,
    pub image: String,
}

/// The selector set that covers most Shopify storefront themes.
pub fn default_extraction_schema() -> ExtractionSchema {
    ExtractionSchema {
        product_list: ".product-card, .product-item, [data-product-id]".to_string(),
        title: ".product-title, .product-name, h2, h3".to_string(),
        price: ".product-price, .price, [data-product-price]".to_string(),
        url: "a".to_string(),
        image: "img".to_string(),
    }
}

/// Acquisition collaborator B: fetches the store's listing page and pulls
/// listings out of the markup. Used when the structured API yields nothing.
#[derive(Debug, Clone)]
pub struct DomExtractionStrategy {
    pub schema: ExtractionSchema,
}

impl Default for DomExtractionStrategy {
    fn default() -> Self {
        Self {
            schema: default_extraction_schema(),
        }
    }
}

impl DomExtractionStrategy {
    /// Extract raw listings from listing-page markup. URLs are left exactly
    /// as they appear; the normalizer repairs relative ones.
    pub fn extract_from_html(
        html: &str,
        schema: &ExtractionSchema,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let list_sel = parse_selector(&schema.product_list)?;
        let title_sel = parse_selector(&schema.title)?;
        let price_sel = parse_selector(&schema.price)?;
        let url_sel = parse_selector(&schema.url)?;
        let image_sel = parse_selector(&schema.image)?;

        let document = Html::parse_document(html);
        let mut listings = Vec::new();

        for element in document.select(&list_sel) {
            let title = first_text(&element, &title_sel).unwrap_or_default();
            if title.is_empty() {
                continue;
            }
            let price = first_text(&element, &price_sel)
                .map(RawPrice::Text)
                .unwrap_or_default();
            let url = first_attr(&element, &url_sel, "href").unwrap_or_default();
            let image = first_attr(&element, &image_sel, "src")
                .or_else(|| first_attr(&element, &image_sel, "data-src"))
                .unwrap_or_default();

            listings.push(RawListing {
                title,
                price,
                url,
                image,
                ..RawListing::default()
            });
        }

        Ok(listings)
    }
}

#[async_trait]
impl AcquisitionStrategy for DomExtractionStrategy {
    fn name(&self) -> &'static str {
        "dom-extraction"
    }

    async fn fetch_listings(
        &self,
        http: &HttpFetcher,
        store: &StoreConfig,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let response = match http.fetch_bytes(&store.id, &store.products_url).await {
            Ok(response) => response,
            Err(err) => {
                warn!(store = %store.id, error = %err, "listing page fetch failed");
                return Ok(Vec::new());
            }
        };
        let html = String::from_utf8_lossy(&response.body);
        Self::extract_from_html(&html, &self.schema)
    }
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("bad selector {selector:?}: {e}")))
}

fn first_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(|n| n.text().collect::<String>())
        .map(|t| t.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}

fn first_attr(element: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Flatten markup to its text content, whitespace-normalized.
pub fn strip_html(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    fragment
        .root_element()
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> StoreConfig {
        StoreConfig {
            id: "tesery".to_string(),
            name: "Tesery".to_string(),
            base_url: "https://www.tesery.com".to_string(),
            products_url: "https://www.tesery.com/collections/all".to_string(),
            enabled: true,
            affiliate: true,
            discount_percent: 5,
        }
    }

    #[test]
    fn parses_catalog_page_with_tag_array() {
        let payload = serde_json::json!({
            "products": [{
                "title": "Model Y All-Weather Floor Mats",
                "handle": "model-y-all-weather-floor-mats",
                "body_html": "<p>Custom-fit <b>floor mats</b> for every season.</p>",
                "vendor": "Tesery",
                "product_type": "Floor Mats",
                "tags": ["model-y", "interior"],
                "variants": [{"price": "49.99"}, {"price": "59.99"}],
                "images": [{"src": "https://cdn.tesery.com/mats.jpg"}]
            }]
        });
        let listings =
            ShopifyApiStrategy::parse_catalog_page(&test_store(), payload.to_string().as_bytes())
                .expect("parse");

        assert_eq!(listings.len(), 1);
        let listing = &listings[0];
        assert_eq!(listing.title, "Model Y All-Weather Floor Mats");
        assert_eq!(listing.price, RawPrice::Text("49.99".to_string()));
        assert_eq!(
            listing.url,
            "https://www.tesery.com/products/model-y-all-weather-floor-mats"
        );
        assert_eq!(listing.image, "https://cdn.tesery.com/mats.jpg");
        assert_eq!(listing.description, "Custom-fit floor mats for every season.");
        assert_eq!(listing.product_type, "Floor Mats");
        assert_eq!(listing.tags, vec!["model-y".to_string(), "interior".to_string()]);
    }

    #[test]
    fn parses_catalog_page_with_joined_tags_and_no_variants() {
        let payload = serde_json::json!({
            "products": [{
                "title": "Sunshade",
                "handle": "sunshade",
                "tags": "model-3, roof, summer",
                "variants": [],
                "images": []
            }]
        });
        let listings =
            ShopifyApiStrategy::parse_catalog_page(&test_store(), payload.to_string().as_bytes())
                .expect("parse");

        assert_eq!(listings[0].tags, vec!["model-3", "roof", "summer"]);
        assert_eq!(listings[0].price, RawPrice::Text(String::new()));
        assert!(listings[0].image.is_empty());
    }

    #[test]
    fn pagination_keeps_pages_gathered_before_a_bad_payload() {
        let store = test_store();
        let mut listings = Vec::new();

        let good = serde_json::json!({
            "products": [{"title": "Sunshade", "handle": "sunshade"}]
        });
        assert!(ShopifyApiStrategy::accumulate_page(
            &store,
            &mut listings,
            good.to_string().as_bytes(),
            1,
        ));

        // A storefront error page mid-pagination stops paging but keeps
        // what was already collected.
        assert!(!ShopifyApiStrategy::accumulate_page(
            &store,
            &mut listings,
            b"<html>blocked</html>",
            2,
        ));
        assert_eq!(listings.len(), 1);

        let empty = serde_json::json!({"products": []});
        assert!(!ShopifyApiStrategy::accumulate_page(
            &store,
            &mut listings,
            empty.to_string().as_bytes(),
            3,
        ));
        assert_eq!(listings.len(), 1);
    }

    #[test]
    fn rejects_malformed_catalog_payload() {
        let err = ShopifyApiStrategy::parse_catalog_page(&test_store(), b"<html>blocked</html>")
            .expect_err("should fail");
        assert!(matches!(err, AdapterError::Message(_)));
    }

    #[test]
    fn extracts_listings_from_markup() {
        let html = r#"
            <div class="grid">
              <div class="product-card">
                <h3 class="product-title">Model 3 Mud Flaps</h3>
                <span class="price">$34.99 USD</span>
                <a href="/products/model-3-mud-flaps">view</a>
                <img data-src="//cdn.example.com/flaps.jpg">
              </div>
              <div class="product-card">
                <h3 class="product-title">Cybertruck Bed Mat</h3>
                <span class="price">From $129.00</span>
                <a href="https://store.example.com/products/ct-bed-mat">view</a>
                <img src="https://cdn.example.com/bedmat.jpg">
              </div>
              <div class="product-card"><span class="price">$9.99</span></div>
            </div>
        "#;
        let listings =
            DomExtractionStrategy::extract_from_html(html, &default_extraction_schema())
                .expect("extract");

        // The title-less card is dropped.
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].title, "Model 3 Mud Flaps");
        assert_eq!(listings[0].price, RawPrice::Text("$34.99 USD".to_string()));
        assert_eq!(listings[0].url, "/products/model-3-mud-flaps");
        assert_eq!(listings[0].image, "//cdn.example.com/flaps.jpg");
        assert_eq!(listings[1].image, "https://cdn.example.com/bedmat.jpg");
    }

    #[test]
    fn strip_html_flattens_markup() {
        assert_eq!(
            strip_html("<p>Custom-fit\n<b>mats</b> for   Tesla</p>"),
            "Custom-fit mats for Tesla"
        );
        assert_eq!(strip_html("plain text"), "plain text");
    }
}
