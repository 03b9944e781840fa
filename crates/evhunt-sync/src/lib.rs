//! Scrape pipeline orchestration: normalize raw listings, enrich thin
//! descriptions, merge against the persisted catalog, and find cross-store
//! price matches.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use evhunt_adapters::{
    AcquisitionStrategy, DomExtractionStrategy, ShopifyApiStrategy, StoreConfig,
};
use evhunt_core::{
    canonicalize_title, detect_category, detect_models, product_key, PriceMatch, Product,
    RawListing, RawPrice, CATEGORY_RULES, MODEL_RULES, UNIVERSAL,
};
use evhunt_storage::{update_price_history, CatalogStore, HttpClientConfig, HttpFetcher};
use serde::{Deserialize, Serialize};
use strsim::sorensen_dice;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evhunt-sync";

/// Listings cheaper than this are junk (samples, stickers, shipping SKUs)
/// and are rejected at normalization time.
pub const MIN_PRICE: f64 = 10.0;

/// Descriptions shorter than this are considered missing and get enriched.
pub const MIN_DESCRIPTION_LEN: usize = 50;

/// Groups need this much average pairwise title similarity to count as the
/// same product across stores.
const MIN_MATCH_SIMILARITY: f64 = 0.65;

#[derive(Debug, Clone, Deserialize)]
pub struct StoreRegistry {
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay_ms: u64,
    pub enrich_batch_size: usize,
    pub enrich_pause_ms: u64,
    pub anthropic_api_key: Option<String>,
    pub scheduler_enabled: bool,
    pub scrape_cron: String,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("EVHUNT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            workspace_root: PathBuf::from("."),
            user_agent: std::env::var("EVHUNT_USER_AGENT")
                .unwrap_or_else(|_| "evhunt-bot/0.1".to_string()),
            http_timeout_secs: std::env::var("EVHUNT_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_delay_ms: std::env::var("EVHUNT_PAGE_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            enrich_batch_size: std::env::var("EVHUNT_ENRICH_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            enrich_pause_ms: std::env::var("EVHUNT_ENRICH_PAUSE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok().filter(|k| !k.is_empty()),
            scheduler_enabled: std::env::var("EVHUNT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            scrape_cron: std::env::var("EVHUNT_SCRAPE_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Record normalizer
// ---------------------------------------------------------------------------

/// Pull the first numeric magnitude out of a raw price. Handles currency
/// symbols, thousands separators, and range text ("From $1,299.00"); any
/// unparseable input defaults to zero, which the price floor then rejects.
pub fn parse_price(raw: &RawPrice) -> f64 {
    match raw {
        RawPrice::Amount(amount) => *amount,
        RawPrice::Text(text) => {
            let mut number = String::new();
            let mut seen_digit = false;
            let mut seen_dot = false;
            for ch in text.chars() {
                match ch {
                    '0'..='9' => {
                        number.push(ch);
                        seen_digit = true;
                    }
                    ',' if seen_digit && !seen_dot => {}
                    '.' if seen_digit && !seen_dot => {
                        number.push(ch);
                        seen_dot = true;
                    }
                    _ if seen_digit => break,
                    _ => {}
                }
            }
            number.parse().unwrap_or(0.0)
        }
    }
}

/// Repair a possibly-relative URL against the store's base. Scheme-relative
/// URLs (`//cdn...`) get `https:`; anything without a scheme is joined to
/// the base URL.
pub fn resolve_url(base_url: &str, url: &str) -> String {
    if url.is_empty() || url.starts_with("http") {
        return url.to_string();
    }
    if let Some(rest) = url.strip_prefix("//") {
        return format!("https://{rest}");
    }
    let base = base_url.trim_end_matches('/');
    if url.starts_with('/') {
        format!("{base}{url}")
    } else {
        format!("{base}/{url}")
    }
}

/// Convert a raw listing into a canonical product record, or reject it.
/// Rejection is silent: an empty title or a price below [`MIN_PRICE`]
/// yields `None`. Pure aside from reading the store configuration.
pub fn normalize_listing(
    raw: &RawListing,
    store: &StoreConfig,
    scraped_at: DateTime<Utc>,
) -> Option<Product> {
    let title = raw.title.trim();
    if title.is_empty() {
        return None;
    }
    let price = parse_price(&raw.price);
    if price < MIN_PRICE {
        return None;
    }

    Some(Product {
        title: title.to_string(),
        price,
        currency: "USD".to_string(),
        url: resolve_url(&store.base_url, &raw.url),
        image: resolve_url(&store.base_url, &raw.image),
        source: store.name.clone(),
        source_id: store.id.clone(),
        description: raw.description.clone(),
        vendor: raw.vendor.clone(),
        product_type: raw.product_type.clone(),
        tags: raw.tags.clone(),
        models: detect_models(MODEL_RULES, title, &raw.description),
        category: detect_category(CATEGORY_RULES, title, &raw.product_type),
        match_key: canonicalize_title(title),
        scraped_at,
    })
}

// ---------------------------------------------------------------------------
// Description enricher
// ---------------------------------------------------------------------------

/// External text-generation collaborator. Treated as unreliable: any error
/// degrades to [`fallback_description`] and never aborts the batch.
#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    async fn generate(&self, product: &Product) -> Result<String>;
}

/// Claude-backed generator hitting the Anthropic messages API with a short
/// structured prompt and a bounded timeout.
pub struct ClaudeDescriptionGenerator {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: String,
}

impl ClaudeDescriptionGenerator {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building enrichment http client")?;
        Ok(Self {
            client,
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_key,
            model: "claude-3-haiku-20240307".to_string(),
        })
    }

    fn prompt(product: &Product) -> String {
        let models = product.models.join(", ");
        format!(
            "Write a concise 2-sentence product description for SEO.\n\n\
             Product: {}\nCategory: {}\nCompatible with: {}\nStore: {}\n\n\
             Requirements:\n- Natural, not salesy\n- Include compatibility info\n\
             - Mention key benefit\n- Under 160 characters total",
            product.title, product.category, models, product.source
        )
    }
}

#[async_trait]
impl DescriptionGenerator for ClaudeDescriptionGenerator {
    async fn generate(&self, product: &Product) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 200,
            "messages": [{"role": "user", "content": Self::prompt(product)}],
        });
        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
            .context("sending enrichment request")?
            .error_for_status()
            .context("enrichment request rejected")?;

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("decoding enrichment response")?;
        let text = parsed
            .content
            .first()
            .map(|c| c.text.trim().to_string())
            .unwrap_or_default();
        if text.is_empty() {
            bail!("empty completion");
        }
        Ok(text)
    }
}

fn title_case_tag(tag: &str) -> String {
    tag.split('-')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic description used when the generator is unavailable or
/// fails: category, compatible models (the `universal` sentinel excluded),
/// and the store name.
pub fn fallback_description(product: &Product) -> String {
    let model_text = product
        .models
        .iter()
        .filter(|m| m.as_str() != UNIVERSAL)
        .map(|m| title_case_tag(m))
        .collect::<Vec<_>>()
        .join(", ");
    let model_text = if model_text.is_empty() {
        "all Tesla vehicles".to_string()
    } else {
        model_text
    };
    format!(
        "Premium {} designed for {}. Quality Tesla accessory from {}.",
        product.category.replace('-', " "),
        model_text,
        product.source
    )
}

/// Rewrites short descriptions in place, throttling the live generator
/// after every `batch_size` calls.
pub struct DescriptionEnricher {
    generator: Option<Arc<dyn DescriptionGenerator>>,
    batch_size: usize,
    pause: Duration,
}

impl DescriptionEnricher {
    pub fn new(
        generator: Option<Arc<dyn DescriptionGenerator>>,
        batch_size: usize,
        pause: Duration,
    ) -> Self {
        Self {
            generator,
            batch_size: batch_size.max(1),
            pause,
        }
    }

    /// Fallback-only enricher, used when no API key is configured.
    pub fn offline() -> Self {
        Self::new(None, usize::MAX, Duration::ZERO)
    }

    pub async fn enrich(&self, products: &mut [Product]) {
        let mut generated = 0usize;
        for product in products.iter_mut() {
            if product.description.chars().count() >= MIN_DESCRIPTION_LEN {
                continue;
            }

            product.description = match &self.generator {
                Some(generator) => match generator.generate(product).await {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(title = %product.title, error = %err, "description generation failed, using fallback");
                        fallback_description(product)
                    }
                },
                None => fallback_description(product),
            };

            generated += 1;
            // The pause only matters for the live collaborator's rate limits.
            if self.generator.is_some() && generated % self.batch_size == 0 {
                tokio::time::sleep(self.pause).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog merger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub new_count: usize,
    pub updated_count: usize,
    pub total_count: usize,
}

/// Merge a freshly scraped batch into the persisted catalog.
///
/// Semantics, per store:
/// - stores present in the batch are fully replaced (delisted items drop);
/// - stores absent from the batch carry forward unchanged, so a store that
///   was skipped or whose acquisition failed never loses its listings.
///
/// Per record, the new version supersedes the old except that the longer
/// of the two descriptions is kept.
pub fn merge_catalog(
    existing: &BTreeMap<String, Product>,
    new_records: Vec<Product>,
) -> (BTreeMap<String, Product>, MergeStats) {
    let scraped_stores: BTreeSet<String> =
        new_records.iter().map(|p| p.source_id.clone()).collect();

    let mut merged = BTreeMap::new();
    let mut stats = MergeStats::default();

    for mut record in new_records {
        let key = product_key(&record.source_id, &record.match_key);
        match existing.get(&key) {
            Some(old) => {
                if old.description.len() > record.description.len() {
                    record.description = old.description.clone();
                }
                stats.updated_count += 1;
            }
            None => stats.new_count += 1,
        }
        merged.insert(key, record);
    }

    for (key, old) in existing {
        if !scraped_stores.contains(&old.source_id) {
            merged.entry(key.clone()).or_insert_with(|| old.clone());
        }
    }

    stats.total_count = merged.len();
    (merged, stats)
}

// ---------------------------------------------------------------------------
// Cross-store price matching
// ---------------------------------------------------------------------------

const MATERIAL_TERMS: &[&str] = &[
    "carbon", "leather", "alcantara", "suede", "wood", "chrome", "matte", "glossy",
];
const COLOR_TERMS: &[&str] = &["black", "white", "red", "blue", "gray", "grey"];
const QUANTITY_UNITS: &[&str] = &["pc", "pcs", "piece", "pieces", "set", "pack"];

fn quantity_term(title_lower: &str) -> Option<String> {
    let tokens: Vec<&str> = title_lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.chars().all(|c| c.is_ascii_digit()) {
            if let Some(next) = tokens.get(i + 1) {
                if QUANTITY_UNITS.contains(next) {
                    return Some(format!("{token}pcs"));
                }
            }
            continue;
        }
        let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() && QUANTITY_UNITS.contains(&&token[digits.len()..]) {
            return Some(format!("{digits}pcs"));
        }
    }
    None
}

/// Looser grouping key than the exact match key: category, models, and a
/// handful of distinguishing terms (material, color, quantity, and mat
/// coverage), so near-identical listings with differently worded titles
/// still land in the same bucket.
fn flex_match_key(product: &Product) -> String {
    let title = product.title.to_lowercase();
    let mut models = product.models.clone();
    models.sort();

    let mut terms: Vec<String> = MATERIAL_TERMS
        .iter()
        .chain(COLOR_TERMS)
        .filter(|term| title.contains(*term))
        .map(|term| term.to_string())
        .collect();
    if let Some(qty) = quantity_term(&title) {
        terms.push(qty);
    }
    if product.category == "floor-mats" {
        if title.contains("front") {
            terms.push("front".to_string());
        }
        if title.contains("rear") || title.contains("back") {
            terms.push("rear".to_string());
        }
        if title.contains("full") || title.contains("complete") || title.contains("all") {
            terms.push("full".to_string());
        }
    }
    terms.sort();
    terms.dedup();

    format!("{}|{}|{}", product.category, models.join("-"), terms.join("-"))
}

fn average_title_similarity(products: &[&Product]) -> f64 {
    let mut total = 0.0;
    let mut count = 0usize;
    for i in 0..products.len() {
        for j in (i + 1)..products.len() {
            total += sorensen_dice(
                &products[i].title.to_lowercase(),
                &products[j].title.to_lowercase(),
            );
            count += 1;
        }
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Find products sold by more than one store. Listings are grouped by the
/// flexible key and by the exact match key, groups spanning a single store
/// are discarded, and a title-similarity gate filters out buckets that
/// merely share a category. Best savings first.
pub fn match_products(products: &[Product]) -> Vec<PriceMatch> {
    let mut groups: BTreeMap<String, Vec<&Product>> = BTreeMap::new();
    for product in products {
        groups.entry(flex_match_key(product)).or_default().push(product);
    }
    for product in products {
        groups
            .entry(product.match_key.clone())
            .or_default()
            .push(product);
    }

    // The same pair can group under both the flexible key and the exact
    // match key, so groups are identified by their member set.
    let mut seen_groups: BTreeSet<BTreeSet<String>> = BTreeSet::new();
    let mut matches: Vec<PriceMatch> = groups
        .into_values()
        .filter(|group| {
            let stores: BTreeSet<&str> = group.iter().map(|p| p.source_id.as_str()).collect();
            stores.len() > 1
        })
        .filter(|group| {
            let identity: BTreeSet<String> = group
                .iter()
                .map(|p| product_key(&p.source_id, &p.match_key))
                .collect();
            seen_groups.insert(identity)
        })
        .filter(|group| average_title_similarity(group) >= MIN_MATCH_SIMILARITY)
        .map(|group| {
            let mut members: Vec<Product> = group.into_iter().cloned().collect();
            members.sort_by(|a, b| a.price.total_cmp(&b.price));
            let lowest_price = members.first().map(|p| p.price).unwrap_or(0.0);
            let highest_price = members.last().map(|p| p.price).unwrap_or(0.0);
            let savings = highest_price - lowest_price;
            let savings_percent = if highest_price > 0.0 {
                (savings / highest_price * 100.0).round() as u32
            } else {
                0
            };
            let representative = &members[0];
            PriceMatch {
                match_key: representative.match_key.clone(),
                category: representative.category.clone(),
                models: representative.models.clone(),
                lowest_price,
                highest_price,
                savings,
                savings_percent,
                products: members,
            }
        })
        .collect();

    matches.sort_by(|a, b| b.savings_percent.cmp(&a.savings_percent));
    matches
}

// ---------------------------------------------------------------------------
// Pipeline orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    /// Every source came back empty; the catalog was left untouched so a
    /// bad run cannot wipe good data.
    NoProducts,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stores_scraped: usize,
    pub raw_listings: usize,
    pub normalized: usize,
    pub stats: MergeStats,
    pub matches: usize,
}

pub struct ScrapePipeline {
    config: PipelineConfig,
    catalog: CatalogStore,
    http: HttpFetcher,
    strategies: Vec<Box<dyn AcquisitionStrategy>>,
    enricher: DescriptionEnricher,
}

impl ScrapePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let catalog = CatalogStore::new(config.data_dir.clone());
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;

        let generator: Option<Arc<dyn DescriptionGenerator>> =
            match config.anthropic_api_key.clone() {
                Some(api_key) => Some(Arc::new(ClaudeDescriptionGenerator::new(
                    api_key,
                    Duration::from_secs(config.http_timeout_secs),
                )?)),
                None => None,
            };
        let enricher = DescriptionEnricher::new(
            generator,
            config.enrich_batch_size,
            Duration::from_millis(config.enrich_pause_ms),
        );

        let shopify = ShopifyApiStrategy {
            page_delay: Duration::from_millis(config.page_delay_ms),
            ..Default::default()
        };
        let strategies: Vec<Box<dyn AcquisitionStrategy>> = vec![
            Box::new(shopify),
            Box::new(DomExtractionStrategy::default()),
        ];

        Ok(Self {
            config,
            catalog,
            http,
            strategies,
            enricher,
        })
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn AcquisitionStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// One full scrape-normalize-enrich-merge-persist cycle. Merge and
    /// persistence run strictly after all per-store acquisition; runs of
    /// the whole pipeline must be serialized externally.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let registry = self.load_store_registry().await?;
        let enabled: Vec<_> = registry.stores.into_iter().filter(|s| s.enabled).collect();

        let mut raw_listings = 0usize;
        let mut products = Vec::new();

        for store in &enabled {
            let listings = self.acquire_store(store).await;
            raw_listings += listings.len();

            let scraped_at = Utc::now();
            let before = products.len();
            products.extend(
                listings
                    .iter()
                    .filter_map(|raw| normalize_listing(raw, store, scraped_at)),
            );
            info!(
                store = %store.id,
                raw = listings.len(),
                kept = products.len() - before,
                "normalized store batch"
            );
        }

        self.enricher.enrich(&mut products).await;
        let normalized = products.len();

        if products.is_empty() {
            warn!(run_id = %run_id, "no products scraped; catalog left untouched");
            return Ok(RunSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                status: RunStatus::NoProducts,
                stores_scraped: enabled.len(),
                raw_listings,
                normalized,
                stats: MergeStats::default(),
                matches: 0,
            });
        }

        let existing = self.catalog.load_catalog().await?;
        let (merged, stats) = merge_catalog(&existing, products);
        let merged: Vec<Product> = merged.into_values().collect();

        let today = Utc::now().date_naive();
        self.catalog.save_catalog(&merged, today).await?;

        let mut history = self.catalog.load_price_history().await?;
        update_price_history(&mut history, &merged, today);
        self.catalog.save_price_history(&history).await?;

        let matches = match_products(&merged);
        self.catalog.save_matches(&matches).await?;

        info!(
            run_id = %run_id,
            new = stats.new_count,
            updated = stats.updated_count,
            total = stats.total_count,
            matches = matches.len(),
            "scrape run complete"
        );

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            status: RunStatus::Completed,
            stores_scraped: enabled.len(),
            raw_listings,
            normalized,
            stats,
            matches: matches.len(),
        })
    }

    /// Try acquisition strategies in order; first non-empty result wins.
    /// Every failure degrades to zero records so one broken store never
    /// aborts the run.
    async fn acquire_store(&self, store: &StoreConfig) -> Vec<RawListing> {
        for strategy in &self.strategies {
            match strategy.fetch_listings(&self.http, store).await {
                Ok(listings) if !listings.is_empty() => {
                    info!(store = %store.id, strategy = strategy.name(), count = listings.len(), "acquired listings");
                    return listings;
                }
                Ok(_) => continue,
                Err(err) => {
                    warn!(store = %store.id, strategy = strategy.name(), error = %err, "acquisition failed");
                    continue;
                }
            }
        }
        warn!(store = %store.id, "all acquisition strategies came back empty");
        Vec::new()
    }

    async fn load_store_registry(&self) -> Result<StoreRegistry> {
        let path = self.config.workspace_root.join("stores.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn catalog(&self) -> &CatalogStore {
        &self.catalog
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.scrape_cron.clone();
        let job = Job::new_async(cron.as_str(), |_uuid, _l| {
            Box::pin(async move {
                match run_scrape_once_from_env().await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        total = summary.stats.total_count,
                        "scheduled scrape finished"
                    ),
                    Err(err) => warn!(error = %err, "scheduled scrape failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_scrape_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env();
    let pipeline = ScrapePipeline::new(config)?;
    pipeline.run_once().await
}
