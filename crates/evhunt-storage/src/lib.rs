//! Catalog persistence + HTTP fetch utilities for EV Price Hunt.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use evhunt_core::{PriceMatch, Product};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{info, info_span};
use uuid::Uuid;

pub const CRATE_NAME: &str = "evhunt-storage";

/// How many daily price points to retain per product.
pub const PRICE_HISTORY_DAYS: usize = 90;

const LATEST_FILE: &str = "latest.json";
const MATCHES_FILE: &str = "matches.json";
const PRICE_HISTORY_FILE: &str = "price-history.json";

/// One observed price on a given calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: NaiveDate,
    pub price: f64,
}

/// Rolling per-product price history, keyed by [`history_id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub title: String,
    pub source: String,
    pub category: String,
    pub url: String,
    pub prices: Vec<PricePoint>,
}

pub type PriceHistory = BTreeMap<String, PriceHistoryEntry>;

/// Stable history key: lowercased source plus a slugged, length-capped title.
pub fn history_id(product: &Product) -> String {
    let slug: String = product
        .title
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .chars()
        .take(50)
        .collect();
    format!("{}-{}", product.source.to_lowercase(), slug)
}

/// Fold a batch of products into the history: at most one price point per
/// calendar day, today's point updated in place when the price moved, and
/// the series capped at the most recent [`PRICE_HISTORY_DAYS`] points.
pub fn update_price_history(history: &mut PriceHistory, products: &[Product], today: NaiveDate) {
    for product in products {
        let entry = history
            .entry(history_id(product))
            .or_insert_with(|| PriceHistoryEntry {
                title: product.title.clone(),
                source: product.source.clone(),
                category: product.category.clone(),
                url: product.url.clone(),
                prices: Vec::new(),
            });

        match entry.prices.last_mut() {
            Some(last) if last.date == today => last.price = product.price,
            _ => entry.prices.push(PricePoint {
                date: today,
                price: product.price,
            }),
        }

        if entry.prices.len() > PRICE_HISTORY_DAYS {
            let drop = entry.prices.len() - PRICE_HISTORY_DAYS;
            entry.prices.drain(..drop);
        }
    }
}

/// JSON-file catalog store: `latest.json` plus dated backups, cross-store
/// match output, and the price history document.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    data_dir: PathBuf,
}

impl CatalogStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.data_dir.join(LATEST_FILE)
    }

    pub fn backup_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(format!("backup-{}.json", date.format("%Y-%m-%d")))
    }

    /// Read the persisted catalog, keyed by `sourceId:matchKey`. A missing
    /// file is an empty catalog, not an error.
    pub async fn load_catalog(&self) -> anyhow::Result<BTreeMap<String, Product>> {
        let products: Vec<Product> = match self.read_json(&self.latest_path()).await? {
            Some(products) => products,
            None => return Ok(BTreeMap::new()),
        };
        Ok(products
            .into_iter()
            .map(|p| (evhunt_core::product_key(&p.source_id, &p.match_key), p))
            .collect())
    }

    /// Replace the catalog document wholesale. If a previous version exists
    /// and no backup has been taken for `today` yet, it is copied aside
    /// first; at most one backup per calendar day regardless of how many
    /// saves happen. The write itself goes through a temp file and an
    /// atomic rename so a crash never leaves a truncated catalog.
    pub async fn save_catalog(&self, products: &[Product], today: NaiveDate) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;

        let latest = self.latest_path();
        let backup = self.backup_path(today);
        if path_exists(&latest).await? && !path_exists(&backup).await? {
            fs::copy(&latest, &backup)
                .await
                .with_context(|| format!("backing up catalog to {}", backup.display()))?;
            info!(backup = %backup.display(), "created daily catalog backup");
        }

        self.write_json_atomic(&latest, &products).await?;
        info!(count = products.len(), path = %latest.display(), "saved catalog");
        Ok(())
    }

    pub async fn save_matches(&self, matches: &[PriceMatch]) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;
        self.write_json_atomic(&self.data_dir.join(MATCHES_FILE), &matches)
            .await
    }

    pub async fn load_matches(&self) -> anyhow::Result<Vec<PriceMatch>> {
        Ok(self
            .read_json(&self.data_dir.join(MATCHES_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn load_price_history(&self) -> anyhow::Result<PriceHistory> {
        Ok(self
            .read_json(&self.data_dir.join(PRICE_HISTORY_FILE))
            .await?
            .unwrap_or_default())
    }

    pub async fn save_price_history(&self, history: &PriceHistory) -> anyhow::Result<()> {
        fs::create_dir_all(&self.data_dir)
            .await
            .with_context(|| format!("creating data dir {}", self.data_dir.display()))?;
        self.write_json_atomic(&self.data_dir.join(PRICE_HISTORY_FILE), history)
            .await
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> anyhow::Result<Option<T>> {
        let text = match fs::read_to_string(path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
        };
        let value =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Some(value))
    }

    async fn write_json_atomic<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(value)
            .with_context(|| format!("serializing {}", path.display()))?;

        let parent = path.parent().unwrap_or(&self.data_dir);
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }
}

async fn path_exists(path: &Path) -> anyhow::Result<bool> {
    fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with bounded concurrency and retry-with-backoff for
/// transient failures. Acquisition strategies never talk to `reqwest`
/// directly.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(
        &self,
        store_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self.limit.acquire().await.expect("semaphore not closed");

        let span = info_span!("http_fetch", store_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn mk_product(source_id: &str, title: &str, price: f64) -> Product {
        let match_key = evhunt_core::canonicalize_title(title);
        Product {
            title: title.to_string(),
            price,
            currency: "USD".to_string(),
            url: format!("https://example.com/products/{match_key}"),
            image: String::new(),
            source: source_id.to_string(),
            source_id: source_id.to_string(),
            description: String::new(),
            vendor: String::new(),
            product_type: String::new(),
            tags: vec![],
            models: vec![evhunt_core::UNIVERSAL.to_string()],
            category: evhunt_core::OTHER_CATEGORY.to_string(),
            match_key,
            scraped_at: Utc::now(),
        }
    }

    fn date(s: &str) -> NaiveDate {
        s.parse().expect("date")
    }

    #[tokio::test]
    async fn missing_catalog_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());
        assert!(store.load_catalog().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn catalog_round_trips_through_disk() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());
        let products = vec![
            mk_product("tesery", "Model Y Floor Mats", 49.99),
            mk_product("yeslak", "Sunshade", 25.0),
        ];

        store
            .save_catalog(&products, date("2026-08-29"))
            .await
            .expect("save");
        let loaded = store.load_catalog().await.expect("load");

        assert_eq!(loaded.len(), 2);
        let key = evhunt_core::product_key("tesery", "model y floor mats");
        assert_eq!(loaded.get(&key).expect("entry").price, 49.99);
    }

    #[tokio::test]
    async fn backup_is_created_at_most_once_per_day() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());
        let today = date("2026-08-29");

        let first = vec![mk_product("tesery", "Floor Mats", 49.99)];
        store.save_catalog(&first, today).await.expect("first save");
        // No previous catalog existed, so no backup yet.
        assert!(!store.backup_path(today).exists());

        let second = vec![mk_product("tesery", "Floor Mats", 44.99)];
        store.save_catalog(&second, today).await.expect("second save");
        assert!(store.backup_path(today).exists());

        let backup_before = std::fs::read_to_string(store.backup_path(today)).expect("backup");
        let third = vec![mk_product("tesery", "Floor Mats", 39.99)];
        store.save_catalog(&third, today).await.expect("third save");
        let backup_after = std::fs::read_to_string(store.backup_path(today)).expect("backup");

        // The second save that day must not overwrite the existing backup.
        assert_eq!(backup_before, backup_after);
        let backups = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("backup-"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn backup_preserves_previous_day_contents() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path());

        let yesterday_catalog = vec![mk_product("tesery", "Floor Mats", 49.99)];
        store
            .save_catalog(&yesterday_catalog, date("2026-08-28"))
            .await
            .expect("save");

        let today = date("2026-08-29");
        let new_catalog = vec![mk_product("tesery", "Floor Mats", 44.99)];
        store.save_catalog(&new_catalog, today).await.expect("save");

        let backup: Vec<Product> = serde_json::from_str(
            &std::fs::read_to_string(store.backup_path(today)).expect("backup"),
        )
        .expect("parse backup");
        assert_eq!(backup[0].price, 49.99);

        let latest: Vec<Product> =
            serde_json::from_str(&std::fs::read_to_string(store.latest_path()).expect("latest"))
                .expect("parse latest");
        assert_eq!(latest[0].price, 44.99);
    }

    #[test]
    fn history_id_slugs_source_and_title() {
        let product = mk_product("tesery", "Model Y All-Weather Floor Mats!", 49.99);
        assert_eq!(history_id(&product), "tesery-model-y-allweather-floor-mats");
    }

    #[test]
    fn price_history_records_one_point_per_day() {
        let mut history = PriceHistory::new();
        let product = mk_product("tesery", "Floor Mats", 49.99);

        update_price_history(&mut history, std::slice::from_ref(&product), date("2026-08-29"));
        let cheaper = mk_product("tesery", "Floor Mats", 44.99);
        update_price_history(&mut history, std::slice::from_ref(&cheaper), date("2026-08-29"));

        let entry = history.get(&history_id(&product)).expect("entry");
        assert_eq!(entry.prices.len(), 1);
        assert_eq!(entry.prices[0].price, 44.99);

        update_price_history(&mut history, std::slice::from_ref(&product), date("2026-08-30"));
        let entry = history.get(&history_id(&product)).expect("entry");
        assert_eq!(entry.prices.len(), 2);
    }

    #[test]
    fn price_history_caps_at_90_days() {
        let mut history = PriceHistory::new();
        let product = mk_product("tesery", "Floor Mats", 49.99);
        let start = date("2026-01-01");
        for offset in 0..120 {
            let day = start + chrono::Days::new(offset);
            update_price_history(&mut history, std::slice::from_ref(&product), day);
        }
        let entry = history.get(&history_id(&product)).expect("entry");
        assert_eq!(entry.prices.len(), PRICE_HISTORY_DAYS);
        assert_eq!(entry.prices.last().expect("last").date, start + chrono::Days::new(119));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }
}
