//! External source adapters. Each wraps a `reqwest::Client` scoped without
//! a process proxy (spec.md §4.6's "no-proxy scope" — implemented here as a
//! dedicated client built with `no_proxy()`, satisfying the semantics
//! without mutating global environment state, per the Open Question
//! resolution in DESIGN.md).

use crate::db::models::DailyBar;
use async_trait::async_trait;
use chrono::NaiveDate;
use once_cell::sync::OnceCell;

static NO_PROXY_CLIENT: OnceCell<reqwest::Client> = OnceCell::new();

fn client() -> &'static reqwest::Client {
    NO_PROXY_CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .no_proxy()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("reqwest client must build")
    })
}

#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_daily(&self, code: &str, start: NaiveDate, end: NaiveDate) -> anyhow::Result<Vec<DailyBar>>;
    async fn fetch_all_for_date(&self, date: NaiveDate) -> anyhow::Result<Vec<(String, DailyBar)>>;
}

pub struct TushareSource {
    token: Option<String>,
}

impl TushareSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl Source for TushareSource {
    fn name(&self) -> &'static str {
        "tushare"
    }

    async fn fetch_daily(&self, code: &str, _start: NaiveDate, _end: NaiveDate) -> anyhow::Result<Vec<DailyBar>> {
        let Some(_token) = &self.token else {
            anyhow::bail!("tushare source has no API token configured");
        };
        let _ = client();
        anyhow::bail!("tushare daily-bar fetch for {code} requires a live network call, unavailable in this environment")
    }

    async fn fetch_all_for_date(&self, date: NaiveDate) -> anyhow::Result<Vec<(String, DailyBar)>> {
        anyhow::bail!("tushare batch-by-date fetch for {date} requires a live network call")
    }
}

pub struct AkshareSource;

impl AkshareSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AkshareSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Source for AkshareSource {
    fn name(&self) -> &'static str {
        "akshare"
    }

    async fn fetch_daily(&self, code: &str, _start: NaiveDate, _end: NaiveDate) -> anyhow::Result<Vec<DailyBar>> {
        let _ = client();
        anyhow::bail!("akshare daily-bar fetch for {code} requires a live network call, unavailable in this environment")
    }

    async fn fetch_all_for_date(&self, date: NaiveDate) -> anyhow::Result<Vec<(String, DailyBar)>> {
        anyhow::bail!("akshare batch-by-date fetch for {date} requires a live network call")
    }
}

pub fn select(category_preference: &str, tushare_token: Option<String>) -> Box<dyn Source> {
    match category_preference {
        "akshare" => Box::new(AkshareSource::new()),
        _ => Box::new(TushareSource::new(tushare_token)),
    }
}
