use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::http_client::{USER_AGENT_VALUE, http_client, read_success_body};

const NEWS_TIMEOUT: Duration = Duration::from_secs(4);

pub const SALE_KEYWORDS: &[&str] = &[
    "sale",
    "discount",
    "deal",
    "price cut",
    "price drop",
    "% off",
    "bundle",
    "promo",
    "free weekend",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub title: String,
    pub source: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<String>,
}

pub trait NewsSource: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn search(&self, query: &str, limit: usize) -> Result<Vec<NewsArticle>>;
}

// newsapi.org /v2/everything
#[derive(Debug, Clone)]
pub struct NewsApiClient {
    api_key: Option<String>,
    base_url: String,
}

impl NewsApiClient {
    pub fn new(api_key: Option<String>, base_url: &str) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

impl NewsSource for NewsApiClient {
    fn is_enabled(&self) -> bool {
        self.api_key.is_some()
    }

    fn search(&self, query: &str, limit: usize) -> Result<Vec<NewsArticle>> {
        let Some(key) = self.api_key.as_deref() else {
            return Ok(Vec::new());
        };
        let url = format!("{}/v2/everything", self.base_url);
        let page_size = limit.to_string();
        let resp = http_client()?
            .get(&url)
            .header(USER_AGENT, USER_AGENT_VALUE)
            .query(&[
                ("q", query),
                ("pageSize", page_size.as_str()),
                ("sortBy", "publishedAt"),
                ("language", "en"),
                ("apiKey", key),
            ])
            .timeout(NEWS_TIMEOUT)
            .send()
            .context("news request failed")?;
        let body = read_success_body(resp).context("news search")?;
        let mut articles = parse_news_response_json(&body)?;
        articles.truncate(limit);
        Ok(articles)
    }
}

pub fn parse_news_response_json(raw: &str) -> Result<Vec<NewsArticle>> {
    let value = serde_json::from_str::<Value>(raw).context("invalid news json")?;
    let items = value
        .get("articles")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    Ok(items
        .iter()
        .filter_map(|item| {
            let title = item.get("title").and_then(Value::as_str)?.trim();
            if title.is_empty() {
                return None;
            }
            Some(NewsArticle {
                title: title.to_string(),
                source: item
                    .get("source")
                    .and_then(|s| s.get("name"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                url: pick_str(item, "url"),
                published_at: pick_str(item, "publishedAt"),
            })
        })
        .collect())
}

fn pick_str(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// A headline is relevant when it names the game or mentions a sale keyword.
pub fn is_relevant_article(title: &str, game_name: Option<&str>) -> bool {
    let lower = title.to_lowercase();
    let names_game = game_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .is_some_and(|n| lower.contains(&n.to_lowercase()));
    names_game || SALE_KEYWORDS.iter().any(|k| lower.contains(k))
}
