use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::USER_AGENT;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::http_client::{USER_AGENT_VALUE, http_client, read_success_body};

const GET_TIMEOUT: Duration = Duration::from_secs(3);
const POST_TIMEOUT: Duration = Duration::from_secs(5);
const IMAGE_ASSET_KEYS: &[&str] = &["boxart", "banner600", "banner400", "banner300", "banner145"];

pub trait ShopCatalog: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn search_games(&self, title: &str, limit: usize) -> Result<Vec<CatalogMatch>>;
    fn game_info(&self, id: &str) -> Result<Option<Value>>;
    fn storefronts(&self, id: &str) -> Result<Vec<String>>;
    fn best_price(&self, id: &str) -> Result<Option<PriceQuote>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMatch {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub appid: Option<u64>,
    #[serde(default)]
    pub assets: Map<String, Value>,
}

impl CatalogMatch {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            appid: None,
            assets: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub amount: f64,
    pub currency: Option<String>,
    pub shop: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShopDeal {
    pub shop: String,
    pub amount: Option<f64>,
    pub currency: Option<String>,
}

// Without an API key the client reports disabled and every call is empty.
#[derive(Debug, Clone)]
pub struct ItadClient {
    api_key: Option<String>,
    base_url: String,
    country: String,
    primary_store: String,
}

impl ItadClient {
    pub fn new(
        api_key: Option<String>,
        base_url: &str,
        country: &str,
        primary_store: &str,
    ) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: base_url.trim_end_matches('/').to_string(),
            country: country.to_string(),
            primary_store: primary_store.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn get(&self, path: &str, params: &[(&str, String)]) -> Result<String> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let resp = http_client()?
            .get(self.url(path))
            .header(USER_AGENT, USER_AGENT_VALUE)
            .query(&[("key", key)])
            .query(params)
            .timeout(GET_TIMEOUT)
            .send()
            .with_context(|| format!("itad GET {path} failed"))?;
        read_success_body(resp).with_context(|| format!("itad GET {path}"))
    }

    fn post(&self, path: &str, body: &Value, params: &[(&str, String)]) -> Result<String> {
        let key = self.api_key.as_deref().unwrap_or_default();
        let resp = http_client()?
            .post(self.url(path))
            .header(USER_AGENT, USER_AGENT_VALUE)
            .query(&[("key", key)])
            .query(params)
            .json(body)
            .timeout(POST_TIMEOUT)
            .send()
            .with_context(|| format!("itad POST {path} failed"))?;
        read_success_body(resp).with_context(|| format!("itad POST {path}"))
    }

    fn deals(&self, id: &str) -> Result<Vec<ShopDeal>> {
        let body = self.post(
            "/games/prices/v3",
            &Value::Array(vec![Value::String(id.to_string())]),
            &[("country", self.country.clone())],
        )?;
        parse_prices_json(&body)
    }
}

impl ShopCatalog for ItadClient {
    fn is_enabled(&self) -> bool {
        self.api_key.is_some() && !self.base_url.is_empty()
    }

    fn search_games(&self, title: &str, limit: usize) -> Result<Vec<CatalogMatch>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        let body = self.get(
            "/games/search/v1",
            &[("title", title.to_string()), ("results", limit.to_string())],
        )?;
        let mut out = parse_search_json(&body)?;
        out.truncate(limit);
        Ok(out)
    }

    fn game_info(&self, id: &str) -> Result<Option<Value>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        let body = self.get("/games/info/v2", &[("id", id.to_string())])?;
        let info = serde_json::from_str::<Value>(&body).context("invalid itad game info json")?;
        Ok(info.is_object().then_some(info))
    }

    fn storefronts(&self, id: &str) -> Result<Vec<String>> {
        if !self.is_enabled() {
            return Ok(Vec::new());
        }
        Ok(shops_from_deals(&self.deals(id)?))
    }

    fn best_price(&self, id: &str) -> Result<Option<PriceQuote>> {
        if !self.is_enabled() {
            return Ok(None);
        }
        Ok(pick_best_price(&self.deals(id)?, &self.primary_store))
    }
}

/// Accepts either a bare array or an object with `results`.
pub fn parse_search_json(raw: &str) -> Result<Vec<CatalogMatch>> {
    let value = serde_json::from_str::<Value>(raw).context("invalid itad search json")?;
    let items = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
        _ => &[],
    };
    Ok(items
        .iter()
        .filter_map(|item| {
            let id = item
                .get("id")
                .or_else(|| item.get("itad_id"))
                .and_then(Value::as_str)?;
            let title = item
                .get("title")
                .or_else(|| item.get("name"))
                .and_then(Value::as_str)?;
            if id.trim().is_empty() || title.trim().is_empty() {
                return None;
            }
            Some(CatalogMatch {
                id: id.trim().to_string(),
                title: title.trim().to_string(),
                appid: item.get("appid").and_then(appid_from_value),
                assets: item
                    .get("assets")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
            })
        })
        .collect())
}

fn appid_from_value(value: &Value) -> Option<u64> {
    let appid = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    appid.filter(|id| *id > 0)
}

// Deals of the first entry in a prices/v3 response.
pub fn parse_prices_json(raw: &str) -> Result<Vec<ShopDeal>> {
    let value = serde_json::from_str::<Value>(raw).context("invalid itad prices json")?;
    let Some(entry) = value.as_array().and_then(|a| a.first()) else {
        return Ok(Vec::new());
    };
    let deals = entry
        .get("deals")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    Ok(deals
        .iter()
        .filter_map(|deal| {
            let shop = match deal.get("shop")? {
                Value::String(s) => s.trim().to_string(),
                Value::Object(map) => map
                    .get("name")
                    .or_else(|| map.get("id"))
                    .map(|v| match v {
                        Value::String(s) => s.trim().to_string(),
                        other => other.to_string(),
                    })?,
                _ => return None,
            };
            if shop.is_empty() {
                return None;
            }
            let price = deal.get("price");
            Some(ShopDeal {
                shop,
                amount: price.and_then(|p| p.get("amount")).and_then(Value::as_f64),
                currency: price
                    .and_then(|p| p.get("currency"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect())
}

pub fn shops_from_deals(deals: &[ShopDeal]) -> Vec<String> {
    deals
        .iter()
        .map(|d| d.shop.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

// Primary store when listed, otherwise the lowest observed price.
pub fn pick_best_price(deals: &[ShopDeal], primary_store: &str) -> Option<PriceQuote> {
    let priced = deals
        .iter()
        .filter_map(|d| d.amount.filter(|a| a.is_finite()).map(|a| (d, a)))
        .collect::<Vec<_>>();

    let chosen = priced
        .iter()
        .find(|(d, _)| d.shop.eq_ignore_ascii_case(primary_store))
        .or_else(|| {
            priced
                .iter()
                .min_by(|(_, a), (_, b)| a.total_cmp(b))
        })?;

    Some(PriceQuote {
        amount: chosen.1,
        currency: chosen.0.currency.clone(),
        shop: chosen.0.shop.clone(),
    })
}

pub fn image_url(info: Option<&Value>, appid: u64) -> Option<String> {
    if let Some(assets) = info.and_then(|i| i.get("assets")).and_then(Value::as_object) {
        for key in IMAGE_ASSET_KEYS {
            if let Some(url) = assets.get(*key).and_then(Value::as_str) {
                let url = url.trim();
                if !url.is_empty() {
                    return Some(url.to_string());
                }
            }
        }
    }
    (appid != 0).then(|| format!("https://steamcdn-a.akamaihd.net/steam/apps/{appid}/header.jpg"))
}

// Exact (case-insensitive) title match, else the first result.
pub fn pick_candidate<'a>(title: &str, results: &'a [CatalogMatch]) -> Option<&'a CatalogMatch> {
    let wanted = title.trim().to_lowercase();
    results
        .iter()
        .find(|r| r.title.trim().to_lowercase() == wanted)
        .or_else(|| results.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deal(shop: &str, amount: Option<f64>) -> ShopDeal {
        ShopDeal {
            shop: shop.to_string(),
            amount,
            currency: Some("USD".to_string()),
        }
    }

    #[test]
    fn best_price_prefers_primary_store() {
        let deals = vec![deal("GOG", Some(19.99)), deal("Steam", Some(29.99))];
        let best = pick_best_price(&deals, "Steam").unwrap();
        assert_eq!(best.shop, "Steam");
        assert_eq!(best.amount, 29.99);
    }

    #[test]
    fn best_price_falls_back_to_lowest() {
        let deals = vec![
            deal("GOG", Some(19.99)),
            deal("Fanatical", Some(17.49)),
            deal("Steam", None),
        ];
        let best = pick_best_price(&deals, "Steam").unwrap();
        assert_eq!(best.shop, "Fanatical");
        assert!(pick_best_price(&[], "Steam").is_none());
    }

    #[test]
    fn shops_are_deduplicated_and_sorted() {
        let deals = vec![deal("Steam", None), deal("GOG", None), deal("Steam", None)];
        assert_eq!(shops_from_deals(&deals), vec!["GOG", "Steam"]);
    }

    #[test]
    fn search_json_accepts_wrapped_results() {
        let raw = r#"{"results": [{"id": "abc", "title": "Hades II"}, {"id": "", "title": "x"}]}"#;
        let rows = parse_search_json(raw).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "abc");
        assert_eq!(rows[0].appid, None);
        assert!(rows[0].assets.is_empty());
    }

    #[test]
    fn search_json_keeps_appid_and_assets() {
        let raw = r#"[{"id": "x", "title": "Game", "appid": "570", "assets": {"boxart": "https://img/b.jpg"}},
                      {"id": "y", "title": "Other", "appid": 0}]"#;
        let rows = parse_search_json(raw).unwrap();
        assert_eq!(rows[0].appid, Some(570));
        assert_eq!(rows[0].assets["boxart"], "https://img/b.jpg");
        assert_eq!(rows[1].appid, None);
    }

    #[test]
    fn image_url_prefers_assets_then_steam_header() {
        let info = json!({"assets": {"banner400": " https://img/b400.jpg ", "boxart": ""}});
        assert_eq!(image_url(Some(&info), 10).as_deref(), Some("https://img/b400.jpg"));
        assert_eq!(
            image_url(None, 570).as_deref(),
            Some("https://steamcdn-a.akamaihd.net/steam/apps/570/header.jpg")
        );
        assert_eq!(image_url(Some(&json!({})), 0), None);
    }

    #[test]
    fn candidate_prefers_exact_title() {
        let results = vec![CatalogMatch::new("1", "Hades"), CatalogMatch::new("2", "Hades II")];
        assert_eq!(pick_candidate(" hades ii", &results).unwrap().id, "2");
        assert_eq!(pick_candidate("unknown", &results).unwrap().id, "1");
        assert!(pick_candidate("x", &[]).is_none());
    }

    #[test]
    fn disabled_client_returns_empty_without_network() {
        let client = ItadClient::new(None, "https://api.isthereanydeal.com", "US", "Steam");
        assert!(!client.is_enabled());
        assert!(client.search_games("anything", 5).unwrap().is_empty());
        assert!(client.storefronts("id").unwrap().is_empty());
        assert!(client.best_price("id").unwrap().is_none());
        assert!(client.game_info("id").unwrap().is_none());
    }
}
