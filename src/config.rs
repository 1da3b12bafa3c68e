use std::env;
use std::path::PathBuf;

use crate::features::{SaleCalendar, StorePolicy};

const DEFAULT_ITAD_BASE_URL: &str = "https://api.isthereanydeal.com";
const DEFAULT_NEWS_BASE_URL: &str = "https://newsapi.org";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_THRESHOLD: f64 = 0.5;
const DEFAULT_RECENT_RELEASE_YEAR: i32 = 2024;

#[derive(Debug, Clone)]
pub struct Settings {
    pub app_env: String,
    pub model_30d_path: PathBuf,
    pub model_60d_path: PathBuf,
    pub features_path: PathBuf,
    pub franchise_medians_path: PathBuf,
    pub default_threshold: f64,
    pub recent_release_year: i32,
    pub itad_api_key: Option<String>,
    pub itad_base_url: String,
    pub itad_country: String,
    pub news_api_key: Option<String>,
    pub news_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openai_model: String,
    pub upcoming_seed_path: PathBuf,
    pub upcoming_output_path: PathBuf,
    pub precompute_parallelism: usize,
    pub sale_calendar: SaleCalendar,
    pub store_policy: StorePolicy,
}

impl Settings {
    // .env.local then .env; the first value wins.
    pub fn load() -> Self {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");
        Self::from_env()
    }

    pub fn from_env() -> Self {
        let default_threshold = env_f64("DEFAULT_THRESHOLD")
            .unwrap_or(DEFAULT_THRESHOLD)
            .clamp(0.0, 1.0);
        let recent_release_year = env_string("RECENT_RELEASE_YEAR")
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(DEFAULT_RECENT_RELEASE_YEAR);
        let precompute_parallelism = env_string("PRECOMPUTE_PARALLELISM")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4)
            .clamp(1, 32);

        let mut sale_calendar = SaleCalendar::default();
        if let Some(months) = env_months("NEAR_SALE_MONTHS") {
            sale_calendar.near_sale = months;
        }

        let mut store_policy = StorePolicy::default();
        if let Some(primary) = env_string("PRIMARY_STORE") {
            store_policy.primary = primary;
        }
        if let Some(raw) = env_string("RECOGNIZED_STORES") {
            let stores = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>();
            if !stores.is_empty() {
                store_policy.recognized = stores;
            }
        }

        Self {
            app_env: env_string("APP_ENV").unwrap_or_else(|| "dev".to_string()),
            model_30d_path: env_path("MODEL_30D_PATH", "artifacts/model_30d.json"),
            model_60d_path: env_path("MODEL_60D_PATH", "artifacts/model_60d.json"),
            features_path: env_path("FEATURES_PATH", "artifacts/feature_list.json"),
            franchise_medians_path: env_path(
                "FRANCHISE_MEDIANS_PATH",
                "artifacts/franchise_medians.json",
            ),
            default_threshold,
            recent_release_year,
            itad_api_key: env_string("ITAD_API_KEY"),
            itad_base_url: env_string("ITAD_BASE_URL")
                .unwrap_or_else(|| DEFAULT_ITAD_BASE_URL.to_string()),
            itad_country: env_string("ITAD_COUNTRY").unwrap_or_else(|| "US".to_string()),
            news_api_key: env_string("NEWS_API_KEY"),
            news_base_url: env_string("NEWS_BASE_URL")
                .unwrap_or_else(|| DEFAULT_NEWS_BASE_URL.to_string()),
            openai_api_key: env_string("OPENAI_API_KEY"),
            openai_base_url: env_string("OPENAI_BASE_URL")
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_model: env_string("OPENAI_MODEL")
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            upcoming_seed_path: env_path("UPCOMING_SEED_PATH", "artifacts/upcoming_seed.csv"),
            upcoming_output_path: env_path(
                "UPCOMING_OUTPUT_PATH",
                "artifacts/upcoming_predictions.json",
            ),
            precompute_parallelism,
            sale_calendar,
            store_policy,
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_f64(key: &str) -> Option<f64> {
    env_string(key)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env_string(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_months(key: &str) -> Option<Vec<u32>> {
    let raw = env_string(key)?;
    let months = parse_month_list(&raw);
    if months.is_empty() { None } else { Some(months) }
}

fn parse_month_list(raw: &str) -> Vec<u32> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<u32>().ok())
        .filter(|m| (1..=12).contains(m))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::parse_month_list;

    #[test]
    fn month_list_skips_junk_and_out_of_range() {
        assert_eq!(parse_month_list("6, 11,12"), vec![6, 11, 12]);
        assert_eq!(parse_month_list("0,13,x,7"), vec![7]);
        assert!(parse_month_list("").is_empty());
    }
}
