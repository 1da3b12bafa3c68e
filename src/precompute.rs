use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{NaiveDate, Utc};
use rayon::prelude::*;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::catalog::pick_candidate;
use crate::config::Settings;
use crate::error::{ForecastError, ForecastResult};
use crate::features::{coerce_numeric, parse_price_text};
use crate::forecast::{ForecastPipeline, GameForecast, TITLE_SEARCH_LIMIT};

pub const DEFAULT_SEED_PRICE: f64 = 39.99;

// name,release_date,price
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedRow {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub release_date: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PrecomputeJob {
    pub seed_path: PathBuf,
    pub output_path: PathBuf,
    pub parallelism: usize,
}

impl PrecomputeJob {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            seed_path: settings.upcoming_seed_path.clone(),
            output_path: settings.upcoming_output_path.clone(),
            parallelism: settings.precompute_parallelism,
        }
    }

    pub fn run(&self, pipeline: &ForecastPipeline) -> Result<Vec<GameForecast>> {
        self.run_at(pipeline, Utc::now().date_naive())
    }

    // Rows that fail are logged and skipped.
    pub fn run_at(&self, pipeline: &ForecastPipeline, today: NaiveDate) -> Result<Vec<GameForecast>> {
        tracing::info!(seed_path = %self.seed_path.display(), "upcoming_precompute_started");
        if !pipeline.models().is_loaded() {
            bail!("models are not loaded; cannot precompute upcoming forecasts");
        }

        let rows = read_seed(&self.seed_path)?;
        let records = with_pool(self.parallelism, || {
            rows.par_iter()
                .filter_map(|row| forecast_seed_row(pipeline, row, today))
                .collect::<Vec<_>>()
        });

        write_records(&self.output_path, &records)?;
        tracing::info!(
            count = records.len(),
            seed_rows = rows.len(),
            output_path = %self.output_path.display(),
            "upcoming_precompute_done"
        );
        Ok(records)
    }
}

pub fn read_seed(path: &Path) -> Result<Vec<SeedRow>> {
    let file = fs::File::open(path)
        .with_context(|| format!("seed file not found at {}", path.display()))?;
    parse_seed(file).with_context(|| format!("parse seed {}", path.display()))
}

pub fn parse_seed<R: Read>(reader: R) -> Result<Vec<SeedRow>> {
    let mut csv = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);
    let mut rows = Vec::new();
    for record in csv.deserialize::<SeedRow>() {
        let mut row = record.context("invalid seed row")?;
        row.name = row.name.trim().to_string();
        if row.name.is_empty() {
            continue;
        }
        row.release_date = row.release_date.filter(|d| !d.trim().is_empty());
        rows.push(row);
    }
    Ok(rows)
}

/// Metadata for one seed row. Catalog info, when present, wins for release
/// date, price and appid; a missing price falls back to
/// [`DEFAULT_SEED_PRICE`].
pub fn seed_metadata(row: &SeedRow, catalog_id: Option<&str>, info: Option<&Value>) -> (u64, Value) {
    let mut metadata = match info {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };

    let release = info
        .and_then(|i| i.get("releaseDate").or_else(|| i.get("release_date")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| row.release_date.clone());
    let price = info
        .and_then(|i| i.get("price"))
        .and_then(Value::as_f64)
        .or_else(|| row.price.as_deref().and_then(parse_price_text))
        .unwrap_or(DEFAULT_SEED_PRICE);
    let appid = info
        .and_then(|i| i.get("appid"))
        .and_then(coerce_numeric)
        .filter(|v| *v > 0.0)
        .map(|v| v as u64)
        .unwrap_or(0);

    match release {
        Some(date) => {
            metadata.insert("releaseDate".to_string(), Value::String(date));
        }
        None => {
            metadata.remove("releaseDate");
        }
    }
    metadata.insert("price".to_string(), Value::from(price));
    if !metadata.contains_key("tags") {
        metadata.insert("tags".to_string(), Value::Array(Vec::new()));
    }
    if let Some(id) = catalog_id {
        metadata.insert("id".to_string(), Value::String(id.to_string()));
    }
    (appid, Value::Object(metadata))
}

fn forecast_seed_row(pipeline: &ForecastPipeline, row: &SeedRow, today: NaiveDate) -> Option<GameForecast> {
    let (catalog_id, info) = enrich(pipeline, &row.name);
    let (appid, metadata) = seed_metadata(row, catalog_id.as_deref(), info.as_ref());

    match pipeline.forecast_metadata_at(appid, &row.name, &metadata, today) {
        Ok(forecast) => Some(forecast),
        Err(err) => {
            tracing::warn!(appid, game_name = %row.name, error = %err, "upcoming_prediction_failed");
            None
        }
    }
}

fn enrich(pipeline: &ForecastPipeline, name: &str) -> (Option<String>, Option<Value>) {
    let catalog = pipeline.catalog();
    if !catalog.is_enabled() {
        return (None, None);
    }
    let results = match catalog.search_games(name, TITLE_SEARCH_LIMIT) {
        Ok(results) => results,
        Err(err) => {
            tracing::warn!(game_name = name, error = %format!("{err:#}"), "catalog_enrich_failed");
            return (None, None);
        }
    };
    let Some(candidate) = pick_candidate(name, &results) else {
        return (None, None);
    };
    tracing::debug!(game_name = name, catalog_id = %candidate.id, "catalog_candidate_found");
    match catalog.game_info(&candidate.id) {
        Ok(info) => (Some(candidate.id.clone()), info),
        Err(err) => {
            tracing::warn!(game_name = name, error = %format!("{err:#}"), "catalog_enrich_failed");
            (Some(candidate.id.clone()), None)
        }
    }
}

fn with_pool<T>(threads: usize, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    match rayon::ThreadPoolBuilder::new().num_threads(threads.max(1)).build() {
        Ok(pool) => pool.install(action),
        Err(_) => action(),
    }
}

pub fn write_records(path: &Path, records: &[GameForecast]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let json = serde_json::to_string_pretty(records).context("serialize upcoming forecasts")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("swap {}", path.display()))?;
    Ok(())
}

pub fn load_upcoming(path: &Path) -> Result<Vec<GameForecast>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read upcoming forecasts {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse upcoming forecasts {}", path.display()))
}

/// Serves the precomputed file: absent means the batch has not run yet,
/// anything unreadable is an internal fault.
pub fn list_upcoming(path: &Path) -> ForecastResult<Vec<GameForecast>> {
    if !path.exists() {
        return Err(ForecastError::UpcomingUnavailable);
    }
    load_upcoming(path).map_err(|err| {
        tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "upcoming_file_load_failed");
        ForecastError::Internal(err)
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(name: &str, release: Option<&str>, price: Option<&str>) -> SeedRow {
        SeedRow {
            name: name.to_string(),
            release_date: release.map(str::to_string),
            price: price.map(str::to_string),
        }
    }

    #[test]
    fn seed_parsing_trims_and_skips_blank_names() {
        let raw = "name,release_date,price\n Hades II ,2026-09-25, $29.99\n,2026-01-01,10\nNo Price,,\n";
        let rows = parse_seed(raw.as_bytes()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], row("Hades II", Some("2026-09-25"), Some("$29.99")));
        assert_eq!(rows[1].release_date, None);
    }

    #[test]
    fn seed_metadata_uses_csv_values_without_catalog() {
        let (appid, meta) = seed_metadata(&row("A", Some("2026-11-20"), Some("£19.99")), None, None);
        assert_eq!(appid, 0);
        assert_eq!(meta["releaseDate"], "2026-11-20");
        assert_eq!(meta["price"], 19.99);
        assert_eq!(meta["tags"], json!([]));
        assert!(meta.get("id").is_none());
    }

    #[test]
    fn seed_metadata_defaults_price() {
        let (_, meta) = seed_metadata(&row("A", None, Some("TBA")), None, None);
        assert_eq!(meta["price"], DEFAULT_SEED_PRICE);
        assert!(meta.get("releaseDate").is_none());
    }

    #[test]
    fn catalog_info_wins_over_csv() {
        let info = json!({
            "appid": 1145350,
            "releaseDate": "2026-10-01",
            "price": 24.5,
            "tags": ["Roguelike", "Action"],
        });
        let (appid, meta) = seed_metadata(
            &row("Hades II", Some("2026-09-25"), Some("29.99")),
            Some("018d937e-xyz"),
            Some(&info),
        );
        assert_eq!(appid, 1145350);
        assert_eq!(meta["releaseDate"], "2026-10-01");
        assert_eq!(meta["price"], 24.5);
        assert_eq!(meta["id"], "018d937e-xyz");
        assert_eq!(meta["tags"], json!(["Roguelike", "Action"]));
    }
}
