use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::{ItadClient, ShopCatalog, image_url, pick_candidate};
use crate::config::Settings;
use crate::error::{ForecastError, ForecastResult};
use crate::features::{
    FeatureBuilder, FeatureMap, coerce_numeric, extract_launch_price, extract_release_date,
};
use crate::insights::{CombinedRationale, InsightService, Rationale, released_rationale};
use crate::llm::OpenAiClient;
use crate::news::NewsApiClient;
use crate::predictor::{ArtifactPaths, Horizon, ModelService};

pub const TITLE_SEARCH_LIMIT: usize = 5;
pub const SUGGEST_LIMIT: usize = 8;

const RELEASE_DATE_FIELDS: &[&str] = &["releaseDate", "release_date", "released", "date"];
const TITLE_FIELDS: &[&str] = &["title", "name"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub appid: u64,
    pub horizon: String,
    pub features: FeatureMap,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub include_insights: bool,
    #[serde(default)]
    pub name: Option<String>,
}

impl PredictRequest {
    pub fn validate(&self) -> ForecastResult<Horizon> {
        let horizon = self.horizon.parse::<Horizon>()?;
        check_threshold(self.threshold)?;
        if self.features.is_empty() {
            return Err(ForecastError::bad_request("features cannot be empty"));
        }
        Ok(horizon)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub appid: u64,
    pub horizon: Horizon,
    pub will_discount: bool,
    pub score: f64,
    pub threshold: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insights: Option<Rationale>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameSuggestion {
    pub itad_id: String,
    pub title: String,
    pub appid: Option<u64>,
    pub assets: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub model_30d_loaded: bool,
    pub model_60d_loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameForecast {
    pub appid: u64,
    pub name: String,
    pub release_date: Option<String>,
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub already_released: bool,
    pub score_30d: f64,
    pub will_discount_30d: bool,
    pub threshold_30d: f64,
    pub score_60d: f64,
    pub will_discount_60d: bool,
    pub threshold_60d: f64,
    pub insights: CombinedRationale,
}

/// Everything needed to serve forecasts, built once and then shared
/// read-only.
pub struct ForecastPipeline {
    models: ModelService,
    builder: FeatureBuilder,
    insights: InsightService,
    catalog: Arc<dyn ShopCatalog>,
}

impl ForecastPipeline {
    /// A failed model load is logged and leaves the pipeline in the "loading"
    /// state, where predictions fail with `ModelNotLoaded`.
    pub fn initialize(settings: &Settings) -> Self {
        let catalog: Arc<dyn ShopCatalog> = Arc::new(ItadClient::new(
            settings.itad_api_key.clone(),
            &settings.itad_base_url,
            &settings.itad_country,
            &settings.store_policy.primary,
        ));

        let mut models = ModelService::new(settings.default_threshold);
        let paths = ArtifactPaths {
            model_30d: settings.model_30d_path.clone(),
            model_60d: settings.model_60d_path.clone(),
            features: settings.features_path.clone(),
        };
        if let Err(err) = models.load(&paths) {
            tracing::error!(error = %err, "startup_failed");
        }

        let mut builder = FeatureBuilder::from_path(&settings.franchise_medians_path)
            .with_calendar(settings.sale_calendar.clone())
            .with_store_policy(settings.store_policy.clone())
            .with_catalog(Arc::clone(&catalog));
        if let Some(schema) = models.feature_names() {
            builder = builder.with_expected_keys(schema.to_vec());
        }

        let insights = InsightService::new(settings.recent_release_year)
            .with_news(Arc::new(NewsApiClient::new(
                settings.news_api_key.clone(),
                &settings.news_base_url,
            )))
            .with_generator(Arc::new(OpenAiClient::new(
                settings.openai_api_key.clone(),
                &settings.openai_base_url,
                &settings.openai_model,
            )));

        tracing::info!(
            env = %settings.app_env,
            models_loaded = models.is_loaded(),
            catalog_enabled = catalog.is_enabled(),
            news_enabled = insights.news_enabled(),
            generator_enabled = insights.generator_enabled(),
            "startup_complete"
        );

        Self::from_parts(models, builder, insights, catalog)
    }

    pub fn from_parts(
        models: ModelService,
        builder: FeatureBuilder,
        insights: InsightService,
        catalog: Arc<dyn ShopCatalog>,
    ) -> Self {
        Self {
            models,
            builder,
            insights,
            catalog,
        }
    }

    pub fn models(&self) -> &ModelService {
        &self.models
    }

    pub fn feature_builder(&self) -> &FeatureBuilder {
        &self.builder
    }

    pub fn catalog(&self) -> &Arc<dyn ShopCatalog> {
        &self.catalog
    }

    pub fn health(&self) -> HealthStatus {
        let loaded = self.models.is_loaded();
        HealthStatus {
            status: if loaded { "ok" } else { "loading" },
            model_30d_loaded: loaded,
            model_60d_loaded: loaded,
        }
    }

    pub fn predict(&self, request: &PredictRequest) -> ForecastResult<PredictResponse> {
        let horizon = request.validate()?;
        let decision = self.models.predict_horizon(
            horizon,
            request.appid,
            &request.features,
            request.threshold,
        )?;
        let insights = request.include_insights.then(|| {
            self.insights.explain(
                request.appid,
                &decision,
                &request.features,
                request.name.as_deref(),
            )
        });

        Ok(PredictResponse {
            appid: decision.appid(),
            horizon: decision.horizon(),
            will_discount: decision.will_discount(),
            score: decision.score(),
            threshold: decision.threshold(),
            insights,
            name: None,
            image_url: None,
        })
    }

    /// Typeahead over the catalog search.
    pub fn suggest(&self, title: &str, limit: usize) -> ForecastResult<Vec<GameSuggestion>> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ForecastError::bad_request("title cannot be empty"));
        }
        if !self.catalog.is_enabled() {
            return Err(ForecastError::CatalogUnavailable);
        }
        let limit = limit.max(1);
        let results = self.catalog.search_games(title, limit).map_err(|err| {
            tracing::error!(title, error = %format!("{err:#}"), "suggest_catalog_failed");
            ForecastError::Upstream("catalog search failed".to_string())
        })?;
        Ok(results
            .into_iter()
            .take(limit)
            .map(|m| GameSuggestion {
                itad_id: m.id,
                title: m.title,
                appid: m.appid,
                assets: m.assets,
            })
            .collect())
    }

    /// Single-horizon prediction for a catalog entry, built from its game info.
    pub fn forecast_by_catalog_id(
        &self,
        catalog_id: &str,
        horizon: &str,
        threshold: Option<f64>,
        include_insights: bool,
    ) -> ForecastResult<PredictResponse> {
        let horizon = horizon.parse::<Horizon>()?;
        check_threshold(threshold)?;
        if !self.catalog.is_enabled() {
            return Err(ForecastError::CatalogUnavailable);
        }

        let info = self
            .catalog
            .game_info(catalog_id)
            .map_err(|err| {
                tracing::error!(catalog_id, error = %format!("{err:#}"), "predict_catalog_gameinfo_failed");
                ForecastError::Upstream("catalog game info failed".to_string())
            })?
            .filter(Value::is_object)
            .ok_or_else(|| ForecastError::NotFound("Could not fetch game info from the catalog".to_string()))?;
        let appid = catalog_appid(&info)
            .ok_or_else(|| ForecastError::bad_request("Game info from the catalog is missing a Steam appid"))?;
        let name = first_str(&info, TITLE_FIELDS);
        let image_url = image_url(Some(&info), appid);

        let mut metadata = match info {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        metadata
            .entry("id")
            .or_insert_with(|| Value::String(catalog_id.to_string()));
        let features = self.builder.build(appid, &Value::Object(metadata));

        let decision = self
            .models
            .predict_horizon(horizon, appid, &features, threshold)?;
        let insights = include_insights
            .then(|| self.insights.explain(appid, &decision, &features, name.as_deref()));

        Ok(PredictResponse {
            appid,
            horizon: decision.horizon(),
            will_discount: decision.will_discount(),
            score: decision.score(),
            threshold: decision.threshold(),
            insights,
            name,
            image_url,
        })
    }

    pub fn forecast_metadata(
        &self,
        appid: u64,
        name: &str,
        metadata: &Value,
    ) -> ForecastResult<GameForecast> {
        self.forecast_metadata_at(appid, name, metadata, Utc::now().date_naive())
    }

    pub fn forecast_metadata_at(
        &self,
        appid: u64,
        name: &str,
        metadata: &Value,
        today: NaiveDate,
    ) -> ForecastResult<GameForecast> {
        let features = self.builder.build_at(appid, metadata, today);
        let d30 = self
            .models
            .predict_horizon(Horizon::ThirtyDays, appid, &features, None)?;
        let d60 = self
            .models
            .predict_horizon(Horizon::SixtyDays, appid, &features, None)?;
        let insights = self
            .insights
            .explain_combined(appid, Some(name), &d30, &d60, &features);

        Ok(GameForecast {
            appid,
            name: name.to_string(),
            release_date: first_str(metadata, RELEASE_DATE_FIELDS),
            price: extract_launch_price(metadata).filter(|p| *p > 0.0),
            currency: None,
            image_url: image_url(Some(metadata), appid),
            already_released: false,
            score_30d: d30.score(),
            will_discount_30d: d30.will_discount(),
            threshold_30d: d30.threshold(),
            score_60d: d60.score(),
            will_discount_60d: d60.will_discount(),
            threshold_60d: d60.threshold(),
            insights,
        })
    }

    pub fn forecast_by_title(&self, title: &str) -> ForecastResult<GameForecast> {
        self.forecast_by_title_at(title, Utc::now().date_naive())
    }

    pub fn forecast_by_title_at(&self, title: &str, today: NaiveDate) -> ForecastResult<GameForecast> {
        tracing::info!(title, "predict_search_requested");
        if !self.catalog.is_enabled() {
            return Err(ForecastError::CatalogUnavailable);
        }

        let results = self
            .catalog
            .search_games(title, TITLE_SEARCH_LIMIT)
            .map_err(|err| {
                tracing::error!(title, error = %format!("{err:#}"), "predict_search_catalog_failed");
                ForecastError::Upstream("catalog search failed".to_string())
            })?;
        let candidate = pick_candidate(title, &results).ok_or_else(|| {
            ForecastError::NotFound(format!(
                "No catalog match found for '{title}'. Try a different spelling."
            ))
        })?;

        let info = self
            .catalog
            .game_info(&candidate.id)
            .map_err(|err| {
                tracing::error!(
                    title,
                    catalog_id = %candidate.id,
                    error = %format!("{err:#}"),
                    "predict_search_gameinfo_failed"
                );
                ForecastError::Upstream("catalog game info failed".to_string())
            })?
            .unwrap_or_else(|| Value::Object(Map::new()));

        let appid = catalog_appid(&info).unwrap_or(0);
        let name = first_str(&info, TITLE_FIELDS).unwrap_or_else(|| candidate.title.clone());
        let quote = match self.catalog.best_price(&candidate.id) {
            Ok(quote) => quote,
            Err(err) => {
                tracing::warn!(catalog_id = %candidate.id, error = %format!("{err:#}"), "price_lookup_failed");
                None
            }
        };

        if extract_release_date(&info).is_some_and(|d| d < today) {
            return Ok(GameForecast {
                appid,
                release_date: first_str(&info, RELEASE_DATE_FIELDS),
                price: quote.as_ref().map(|q| q.amount),
                currency: quote.and_then(|q| q.currency),
                image_url: image_url(Some(&info), appid),
                already_released: true,
                score_30d: 0.0,
                will_discount_30d: false,
                threshold_30d: self.models.default_threshold(),
                score_60d: 0.0,
                will_discount_60d: false,
                threshold_60d: self.models.default_threshold(),
                insights: released_rationale(appid, Some(&name)),
                name,
            });
        }

        let mut metadata = match info {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        metadata.insert("id".to_string(), Value::String(candidate.id.clone()));
        if let Some(q) = &quote {
            metadata.insert("price".to_string(), Value::from(q.amount));
        }
        let metadata = Value::Object(metadata);

        let mut forecast = self.forecast_metadata_at(appid, &name, &metadata, today)?;
        forecast.price = quote.as_ref().map(|q| q.amount);
        forecast.currency = quote.and_then(|q| q.currency);
        Ok(forecast)
    }
}

fn check_threshold(threshold: Option<f64>) -> ForecastResult<()> {
    match threshold {
        Some(t) if !(0.0..=1.0).contains(&t) => Err(ForecastError::bad_request(format!(
            "threshold must be between 0 and 1, got {t}"
        ))),
        _ => Ok(()),
    }
}

fn catalog_appid(info: &Value) -> Option<u64> {
    info.get("appid")
        .and_then(coerce_numeric)
        .filter(|v| *v > 0.0)
        .map(|v| v as u64)
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
