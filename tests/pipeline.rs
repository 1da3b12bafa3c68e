use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde_json::{Value, json};

use steam_sale_forecast::catalog::{
    CatalogMatch, PriceQuote, ShopCatalog, parse_prices_json, parse_search_json, pick_best_price,
    shops_from_deals,
};
use steam_sale_forecast::features::{FeatureBuilder, FranchiseTable};
use steam_sale_forecast::forecast::{ForecastPipeline, PredictRequest};
use steam_sale_forecast::insights::{BulletSource, InsightService};
use steam_sale_forecast::precompute::{PrecomputeJob, list_upcoming, load_upcoming};
use steam_sale_forecast::predictor::{ArtifactPaths, ModelService};
use steam_sale_forecast::ForecastError;

fn fixture_path(name: &str) -> PathBuf {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    path
}

fn read_fixture(name: &str) -> String {
    fs::read_to_string(fixture_path(name)).expect("fixture file should be readable")
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

struct FakeCatalog {
    enabled: bool,
    fail_search: bool,
    search: String,
    info: String,
    prices: String,
}

impl FakeCatalog {
    fn from_fixtures() -> Self {
        Self {
            enabled: true,
            fail_search: false,
            search: read_fixture("itad_search.json"),
            info: read_fixture("itad_info.json"),
            prices: read_fixture("itad_prices.json"),
        }
    }
}

impl ShopCatalog for FakeCatalog {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn search_games(&self, _title: &str, limit: usize) -> Result<Vec<CatalogMatch>> {
        if self.fail_search {
            return Err(anyhow!("http 500: upstream down"));
        }
        let mut rows = parse_search_json(&self.search)?;
        rows.truncate(limit);
        Ok(rows)
    }

    fn game_info(&self, _id: &str) -> Result<Option<Value>> {
        let info = serde_json::from_str::<Value>(&self.info)?;
        Ok((!info.is_null()).then_some(info))
    }

    fn storefronts(&self, _id: &str) -> Result<Vec<String>> {
        Ok(shops_from_deals(&parse_prices_json(&self.prices)?))
    }

    fn best_price(&self, _id: &str) -> Result<Option<PriceQuote>> {
        Ok(pick_best_price(&parse_prices_json(&self.prices)?, "Steam"))
    }
}

fn loaded_models() -> ModelService {
    let mut models = ModelService::default();
    models
        .load(&ArtifactPaths {
            model_30d: fixture_path("model_30d.json"),
            model_60d: fixture_path("model_60d.json"),
            features: fixture_path("feature_list.json"),
        })
        .expect("fixture artifacts load");
    models
}

fn pipeline_with(models: ModelService, catalog: FakeCatalog) -> ForecastPipeline {
    let catalog: Arc<dyn ShopCatalog> = Arc::new(catalog);
    let mut builder = FeatureBuilder::new(FranchiseTable::load(&fixture_path(
        "franchise_medians.json",
    )))
    .with_catalog(Arc::clone(&catalog));
    if let Some(schema) = models.feature_names() {
        builder = builder.with_expected_keys(schema.to_vec());
    }
    ForecastPipeline::from_parts(models, builder, InsightService::default(), catalog)
}

fn disabled_catalog() -> FakeCatalog {
    FakeCatalog {
        enabled: false,
        ..FakeCatalog::from_fixtures()
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[test]
fn health_reports_loading_until_models_load() {
    let idle = pipeline_with(ModelService::default(), disabled_catalog());
    let health = idle.health();
    assert_eq!(health.status, "loading");
    assert!(!health.model_30d_loaded);

    let ready = pipeline_with(loaded_models(), disabled_catalog());
    assert_eq!(ready.health().status, "ok");
}

#[test]
fn december_metadata_forecast_uses_both_models_and_template_bullets() {
    let pipeline = pipeline_with(loaded_models(), disabled_catalog());
    let metadata = json!({"price": 45, "releaseDate": "2026-12-10", "tags": ["Puzzle"]});
    let forecast = pipeline
        .forecast_metadata_at(10, "Snow Puzzle", &metadata, day(2026, 10, 16))
        .expect("forecast");

    assert!((forecast.score_30d - sigmoid(-1.0)).abs() < 1e-9);
    assert!((forecast.score_60d - sigmoid(1.5)).abs() < 1e-9);
    assert!(!forecast.will_discount_30d);
    assert!(forecast.will_discount_60d);
    assert_eq!(forecast.price, Some(45.0));
    assert_eq!(forecast.release_date.as_deref(), Some("2026-12-10"));
    assert_eq!(
        forecast.image_url.as_deref(),
        Some("https://steamcdn-a.akamaihd.net/steam/apps/10/header.jpg")
    );

    let insights = &forecast.insights;
    assert_eq!(insights.bullet_source, BulletSource::Template);
    assert!(insights.bullets[0].contains("some chance"));
    assert!(insights.bullets[1].contains("quite plausible"));
    assert!(insights.bullets[2].contains("hold off"));
    assert!(insights.confidence_60d.starts_with("Good chance"));
    assert!(
        insights
            .contextual_factors
            .iter()
            .any(|f| f.contains("major Steam sale window"))
    );
}

#[test]
fn title_search_forecasts_upcoming_game() {
    let pipeline = pipeline_with(loaded_models(), FakeCatalog::from_fixtures());
    let forecast = pipeline
        .forecast_by_title_at("hades ii", day(2026, 10, 16))
        .expect("forecast");

    assert_eq!(forecast.appid, 1145350);
    assert_eq!(forecast.name, "Hades II");
    assert!(!forecast.already_released);
    assert_eq!(forecast.price, Some(29.99));
    assert_eq!(forecast.currency.as_deref(), Some("USD"));
    assert_eq!(
        forecast.image_url.as_deref(),
        Some("https://assets.isthereanydeal.com/hades-ii/banner400.jpg")
    );
    // Holiday release, early access.
    assert!((forecast.score_30d - sigmoid(-1.5)).abs() < 1e-9);
    assert!(forecast.will_discount_60d);

    let factors = forecast.insights.contextual_factors.join(" ");
    assert!(factors.contains("new or upcoming title"));
    assert!(factors.contains("Mid-sized publisher"));
    assert!(factors.contains("experimental"));
    assert!(factors.contains("franchise"));
}

#[test]
fn title_search_features_reflect_catalog_storefronts() {
    let pipeline = pipeline_with(loaded_models(), FakeCatalog::from_fixtures());
    let game = json!({"id": "018d937f-5a5e-71b3-bf5a-8d2b4fb9b9f7", "platforms": ["Windows"]});
    let features = pipeline.feature_builder().build_at(1, &game, day(2026, 10, 16));
    assert_eq!(features["is_multi_store_pc"], 1);
    assert_eq!(features["exclusive_steam"], 0);
    assert_eq!(features["is_multiplatform_refined"], 1);
    assert_eq!(features["is_cross_platform"], 0);
}

#[test]
fn released_title_gets_info_only_result() {
    let pipeline = pipeline_with(loaded_models(), FakeCatalog::from_fixtures());
    let forecast = pipeline
        .forecast_by_title_at("Hades II", day(2027, 1, 1))
        .expect("forecast");
    assert!(forecast.already_released);
    assert_eq!(forecast.score_30d, 0.0);
    assert_eq!(forecast.score_60d, 0.0);
    assert!(!forecast.will_discount_60d);
    assert_eq!(forecast.insights.bullets[0], "This game has already released.");
    assert!(forecast.insights.contextual_factors.is_empty());
}

#[test]
fn title_search_error_paths() {
    let disabled = pipeline_with(loaded_models(), disabled_catalog());
    assert!(matches!(
        disabled.forecast_by_title("anything"),
        Err(ForecastError::CatalogUnavailable)
    ));

    let empty = pipeline_with(
        loaded_models(),
        FakeCatalog {
            search: "[]".to_string(),
            ..FakeCatalog::from_fixtures()
        },
    );
    let err = empty.forecast_by_title("nothing").unwrap_err();
    assert!(matches!(err, ForecastError::NotFound(_)));
    assert_eq!(err.status_code(), 404);

    let failing = pipeline_with(
        loaded_models(),
        FakeCatalog {
            fail_search: true,
            ..FakeCatalog::from_fixtures()
        },
    );
    let err = failing.forecast_by_title("Hades II").unwrap_err();
    assert_eq!(err.status_code(), 502);
    assert_eq!(err.public_message(), "External service error");
}

#[test]
fn predict_request_round_trip_through_pipeline() {
    let pipeline = pipeline_with(loaded_models(), disabled_catalog());
    let features = pipeline.feature_builder().build_at(
        570,
        &json!({"price": 19.99, "releaseDate": "2027-03-03"}),
        day(2026, 10, 16),
    );

    let request = PredictRequest {
        appid: 570,
        horizon: "30d".to_string(),
        features: features.clone(),
        threshold: Some(0.1),
        include_insights: true,
        name: Some("Dota Tactics".to_string()),
    };
    let response = pipeline.predict(&request).expect("prediction");
    assert!((response.score - sigmoid(-2.0)).abs() < 1e-9);
    assert!(response.will_discount);
    assert_eq!(response.threshold, 0.1);
    let insights = response.insights.expect("insights requested");
    assert!(insights.summary.is_none());
    assert!(insights.sale_confidence_comment.starts_with("Unlikely"));

    let mut partial = features;
    partial.remove("release_year");
    partial.remove("mature");
    let err = pipeline
        .predict(&PredictRequest {
            features: partial,
            include_insights: false,
            ..request
        })
        .unwrap_err();
    match err {
        ForecastError::BadRequest(msg) => {
            assert!(msg.contains("release_year") && msg.contains("mature"));
        }
        other => panic!("expected bad request, got {other:?}"),
    }
}

#[test]
fn metadata_forecast_reports_no_price_when_defaulted() {
    let pipeline = pipeline_with(loaded_models(), disabled_catalog());
    for metadata in [json!({"price": 0}), json!({"price": -3.5}), json!({})] {
        let forecast = pipeline
            .forecast_metadata_at(10, "Freebie", &metadata, day(2026, 10, 16))
            .expect("forecast");
        assert_eq!(forecast.price, None);
    }
}

#[test]
fn suggestions_carry_catalog_ids_and_assets() {
    let pipeline = pipeline_with(loaded_models(), FakeCatalog::from_fixtures());
    let suggestions = pipeline.suggest("hades", 8).expect("suggestions");
    assert_eq!(suggestions.len(), 2);
    assert_eq!(suggestions[0].title, "Hades");
    assert_eq!(suggestions[0].appid, None);
    assert_eq!(suggestions[1].itad_id, "018d937f-5a5e-71b3-bf5a-8d2b4fb9b9f7");
    assert_eq!(suggestions[1].appid, Some(1145350));
    assert!(suggestions[1].assets.contains_key("banner145"));

    assert_eq!(pipeline.suggest("hades", 1).expect("suggestions").len(), 1);
    assert_eq!(pipeline.suggest("  ", 8).unwrap_err().status_code(), 400);

    let disabled = pipeline_with(loaded_models(), disabled_catalog());
    assert!(matches!(
        disabled.suggest("hades", 8),
        Err(ForecastError::CatalogUnavailable)
    ));

    let failing = pipeline_with(
        loaded_models(),
        FakeCatalog {
            fail_search: true,
            ..FakeCatalog::from_fixtures()
        },
    );
    assert_eq!(failing.suggest("hades", 8).unwrap_err().status_code(), 502);
}

#[test]
fn catalog_id_forecast_uses_game_info() {
    let pipeline = pipeline_with(loaded_models(), FakeCatalog::from_fixtures());
    let response = pipeline
        .forecast_by_catalog_id("018d937f-5a5e-71b3-bf5a-8d2b4fb9b9f7", "30d", None, true)
        .expect("prediction");

    assert_eq!(response.appid, 1145350);
    assert_eq!(response.name.as_deref(), Some("Hades II"));
    assert_eq!(
        response.image_url.as_deref(),
        Some("https://assets.isthereanydeal.com/hades-ii/banner400.jpg")
    );
    // December release, early access.
    assert!((response.score - sigmoid(-1.5)).abs() < 1e-9);
    assert!(!response.will_discount);
    let insights = response.insights.expect("insights requested");
    assert!(insights.summary.is_none());
    assert!(insights.contextual_factors.iter().any(|f| f.contains("experimental")));

    let quiet = pipeline
        .forecast_by_catalog_id("018d937f-5a5e-71b3-bf5a-8d2b4fb9b9f7", "60d", Some(0.9), false)
        .expect("prediction");
    assert!(quiet.insights.is_none());
    assert_eq!(quiet.threshold, 0.9);
    assert!((quiet.score - sigmoid(1.5)).abs() < 1e-9);
}

#[test]
fn catalog_id_forecast_error_paths() {
    let missing = pipeline_with(
        loaded_models(),
        FakeCatalog {
            info: "null".to_string(),
            ..FakeCatalog::from_fixtures()
        },
    );
    let err = missing
        .forecast_by_catalog_id("gone", "30d", None, false)
        .unwrap_err();
    assert!(matches!(err, ForecastError::NotFound(_)));

    let no_appid = pipeline_with(
        loaded_models(),
        FakeCatalog {
            info: r#"{"title": "Console Only", "releaseDate": "2027-02-01"}"#.to_string(),
            ..FakeCatalog::from_fixtures()
        },
    );
    let err = no_appid
        .forecast_by_catalog_id("console", "30d", None, false)
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
    assert!(err.public_message().contains("appid"));

    let pipeline = pipeline_with(loaded_models(), FakeCatalog::from_fixtures());
    assert!(matches!(
        pipeline.forecast_by_catalog_id("x", "90d", None, false),
        Err(ForecastError::InvalidHorizon(_))
    ));
    assert_eq!(
        pipeline
            .forecast_by_catalog_id("x", "30d", Some(2.0), false)
            .unwrap_err()
            .status_code(),
        400
    );

    let disabled = pipeline_with(loaded_models(), disabled_catalog());
    assert!(matches!(
        disabled.forecast_by_catalog_id("x", "30d", None, false),
        Err(ForecastError::CatalogUnavailable)
    ));
}

#[test]
fn upcoming_listing_distinguishes_missing_and_corrupt_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("upcoming_predictions.json");
    let err = list_upcoming(&path).unwrap_err();
    assert!(matches!(err, ForecastError::UpcomingUnavailable));
    assert_eq!(err.status_code(), 503);

    fs::write(&path, "{not json").expect("write");
    let err = list_upcoming(&path).unwrap_err();
    assert_eq!(err.status_code(), 500);
    assert_eq!(err.public_message(), "An unexpected error occurred");

    let job = PrecomputeJob {
        seed_path: fixture_path("upcoming_seed.csv"),
        output_path: path.clone(),
        parallelism: 1,
    };
    let pipeline = pipeline_with(loaded_models(), disabled_catalog());
    let records = job.run_at(&pipeline, day(2026, 10, 16)).expect("precompute");
    assert_eq!(list_upcoming(&path).expect("listing"), records);
}

#[test]
fn predict_without_models_is_not_loaded() {
    let pipeline = pipeline_with(ModelService::default(), disabled_catalog());
    let request = PredictRequest {
        appid: 1,
        horizon: "60d".to_string(),
        features: json!({"x": 1}).as_object().cloned().unwrap(),
        threshold: None,
        include_insights: false,
        name: None,
    };
    let err = pipeline.predict(&request).unwrap_err();
    assert!(matches!(err, ForecastError::ModelNotLoaded(_)));
    assert_eq!(err.status_code(), 503);
}

#[test]
fn precompute_writes_records_in_seed_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job = PrecomputeJob {
        seed_path: fixture_path("upcoming_seed.csv"),
        output_path: dir.path().join("out").join("upcoming_predictions.json"),
        parallelism: 2,
    };
    let pipeline = pipeline_with(loaded_models(), disabled_catalog());
    let records = job.run_at(&pipeline, day(2026, 10, 16)).expect("precompute");

    let names = records.iter().map(|r| r.name.as_str()).collect::<Vec<_>>();
    assert_eq!(names, vec!["Hades II", "Quiet Harbor", "Orbital Foundry"]);
    assert_eq!(records[0].price, Some(29.99));
    assert_eq!(records[1].price, Some(39.99));
    assert_eq!(records[2].price, Some(24.99));
    assert!(records.iter().all(|r| r.appid == 0 && r.image_url.is_none()));
    assert!(records[0].will_discount_60d);

    let reloaded = load_upcoming(&job.output_path).expect("reload");
    assert_eq!(reloaded, records);
    assert!(!job.output_path.with_extension("json.tmp").exists());
}

#[test]
fn precompute_requires_loaded_models() {
    let dir = tempfile::tempdir().expect("tempdir");
    let job = PrecomputeJob {
        seed_path: fixture_path("upcoming_seed.csv"),
        output_path: dir.path().join("upcoming.json"),
        parallelism: 1,
    };
    let pipeline = pipeline_with(ModelService::default(), disabled_catalog());
    assert!(job.run_at(&pipeline, day(2026, 10, 16)).is_err());
    assert!(!job.output_path.exists());
}
