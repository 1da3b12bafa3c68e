use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::classifier::{Classifier, ClassifierArtifact};
use crate::error::{ForecastError, ForecastResult};
use crate::features::{FeatureMap, coerce_numeric};

pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Horizon {
    #[serde(rename = "30d")]
    ThirtyDays,
    #[serde(rename = "60d")]
    SixtyDays,
}

impl Horizon {
    pub const ALL: [Horizon; 2] = [Horizon::ThirtyDays, Horizon::SixtyDays];

    pub fn as_str(self) -> &'static str {
        match self {
            Horizon::ThirtyDays => "30d",
            Horizon::SixtyDays => "60d",
        }
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Horizon {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "30d" => Ok(Horizon::ThirtyDays),
            "60d" => Ok(Horizon::SixtyDays),
            other => Err(ForecastError::InvalidHorizon(other.to_string())),
        }
    }
}

/// Outcome of one inference call. Fields are read-only so `will_discount`
/// always agrees with `score >= threshold`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    appid: u64,
    horizon: Horizon,
    score: f64,
    threshold: f64,
    will_discount: bool,
}

impl DecisionRecord {
    pub fn new(appid: u64, horizon: Horizon, score: f64, threshold: f64) -> Self {
        Self {
            appid,
            horizon,
            score,
            threshold,
            will_discount: score >= threshold,
        }
    }

    pub fn appid(&self) -> u64 {
        self.appid
    }

    pub fn horizon(&self) -> Horizon {
        self.horizon
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn will_discount(&self) -> bool {
        self.will_discount
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub model_30d: PathBuf,
    pub model_60d: PathBuf,
    pub features: PathBuf,
}

struct LoadedModels {
    schema: Vec<String>,
    model_30d: Box<dyn Classifier>,
    model_60d: Box<dyn Classifier>,
}

// Nothing is accepted until load (or from_parts) has succeeded.
pub struct ModelService {
    default_threshold: f64,
    loaded: Option<LoadedModels>,
}

impl Default for ModelService {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl ModelService {
    pub fn new(default_threshold: f64) -> Self {
        Self {
            default_threshold,
            loaded: None,
        }
    }

    pub fn from_parts(
        schema: Vec<String>,
        model_30d: Box<dyn Classifier>,
        model_60d: Box<dyn Classifier>,
        default_threshold: f64,
    ) -> ForecastResult<Self> {
        validate_schema(&schema)?;
        Ok(Self {
            default_threshold,
            loaded: Some(LoadedModels {
                schema,
                model_30d,
                model_60d,
            }),
        })
    }

    pub fn load(&mut self, paths: &ArtifactPaths) -> ForecastResult<()> {
        tracing::info!("loading_model_artifacts");

        let schema = load_feature_schema(&paths.features)?;
        let model_30d = load_classifier(&paths.model_30d, &schema, Horizon::ThirtyDays)?;
        let model_60d = load_classifier(&paths.model_60d, &schema, Horizon::SixtyDays)?;

        self.loaded = Some(LoadedModels {
            schema,
            model_30d: Box::new(model_30d),
            model_60d: Box::new(model_60d),
        });

        tracing::info!(
            model_30d_path = %paths.model_30d.display(),
            model_60d_path = %paths.model_60d.display(),
            features_path = %paths.features.display(),
            "model_artifacts_loaded_successfully"
        );
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    pub fn default_threshold(&self) -> f64 {
        self.default_threshold
    }

    pub fn feature_names(&self) -> Option<&[String]> {
        self.loaded.as_ref().map(|m| m.schema.as_slice())
    }

    pub fn predict(
        &self,
        horizon: &str,
        appid: u64,
        features: &FeatureMap,
        threshold: Option<f64>,
    ) -> ForecastResult<DecisionRecord> {
        let horizon = horizon.parse::<Horizon>()?;
        self.predict_horizon(horizon, appid, features, threshold)
    }

    pub fn predict_horizon(
        &self,
        horizon: Horizon,
        appid: u64,
        features: &FeatureMap,
        threshold: Option<f64>,
    ) -> ForecastResult<DecisionRecord> {
        let models = self.loaded.as_ref().ok_or_else(|| {
            ForecastError::ModelNotLoaded("models not loaded, call load() first".to_string())
        })?;

        let row = vectorize(&models.schema, features)?;
        let model = match horizon {
            Horizon::ThirtyDays => &models.model_30d,
            Horizon::SixtyDays => &models.model_60d,
        };
        let score = model
            .predict_proba(&row)
            .with_context(|| format!("{horizon} classifier inference failed"))?;
        let cut = threshold.unwrap_or(self.default_threshold);

        let decision = DecisionRecord::new(appid, horizon, score, cut);
        tracing::info!(
            appid,
            horizon = %horizon,
            score,
            threshold = cut,
            will_discount = decision.will_discount(),
            "prediction_made"
        );
        Ok(decision)
    }
}

/// Orders `features` by `schema`. Every missing key is reported together;
/// the first non-numeric value fails immediately.
pub fn vectorize(schema: &[String], features: &FeatureMap) -> ForecastResult<Vec<f64>> {
    let mut row = Vec::with_capacity(schema.len());
    let mut missing = Vec::new();

    for name in schema {
        match features.get(name) {
            None | Some(Value::Null) => missing.push(name.clone()),
            Some(value) => match coerce_numeric(value) {
                Some(v) => row.push(v),
                None => {
                    return Err(ForecastError::bad_request(format!(
                        "Feature '{name}' must be numeric. Got {value}"
                    )));
                }
            },
        }
    }

    if !missing.is_empty() {
        return Err(ForecastError::bad_request(format!(
            "Missing required features: {missing:?}"
        )));
    }
    Ok(row)
}

// JSON array of names, or one name per line with blanks and `#` comments skipped.
pub fn load_feature_schema(path: &Path) -> ForecastResult<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|err| {
        tracing::error!(path = %path.display(), error = %err, "features_file_missing");
        ForecastError::ModelNotLoaded(format!("features list not found at {}", path.display()))
    })?;
    let schema = parse_feature_schema(&raw)?;
    validate_schema(&schema)?;
    Ok(schema)
}

pub fn parse_feature_schema(raw: &str) -> ForecastResult<Vec<String>> {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<String>>(trimmed).map_err(|err| {
            ForecastError::ModelNotLoaded(format!("features list is not a JSON string array: {err}"))
        });
    }
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn validate_schema(schema: &[String]) -> ForecastResult<()> {
    if schema.is_empty() {
        return Err(ForecastError::ModelNotLoaded(
            "features list is empty".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for name in schema {
        if !seen.insert(name.as_str()) {
            return Err(ForecastError::ModelNotLoaded(format!(
                "features list repeats '{name}'"
            )));
        }
    }
    Ok(())
}

fn load_classifier(
    path: &Path,
    schema: &[String],
    horizon: Horizon,
) -> ForecastResult<ClassifierArtifact> {
    if !path.exists() {
        tracing::error!(path = %path.display(), horizon = %horizon, "model_missing");
        return Err(ForecastError::ModelNotLoaded(format!(
            "{horizon} model not found at {}",
            path.display()
        )));
    }
    let artifact = ClassifierArtifact::load(path)
        .and_then(|a| a.validate(schema).map(|_| a))
        .map_err(|err| {
            tracing::error!(path = %path.display(), horizon = %horizon, error = %format!("{err:#}"), "model_invalid");
            ForecastError::ModelNotLoaded(format!("{horizon} model at {} is invalid: {err:#}", path.display()))
        })?;
    Ok(artifact)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(f64);

    impl Classifier for Fixed {
        fn predict_proba(&self, _row: &[f64]) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    fn schema() -> Vec<String> {
        vec!["a".to_string(), "b".to_string(), "c".to_string()]
    }

    fn service(p30: f64, p60: f64) -> ModelService {
        ModelService::from_parts(schema(), Box::new(Fixed(p30)), Box::new(Fixed(p60)), 0.5).unwrap()
    }

    fn full_map() -> FeatureMap {
        json!({"a": 1, "b": 2.5, "c": "3", "extra": "ignored"})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn horizon_parsing_accepts_only_two_literals() {
        assert_eq!("30d".parse::<Horizon>().unwrap(), Horizon::ThirtyDays);
        assert_eq!("60d".parse::<Horizon>().unwrap(), Horizon::SixtyDays);
        for bad in ["45d", "30", "30D", ""] {
            assert!(matches!(
                bad.parse::<Horizon>(),
                Err(ForecastError::InvalidHorizon(_))
            ));
        }
    }

    #[test]
    fn invalid_horizon_is_reported_before_load_state() {
        let svc = ModelService::default();
        let err = svc.predict("90d", 1, &full_map(), None).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidHorizon(_)));
    }

    #[test]
    fn unloaded_service_refuses_predictions() {
        let svc = ModelService::default();
        assert!(!svc.is_loaded());
        let err = svc.predict("30d", 1, &full_map(), None).unwrap_err();
        assert!(matches!(err, ForecastError::ModelNotLoaded(_)));
    }

    #[test]
    fn decision_is_inclusive_at_threshold() {
        let d = DecisionRecord::new(1, Horizon::ThirtyDays, 0.5, 0.5);
        assert!(d.will_discount());
        let d = DecisionRecord::new(1, Horizon::ThirtyDays, 0.4999, 0.5);
        assert!(!d.will_discount());
    }

    #[test]
    fn predict_uses_horizon_model_and_threshold() {
        let svc = service(0.3, 0.7);
        let d30 = svc.predict("30d", 9, &full_map(), None).unwrap();
        let d60 = svc.predict("60d", 9, &full_map(), None).unwrap();
        assert_eq!(d30.score(), 0.3);
        assert!(!d30.will_discount());
        assert!(d60.will_discount());
        assert_eq!(d60.threshold(), 0.5);

        let custom = svc.predict("60d", 9, &full_map(), Some(0.7)).unwrap();
        assert!(custom.will_discount());
        assert_eq!(custom.threshold(), 0.7);
    }

    #[test]
    fn missing_keys_are_collected() {
        let svc = service(0.5, 0.5);
        let features = json!({"b": 1}).as_object().cloned().unwrap();
        let err = svc.predict("30d", 1, &features, None).unwrap_err();
        match err {
            ForecastError::BadRequest(msg) => {
                assert!(msg.contains("\"a\""));
                assert!(msg.contains("\"c\""));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_numeric_value_names_the_key() {
        let svc = service(0.5, 0.5);
        let features = json!({"a": 1, "b": "lots", "c": 2}).as_object().cloned().unwrap();
        let err = svc.predict("30d", 1, &features, None).unwrap_err();
        match err {
            ForecastError::BadRequest(msg) => assert!(msg.contains("'b'")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn null_counts_as_missing() {
        let svc = service(0.5, 0.5);
        let features = json!({"a": 1, "b": null, "c": 2}).as_object().cloned().unwrap();
        let err = svc.predict("30d", 1, &features, None).unwrap_err();
        match err {
            ForecastError::BadRequest(msg) => assert!(msg.contains("Missing")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn vectorize_follows_schema_order() {
        let row = vectorize(&schema(), &full_map()).unwrap();
        assert_eq!(row, vec![1.0, 2.5, 3.0]);
    }

    #[test]
    fn schema_parses_json_and_plain_text() {
        assert_eq!(parse_feature_schema(r#"["a", "b"]"#).unwrap(), vec!["a", "b"]);
        assert_eq!(
            parse_feature_schema("# trained 2025-11\na\n\n b \n").unwrap(),
            vec!["a", "b"]
        );
        assert!(parse_feature_schema("[1, 2]").is_err());
    }

    #[test]
    fn duplicate_schema_is_rejected() {
        let err = ModelService::from_parts(
            vec!["a".into(), "a".into()],
            Box::new(Fixed(0.1)),
            Box::new(Fixed(0.1)),
            0.5,
        )
        .err()
        .unwrap();
        assert!(matches!(err, ForecastError::ModelNotLoaded(_)));
    }

    #[test]
    fn failing_classifier_is_an_internal_fault() {
        struct Broken;
        impl Classifier for Broken {
            fn predict_proba(&self, _row: &[f64]) -> anyhow::Result<f64> {
                Err(anyhow::anyhow!("boom"))
            }
        }
        let svc =
            ModelService::from_parts(schema(), Box::new(Broken), Box::new(Fixed(0.1)), 0.5).unwrap();
        let err = svc.predict("30d", 1, &full_map(), None).unwrap_err();
        assert!(matches!(err, ForecastError::Internal(_)));
        assert_eq!(err.status_code(), 500);
    }
}
