pub mod catalog;
pub mod classifier;
pub mod config;
pub mod error;
pub mod features;
pub mod forecast;
pub mod http_client;
pub mod insights;
pub mod llm;
pub mod logging;
pub mod news;
pub mod precompute;
pub mod predictor;

pub use error::{ForecastError, ForecastResult};
pub use forecast::{ForecastPipeline, GameForecast, PredictRequest};
