use std::path::PathBuf;

use anyhow::{Result, anyhow};

use steam_sale_forecast::config::Settings;
use steam_sale_forecast::forecast::ForecastPipeline;
use steam_sale_forecast::logging;
use steam_sale_forecast::precompute::PrecomputeJob;

fn main() -> Result<()> {
    let settings = Settings::load();
    logging::init();

    let mut job = PrecomputeJob::from_settings(&settings);
    if let Some(seed) = parse_path_arg("--seed") {
        job.seed_path = seed;
    }
    if let Some(out) = parse_path_arg("--out") {
        job.output_path = out;
    }

    let pipeline = ForecastPipeline::initialize(&settings);
    if !pipeline.models().is_loaded() {
        return Err(anyhow!(
            "model artifacts failed to load (MODEL_30D_PATH / MODEL_60D_PATH / FEATURES_PATH)"
        ));
    }

    let records = job.run(&pipeline)?;
    let positive_30d = records.iter().filter(|r| r.will_discount_30d).count();
    let positive_60d = records.iter().filter(|r| r.will_discount_60d).count();

    println!("Upcoming precompute complete");
    println!("Seed: {}", job.seed_path.display());
    println!("Output: {}", job.output_path.display());
    println!("Records: {}", records.len());
    println!("Likely discount within 30d: {positive_30d}");
    println!("Likely discount within 60d: {positive_60d}");
    Ok(())
}

fn parse_path_arg(flag: &str) -> Option<PathBuf> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(path) = arg.strip_prefix(&prefix) {
            let trimmed = path.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }
        if arg == flag {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() {
                return Some(PathBuf::from(next));
            }
        }
    }
    None
}
