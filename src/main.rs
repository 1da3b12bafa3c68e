use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde_json::{Value, json};

use steam_sale_forecast::config::Settings;
use steam_sale_forecast::forecast::SUGGEST_LIMIT;
use steam_sale_forecast::precompute::list_upcoming;
use steam_sale_forecast::{ForecastError, ForecastPipeline, PredictRequest, logging};

const USAGE: &str = "usage: steam_sale_forecast (--health | --title <name> | --suggest <title> [--limit N] \
| --catalog-id <id> [--horizon 30d|60d] [--threshold X] [--insights] | --upcoming [--path file.json] \
| --metadata <file.json> [--appid N] [--name S] | --predict <request.json>)";

enum Command {
    Health,
    Title(String),
    Metadata {
        path: PathBuf,
        appid: u64,
        name: Option<String>,
    },
    Predict(PathBuf),
    Suggest {
        title: String,
        limit: usize,
    },
    CatalogId {
        id: String,
        horizon: String,
        threshold: Option<f64>,
        include_insights: bool,
    },
    Upcoming(Option<PathBuf>),
}

fn main() -> ExitCode {
    let settings = Settings::load();
    logging::init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(err) => {
            eprintln!("{err:#}");
            eprintln!("{USAGE}");
            return ExitCode::from(2);
        }
    };

    let pipeline = ForecastPipeline::initialize(&settings);
    match run(&settings, &pipeline, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => report(err),
    }
}

fn run(settings: &Settings, pipeline: &ForecastPipeline, command: Command) -> Result<(), ForecastError> {
    match command {
        Command::Health => print_json(&pipeline.health()),
        Command::Title(title) => print_json(&pipeline.forecast_by_title(&title)?),
        Command::Metadata { path, appid, name } => {
            let metadata = read_json(&path)?;
            let name = name
                .or_else(|| {
                    ["name", "title"]
                        .iter()
                        .find_map(|k| metadata.get(*k).and_then(Value::as_str))
                        .map(str::to_string)
                })
                .unwrap_or_else(|| format!("Steam app {appid}"));
            print_json(&pipeline.forecast_metadata(appid, &name, &metadata)?)
        }
        Command::Predict(path) => {
            let request = serde_json::from_value::<PredictRequest>(read_json(&path)?)
                .map_err(|err| ForecastError::bad_request(format!("invalid predict request: {err}")))?;
            print_json(&pipeline.predict(&request)?)
        }
        Command::Suggest { title, limit } => print_json(&pipeline.suggest(&title, limit)?),
        Command::CatalogId {
            id,
            horizon,
            threshold,
            include_insights,
        } => print_json(&pipeline.forecast_by_catalog_id(&id, &horizon, threshold, include_insights)?),
        Command::Upcoming(path) => {
            let path = path.unwrap_or_else(|| settings.upcoming_output_path.clone());
            print_json(&list_upcoming(&path)?)
        }
    }
}

fn report(err: ForecastError) -> ExitCode {
    let status = err.status_code();
    let body = json!({ "status": status, "error": err.public_message() });
    eprintln!("{body}");
    if err.is_client_error() {
        ExitCode::from(2)
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), ForecastError> {
    let out = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{out}");
    Ok(())
}

fn read_json(path: &Path) -> Result<Value, ForecastError> {
    let raw = fs::read_to_string(path)
        .map_err(|err| ForecastError::bad_request(format!("cannot read {}: {err}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|err| ForecastError::bad_request(format!("{} is not valid JSON: {err}", path.display())))
}

fn parse_command(args: &[String]) -> Result<Command> {
    if args.iter().any(|a| a == "--health") {
        return Ok(Command::Health);
    }
    if let Some(title) = arg_value(args, "--title") {
        return Ok(Command::Title(title));
    }
    if let Some(title) = arg_value(args, "--suggest") {
        let limit = match arg_value(args, "--limit") {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("invalid --limit '{raw}'"))?,
            None => SUGGEST_LIMIT,
        };
        return Ok(Command::Suggest { title, limit });
    }
    if let Some(id) = arg_value(args, "--catalog-id") {
        let threshold = match arg_value(args, "--threshold") {
            Some(raw) => Some(
                raw.parse::<f64>()
                    .with_context(|| format!("invalid --threshold '{raw}'"))?,
            ),
            None => None,
        };
        return Ok(Command::CatalogId {
            id,
            horizon: arg_value(args, "--horizon").unwrap_or_else(|| "30d".to_string()),
            threshold,
            include_insights: args.iter().any(|a| a == "--insights"),
        });
    }
    if args.iter().any(|a| a == "--upcoming") {
        return Ok(Command::Upcoming(arg_value(args, "--path").map(PathBuf::from)));
    }
    if let Some(path) = arg_value(args, "--predict") {
        return Ok(Command::Predict(PathBuf::from(path)));
    }
    if let Some(path) = arg_value(args, "--metadata") {
        let appid = match arg_value(args, "--appid") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("invalid --appid '{raw}'"))?,
            None => 0,
        };
        return Ok(Command::Metadata {
            path: PathBuf::from(path),
            appid,
            name: arg_value(args, "--name"),
        });
    }
    Err(anyhow!("no command given"))
}

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    let prefix = format!("{flag}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == flag {
            let Some(next) = args.get(idx + 1) else {
                continue;
            };
            if !next.trim().is_empty() && !next.starts_with("--") {
                return Some(next.trim().to_string());
            }
        }
    }
    None
}
