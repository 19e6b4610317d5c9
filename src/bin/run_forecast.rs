//! Runs the enrollment and cost simulator over a scenario file, without a database.
//!
//! Usage: `run-forecast <scenarios.json> [horizon_months] [start YYYY-MM-DD]`
//!
//! The file holds either a JSON array of scenarios or a `{"scenarios": [...],
//! "horizon_months": N}` request. The projection is printed to stdout as JSON.

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use ctms_payments_api::forecast;
use ctms_payments_api::models::{ForecastRequest, ForecastScenario};
use serde::Deserialize;
use std::env;

const DEFAULT_HORIZON_MONTHS: u32 = 12;

#[derive(Deserialize)]
#[serde(untagged)]
enum ScenarioFile {
    Request(ForecastRequest),
    Scenarios(Vec<ForecastScenario>),
}

fn main() -> anyhow::Result<()> {
    ctms_payments_api::obs::init_cli_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let path = args
        .first()
        .context("usage: run-forecast <scenarios.json> [horizon_months] [start YYYY-MM-DD]")?;

    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let (scenarios, file_horizon) = match serde_json::from_str::<ScenarioFile>(&raw)
        .with_context(|| format!("parsing scenarios from {}", path))?
    {
        ScenarioFile::Request(request) => (request.scenarios, Some(request.horizon_months)),
        ScenarioFile::Scenarios(scenarios) => (scenarios, None),
    };

    let horizon_months = match args.get(1) {
        Some(h) => h
            .parse::<u32>()
            .with_context(|| format!("horizon_months must be a positive number, got '{}'", h))?,
        None => file_horizon.unwrap_or(DEFAULT_HORIZON_MONTHS),
    };
    let start = match args.get(2) {
        Some(d) => NaiveDate::parse_from_str(d, "%Y-%m-%d")
            .with_context(|| format!("start must be YYYY-MM-DD, got '{}'", d))?,
        None => Utc::now().date_naive(),
    };

    tracing::info!(
        "Simulating {} scenario(s) over {} months from {}",
        scenarios.len(),
        horizon_months,
        start
    );
    let projections = forecast::simulate(&scenarios, horizon_months, start)
        .map_err(|e| anyhow::anyhow!("forecast rejected: {}", e))?;

    println!("{}", serde_json::to_string_pretty(&projections)?);
    Ok(())
}
