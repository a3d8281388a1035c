use std::path::Path;

use chrono::{DateTime, Utc};
use recman::{HarvestOptions, RecordManager};

fn parse_arg(flag: &str) -> Option<String> {
    std::env::args().find_map(|arg| {
        arg.strip_prefix(&format!("{flag}="))
            .map(str::to_string)
    })
}

fn parse_switch(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn parse_date(value: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")?;
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight exists");
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = parse_arg("--config");
    let datasources = parse_arg("--datasources").unwrap_or_else(|| "datasources.toml".to_string());
    let mappings = parse_arg("--mappings").unwrap_or_else(|| "mappings".to_string());
    let manager = RecordManager::open(config.as_deref(), &datasources, Path::new(&mappings))?;
    manager.cancellation().install_ctrl_c();

    let mut options = HarvestOptions::default();
    if let Some(from) = parse_arg("--from") {
        options.from = Some(parse_date(&from)?);
    }
    if let Some(until) = parse_arg("--until") {
        options.until = Some(parse_date(&until)?);
    }
    options.resumption = parse_arg("--resumption");
    if let Some(date) = parse_arg("--reharvest") {
        options.reharvest = Some(Some(parse_date(&date)?));
    } else if parse_switch("--reharvest") {
        options.reharvest = Some(None);
    }

    let excluded: Vec<String> = parse_arg("--exclude")
        .map(|list| list.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    let sources: Vec<String> = match parse_arg("--source") {
        Some(source) => vec![source],
        None => manager
            .sources()
            .keys()
            .filter(|id| !excluded.contains(id))
            .cloned()
            .collect(),
    };

    let mut failed = false;
    for source in &sources {
        match manager.harvest_source(source, &options).await {
            Ok(stats) => println!(
                "{source}: {} records ({} deleted, {} removed by reconciliation)",
                stats.records, stats.deleted, stats.removed
            ),
            Err(err) => {
                eprintln!("{source}: harvest failed: {err}");
                failed = true;
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
