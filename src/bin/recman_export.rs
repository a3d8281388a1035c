use std::path::Path;

use chrono::{DateTime, Utc};
use recman::{AddDedupId, ExportOptions, RecordManager};

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

    let mut options = ExportOptions {
        file: parse_arg("--file").ok_or_else(|| anyhow::anyhow!("--file=F is required"))?,
        deleted_file: parse_arg("--deleted"),
        skip: parse_arg("--skip")
            .map(|n| n.parse())
            .transpose()?
            .unwrap_or(0),
        source: parse_arg("--source"),
        single_id: parse_arg("--single"),
        xpath: parse_arg("--xpath"),
        sort_dedup: parse_switch("--sort-dedup"),
        ..ExportOptions::default()
    };
    if let Some(from) = parse_arg("--from") {
        options.from = Some(parse_date(&from)?);
    }
    options.add_dedup_id = match parse_arg("--add-dedup-id").as_deref() {
        None => AddDedupId::No,
        Some("deduped") => AddDedupId::Deduped,
        Some("always") => AddDedupId::Always,
        Some(other) => anyhow::bail!("bad --add-dedup-id value {other}"),
    };

    let exported = manager.export(&options)?;
    println!("exported {exported} records to {}", options.file);
    Ok(())
}
