use std::path::Path;

use recman::RecordManager;

fn parse_arg(flag: &str) -> Option<String> {
    std::env::args().find_map(|arg| {
        arg.strip_prefix(&format!("{flag}="))
            .map(str::to_string)
    })
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let config = parse_arg("--config");
    let datasources = parse_arg("--datasources").unwrap_or_else(|| "datasources.toml".to_string());
    let mappings = parse_arg("--mappings").unwrap_or_else(|| "mappings".to_string());
    let manager = RecordManager::open(config.as_deref(), &datasources, Path::new(&mappings))?;

    let pattern = parse_arg("--search").unwrap_or_else(|| ".".to_string());
    let pattern = regex::Regex::new(&pattern)?;

    for (source_id, settings) in manager.search_datasources(&pattern) {
        println!(
            "{source_id}: format={} type={:?} url={} dedup={}",
            settings.format, settings.source_type, settings.url, settings.dedup
        );
    }
    Ok(())
}
