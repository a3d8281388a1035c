use std::path::Path;

use chrono::{DateTime, Utc};
use recman::{RecordManager, UpdateOptions};

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

    let func = parse_arg("--func").ok_or_else(|| anyhow::anyhow!("--func=NAME is required"))?;
    let source = parse_arg("--source");
    let single = parse_arg("--single");

    match func.as_str() {
        "renormalize" => {
            let count = manager.renormalize(source.as_deref(), single.as_deref())?;
            println!("renormalized {count} records");
        }
        "deduplicate" => {
            let stats = manager.deduplicate(source.as_deref())?;
            println!(
                "processed {} records: {} matched, {} new groups, {} detached",
                stats.processed, stats.matched, stats.groups_created, stats.detached
            );
        }
        "markdeleted" => {
            let count = manager.mark_deleted(source.as_deref(), single.as_deref())?;
            println!("marked {count} records deleted");
        }
        "deleterecords" => {
            let source =
                source.ok_or_else(|| anyhow::anyhow!("deleterecords needs --source=S"))?;
            let count = manager.delete_records(&source)?;
            println!("deleted {count} records from the store");
        }
        "deletesolr" => {
            let source = source.ok_or_else(|| anyhow::anyhow!("deletesolr needs --source=S"))?;
            let stats = manager
                .delete_datasource_from_solr(&source, parse_switch("--no-commit"))
                .await?;
            println!("rewrote {} merged documents", stats.updated);
        }
        "updatesolr" => {
            let mut options = UpdateOptions {
                source,
                single_id: single,
                no_commit: parse_switch("--no-commit"),
                ..UpdateOptions::default()
            };
            if let Some(from) = parse_arg("--from") {
                options.from = Some(parse_date(&from)?);
            }
            let compare = parse_arg("--compare");
            let dump = parse_arg("--dump");
            let stats = manager
                .update_solr(
                    &options,
                    compare.as_deref().map(Path::new),
                    dump.as_deref(),
                )
                .await?;
            println!(
                "queued {} ({}), updated {}, deleted {}",
                stats.queued,
                if stats.queue_reused { "reused" } else { "fresh" },
                stats.updated,
                stats.deleted
            );
        }
        "optimizesolr" => {
            manager.optimize_solr().await?;
            println!("optimize request sent");
        }
        "checkdedup" => {
            let report = manager.check_dedup()?;
            println!(
                "checked {} groups: removed {} stale ids, deleted {} groups, cleared {} orphans",
                report.groups_checked,
                report.stale_ids_removed,
                report.groups_deleted,
                report.orphans_cleared
            );
        }
        "count" => {
            let count =
                manager.count_records(source.as_deref(), parse_switch("--deleted"))?;
            println!("{count}");
        }
        "dump" => {
            let id = single.ok_or_else(|| anyhow::anyhow!("dump needs --single=ID"))?;
            print!("{}", manager.dump_record(&id)?);
        }
        "preview" => {
            let id = single.ok_or_else(|| anyhow::anyhow!("preview needs --single=ID"))?;
            let doc = manager.preview_record(&id).await?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        other => anyhow::bail!("unknown function {other}"),
    }
    Ok(())
}
