use std::path::{Path, PathBuf};

use recman::RecordManager;

fn parse_arg(flag: &str) -> Option<String> {
    std::env::args().find_map(|arg| {
        arg.strip_prefix(&format!("{flag}="))
            .map(str::to_string)
    })
}

fn parse_switch(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

/// Expand a trailing-component glob like `exports/*.json`. Only `*` in
/// the file name is supported.
fn expand_glob(pattern: &str) -> anyhow::Result<Vec<PathBuf>> {
    let path = Path::new(pattern);
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        anyhow::bail!("bad file pattern {pattern}");
    };
    if !name.contains('*') {
        return Ok(vec![path.to_path_buf()]);
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let (prefix, suffix) = name.split_once('*').expect("checked above");

    let mut matches = Vec::new();
    for entry in std::fs::read_dir(&parent)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if file_name.starts_with(prefix) && file_name.ends_with(suffix) {
            matches.push(parent.join(file_name));
        }
    }
    matches.sort();
    Ok(matches)
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

    let source = parse_arg("--source")
        .ok_or_else(|| anyhow::anyhow!("--source=S is required"))?;
    let pattern = parse_arg("--file").ok_or_else(|| anyhow::anyhow!("--file=GLOB is required"))?;
    let delete = parse_switch("--delete");

    let files = expand_glob(&pattern)?;
    if files.is_empty() {
        anyhow::bail!("no files match {pattern}");
    }

    let mut total = 0;
    for file in &files {
        let count = manager.import_file(&source, file, delete)?;
        println!("{}: {count} records", file.display());
        total += count;
    }
    println!("total: {total} records");
    Ok(())
}
