/// Parse a `column=v1,v2` filter argument into a column name and its values.
pub fn parse_filter(arg: &str) -> anyhow::Result<(String, Vec<String>)> {
    let (column, values) = arg
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("Invalid filter {:?}, expected column=v1,v2", arg))?;
    if column.is_empty() {
        anyhow::bail!("Invalid filter {:?}: empty column name", arg);
    }
    let values: Vec<String> = values
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect();
    if values.is_empty() {
        anyhow::bail!("Invalid filter {:?}: no values", arg);
    }
    Ok((column.to_string(), values))
}

/// Human-readable byte count (binary units).
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Initialize tracing for CLI binaries.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
