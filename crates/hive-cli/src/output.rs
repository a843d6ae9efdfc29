use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    println!("{}", json);
    Ok(())
}

/// Print a bare scalar for shell callers (`id=$(hive-tools queue submit ...)`).
pub fn print_raw(value: impl std::fmt::Display) {
    println!("{value}");
}

/// JSON body for an operation switched off by configuration.
pub fn skipped(reason: &str) -> serde_json::Value {
    serde_json::json!({
        "success": true,
        "skipped": true,
        "reason": reason,
    })
}
