use anyhow::{anyhow, Context, Result};
use std::process::Command;

pub fn machine_id() -> Result<String> {
    let output = Command::new("ioreg")
        .args(["-rd1", "-c", "IOPlatformExpertDevice"])
        .output()
        .context("Failed to run ioreg")?;

    if !output.status.success() {
        return Err(anyhow!("ioreg exited with {}", output.status));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_platform_uuid(&stdout).ok_or_else(|| anyhow!("IOPlatformUUID not found in ioreg output"))
}

/// Extract the value of `"IOPlatformUUID" = "..."`
fn parse_platform_uuid(ioreg: &str) -> Option<String> {
    ioreg
        .lines()
        .find(|line| line.contains("\"IOPlatformUUID\""))
        .and_then(|line| line.split('=').nth(1))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}
