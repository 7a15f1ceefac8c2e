use anyhow::{anyhow, Result};

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

pub fn machine_id() -> Result<String> {
    for path in MACHINE_ID_PATHS {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let id = content.trim();
                if !id.is_empty() {
                    tracing::trace!("Machine identity read from {}", path);
                    return Ok(id.to_string());
                }
            }
            Err(e) => tracing::trace!("Could not read {}: {}", path, e),
        }
    }

    Err(anyhow!(
        "No machine id found in {}",
        MACHINE_ID_PATHS.join(" or ")
    ))
}
