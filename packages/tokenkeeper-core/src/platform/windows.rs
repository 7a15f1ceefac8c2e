use anyhow::{Context, Result};
use winreg::enums::*;
use winreg::RegKey;

pub fn machine_id() -> Result<String> {
    let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
    let path = r"SOFTWARE\Microsoft\Cryptography";
    let key = hklm
        .open_subkey_with_flags(path, KEY_READ | KEY_WOW64_64KEY)
        .context("Failed to open registry key")?;

    let guid: String = key
        .get_value("MachineGuid")
        .context("Failed to read MachineGuid")?;

    Ok(guid.trim().to_string())
}
