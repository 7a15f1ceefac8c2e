//! Host machine identity, one implementation per supported OS.

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "windows")]
pub use windows::machine_id;

#[cfg(target_os = "macos")]
pub use macos::machine_id;

#[cfg(target_os = "linux")]
pub use linux::machine_id;

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
pub fn machine_id() -> anyhow::Result<String> {
    Err(anyhow::anyhow!("Unsupported platform"))
}
