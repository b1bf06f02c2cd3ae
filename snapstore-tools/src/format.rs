//! Small rendering helpers used when logging progress and results.

use anyhow::Error;
use proxmox_human_byte::HumanByte;

pub fn render_bytes_human_readable(bytes: u64) -> String {
    HumanByte::from(bytes).to_string()
}

pub fn render_epoch_local(epoch: i64) -> String {
    proxmox_time::strftime_local("%c", epoch).unwrap_or_else(|_: Error| epoch.to_string())
}
