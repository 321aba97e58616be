// Signatures mirror the macOS implementation.
#![allow(clippy::unused_async)]

use anyhow::{Result, bail};

pub async fn bring_up(_iface: &str) -> Result<()> {
    unsupported()
}

pub async fn install_routes() -> Result<()> {
    unsupported()
}

pub async fn uninstall_routes() -> Result<()> {
    unsupported()
}

pub async fn get_dns(_nic: &str) -> Result<Vec<String>> {
    unsupported()
}

pub async fn set_dns(_nic: &str, _servers: &[String]) -> Result<()> {
    unsupported()
}

fn unsupported<T>() -> Result<T> {
    bail!("client mode is not supported on this platform")
}
