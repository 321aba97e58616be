use anyhow::{Context as _, Result, bail};
use tokio::process::Command;

const GATEWAY: &str = "198.18.0.1";
const NETMASK: &str = "255.255.0.0";

/// Eight summary routes covering all of unicast IPv4, so every flow lands on
/// the TUN via the fake gateway.
const ROUTE_NETS: [&str; 8] = ["1", "2/7", "4/6", "8/5", "16/4", "32/3", "64/2", "128.0/1"];

pub async fn bring_up(iface: &str) -> Result<()> {
    run("ifconfig", &[iface, GATEWAY, "netmask", NETMASK, GATEWAY, "up"]).await?;

    Ok(())
}

pub async fn install_routes() -> Result<()> {
    for net in ROUTE_NETS {
        run("route", &["add", "-net", net, GATEWAY]).await?;
    }

    Ok(())
}

pub async fn uninstall_routes() -> Result<()> {
    let mut failed = Vec::new();

    for net in ROUTE_NETS {
        if run("route", &["delete", "-net", net, GATEWAY]).await.is_err() {
            failed.push(net);
        }
    }

    if !failed.is_empty() {
        bail!("failed to delete routes: {failed:?}");
    }

    Ok(())
}

pub async fn get_dns(nic: &str) -> Result<Vec<String>> {
    let output = run("networksetup", &["-getdnsservers", nic]).await?;

    // "There aren't any DNS Servers set on <nic>."
    if output.contains("aren't") {
        return Ok(Vec::new());
    }

    Ok(output
        .split_whitespace()
        .map(|server| server.to_owned())
        .collect())
}

pub async fn set_dns(nic: &str, servers: &[String]) -> Result<()> {
    let mut args = vec!["-setdnsservers", nic];
    if servers.is_empty() {
        // networksetup's spelling of "none".
        args.push("empty");
    } else {
        args.extend(servers.iter().map(String::as_str));
    }

    run("networksetup", &args).await?;

    Ok(())
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    tracing::info!("{program} {}", args.join(" "));

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("Failed to spawn `{program}`"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);

        bail!("`{program}` failed ({}): {stdout}{stderr}", output.status);
    }

    Ok(stdout)
}
