//! Periodic refresh of the China IP database from the APNIC delegation file,
//! fetched through the relay so the fetch itself cannot be blocked.

use std::time::Duration;

use anyhow::{Context as _, Result, ensure};
use dialer::TunnelHttpClient;

pub const REFRESH_TIMEOUT: Duration = Duration::from_secs(60);

const REFRESH_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);
const DELEGATIONS_URL: &str = "http://ftp.apnic.net/apnic/stats/apnic/delegated-apnic-latest";

pub async fn refresh_loop(client: TunnelHttpClient) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;

        match refresh(&client).await {
            Ok(num_ranges) => {
                tracing::info!(num_ranges, "Refreshed the China IP database");
            }
            // The previous database stays live.
            Err(e) => tracing::error!("Failed to refresh the China IP database: {e:#}"),
        }
    }
}

async fn refresh(client: &TunnelHttpClient) -> Result<usize> {
    let response = client
        .get(DELEGATIONS_URL)
        .await
        .context("Failed to fetch the delegation file")?;

    ensure!(
        response.status().is_success(),
        "Delegation fetch returned {}",
        response.status()
    );

    let body =
        std::str::from_utf8(response.body().as_ref()).context("Delegation file is not UTF-8")?;

    let db = ip_range_db::parse_delegations(body, "CN")?;
    let num_ranges = db.len();

    ip_range_db::CHINA.replace(db);

    Ok(num_ranges)
}
