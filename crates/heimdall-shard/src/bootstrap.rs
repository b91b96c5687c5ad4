//! Bootstrap fetch: gateway URL, shard count and identify budget.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, ShardError};
use crate::gate::IdentifyBudget;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Response of `GET /gateway/bot`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Recommended shard count.
    pub shards: u32,
    /// Identify allowance.
    pub session_start_limit: SessionStartLimit,
}

/// Identify allowance as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    /// Identifies allowed per window.
    pub total: u32,
    /// Identifies left in the current window.
    pub remaining: u32,
    /// Milliseconds until the window resets.
    pub reset_after: u64,
    /// Identifies allowed to run concurrently.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

const fn default_max_concurrency() -> u32 {
    1
}

impl SessionStartLimit {
    /// Budget for the identify gate.
    #[must_use]
    pub const fn budget(&self) -> IdentifyBudget {
        IdentifyBudget {
            total: self.total,
            remaining: self.remaining,
            reset_after: Duration::from_millis(self.reset_after),
        }
    }
}

/// Fetch gateway connection data for a bot token.
///
/// # Errors
///
/// Returns an error if the request fails, the API answers with a non-success
/// status, or the response reports zero shards.
pub async fn fetch_gateway(api_base: &str, token: &str) -> Result<GatewayInfo> {
    let url = format!("{}/gateway/bot", api_base.trim_end_matches('/'));
    debug!(url = %url, "fetching gateway bootstrap data");

    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("Heimdall/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let resp = client
        .get(&url)
        .header(reqwest::header::AUTHORIZATION, format!("Bot {token}"))
        .send()
        .await?;

    let status = resp.status();
    let text = resp.text().await?;
    if !status.is_success() {
        return Err(ShardError::Bootstrap(format!("HTTP {status}: {text}")));
    }

    let info: GatewayInfo = serde_json::from_str(&text)
        .map_err(|e| ShardError::Bootstrap(format!("invalid response: {e}")))?;
    if info.shards == 0 {
        return Err(ShardError::Bootstrap("API reported zero shards".to_string()));
    }

    info!(
        gateway = %info.url,
        shards = info.shards,
        remaining = info.session_start_limit.remaining,
        reset_after_ms = info.session_start_limit.reset_after,
        "bootstrap complete"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gateway_info() {
        let info: GatewayInfo = serde_json::from_str(
            r#"{
                "url": "wss://gateway.discord.gg",
                "shards": 2,
                "session_start_limit": {"total": 1000, "remaining": 1, "reset_after": 5000}
            }"#,
        )
        .unwrap();

        assert_eq!(info.shards, 2);
        assert_eq!(info.session_start_limit.max_concurrency, 1);
        assert_eq!(
            info.session_start_limit.budget(),
            IdentifyBudget {
                total: 1000,
                remaining: 1,
                reset_after: Duration::from_millis(5000),
            }
        );
    }
}
