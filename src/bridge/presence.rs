use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BotConfig;
use crate::matrix::MatrixClient;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Keeps the bot marked online until `shutdown` fires, then marks it offline.
pub async fn run_presence_loop(client: MatrixClient, bot: BotConfig, shutdown: CancellationToken) {
    if bot.disable_presence {
        debug!("presence heartbeat disabled");
        return;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(bot.presence_interval.max(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = client.set_presence(ONLINE).await {
                    warn!("failed to refresh presence: {}", e);
                }
            }
        }
    }

    match client.set_presence(OFFLINE).await {
        Ok(()) => info!("presence set to offline"),
        Err(e) => warn!("failed to set presence offline: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use reqwest::Method;

    use super::*;
    use crate::matrix::mock::MockTransport;

    const PRESENCE: &str = "/_matrix/client/v3/presence/%40imposter%3Ahs/status";

    #[tokio::test]
    async fn heartbeat_ends_with_offline() {
        let mock = Arc::new(MockTransport::new());
        let client = MatrixClient::new(mock.clone(), "@imposter:hs");
        let shutdown = CancellationToken::new();
        let bot = BotConfig {
            presence_interval: 1,
            ..BotConfig::default()
        };

        let handle = tokio::spawn(run_presence_loop(client, bot, shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();

        let updates = mock.requests_to(Method::PUT, PRESENCE);
        assert!(updates.len() >= 2);
        assert_eq!(updates[0].body_str("presence"), Some("online"));
        assert_eq!(updates.last().unwrap().body_str("presence"), Some("offline"));
    }

    #[tokio::test]
    async fn disabled_presence_sends_nothing() {
        let mock = Arc::new(MockTransport::new());
        let client = MatrixClient::new(mock.clone(), "@imposter:hs");
        let bot = BotConfig {
            disable_presence: true,
            ..BotConfig::default()
        };

        run_presence_loop(client, bot, CancellationToken::new()).await;
        assert!(mock.requests().is_empty());
    }
}
