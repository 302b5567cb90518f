use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use salvo::affix_state;
use salvo::prelude::*;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bridge::TransactionProcessor;
use crate::config::Config;
use crate::db::DatabaseManager;

mod health;
mod transactions;

use health::{get_status, health_check};
use transactions::{put_transaction, query_not_found};

/// Shared by every handler through the depot.
pub struct WebState {
    pub processor: Arc<TransactionProcessor>,
    pub db_manager: DatabaseManager,
    pub homeserver_token: SecretString,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

pub(crate) fn web_state(depot: &Depot) -> Option<&Arc<WebState>> {
    depot.obtain::<Arc<WebState>>().ok()
}

pub struct WebServer {
    config: Arc<Config>,
    state: Arc<WebState>,
}

impl WebServer {
    pub fn new(
        config: Arc<Config>,
        processor: Arc<TransactionProcessor>,
        db_manager: DatabaseManager,
        shutdown: CancellationToken,
    ) -> Self {
        let state = Arc::new(WebState {
            processor,
            db_manager,
            homeserver_token: SecretString::from(config.registration.homeserver_token.clone()),
            shutdown,
            started_at: Instant::now(),
        });
        Self { config, state }
    }

    /// Serves until the shutdown token fires.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!(
            "{}:{}",
            self.config.bridge.bind_address, self.config.bridge.port
        );
        info!("starting web server on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        let server = Server::new(acceptor);
        let handle = server.handle();
        let shutdown = self.state.shutdown.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            handle.stop_graceful(None);
        });

        server.serve(root_router(self.state.clone())).await;
        info!("web server stopped");
        Ok(())
    }
}

fn appservice_routes(router: Router) -> Router {
    router
        .push(Router::with_path("transactions/{txn_id}").put(put_transaction))
        .push(Router::with_path("users/{user_id}").get(query_not_found))
        .push(Router::with_path("rooms/{room_alias}").get(query_not_found))
}

/// Application service API under both the versioned and the legacy unprefixed paths.
pub fn root_router(state: Arc<WebState>) -> Router {
    Router::new()
        .hoop(affix_state::inject(state))
        .push(Router::with_path("health").get(health_check))
        .push(Router::with_path("status").get(get_status))
        .push(appservice_routes(Router::with_path("_matrix/app/v1")))
        .push(appservice_routes(Router::new()))
}
