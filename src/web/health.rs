use salvo::prelude::*;
use serde_json::json;

use crate::web::web_state;

#[handler]
pub async fn health_check(res: &mut Response) {
    res.render("OK");
}

#[handler]
pub async fn get_status(depot: &mut Depot, res: &mut Response) {
    let Some(state) = web_state(depot).cloned() else {
        res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
        return;
    };
    let uptime_seconds = state.started_at.elapsed().as_secs();
    let database_ok = state.db_manager.is_healthy().await;

    let status = json!({
        "status": if database_ok { "running" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime_seconds,
        "database": database_ok,
    });

    res.render(Json(status));
}
