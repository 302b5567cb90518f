use salvo::prelude::*;
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tracing::{debug, error, warn};

use crate::web::web_state;

fn render_error(res: &mut Response, status: StatusCode, errcode: &str, error: &str) {
    res.status_code(status);
    res.render(Json(json!({ "errcode": errcode, "error": error })));
}

/// The home server token, from the query string or a bearer header.
fn request_token(req: &Request) -> Option<String> {
    req.query::<String>("access_token").or_else(|| {
        req.header::<String>("authorization")
            .and_then(|value| value.strip_prefix("Bearer ").map(ToOwned::to_owned))
    })
}

#[handler]
pub async fn put_transaction(req: &mut Request, depot: &mut Depot, res: &mut Response) {
    let Some(state) = web_state(depot).cloned() else {
        error!("web state missing from depot");
        res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
        res.render(Json(json!({})));
        return;
    };

    match request_token(req) {
        None => {
            render_error(res, StatusCode::UNAUTHORIZED, "M_UNAUTHORIZED", "missing token");
            return;
        }
        Some(token) if token != state.homeserver_token.expose_secret() => {
            warn!("rejected transaction with a bad token");
            render_error(res, StatusCode::FORBIDDEN, "M_FORBIDDEN", "bad token");
            return;
        }
        Some(_) => {}
    }

    let Some(txn_id) = req.param::<String>("txn_id") else {
        render_error(res, StatusCode::BAD_REQUEST, "M_INVALID_PARAM", "missing transaction id");
        return;
    };

    let body = match req.payload().await {
        Ok(bytes) => serde_json::from_slice::<Value>(bytes),
        Err(e) => {
            render_error(res, StatusCode::BAD_REQUEST, "M_NOT_JSON", &e.to_string());
            return;
        }
    };
    let body = match body {
        Ok(body) => body,
        Err(e) => {
            debug!(txn_id = %txn_id, "transaction body is not json: {}", e);
            render_error(res, StatusCode::BAD_REQUEST, "M_NOT_JSON", "body is not json");
            return;
        }
    };
    let events = body
        .get("events")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    match state.processor.process(&txn_id, events).await {
        Ok(true) => res.render(Json(json!({}))),
        Ok(false) => {
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            res.render(Json(json!({})));
        }
        Err(e) => {
            error!(txn_id = %txn_id, "store unavailable, shutting down: {}", e);
            state.shutdown.cancel();
            res.status_code(StatusCode::INTERNAL_SERVER_ERROR);
            res.render(Json(json!({})));
        }
    }
}

/// The bot provisions no virtual users or room aliases.
#[handler]
pub async fn query_not_found(res: &mut Response) {
    res.status_code(StatusCode::NOT_FOUND);
    res.render(Json(json!({})));
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use reqwest::Method;
    use salvo::test::{ResponseExt, TestClient};
    use secrecy::SecretString;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::bridge::{BridgeCore, TransactionProcessor};
    use crate::config::BotConfig;
    use crate::db::DatabaseManager;
    use crate::matrix::MatrixClient;
    use crate::matrix::mock::{MockTransport, room_path};
    use crate::web::{WebState, root_router};

    const BASE: &str = "http://127.0.0.1:9000";

    async fn service() -> (Service, Arc<MockTransport>, DatabaseManager) {
        let mock = Arc::new(MockTransport::new());
        let db = DatabaseManager::new_in_memory().unwrap();
        db.migrate().await.unwrap();
        let client = MatrixClient::new(mock.clone(), "@imposter:hs");
        let core = Arc::new(BridgeCore::new(client, &db, BotConfig::default()));
        let state = Arc::new(WebState {
            processor: Arc::new(TransactionProcessor::new(core, db.clone())),
            db_manager: db.clone(),
            homeserver_token: SecretString::from("hs-secret".to_string()),
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        });
        (Service::new(root_router(state)), mock, db)
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let (service, _, _) = service().await;
        let mut res = TestClient::put(format!("{BASE}/_matrix/app/v1/transactions/t1"))
            .json(&json!({"events": []}))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::UNAUTHORIZED));
        let body: Value = res.take_json().await.unwrap();
        assert_eq!(body["errcode"], "M_UNAUTHORIZED");
    }

    #[tokio::test]
    async fn wrong_token_is_forbidden() {
        let (service, _, _) = service().await;
        let res = TestClient::put(format!("{BASE}/transactions/t1?access_token=nope"))
            .json(&json!({"events": []}))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn bearer_header_is_accepted() {
        let (service, _, _) = service().await;
        let mut res = TestClient::put(format!("{BASE}/_matrix/app/v1/transactions/t1"))
            .add_header("authorization", "Bearer hs-secret", true)
            .json(&json!({"events": []}))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::OK));
        assert_eq!(res.take_string().await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn invalid_json_is_rejected() {
        let (service, _, _) = service().await;
        let mut res = TestClient::put(format!("{BASE}/transactions/t1?access_token=hs-secret"))
            .raw_json("{not json")
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::BAD_REQUEST));
        let body: Value = res.take_json().await.unwrap();
        assert_eq!(body["errcode"], "M_NOT_JSON");
    }

    #[tokio::test]
    async fn transaction_events_are_processed_once() {
        let (service, mock, db) = service().await;
        db.room_store()
            .create_control_room("@alice:hs", "!ctl:hs", false)
            .await
            .unwrap();
        let body = json!({"events": [{
            "event_id": "$1",
            "type": "m.room.message",
            "sender": "@alice:hs",
            "room_id": "!ctl:hs",
            "content": {"msgtype": "m.text", "body": "help"},
        }]});

        for _ in 0..2 {
            let res = TestClient::put(format!(
                "{BASE}/_matrix/app/v1/transactions/txn9?access_token=hs-secret"
            ))
            .json(&body)
            .send(&service)
            .await;
            assert_eq!(res.status_code, Some(StatusCode::OK));
        }
        assert_eq!(mock.sent_to("!ctl:hs").len(), 1);
        assert_eq!(
            mock.requests_to(Method::POST, &room_path("!ctl:hs", "receipt/m.read/"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn failed_events_answer_500() {
        let (service, mock, db) = service().await;
        db.room_store()
            .create_control_room("@alice:hs", "!ctl:hs", false)
            .await
            .unwrap();
        mock.on(
            Method::PUT,
            &room_path("!ctl:hs", "send/m.room.message/*"),
            500,
            json!({"errcode": "M_UNKNOWN"}),
        );
        let res = TestClient::put(format!("{BASE}/transactions/t2?access_token=hs-secret"))
            .json(&json!({"events": [{
                "event_id": "$1",
                "type": "m.room.message",
                "sender": "@alice:hs",
                "room_id": "!ctl:hs",
                "content": {"body": "help"},
            }]}))
            .send(&service)
            .await;
        assert_eq!(res.status_code, Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn user_and_room_queries_are_not_found() {
        let (service, _, _) = service().await;
        for path in ["_matrix/app/v1/users/%40ghost%3Ahs", "rooms/%23alias%3Ahs"] {
            let res = TestClient::get(format!("{BASE}/{path}?access_token=hs-secret"))
                .send(&service)
                .await;
            assert_eq!(res.status_code, Some(StatusCode::NOT_FOUND));
        }
    }
}
