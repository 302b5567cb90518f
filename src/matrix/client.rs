use std::sync::Arc;

use reqwest::Method;
use serde_json::{Value, json};
use tracing::debug;

use super::urlencoding::encode;
use super::{HomeserverTransport, MatrixError};

const CLIENT_API: &str = "/_matrix/client/v3";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub displayname: Option<String>,
    pub avatar_url: Option<String>,
}

/// Typed client-server API calls on top of a [`HomeserverTransport`].
///
/// Calls made on behalf of a mimic user take that user's access token;
/// everything else runs as the bot through the appservice token.
#[derive(Clone)]
pub struct MatrixClient {
    transport: Arc<dyn HomeserverTransport>,
    bot_user_id: String,
}

impl MatrixClient {
    pub fn new(transport: Arc<dyn HomeserverTransport>, bot_user_id: impl Into<String>) -> Self {
        Self {
            transport,
            bot_user_id: bot_user_id.into(),
        }
    }

    pub fn bot_user_id(&self) -> &str {
        &self.bot_user_id
    }

    async fn call(
        &self,
        method: Method,
        path: String,
        body: Option<Value>,
        access_token: Option<&str>,
    ) -> Result<Value, MatrixError> {
        self.transport
            .request(method, &path, body.as_ref(), access_token)
            .await?
            .into_result()
    }

    /// Returns the user id the access token belongs to.
    pub async fn whoami(&self, access_token: &str) -> Result<String, MatrixError> {
        let body = self
            .call(
                Method::GET,
                format!("{CLIENT_API}/account/whoami"),
                None,
                Some(access_token),
            )
            .await?;
        string_field(&body, "user_id")
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Profile, MatrixError> {
        let body = self
            .call(
                Method::GET,
                format!("{CLIENT_API}/profile/{}", encode(user_id)),
                None,
                None,
            )
            .await?;
        Ok(Profile {
            displayname: body
                .get("displayname")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
            avatar_url: body
                .get("avatar_url")
                .and_then(Value::as_str)
                .map(ToOwned::to_owned),
        })
    }

    pub async fn set_displayname(&self, user_id: &str, name: &str) -> Result<(), MatrixError> {
        self.call(
            Method::PUT,
            format!("{CLIENT_API}/profile/{}/displayname", encode(user_id)),
            Some(json!({ "displayname": name })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn set_avatar_url(&self, user_id: &str, avatar_url: &str) -> Result<(), MatrixError> {
        self.call(
            Method::PUT,
            format!("{CLIENT_API}/profile/{}/avatar_url", encode(user_id)),
            Some(json!({ "avatar_url": avatar_url })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn register_appservice_user(&self, localpart: &str) -> Result<(), MatrixError> {
        self.call(
            Method::POST,
            format!("{CLIENT_API}/register"),
            Some(json!({
                "type": "m.login.application_service",
                "username": localpart,
            })),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn set_presence(&self, presence: &str) -> Result<(), MatrixError> {
        self.call(
            Method::PUT,
            format!("{CLIENT_API}/presence/{}/status", encode(&self.bot_user_id)),
            Some(json!({ "presence": presence })),
            None,
        )
        .await
        .map(|_| ())
    }

    /// Creates a private, non-federated direct chat with `invitee` and returns its id.
    pub async fn create_direct_room(&self, invitee: &str) -> Result<String, MatrixError> {
        let body = self
            .call(
                Method::POST,
                format!("{CLIENT_API}/createRoom"),
                Some(json!({
                    "preset": "private_chat",
                    "is_direct": true,
                    "invite": [invitee],
                    "creation_content": { "m.federate": false },
                })),
                None,
            )
            .await?;
        let room_id = string_field(&body, "room_id")?;
        debug!(room_id = %room_id, invitee = %invitee, "created direct room");
        Ok(room_id)
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), MatrixError> {
        self.call(
            Method::POST,
            format!("{CLIENT_API}/rooms/{}/join", encode(room_id)),
            Some(json!({})),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), MatrixError> {
        self.call(
            Method::POST,
            format!("{CLIENT_API}/rooms/{}/leave", encode(room_id)),
            Some(json!({})),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn set_room_name(&self, room_id: &str, name: &str) -> Result<(), MatrixError> {
        self.call(
            Method::PUT,
            format!("{CLIENT_API}/rooms/{}/state/m.room.name", encode(room_id)),
            Some(json!({ "name": name })),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn get_state_field(
        &self,
        room_id: &str,
        event_type: &str,
        field: &str,
    ) -> Result<Option<String>, MatrixError> {
        match self
            .call(
                Method::GET,
                format!(
                    "{CLIENT_API}/rooms/{}/state/{}",
                    encode(room_id),
                    encode(event_type)
                ),
                None,
                None,
            )
            .await
        {
            Ok(body) => Ok(body
                .get(field)
                .and_then(Value::as_str)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)),
            Err(e) if e.has_status(&[403, 404]) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Human-readable room label: its name, else its canonical alias, else the id.
    pub async fn room_display_name(&self, room_id: &str) -> Result<String, MatrixError> {
        if let Some(name) = self.get_state_field(room_id, "m.room.name", "name").await? {
            return Ok(name);
        }
        if let Some(alias) = self
            .get_state_field(room_id, "m.room.canonical_alias", "alias")
            .await?
        {
            return Ok(alias);
        }
        Ok(room_id.to_string())
    }

    pub async fn joined_members(&self, room_id: &str) -> Result<Vec<String>, MatrixError> {
        let body = self
            .call(
                Method::GET,
                format!("{CLIENT_API}/rooms/{}/joined_members", encode(room_id)),
                None,
                None,
            )
            .await?;
        let joined = body
            .get("joined")
            .and_then(Value::as_object)
            .ok_or_else(|| MatrixError::Malformed("joined_members without `joined`".into()))?;
        let mut members: Vec<String> = joined.keys().cloned().collect();
        members.sort();
        Ok(members)
    }

    pub async fn joined_rooms(&self) -> Result<Vec<String>, MatrixError> {
        let body = self
            .call(Method::GET, format!("{CLIENT_API}/joined_rooms"), None, None)
            .await?;
        let rooms = body
            .get("joined_rooms")
            .and_then(Value::as_array)
            .ok_or_else(|| MatrixError::Malformed("joined_rooms without `joined_rooms`".into()))?;
        Ok(rooms
            .iter()
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect())
    }

    /// Looks up an alias in the room directory; unknown aliases resolve to `None`.
    pub async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, MatrixError> {
        match self
            .call(
                Method::GET,
                format!("{CLIENT_API}/directory/room/{}", encode(alias)),
                None,
                None,
            )
            .await
        {
            Ok(body) => string_field(&body, "room_id").map(Some),
            Err(e) if e.has_status(&[400, 404]) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Sends an `m.room.message`; `txn_id` makes retries of the same send collapse server-side.
    pub async fn send_message(
        &self,
        room_id: &str,
        content: &Value,
        txn_id: &str,
        access_token: Option<&str>,
    ) -> Result<String, MatrixError> {
        let body = self
            .call(
                Method::PUT,
                format!(
                    "{CLIENT_API}/rooms/{}/send/m.room.message/{}",
                    encode(room_id),
                    encode(txn_id)
                ),
                Some(content.clone()),
                access_token,
            )
            .await?;
        string_field(&body, "event_id")
    }

    pub async fn redact(
        &self,
        room_id: &str,
        event_id: &str,
        reason: &str,
        txn_id: &str,
        access_token: Option<&str>,
    ) -> Result<(), MatrixError> {
        self.call(
            Method::PUT,
            format!(
                "{CLIENT_API}/rooms/{}/redact/{}/{}",
                encode(room_id),
                encode(event_id),
                encode(txn_id)
            ),
            Some(json!({ "reason": reason })),
            access_token,
        )
        .await
        .map(|_| ())
    }

    pub async fn send_read_receipt(&self, room_id: &str, event_id: &str) -> Result<(), MatrixError> {
        self.call(
            Method::POST,
            format!(
                "{CLIENT_API}/rooms/{}/receipt/m.read/{}",
                encode(room_id),
                encode(event_id)
            ),
            Some(json!({})),
            None,
        )
        .await
        .map(|_| ())
    }
}

fn string_field(body: &Value, field: &str) -> Result<String, MatrixError> {
    body.get(field)
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| MatrixError::Malformed(format!("response is missing `{field}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::mock::MockTransport;

    fn client(mock: &Arc<MockTransport>) -> MatrixClient {
        MatrixClient::new(mock.clone(), "@imposter:hs")
    }

    #[tokio::test]
    async fn room_display_name_falls_back_to_alias_then_id() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            Method::GET,
            "/_matrix/client/v3/rooms/%21named%3Ahs/state/m.room.name",
            200,
            json!({"name": "Lounge"}),
        );
        mock.on(
            Method::GET,
            "/_matrix/client/v3/rooms/%21aliased%3Ahs/state/m.room.name",
            404,
            json!({"errcode": "M_NOT_FOUND"}),
        );
        mock.on(
            Method::GET,
            "/_matrix/client/v3/rooms/%21aliased%3Ahs/state/m.room.canonical_alias",
            200,
            json!({"alias": "#lounge:hs"}),
        );
        mock.on(
            Method::GET,
            "/_matrix/client/v3/rooms/%21bare%3Ahs/state/*",
            404,
            json!({"errcode": "M_NOT_FOUND"}),
        );

        let client = client(&mock);
        assert_eq!(client.room_display_name("!named:hs").await.unwrap(), "Lounge");
        assert_eq!(
            client.room_display_name("!aliased:hs").await.unwrap(),
            "#lounge:hs"
        );
        assert_eq!(client.room_display_name("!bare:hs").await.unwrap(), "!bare:hs");
    }

    #[tokio::test]
    async fn send_uses_given_token_and_txn_id() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            Method::PUT,
            "/_matrix/client/v3/rooms/%21room%3Ahs/send/m.room.message/t1.0.0",
            200,
            json!({"event_id": "$sent"}),
        );

        let event_id = client(&mock)
            .send_message("!room:hs", &json!({"body": "hi"}), "t1.0.0", Some("user-token"))
            .await
            .unwrap();
        assert_eq!(event_id, "$sent");

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].access_token.as_deref(), Some("user-token"));
    }

    #[tokio::test]
    async fn unknown_alias_resolves_to_none() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            Method::GET,
            "/_matrix/client/v3/directory/room/%23missing%3Ahs",
            404,
            json!({"errcode": "M_NOT_FOUND"}),
        );
        mock.on(
            Method::GET,
            "/_matrix/client/v3/directory/room/%23lounge%3Ahs",
            200,
            json!({"room_id": "!lounge:hs"}),
        );

        let client = client(&mock);
        assert_eq!(client.resolve_alias("#missing:hs").await.unwrap(), None);
        assert_eq!(
            client.resolve_alias("#lounge:hs").await.unwrap().as_deref(),
            Some("!lounge:hs")
        );
    }

    #[tokio::test]
    async fn whoami_propagates_auth_failures() {
        let mock = Arc::new(MockTransport::new());
        mock.on(
            Method::GET,
            "/_matrix/client/v3/account/whoami",
            401,
            json!({"errcode": "M_UNKNOWN_TOKEN"}),
        );
        let err = client(&mock).whoami("bad").await.unwrap_err();
        assert_eq!(err.status(), Some(401));
    }
}
