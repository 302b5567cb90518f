use serde_json::Value;
use thiserror::Error;

pub mod client;
pub mod event;
#[cfg(test)]
pub mod mock;
pub mod transport;

pub use self::client::{MatrixClient, Profile};
pub use self::event::MatrixEvent;
pub use self::transport::{ApiResponse, HomeserverTransport, ReqwestTransport};

pub(crate) mod urlencoding {
    /// Percent-encodes one path segment. Form encoding writes a space as `+`
    /// and a literal `+` as `%2B`, so every `+` left over is a space.
    pub fn encode(s: &str) -> String {
        url::form_urlencoded::byte_serialize(s.as_bytes())
            .collect::<String>()
            .replace('+', "%20")
    }
}

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("homeserver returned {status} {errcode}: {error}")]
    Http {
        status: u16,
        errcode: String,
        error: String,
    },

    #[error("malformed homeserver response: {0}")]
    Malformed(String),

    #[error("request aborted by shutdown")]
    Shutdown,
}

impl MatrixError {
    pub fn status(&self) -> Option<u16> {
        match self {
            MatrixError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn has_status(&self, statuses: &[u16]) -> bool {
        self.status().is_some_and(|status| statuses.contains(&status))
    }

    /// The home server rejected the access token the request was made with.
    pub fn is_unknown_token(&self) -> bool {
        matches!(self, MatrixError::Http { errcode, .. } if errcode == "M_UNKNOWN_TOKEN")
    }

    pub(crate) fn from_response(status: u16, body: &Value) -> Self {
        MatrixError::Http {
            status,
            errcode: body
                .get("errcode")
                .and_then(Value::as_str)
                .unwrap_or("M_UNKNOWN")
                .to_string(),
            error: body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn errors_expose_status_and_errcode() {
        let err = MatrixError::from_response(
            401,
            &json!({"errcode": "M_UNKNOWN_TOKEN", "error": "Invalid macaroon passed."}),
        );
        assert_eq!(err.status(), Some(401));
        assert!(err.is_unknown_token());
        assert!(err.has_status(&[401, 403]));

        let err = MatrixError::from_response(500, &json!({}));
        assert!(!err.is_unknown_token());
        assert!(!err.has_status(&[403, 404]));
        assert_eq!(MatrixError::Shutdown.status(), None);
    }

    #[test]
    fn encode_escapes_matrix_sigils() {
        assert_eq!(
            urlencoding::encode("!room:example.org"),
            "%21room%3Aexample.org"
        );
    }

    #[test]
    fn encode_writes_spaces_for_paths() {
        assert_eq!(urlencoding::encode("a b+c"), "a%20b%2Bc");
        assert_eq!(urlencoding::encode("m.room.name"), "m.room.name");
    }
}
