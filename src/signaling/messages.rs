use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages received from a client connection. Requests expect exactly one
/// response, sent back in arrival order; notifications expect none.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Request {
        method: String,
        #[serde(default)]
        data: Value,
    },
    Notification {
        method: String,
        #[serde(default)]
        data: Value,
    },
}

/// Messages sent to a client connection. Responses are correlated by the
/// implicit per-connection request order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Response {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Notification {
        method: String,
        data: Value,
    },
}

impl ServerMessage {
    pub fn response(data: Value) -> Self {
        ServerMessage::Response {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage::Response {
            ok: false,
            data: None,
            error: Some(reason.into()),
        }
    }

    pub fn notification(method: impl Into<String>, data: Value) -> Self {
        ServerMessage::Notification {
            method: method.into(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_envelope_shape() {
        let parsed: ClientMessage = serde_json::from_str(
            r#"{"type":"request","method":"join","data":{"peerName":"alice"}}"#,
        )
        .unwrap();
        match parsed {
            ClientMessage::Request { method, data } => {
                assert_eq!(method, "join");
                assert_eq!(data["peerName"], "alice");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn error_response_carries_reason() {
        let text = serde_json::to_string(&ServerMessage::error("no such peer")).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type":"response","ok":false,"error":"no such peer"}));
    }
}
