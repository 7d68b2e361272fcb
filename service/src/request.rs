use core_types::{ConnectionState, OutboundMessage, SignallingConfig, UserInfo};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 外部呼び出し側から届くリクエスト
///
/// `type` の文字列は旧 IPC チャンネル名のサフィックスと同じ。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Request {
    CreateClient {
        client_id: String,
    },
    Connect {
        client_id: String,
        config: SignallingConfig,
    },
    Disconnect {
        client_id: String,
    },
    SendMessage {
        client_id: String,
        message: OutboundMessage,
    },
    JoinRoom {
        client_id: String,
        room_id: String,
        user_info: UserInfo,
    },
    LeaveRoom {
        client_id: String,
        room_id: String,
    },
    GetConnectionState {
        client_id: String,
    },
    RemoveClient {
        client_id: String,
    },
    GetAllClients,
}

/// 一様なレスポンス形式
///
/// 失敗はすべて `{success: false, error}` に畳まれ、呼び出し側へ
/// 例外が伝播することはない。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ConnectionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ids: Option<Vec<String>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            client_id: None,
            state: None,
            client_ids: None,
        }
    }

    pub fn err(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            client_id: None,
            state: None,
            client_ids: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_state(mut self, state: ConnectionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_client_ids(mut self, client_ids: Vec<String>) -> Self {
        self.client_ids = Some(client_ids);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::SignalType;

    #[test]
    fn request_tags_match_ipc_channel_names() {
        let request: Request =
            serde_json::from_str(r#"{"type":"create-client","clientId":"c1"}"#).unwrap();
        assert!(matches!(request, Request::CreateClient { client_id } if client_id == "c1"));

        let request: Request = serde_json::from_str(
            r#"{"type":"connect","clientId":"c1","config":{"url":"ws://localhost:9000"}}"#,
        )
        .unwrap();
        match request {
            Request::Connect { client_id, config } => {
                assert_eq!(client_id, "c1");
                assert_eq!(config.url, "ws://localhost:9000");
                assert_eq!(config.timeout, 10_000);
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let request: Request = serde_json::from_str(
            r#"{"type":"send-message","clientId":"c1","message":{"type":"message","to":"x","data":{"text":"hi"}}}"#,
        )
        .unwrap();
        match request {
            Request::SendMessage { message, .. } => {
                assert_eq!(message.kind, SignalType::Message);
                assert_eq!(message.to.as_deref(), Some("x"));
            }
            other => panic!("unexpected request: {other:?}"),
        }

        let request: Request = serde_json::from_str(r#"{"type":"get-all-clients"}"#).unwrap();
        assert!(matches!(request, Request::GetAllClients));
    }

    #[test]
    fn response_omits_absent_fields() {
        let json = serde_json::to_value(Response::ok()).unwrap();
        assert_eq!(json, serde_json::json!({ "success": true }));

        let json = serde_json::to_value(Response::err("boom")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": false, "error": "boom" })
        );

        let json =
            serde_json::to_value(Response::ok().with_client_ids(vec!["a".to_string()])).unwrap();
        assert_eq!(json["clientIds"], serde_json::json!(["a"]));
    }
}
