use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub mod errors;
pub mod events;

pub use errors::SignallingError;
pub use events::{EventKind, EventListeners, Listener, ListenerId, SignallingEvent};

/// シグナリングメッセージの種別
///
/// サーバーが独自の種別を送ってくることがあるため、未知の文字列は
/// `Other` としてそのまま保持する。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SignalType {
    // 接続関連
    Connect,
    Disconnect,
    Heartbeat,
    // WebRTC 関連
    Offer,
    Answer,
    IceCandidate,
    // ルーム管理
    JoinRoom,
    LeaveRoom,
    RoomUsers,
    // メッセージ伝達
    Message,
    Broadcast,
    // エラー
    Error,
    // 上位層が扱う未知の種別
    Other(String),
}

impl SignalType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Heartbeat => "heartbeat",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
            Self::JoinRoom => "join-room",
            Self::LeaveRoom => "leave-room",
            Self::RoomUsers => "room-users",
            Self::Message => "message",
            Self::Broadcast => "broadcast",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for SignalType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "connect" => Self::Connect,
            "disconnect" => Self::Disconnect,
            "heartbeat" => Self::Heartbeat,
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "ice-candidate" => Self::IceCandidate,
            "join-room" => Self::JoinRoom,
            "leave-room" => Self::LeaveRoom,
            "room-users" => Self::RoomUsers,
            "message" => Self::Message,
            "broadcast" => Self::Broadcast,
            "error" => Self::Error,
            _ => Self::Other(s),
        }
    }
}

impl From<SignalType> for String {
    fn from(t: SignalType) -> Self {
        t.as_str().to_owned()
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ワイヤ上を流れるシグナリングメッセージ
///
/// `id` / `timestamp` / `from` は送信側クライアントが付与する。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: SignalType,
    /// epoch ミリ秒（送信側が付与）
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// 呼び出し側が組み立てる送信メッセージ
///
/// `id` / `timestamp` / `from` を持たない形にすることで、これらを
/// 呼び出し側が指定できないことを型で保証する。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: SignalType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl OutboundMessage {
    pub fn new(kind: SignalType) -> Self {
        Self {
            kind,
            to: None,
            room: None,
            data: None,
        }
    }
}

/// ユーザー情報（join-room メッセージのペイロード）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub status: UserStatus,
}

/// ユーザーの在席状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Online,
    Offline,
    Busy,
}

/// クライアントの接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_interval_ms() -> u64 {
    3_000
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

/// シグナリング接続の設定
///
/// `connect` に渡された後は不変。クライアントは直近の `connect` で
/// 使われた設定を保持し、再接続にもそれを使う。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignallingConfig {
    pub url: String,
    /// Sec-WebSocket-Protocol として送るサブプロトコル
    #[serde(default)]
    pub protocols: Vec<String>,
    /// 接続タイムアウト（ミリ秒）
    #[serde(default = "default_timeout_ms")]
    pub timeout: u64,
    /// 再接続の待ち時間（ミリ秒）
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval: u64,
    /// 自動再接続の最大試行回数
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// ハートビート送信間隔（ミリ秒）
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval: u64,
}

impl SignallingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            timeout: default_timeout_ms(),
            reconnect_interval: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval: default_heartbeat_interval_ms(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval)
    }

    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }
}
