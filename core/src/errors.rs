use thiserror::Error;

/// シグナリング周りのエラー分類
///
/// クライアント内部の失敗はすべてこの型に正規化され、サービス境界で
/// `{success: false, error}` 形式に変換される。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignallingError {
    #[error("client '{0}' already exists")]
    DuplicateClient(String),

    #[error("client '{0}' does not exist")]
    ClientNotFound(String),

    #[error("connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected to signalling server")]
    NotConnected,

    #[error("reconnect attempts exhausted after {0} tries")]
    ReconnectExhausted(u32),

    #[error("failed to parse inbound message: {0}")]
    MessageParse(String),

    /// サーバーが error メッセージで通知してきた失敗
    #[error("server error: {0}")]
    Server(String),

    /// クライアントのタスクが既に終了している（削除済みなど）
    #[error("client is no longer running")]
    ClientGone,
}
