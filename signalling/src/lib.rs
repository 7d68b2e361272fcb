// SignallingClient: 再接続・ハートビート・ルーム追跡を持つ
// シグナリング接続のクライアント実装
pub mod client;
pub mod connection;

pub use client::SignallingClient;
pub use connection::{Connection, ConnectionEvent, Connector, WsConnector};
