//! テスト用のモックコネクタ
//!
//! 実ソケットの代わりに、テスト側がフレーム注入・切断・送信内容の観測を
//! 行えるチャンネルの束を返す。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use core_types::{SignallingConfig, SignallingError};
use signalling::{Connection, ConnectionEvent, Connector};
use tokio::sync::mpsc;
use tracing::debug;

/// connect 1 回分の挙動
#[derive(Debug, Clone)]
pub enum ConnectBehavior {
    /// 接続を受け入れてセッションを払い出す
    Open,
    /// トランスポートエラーで失敗する
    Fail(String),
    /// 永遠に open しない（タイムアウト試験用）
    Hang,
}

/// 確立した接続 1 本をテスト側から操作するための束
pub struct MockSession {
    /// クライアントが送信したワイヤテキスト
    pub outbound: mpsc::UnboundedReceiver<String>,
    /// クライアントへ流すイベント。drop すると切断扱いになる
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl MockSession {
    pub fn inject_message(&self, text: impl Into<String>) {
        let _ = self.events.send(ConnectionEvent::Message(text.into()));
    }

    pub fn close(&self) {
        let _ = self.events.send(ConnectionEvent::Closed);
    }
}

/// スクリプト可能な [`Connector`] 実装
///
/// `push` で次回以降の connect の挙動を積む。スクリプトが空の間は
/// `Open` として振る舞う。
pub struct MockConnector {
    script: Mutex<VecDeque<ConnectBehavior>>,
    attempts: AtomicU32,
    sessions_tx: mpsc::UnboundedSender<MockSession>,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockSession>) {
        let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicU32::new(0),
            sessions_tx,
        });
        (connector, sessions_rx)
    }

    /// 次の connect の挙動を積む
    pub fn push(&self, behavior: ConnectBehavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    pub fn push_n(&self, behavior: ConnectBehavior, n: usize) {
        for _ in 0..n {
            self.push(behavior.clone());
        }
    }

    /// これまでの connect 試行回数
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, config: &SignallingConfig) -> Result<Connection, SignallingError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ConnectBehavior::Open);
        debug!(url = %config.url, ?behavior, "mock connect");

        match behavior {
            ConnectBehavior::Open => {
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let (event_tx, event_rx) = mpsc::unbounded_channel();
                let session = MockSession {
                    outbound: outbound_rx,
                    events: event_tx,
                };
                let _ = self.sessions_tx.send(session);
                Ok(Connection::from_parts(outbound_tx, event_rx))
            }
            ConnectBehavior::Fail(message) => Err(SignallingError::Transport(message)),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}
