use async_trait::async_trait;
use core_types::{SignallingConfig, SignallingError};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 生のソケットから上がるイベント
#[derive(Debug)]
pub enum ConnectionEvent {
    /// テキストフレームを受信した
    Message(String),
    /// ソケットが閉じた（以降イベントは来ない）
    Closed,
    /// トランスポートレベルのエラー
    Error(String),
}

/// 1 本のリアルタイムソケットを包む送受信プリミティブ
///
/// ルームやメッセージ種別のことは知らない。drop すると背後の I/O
/// タスクが Close フレームを送ってソケットを閉じる。
pub struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl Connection {
    pub fn from_parts(
        outbound: mpsc::UnboundedSender<String>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> Self {
        Self { outbound, events }
    }

    pub fn send(&self, text: String) -> Result<(), SignallingError> {
        self.outbound
            .send(text)
            .map_err(|_| SignallingError::Transport("connection is closed".to_string()))
    }

    pub async fn next_event(&mut self) -> Option<ConnectionEvent> {
        self.events.recv().await
    }
}

/// ソケットを開く側の差し替え点
///
/// 本番は [`WsConnector`]、テストはモックを差す。接続タイムアウトは
/// 呼び出し側（クライアント）が被せる。
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &SignallingConfig) -> Result<Connection, SignallingError>;
}

/// tokio-tungstenite による WebSocket 実装
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, config: &SignallingConfig) -> Result<Connection, SignallingError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SignallingError::Transport(format!("invalid url: {e}")))?;

        if !config.protocols.is_empty() {
            let value = HeaderValue::from_str(&config.protocols.join(", "))
                .map_err(|e| SignallingError::Transport(format!("invalid protocols: {e}")))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }

        debug!(url = %config.url, "connecting to signalling endpoint");
        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| SignallingError::Transport(e.to_string()))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(io_task(ws_stream, outbound_rx, event_tx));

        Ok(Connection::from_parts(outbound_tx, event_rx))
    }
}

/// ソケットの読み書きを 1 タスクに寄せる
///
/// 送信チャンネルが閉じたら Close を送って終了する。受信側のエラーは
/// Error イベントの後に必ず Closed を流す。
async fn io_task(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        let _ = event_tx.send(ConnectionEvent::Error(e.to_string()));
                        let _ = event_tx.send(ConnectionEvent::Closed);
                        break;
                    }
                }
                None => {
                    // Connection が破棄された
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let _ = event_tx.send(ConnectionEvent::Message(text.to_string()));
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    let _ = event_tx.send(ConnectionEvent::Closed);
                    break;
                }
                Some(Ok(_)) => {
                    // Ping/Pong/バイナリはこの層では扱わない
                    debug!("ignoring non-text frame");
                }
                Some(Err(e)) => {
                    let _ = event_tx.send(ConnectionEvent::Error(e.to_string()));
                    let _ = event_tx.send(ConnectionEvent::Closed);
                    break;
                }
            },
        }
    }

    debug!("connection io task finished");
}
