use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use core_types::{
    ConnectionState, EventKind, EventListeners, Listener, ListenerId, OutboundMessage,
    SignalMessage, SignalType, SignallingConfig, SignallingError, SignallingEvent, UserInfo,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, sleep, timeout, Instant, Interval, MissedTickBehavior, Sleep};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::connection::{Connection, ConnectionEvent, Connector};

enum ClientCommand {
    Connect {
        config: SignallingConfig,
        reply: oneshot::Sender<Result<(), SignallingError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Send {
        message: OutboundMessage,
        reply: oneshot::Sender<Result<(), SignallingError>>,
    },
    JoinRoom {
        room_id: String,
        user_info: UserInfo,
        reply: oneshot::Sender<Result<(), SignallingError>>,
    },
    LeaveRoom {
        room_id: String,
        reply: oneshot::Sender<Result<(), SignallingError>>,
    },
}

/// シグナリングクライアントのハンドル
///
/// 実体は [`spawn`](SignallingClient::spawn) が起動するアクタータスクで、
/// 全ての状態遷移はそのタスク上で逐次処理される。ハンドルは clone 可能。
#[derive(Clone)]
pub struct SignallingClient {
    client_id: String,
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    listeners: Arc<Mutex<EventListeners>>,
}

impl SignallingClient {
    pub fn spawn(client_id: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        let client_id = client_id.into();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let listeners = Arc::new(Mutex::new(EventListeners::new()));

        let actor = ClientActor {
            client_id: client_id.clone(),
            connector,
            command_rx,
            state_tx,
            listeners: listeners.clone(),
            state: ConnectionState::Disconnected,
            config: None,
            connection: None,
            reconnect_attempts: 0,
            heartbeat: None,
            reconnect_timer: None,
            current_room: None,
        };
        tokio::spawn(actor.run());

        Self {
            client_id,
            command_tx,
            state_rx,
            listeners,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// シグナリングサーバーへ接続する
    ///
    /// ソケットが open になった時点で解決する。タイムアウト・トランス
    /// ポートエラー時は失敗し、`Error` / `Disconnected` 状態からは再度
    /// 呼び直してよい。
    pub async fn connect(&self, config: SignallingConfig) -> Result<(), SignallingError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::Connect { config, reply })
            .map_err(|_| SignallingError::ClientGone)?;
        reply_rx.await.map_err(|_| SignallingError::ClientGone)?
    }

    /// 切断する。常に安全で冪等
    ///
    /// 保留中の再接続タイマーとハートビートを止め、ソケットを閉じる。
    pub async fn disconnect(&self) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ClientCommand::Disconnect { reply })
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }

    /// メッセージを送信する
    ///
    /// `id` / `timestamp` / `from` はここで付与される。`Connected` 以外の
    /// 状態では [`SignallingError::NotConnected`] で失敗する。
    pub async fn send_message(&self, message: OutboundMessage) -> Result<(), SignallingError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::Send { message, reply })
            .map_err(|_| SignallingError::ClientGone)?;
        reply_rx.await.map_err(|_| SignallingError::ClientGone)?
    }

    /// ルームに参加する（サーバーの応答は待たない楽観的追跡）
    pub async fn join_room(
        &self,
        room_id: impl Into<String>,
        user_info: UserInfo,
    ) -> Result<(), SignallingError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::JoinRoom {
                room_id: room_id.into(),
                user_info,
                reply,
            })
            .map_err(|_| SignallingError::ClientGone)?;
        reply_rx.await.map_err(|_| SignallingError::ClientGone)?
    }

    /// ルームから離脱する。追跡中のルームと一致しなければ何もしない
    pub async fn leave_room(&self, room_id: impl Into<String>) -> Result<(), SignallingError> {
        let (reply, reply_rx) = oneshot::channel();
        self.command_tx
            .send(ClientCommand::LeaveRoom {
                room_id: room_id.into(),
                reply,
            })
            .map_err(|_| SignallingError::ClientGone)?;
        reply_rx.await.map_err(|_| SignallingError::ClientGone)?
    }

    /// 現在の接続状態（純粋な読み取り）
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// イベントを購読する。リスナーは登録順に同期的に呼ばれる
    pub fn on(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.listeners.lock().unwrap().on(kind, listener)
    }

    /// 購読を解除する。未知のハンドルは無視される
    pub fn off(&self, kind: EventKind, id: ListenerId) {
        self.listeners.lock().unwrap().off(kind, id);
    }
}

impl fmt::Debug for SignallingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignallingClient")
            .field("client_id", &self.client_id)
            .field("state", &*self.state_rx.borrow())
            .finish_non_exhaustive()
    }
}

/// クライアント本体。コマンド・ソケットイベント・タイマーを
/// 単一の select ループで逐次処理する
struct ClientActor {
    client_id: String,
    connector: Arc<dyn Connector>,
    command_rx: mpsc::UnboundedReceiver<ClientCommand>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: Arc<Mutex<EventListeners>>,
    state: ConnectionState,
    /// 直近の connect で渡された設定。再接続にも使う
    config: Option<SignallingConfig>,
    connection: Option<Connection>,
    reconnect_attempts: u32,
    // タイマーは同種 1 本のみ。設定は必ず置き換え代入で行う
    heartbeat: Option<Interval>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    current_room: Option<(String, UserInfo)>,
}

impl ClientActor {
    async fn run(mut self) {
        debug!(client_id = %self.client_id, "signalling client started");

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // 全ハンドルが破棄されたら終了
                    None => break,
                },
                event = next_connection_event(&mut self.connection), if self.connection.is_some() => {
                    self.handle_connection_event(event);
                },
                _ = heartbeat_tick(&mut self.heartbeat), if self.heartbeat.is_some() => {
                    self.send_heartbeat();
                },
                _ = reconnect_elapsed(&mut self.reconnect_timer), if self.reconnect_timer.is_some() => {
                    self.reconnect_timer = None;
                    self.try_reconnect().await;
                },
            }
        }

        // drop でソケットとタイマーが畳まれる
        debug!(client_id = %self.client_id, "signalling client stopped");
    }

    async fn handle_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Connect { config, reply } => {
                let result = self.handle_connect(config).await;
                let _ = reply.send(result);
            }
            ClientCommand::Disconnect { reply } => {
                self.handle_disconnect();
                let _ = reply.send(());
            }
            ClientCommand::Send { message, reply } => {
                let _ = reply.send(self.handle_send(message));
            }
            ClientCommand::JoinRoom {
                room_id,
                user_info,
                reply,
            } => {
                let _ = reply.send(self.handle_join_room(room_id, user_info));
            }
            ClientCommand::LeaveRoom { room_id, reply } => {
                let _ = reply.send(self.handle_leave_room(&room_id));
            }
        }
    }

    /// 明示的な connect。進行中の再接続・ハートビートは破棄してやり直す
    async fn handle_connect(&mut self, config: SignallingConfig) -> Result<(), SignallingError> {
        self.reconnect_timer = None;
        self.heartbeat = None;
        self.connection = None;
        self.config = Some(config.clone());
        self.set_state(ConnectionState::Connecting);

        match self.open_socket(&config).await {
            Ok(connection) => {
                self.on_opened(connection);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn open_socket(
        &self,
        config: &SignallingConfig,
    ) -> Result<Connection, SignallingError> {
        match timeout(config.connect_timeout(), self.connector.connect(config)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(e),
            // タイムアウトで接続フューチャーごと破棄される
            Err(_) => Err(SignallingError::ConnectionTimeout(config.timeout)),
        }
    }

    fn on_opened(&mut self, connection: Connection) {
        self.connection = Some(connection);
        self.reconnect_attempts = 0;
        self.set_state(ConnectionState::Connected);
        self.start_heartbeat();
    }

    fn start_heartbeat(&mut self) {
        let Some(config) = &self.config else { return };
        let period = config.heartbeat_period();
        // interval_at で最初の tick も 1 周期後にする
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(interval);
    }

    fn handle_disconnect(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        self.reconnect_timer = None;
        self.reconnect_attempts = 0;
        self.heartbeat = None;
        // drop で I/O タスクが Close を送って閉じる。イベント受信側も
        // 一緒に消えるため、この後の close がリ接続を誘発することはない
        self.connection = None;
    }

    fn handle_send(&self, message: OutboundMessage) -> Result<(), SignallingError> {
        if self.state != ConnectionState::Connected {
            return Err(SignallingError::NotConnected);
        }
        self.transmit(message)
    }

    fn handle_join_room(
        &mut self,
        room_id: String,
        user_info: UserInfo,
    ) -> Result<(), SignallingError> {
        let previous = match &self.current_room {
            Some((current, _)) if *current != room_id => Some(current.clone()),
            _ => None,
        };

        // 楽観的にローカルの所属を更新してから送信する
        self.current_room = Some((room_id.clone(), user_info.clone()));

        if self.state != ConnectionState::Connected {
            return Err(SignallingError::NotConnected);
        }

        if let Some(previous) = previous {
            // 旧実装は黙って上書きしていたが、それだとサーバー側の
            // 所属が残り続けるので先に leave を送る
            warn!(
                client_id = %self.client_id,
                old_room = %previous,
                new_room = %room_id,
                "joining a room while another is still tracked; leaving old room first"
            );
            self.transmit(OutboundMessage {
                kind: SignalType::LeaveRoom,
                to: None,
                room: Some(previous),
                data: None,
            })?;
        }

        self.transmit(OutboundMessage {
            kind: SignalType::JoinRoom,
            to: None,
            room: Some(room_id),
            data: Some(serde_json::json!({ "userInfo": user_info })),
        })
    }

    fn handle_leave_room(&mut self, room_id: &str) -> Result<(), SignallingError> {
        match &self.current_room {
            Some((current, _)) if current == room_id => {
                if self.state != ConnectionState::Connected {
                    return Err(SignallingError::NotConnected);
                }
                self.transmit(OutboundMessage {
                    kind: SignalType::LeaveRoom,
                    to: None,
                    room: Some(room_id.to_string()),
                    data: None,
                })?;
                self.current_room = None;
                Ok(())
            }
            // 追跡中のルームと一致しなければ黙って無視する
            _ => Ok(()),
        }
    }

    fn send_heartbeat(&self) {
        trace!(client_id = %self.client_id, "sending heartbeat");
        if let Err(e) = self.transmit(OutboundMessage::new(SignalType::Heartbeat)) {
            warn!(client_id = %self.client_id, "failed to send heartbeat: {e}");
        }
    }

    /// id / timestamp / from を付与して送信する
    fn transmit(&self, message: OutboundMessage) -> Result<(), SignallingError> {
        let Some(connection) = &self.connection else {
            return Err(SignallingError::NotConnected);
        };
        let timestamp = epoch_millis();
        let full = SignalMessage {
            id: message_id(&self.client_id, timestamp),
            kind: message.kind,
            timestamp,
            from: Some(self.client_id.clone()),
            to: message.to,
            room: message.room,
            data: message.data,
        };
        let text = serde_json::to_string(&full)
            .map_err(|e| SignallingError::Transport(e.to_string()))?;
        connection.send(text)
    }

    fn handle_connection_event(&mut self, event: Option<ConnectionEvent>) {
        match event {
            Some(ConnectionEvent::Message(text)) => self.handle_inbound(&text),
            Some(ConnectionEvent::Error(message)) => {
                warn!(client_id = %self.client_id, "transport error: {message}");
                self.emit(SignallingEvent::Error(SignallingError::Transport(message)));
            }
            Some(ConnectionEvent::Closed) | None => self.handle_unexpected_close(),
        }
    }

    /// サーバー側からの切断。明示的な disconnect ではここに来ない
    /// （その時点でイベント受信側ごと破棄されているため）
    fn handle_unexpected_close(&mut self) {
        info!(client_id = %self.client_id, "connection closed by peer");
        self.connection = None;
        self.heartbeat = None;
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let Some(config) = self.config.clone() else { return };

        if self.reconnect_attempts >= config.max_reconnect_attempts {
            self.set_state(ConnectionState::Error);
            self.emit(SignallingEvent::Error(SignallingError::ReconnectExhausted(
                config.max_reconnect_attempts,
            )));
            return;
        }

        self.set_state(ConnectionState::Reconnecting);
        self.reconnect_attempts += 1;
        debug!(
            client_id = %self.client_id,
            attempt = self.reconnect_attempts,
            max = config.max_reconnect_attempts,
            "scheduling reconnect"
        );
        self.reconnect_timer = Some(Box::pin(sleep(config.reconnect_delay())));
    }

    async fn try_reconnect(&mut self) {
        let Some(config) = self.config.clone() else { return };
        self.set_state(ConnectionState::Connecting);

        match self.open_socket(&config).await {
            Ok(connection) => {
                info!(client_id = %self.client_id, "reconnected");
                self.on_opened(connection);
            }
            Err(e) => {
                warn!(client_id = %self.client_id, "reconnect attempt failed: {e}");
                self.emit(SignallingEvent::Error(e));
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        // 同一状態への遷移は通知しない
        if self.state == state {
            return;
        }
        debug!(
            client_id = %self.client_id,
            from = %self.state,
            to = %state,
            "connection state changed"
        );
        self.state = state;
        let _ = self.state_tx.send(state);
        self.emit(SignallingEvent::ConnectionStateChanged(state));
    }

    fn handle_inbound(&self, text: &str) {
        let message: SignalMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(client_id = %self.client_id, "failed to parse inbound message: {e}");
                self.emit(SignallingEvent::Error(SignallingError::MessageParse(
                    e.to_string(),
                )));
                return;
            }
        };

        // 生のメッセージはまず必ず通知する
        self.emit(SignallingEvent::MessageReceived(message.clone()));

        match &message.kind {
            // 生存確認のみ
            SignalType::Heartbeat => {}
            SignalType::JoinRoom => {
                if let Some(user_info) = message.data.as_ref().and_then(|d| d.get("userInfo")) {
                    match serde_json::from_value::<UserInfo>(user_info.clone()) {
                        Ok(user) => self.emit(SignallingEvent::UserJoined(user)),
                        Err(e) => {
                            debug!(client_id = %self.client_id, "ignoring malformed userInfo: {e}");
                        }
                    }
                }
            }
            SignalType::LeaveRoom => {
                if let Some(from) = &message.from {
                    self.emit(SignallingEvent::UserLeft(from.clone()));
                }
            }
            SignalType::RoomUsers => {
                if let Some(users) = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("users"))
                    .and_then(|u| u.as_array())
                {
                    self.emit(SignallingEvent::RoomUsersUpdated(users.clone()));
                }
            }
            SignalType::Error => {
                let reason = message
                    .data
                    .as_ref()
                    .and_then(|d| d.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or("server error")
                    .to_string();
                self.emit(SignallingEvent::Error(SignallingError::Server(reason)));
            }
            // その他の種別は message-received で上位層に任せる
            _ => {}
        }
    }

    fn emit(&self, event: SignallingEvent) {
        // ロックを持ったまま呼ぶと、リスナー内の on / off が同じロックを
        // 取り直してアクターごと止まる。先に複製を取ってから呼ぶ
        let listeners = self.listeners.lock().unwrap().snapshot(event.kind());
        for listener in &listeners {
            listener(&event);
        }
    }
}

async fn next_connection_event(connection: &mut Option<Connection>) -> Option<ConnectionEvent> {
    match connection {
        Some(connection) => connection.next_event().await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn reconnect_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// クライアント id + タイムスタンプ + ランダムサフィックス
///
/// グローバルな一意性は要らないので uuid の先頭だけ使う。
fn message_id(client_id: &str, timestamp: u64) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{client_id}-{timestamp}-{}", &suffix[..9])
}
