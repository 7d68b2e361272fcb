use std::collections::HashMap;

use crate::{ConnectionState, SignalMessage, SignallingError, UserInfo};

/// クライアントが発火する型付きイベント
#[derive(Debug, Clone)]
pub enum SignallingEvent {
    ConnectionStateChanged(ConnectionState),
    MessageReceived(SignalMessage),
    UserJoined(UserInfo),
    UserLeft(String),
    /// room-users メッセージの `data.users` をそのまま渡す
    RoomUsersUpdated(Vec<serde_json::Value>),
    Error(SignallingError),
}

impl SignallingEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            Self::MessageReceived(_) => EventKind::MessageReceived,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::RoomUsersUpdated(_) => EventKind::RoomUsersUpdated,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// イベント名に相当する購読キー
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionStateChanged,
    MessageReceived,
    UserJoined,
    UserLeft,
    RoomUsersUpdated,
    Error,
}

pub type Listener = Box<dyn Fn(&SignallingEvent) + Send + Sync>;

/// 登録簿の外に持ち出せるリスナーの共有ハンドル
pub type SharedListener = std::sync::Arc<dyn Fn(&SignallingEvent) + Send + Sync>;

/// 購読解除に使うリスナーのハンドル
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// イベント種別ごとのリスナー登録簿
///
/// リスナーは登録順に同期的に呼び出される。`off` は個別に解除でき、
/// 未知のハンドルを渡しても何も起きない。
#[derive(Default)]
pub struct EventListeners {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, SharedListener)>>,
}

impl EventListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, listener: Listener) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners
            .entry(kind)
            .or_default()
            .push((id, std::sync::Arc::from(listener)));
        id
    }

    pub fn off(&mut self, kind: EventKind, id: ListenerId) {
        if let Some(entries) = self.listeners.get_mut(&kind) {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    /// 該当種別のリスナーを登録順で複製して返す
    ///
    /// 登録簿をロックで包んで使う場合、呼び出し側はまずこれで複製を
    /// 取り、ロックを手放してから呼び出すこと。リスナー内の `on` / `off`
    /// が同じロックを取り直しても詰まらない。発火中の解除は進行中の
    /// 発火には効かず、次回から反映される。
    pub fn snapshot(&self, kind: EventKind) -> Vec<SharedListener> {
        self.listeners
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, listener)| listener.clone()).collect())
            .unwrap_or_default()
    }

    pub fn emit(&self, event: &SignallingEvent) {
        for listener in self.snapshot(event.kind()) {
            listener(event);
        }
    }
}
