//! 名前付きシグナリングクライアントのレジストリと外部向けリクエスト面

use std::collections::HashMap;
use std::sync::Arc;

use core_types::SignallingError;
use signalling::{Connector, SignallingClient, WsConnector};
use tracing::{debug, info};

pub mod request;

pub use request::{Request, Response};

/// 複数クライアントを束ねるサービス
///
/// 外部呼び出しの唯一の入口。クライアントの寿命はレジストリの
/// エントリと完全に一致し、削除されたクライアントが残ることはない。
pub struct SignallingService {
    connector: Arc<dyn Connector>,
    clients: HashMap<String, SignallingClient>,
}

impl SignallingService {
    pub fn new() -> Self {
        Self::with_connector(Arc::new(WsConnector))
    }

    /// テストなどでトランスポートを差し替える
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            clients: HashMap::new(),
        }
    }

    pub fn create_client(&mut self, client_id: &str) -> Result<&SignallingClient, SignallingError> {
        if self.clients.contains_key(client_id) {
            return Err(SignallingError::DuplicateClient(client_id.to_string()));
        }
        let client = SignallingClient::spawn(client_id, self.connector.clone());
        info!(client_id, "signalling client created");
        Ok(self
            .clients
            .entry(client_id.to_string())
            .or_insert(client))
    }

    pub fn get_client(&self, client_id: &str) -> Option<&SignallingClient> {
        self.clients.get(client_id)
    }

    /// 登録中のクライアント id 一覧（参照は返さない）
    pub fn client_ids(&self) -> Vec<String> {
        self.clients.keys().cloned().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// クライアントを切断して削除する。存在しなければ何もしない
    pub async fn remove_client(&mut self, client_id: &str) {
        if let Some(client) = self.clients.remove(client_id) {
            client.disconnect().await;
            info!(client_id, "signalling client removed");
        }
    }

    /// 全クライアントを切断して破棄する。冪等
    pub async fn destroy(&mut self) {
        for (client_id, client) in self.clients.drain() {
            client.disconnect().await;
            debug!(client_id, "signalling client destroyed");
        }
    }

    fn client(&self, client_id: &str) -> Result<&SignallingClient, SignallingError> {
        self.clients
            .get(client_id)
            .ok_or_else(|| SignallingError::ClientNotFound(client_id.to_string()))
    }

    /// リクエスト面。失敗は全て `{success: false, error}` に変換され、
    /// あるクライアントの失敗が他のリクエストを巻き込むことはない
    pub async fn handle_request(&mut self, request: Request) -> Response {
        match request {
            Request::CreateClient { client_id } => match self.create_client(&client_id) {
                Ok(_) => Response::ok().with_client_id(client_id),
                Err(e) => Response::err(e),
            },
            Request::Connect { client_id, config } => match self.client(&client_id) {
                Ok(client) => match client.connect(config).await {
                    Ok(()) => Response::ok(),
                    Err(e) => Response::err(e),
                },
                Err(e) => Response::err(e),
            },
            Request::Disconnect { client_id } => match self.client(&client_id) {
                Ok(client) => {
                    client.disconnect().await;
                    Response::ok()
                }
                Err(e) => Response::err(e),
            },
            Request::SendMessage { client_id, message } => match self.client(&client_id) {
                Ok(client) => match client.send_message(message).await {
                    Ok(()) => Response::ok(),
                    Err(e) => Response::err(e),
                },
                Err(e) => Response::err(e),
            },
            Request::JoinRoom {
                client_id,
                room_id,
                user_info,
            } => match self.client(&client_id) {
                Ok(client) => match client.join_room(room_id, user_info).await {
                    Ok(()) => Response::ok(),
                    Err(e) => Response::err(e),
                },
                Err(e) => Response::err(e),
            },
            Request::LeaveRoom { client_id, room_id } => match self.client(&client_id) {
                Ok(client) => match client.leave_room(room_id).await {
                    Ok(()) => Response::ok(),
                    Err(e) => Response::err(e),
                },
                Err(e) => Response::err(e),
            },
            Request::GetConnectionState { client_id } => match self.client(&client_id) {
                Ok(client) => Response::ok().with_state(client.connection_state()),
                Err(e) => Response::err(e),
            },
            Request::RemoveClient { client_id } => {
                self.remove_client(&client_id).await;
                Response::ok()
            }
            Request::GetAllClients => Response::ok().with_client_ids(self.client_ids()),
        }
    }
}

impl Default for SignallingService {
    fn default() -> Self {
        Self::new()
    }
}
