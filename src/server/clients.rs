//! The live-client list and the client record.
//!
//! Clients sit in head-to-tail order, newest first; the dispatcher and
//! `select_clients` both observe that order. The list mutex guards only
//! the list structure. Each client carries its own lock so the dispatcher
//! can service one without stalling other tasks that are walking the list.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ProtocolConfig;
use crate::proto::ws::{frame, WsClient};
use crate::proto::{h1, ws, WorkContext};
use crate::transport::Connection;

pub(crate) type ClientHandle = Arc<Mutex<Client>>;

/// The tagged per-protocol payload of a client record.
///
/// A successful WebSocket handshake swaps `Http` for `Ws` in place; the
/// connection and list position are untouched.
pub(crate) enum ProtoState {
    Http(h1::HttpClient),
    Ws(WsClient),
}

/// One connected client: its socket and its protocol state.
///
/// Application code sees clients in [`select_clients`]
/// (crate::Ember::select_clients) callbacks, mainly to pick out WebSocket
/// clients by route and push messages to them.
pub struct Client {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) state: ProtoState,
    /// Set when the record has been dropped from the list but a dispatcher
    /// snapshot may still reach it.
    pub(crate) dead: bool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("protocol", &match self.state {
                ProtoState::Http(_) => "http",
                ProtoState::Ws(_) => "websocket",
            })
            .field("open", &self.conn.is_open())
            .finish()
    }
}

impl Client {
    /// Build the protocol's client record for a fresh connection. Mirrors
    /// the protocol descriptor's create hook; a failure here makes the
    /// dispatcher close the socket and forget the client silently.
    pub(crate) fn create(
        conn: Box<dyn Connection>,
        proto: &ProtocolConfig,
    ) -> crate::Result<Client> {
        let state = match proto.kind {
            crate::config::ProtocolKind::Http => {
                ProtoState::Http(h1::HttpClient::new(Arc::clone(&proto.root_dir)))
            }
        };
        Ok(Client {
            conn,
            state,
            dead: false,
        })
    }

    /// One work cycle for this client, then any pending protocol swap.
    pub(crate) fn work(&mut self, cx: &mut WorkContext<'_>) -> crate::Result<usize> {
        let result = match &mut self.state {
            ProtoState::Http(http) => h1::work(http, &mut *self.conn, cx),
            ProtoState::Ws(ws) => ws::work(ws, &mut *self.conn, cx),
        };
        if let ProtoState::Http(http) = &mut self.state {
            if let Some(pending) = http.pending_upgrade.take() {
                self.state = ProtoState::Ws(WsClient {
                    txt: pending.txt,
                    bin: pending.bin,
                    route: pending.route,
                    route_len: pending.route_len,
                });
            }
        }
        result
    }

    /// The delete hook plus socket close; the record may linger briefly in
    /// dispatcher snapshots but does nothing further.
    pub(crate) fn shutdown(&mut self) {
        if let ProtoState::Http(http) = &mut self.state {
            http.delete();
        }
        self.conn.close();
        self.dead = true;
    }

    /// Whether this client has completed a WebSocket upgrade.
    pub fn is_websocket(&self) -> bool {
        matches!(self.state, ProtoState::Ws(_))
    }

    /// The route string a WebSocket client was tagged with at upgrade
    /// time; `None` for HTTP clients.
    pub fn ws_route(&self) -> Option<&str> {
        match &self.state {
            ProtoState::Ws(ws) => Some(ws.route()),
            ProtoState::Http(_) => None,
        }
    }

    /// Send a WebSocket text message to this client. Errors on HTTP
    /// clients.
    pub fn send_ws_text(&mut self, text: &str) -> crate::Result<usize> {
        match self.state {
            ProtoState::Ws(_) => {
                frame::send_message(&mut *self.conn, frame::OP_TEXT, text.as_bytes())
            }
            ProtoState::Http(_) => Err(crate::error::Error::new_not_websocket()),
        }
    }

    /// Send a WebSocket binary message to this client. Errors on HTTP
    /// clients.
    pub fn send_ws_binary(&mut self, payload: &[u8]) -> crate::Result<usize> {
        match self.state {
            ProtoState::Ws(_) => {
                frame::send_message(&mut *self.conn, frame::OP_BINARY, payload)
            }
            ProtoState::Http(_) => Err(crate::error::Error::new_not_websocket()),
        }
    }
}

/// The ordered list of live clients.
#[derive(Default)]
pub(crate) struct ClientList {
    clients: VecDeque<ClientHandle>,
}

impl ClientList {
    pub(crate) fn new() -> ClientList {
        ClientList::default()
    }

    /// Insert at the head; the newest client is serviced first next cycle.
    pub(crate) fn push_head(&mut self, client: ClientHandle) {
        self.clients.push_front(client);
    }

    /// Unlink a client by identity.
    pub(crate) fn remove(&mut self, client: &ClientHandle) {
        self.clients.retain(|other| !Arc::ptr_eq(other, client));
    }

    pub(crate) fn get(&self, at: usize) -> Option<&ClientHandle> {
        self.clients.get(at)
    }

    pub(crate) fn remove_at(&mut self, at: usize) -> Option<ClientHandle> {
        self.clients.remove(at)
    }

    pub(crate) fn len(&self) -> usize {
        self.clients.len()
    }

    /// Head-to-tail iteration.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &ClientHandle> {
        self.clients.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConn;

    fn client() -> ClientHandle {
        let proto = ProtocolConfig::http(0);
        Arc::new(Mutex::new(
            Client::create(Box::new(MockConn::new()), &proto).unwrap(),
        ))
    }

    #[test]
    fn list_orders_head_first() {
        let mut list = ClientList::new();
        let first = client();
        let second = client();
        list.push_head(Arc::clone(&first));
        list.push_head(Arc::clone(&second));

        let order: Vec<_> = list.iter().cloned().collect();
        assert!(Arc::ptr_eq(&order[0], &second));
        assert!(Arc::ptr_eq(&order[1], &first));
    }

    #[test]
    fn remove_unlinks_by_identity() {
        let mut list = ClientList::new();
        let a = client();
        let b = client();
        list.push_head(Arc::clone(&a));
        list.push_head(Arc::clone(&b));
        list.remove(&a);
        assert_eq!(list.len(), 1);
        assert!(Arc::ptr_eq(list.get(0).unwrap(), &b));
    }

    #[test]
    fn http_client_is_not_websocket() {
        let handle = client();
        let mut guard = handle.lock();
        assert!(!guard.is_websocket());
        assert!(guard.ws_route().is_none());
        assert!(guard.send_ws_text("x").is_err());
    }

    #[test]
    fn shutdown_closes_and_marks_dead() {
        let handle = client();
        let mut guard = handle.lock();
        guard.shutdown();
        assert!(guard.dead);
        assert!(!guard.conn.is_open());
    }
}
