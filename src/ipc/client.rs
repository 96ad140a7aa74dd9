use super::protocol::{
    Reply, ReplyKind, ReplyStatus, Request, RequestKind, PROTOCOL_VERSION, REPLY_SIZE,
};
use super::queue::{MessageQueue, QueueNamespace};
use crate::compensation::CompensationParameters;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::types::{CompensationMode, DeviceInfo};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Reply correlation entry
enum Pending {
    /// A caller is blocked on this reply
    Awaiting(Sender<Reply>),
    /// Reply requested but nobody waits for it
    Discard,
}

/// Discarded replies still tracked; older ones are forgotten
const MAX_DISCARDS: usize = 64;

/// Correlation table for outstanding requests
#[derive(Default)]
struct PendingTable {
    entries: HashMap<u32, Pending>,
    /// Discard ids, oldest first
    discards: VecDeque<u32>,
}

impl PendingTable {
    fn await_reply(&mut self, message_id: u32, tx: Sender<Reply>) {
        self.entries.insert(message_id, Pending::Awaiting(tx));
    }

    fn discard_reply(&mut self, message_id: u32) {
        self.entries.insert(message_id, Pending::Discard);
        self.discards.push_back(message_id);
        while self.discards.len() > MAX_DISCARDS {
            if let Some(old) = self.discards.pop_front() {
                if matches!(self.entries.get(&old), Some(Pending::Discard)) {
                    self.entries.remove(&old);
                }
            }
        }
    }

    fn remove(&mut self, message_id: &u32) -> Option<Pending> {
        let entry = self.entries.remove(message_id);
        if matches!(entry, Some(Pending::Discard)) {
            self.discards.retain(|id| id != message_id);
        }
        entry
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.discards.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// State shared with the receive thread
struct Shared {
    pending: Mutex<PendingTable>,
    stop: AtomicBool,
    next_message_id: AtomicU32,
    next_nonce: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(PendingTable::default()),
            stop: AtomicBool::new(false),
            next_message_id: AtomicU32::new(1),
            next_nonce: AtomicU64::new(1),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, PendingTable> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ping sequence number, echoed back by the server
    fn nonce(&self) -> u64 {
        self.next_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Next correlation id; never 0, which means "no reply"
    fn message_id(&self) -> u32 {
        loop {
            let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn dispatch(&self, reply: Reply) {
        match self.pending().remove(&reply.message_id) {
            Some(Pending::Awaiting(tx)) => {
                // the waiter may have timed out already
                let _ = tx.send(reply);
            }
            Some(Pending::Discard) => {}
            None => log::debug!("Dropping reply {} with nobody waiting", reply.message_id),
        }
    }
}

struct Connection {
    client_id: u32,
    server_queue: Arc<dyn MessageQueue>,
    client_queue_name: String,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

/// Control-channel client for a running compensation driver
pub struct CompensationClient {
    namespace: Arc<dyn QueueNamespace>,
    config: ClientConfig,
    connection: Option<Connection>,
}

fn client_queue_name(prefix: &str) -> String {
    static SEQUENCE: AtomicU32 = AtomicU32::new(0);
    format!(
        "{}.{}.{}.{}",
        prefix,
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

fn receive_loop(queue: Arc<dyn MessageQueue>, shared: Arc<Shared>, timeout: Duration) {
    let mut buf = [0u8; REPLY_SIZE + 1];
    while !shared.stop.load(Ordering::Acquire) {
        match queue.timed_receive(&mut buf, timeout) {
            Ok(Some(len)) => match Reply::decode(&buf[..len]) {
                Ok(reply) => shared.dispatch(reply),
                Err(e) => log::error!("Error in IPC receive loop: {}", e),
            },
            Ok(None) => {}
            Err(e) => {
                log::error!("Error in IPC receive loop: {}", e);
                std::thread::sleep(timeout);
            }
        }
    }
    // dropping the senders wakes every waiter
    shared.pending().clear();
}

impl CompensationClient {
    pub fn new(namespace: Arc<dyn QueueNamespace>, config: ClientConfig) -> Self {
        Self {
            namespace,
            config,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn client_id(&self) -> Option<u32> {
        self.connection.as_ref().map(|c| c.client_id)
    }

    /// Open the server queue, create the reply queue and perform the handshake
    pub fn connect(&mut self) -> Result<u32, ClientError> {
        self.connect_with_version(PROTOCOL_VERSION)
    }

    fn connect_with_version(&mut self, protocol_version: u32) -> Result<u32, ClientError> {
        if self.connection.is_some() {
            return Err(ClientError::AlreadyConnected);
        }

        let server_queue = self.namespace.open(&self.config.server_queue)?;
        let client_queue_name = client_queue_name(&self.config.client_queue_prefix);
        let client_queue =
            self.namespace
                .create(&client_queue_name, self.config.max_messages, REPLY_SIZE)?;

        let shared = Arc::new(Shared::new());
        let thread_shared = Arc::clone(&shared);
        let timeout = self.config.receive_timeout();
        let thread = std::thread::Builder::new()
            .name("ipc-client".to_string())
            .spawn(move || receive_loop(client_queue, thread_shared, timeout))
            .map_err(|e| ClientError::Queue(e.into()))?;

        let mut connection = Connection {
            client_id: 0,
            server_queue,
            client_queue_name,
            shared,
            thread: Some(thread),
        };

        let kind = RequestKind::ClientConnect {
            protocol_version,
            queue_name: connection.client_queue_name.clone(),
        };
        let reply = match self.round_trip(&connection, kind) {
            Ok(reply) => reply,
            Err(e) => {
                self.teardown(&mut connection);
                return Err(e);
            }
        };

        match (reply.status, reply.kind) {
            (ReplyStatus::Ok, ReplyKind::ClientConnect { client_id, .. }) => {
                connection.client_id = client_id;
                log::info!("Connected to {} as client {}", self.config.server_queue, client_id);
                self.connection = Some(connection);
                Ok(client_id)
            }
            (ReplyStatus::InvalidVersion, _) => {
                self.teardown(&mut connection);
                Err(ClientError::VersionMismatch {
                    client: protocol_version,
                })
            }
            (ReplyStatus::Ok, other) => {
                self.teardown(&mut connection);
                Err(ClientError::UnexpectedReply(format!("{:?}", other)))
            }
            (status, _) => {
                self.teardown(&mut connection);
                Err(ClientError::Status(status))
            }
        }
    }

    /// Tell the server goodbye, then stop and join the receive thread
    pub fn disconnect(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        let request = Request::new(connection.client_id, 0, RequestKind::ClientDisconnect);
        if let Err(e) = request
            .encode()
            .map_err(ClientError::from)
            .and_then(|buf| connection.server_queue.send(&buf).map_err(ClientError::from))
        {
            log::warn!("Could not send disconnect: {}", e);
        }
        self.teardown(&mut connection);
        log::info!("Disconnected from {}", self.config.server_queue);
    }

    fn teardown(&self, connection: &mut Connection) {
        connection.shared.stop.store(true, Ordering::Release);
        if let Some(thread) = connection.thread.take() {
            if thread.join().is_err() {
                log::error!("IPC client thread panicked");
            }
        }
        if let Err(e) = self.namespace.remove(&connection.client_queue_name) {
            log::debug!("Removing {}: {}", connection.client_queue_name, e);
        }
    }

    fn connection(&self) -> Result<&Connection, ClientError> {
        self.connection.as_ref().ok_or(ClientError::NotConnected)
    }

    fn send(&self, connection: &Connection, message_id: u32, kind: RequestKind) -> Result<(), ClientError> {
        let request = Request::new(connection.client_id, message_id, kind);
        connection.server_queue.send(&request.encode()?)?;
        Ok(())
    }

    /// Send and block until the correlated reply arrives
    fn round_trip(&self, connection: &Connection, kind: RequestKind) -> Result<Reply, ClientError> {
        let message_id = connection.shared.message_id();
        let (tx, rx): (Sender<Reply>, Receiver<Reply>) = channel::bounded(1);
        connection
            .shared
            .pending()
            .await_reply(message_id, tx);

        if let Err(e) = self.send(connection, message_id, kind) {
            connection.shared.pending().remove(&message_id);
            return Err(e);
        }

        let result = match self.config.reply_timeout() {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => ClientError::Timeout,
                RecvTimeoutError::Disconnected => ClientError::ConnectionClosed,
            }),
            None => rx.recv().map_err(|_| ClientError::ConnectionClosed),
        };
        if result.is_err() {
            connection.shared.pending().remove(&message_id);
        }
        result
    }

    /// Modal requests wait for the reply and check its status; others are fire-and-forget
    fn request(&self, kind: RequestKind, modal: bool) -> Result<(), ClientError> {
        let connection = self.connection()?;
        if modal {
            let reply = self.round_trip(connection, kind)?;
            expect_ok(&reply)
        } else {
            self.send(connection, 0, kind)
        }
    }

    /// Liveness check. Non-modal pings may still request a reply that is then discarded.
    pub fn ping(&self, modal: bool, enable_reply: bool) -> Result<(), ClientError> {
        let connection = self.connection()?;
        let nonce = connection.shared.nonce();
        if modal {
            let reply = self.round_trip(connection, RequestKind::Ping { nonce })?;
            expect_ok(&reply)?;
            return match reply.kind {
                ReplyKind::Ping { nonce: echoed } if echoed == nonce => Ok(()),
                other => Err(ClientError::UnexpectedReply(format!("{:?}", other))),
            };
        }
        let message_id = if enable_reply {
            let id = connection.shared.message_id();
            connection.shared.pending().discard_reply(id);
            id
        } else {
            0
        };
        self.send(connection, message_id, RequestKind::Ping { nonce })
    }

    pub fn device_info(&self, device_id: u32) -> Result<DeviceInfo, ClientError> {
        let connection = self.connection()?;
        let reply = self.round_trip(connection, RequestKind::GetDeviceInfo { device_id })?;
        expect_ok(&reply)?;
        match reply.kind {
            ReplyKind::DeviceInfo {
                device_id,
                device_class,
                role,
            } => Ok(DeviceInfo {
                device_id,
                device_class,
                role,
                serial: None,
            }),
            other => Err(ClientError::UnexpectedReply(format!("{:?}", other))),
        }
    }

    pub fn set_compensation_mode(
        &self,
        target_id: u32,
        reference_id: u32,
        mode: CompensationMode,
        modal: bool,
    ) -> Result<(), ClientError> {
        self.request(
            RequestKind::SetCompensationMode {
                target_id,
                reference_id,
                mode,
            },
            modal,
        )
    }

    pub fn set_compensation_parameters(&self, params: CompensationParameters, modal: bool) -> Result<(), ClientError> {
        self.request(RequestKind::SetCompensationParameters(params), modal)
    }

    pub fn reset_zero_pose(&self, modal: bool) -> Result<(), ClientError> {
        self.request(RequestKind::ResetZeroPose, modal)
    }
}

impl Drop for CompensationClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn expect_ok(reply: &Reply) -> Result<(), ClientError> {
    match reply.status {
        ReplyStatus::Ok => Ok(()),
        status => Err(ClientError::Status(status)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::{CResult, CompensationError};
    use crate::ipc::queue::MemoryNamespace;
    use crate::ipc::server::{ControlHandler, IpcServer};
    use crate::types::{DeviceClass, DeviceRole};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        resets: AtomicUsize,
    }

    impl ControlHandler for CountingHandler {
        fn device_info(&self, device_id: u32) -> CResult<DeviceInfo> {
            match device_id {
                0 => Ok(DeviceInfo {
                    device_id,
                    device_class: DeviceClass::Hmd,
                    role: DeviceRole::MotionCompensated,
                    serial: None,
                }),
                id => Err(CompensationError::DeviceNotFound(id)),
            }
        }

        fn set_compensation_mode(&self, target_id: u32, reference_id: u32, _mode: CompensationMode) -> CResult<()> {
            if target_id == reference_id {
                Err(CompensationError::SameDevice(target_id))
            } else {
                Ok(())
            }
        }

        fn set_compensation_parameters(&self, params: CompensationParameters) -> CResult<CompensationParameters> {
            params.validated()
        }

        fn reset_zero_pose(&self) -> CResult<()> {
            self.resets.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn setup(name: &str) -> (IpcServer, CompensationClient, Arc<CountingHandler>) {
        let ns = MemoryNamespace::new();
        let handler = Arc::new(CountingHandler::default());
        let server_config = ServerConfig {
            queue_name: name.to_string(),
            receive_timeout_ms: 5,
            ..ServerConfig::default()
        };
        let server = IpcServer::start(Arc::new(ns.clone()), &server_config, handler.clone()).unwrap();
        let client_config = ClientConfig {
            server_queue: name.to_string(),
            receive_timeout_ms: 5,
            reply_timeout_ms: Some(2000),
            ..ClientConfig::default()
        };
        let client = CompensationClient::new(Arc::new(ns), client_config);
        (server, client, handler)
    }

    #[test]
    fn test_connect_and_ping() {
        let (server, mut client, _) = setup("cl_ping");
        assert!(!client.is_connected());
        let id = client.connect().unwrap();
        assert_eq!(id, 1);
        assert!(client.is_connected());
        assert_eq!(server.client_count(), 1);

        client.ping(true, false).unwrap();
        client.ping(false, true).unwrap();
        client.ping(false, false).unwrap();
        client.ping(true, false).unwrap();
    }

    #[test]
    fn test_version_mismatch() {
        let (server, mut client, _) = setup("cl_version");
        let err = client.connect_with_version(PROTOCOL_VERSION + 1).unwrap_err();
        assert!(matches!(err, ClientError::VersionMismatch { client } if client == PROTOCOL_VERSION + 1));
        assert!(!client.is_connected());
        assert_eq!(server.client_count(), 0);
    }

    #[test]
    fn test_requests_require_connection() {
        let (_server, client, _) = setup("cl_offline");
        assert!(matches!(client.ping(true, false), Err(ClientError::NotConnected)));
        assert!(matches!(client.reset_zero_pose(true), Err(ClientError::NotConnected)));
    }

    #[test]
    fn test_missing_server_queue() {
        let ns = MemoryNamespace::new();
        let mut client = CompensationClient::new(Arc::new(ns), ClientConfig::default());
        assert!(matches!(client.connect(), Err(ClientError::Queue(_))));
    }

    #[test]
    fn test_status_errors_surface() {
        let (_server, mut client, _) = setup("cl_status");
        client.connect().unwrap();

        let err = client
            .set_compensation_mode(2, 2, CompensationMode::ReferenceTracker, true)
            .unwrap_err();
        assert!(matches!(err, ClientError::Status(ReplyStatus::InvalidId)));

        let err = client.device_info(5).unwrap_err();
        assert!(matches!(err, ClientError::Status(ReplyStatus::NotFound)));

        let info = client.device_info(0).unwrap();
        assert_eq!(info.device_class, DeviceClass::Hmd);
        assert_eq!(info.role, DeviceRole::MotionCompensated);

        let err = client
            .set_compensation_parameters(
                CompensationParameters {
                    lpf_beta: f64::INFINITY,
                    ..CompensationParameters::default()
                },
                true,
            )
            .unwrap_err();
        assert!(matches!(err, ClientError::Status(ReplyStatus::InvalidOperation)));
    }

    #[test]
    fn test_non_modal_requests_delivered() {
        let (_server, mut client, handler) = setup("cl_fire");
        client.connect().unwrap();
        client.reset_zero_pose(false).unwrap();
        // modal request behind it is processed after the fire-and-forget one
        client.reset_zero_pose(true).unwrap();
        assert_eq!(handler.resets.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_discarded_replies_are_bounded() {
        let shared = Shared::new();
        for _ in 0..MAX_DISCARDS * 3 {
            let id = shared.message_id();
            shared.pending().discard_reply(id);
        }
        let (tx, _rx) = channel::bounded(1);
        let waiting = shared.message_id();
        shared.pending().await_reply(waiting, tx);
        for _ in 0..MAX_DISCARDS {
            let id = shared.message_id();
            shared.pending().discard_reply(id);
        }
        // only the newest discards survive, the waiter is never evicted
        assert_eq!(shared.pending().len(), MAX_DISCARDS + 1);
        assert!(matches!(shared.pending().remove(&waiting), Some(Pending::Awaiting(_))));
        assert!(shared.pending().remove(&1).is_none());
    }

    #[test]
    fn test_discarded_reply_is_consumed() {
        let shared = Shared::new();
        let id = shared.message_id();
        shared.pending().discard_reply(id);
        shared.dispatch(Reply::generic(id, ReplyStatus::Ok));
        assert_eq!(shared.pending().len(), 0);
        assert!(shared.pending().discards.is_empty());
    }

    #[test]
    fn test_ping_nonces_are_unique() {
        let shared = Shared::new();
        let a = shared.nonce();
        let b = shared.nonce();
        assert_ne!(a, b);
    }

    #[test]
    fn test_disconnect_then_reconnect() {
        let (server, mut client, _) = setup("cl_reconnect");
        client.connect().unwrap();
        client.disconnect();
        assert!(!client.is_connected());
        assert!(matches!(client.ping(true, false), Err(ClientError::NotConnected)));

        let id = client.connect().unwrap();
        assert_eq!(id, 2);
        client.ping(true, false).unwrap();
        assert_eq!(server.client_count(), 1);
    }
}
