use super::protocol::{
    Reply, ReplyKind, ReplyStatus, Request, RequestKind, CLIENT_CONNECT_TAG, PROTOCOL_VERSION,
    REPLY_SIZE, REQUEST_SIZE,
};
use super::queue::{MessageQueue, QueueError, QueueNamespace};
use crate::compensation::CompensationParameters;
use crate::config::ServerConfig;
use crate::error::CResult;
use crate::types::{CompensationMode, DeviceInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Operations the control channel can invoke on the driver
pub trait ControlHandler: Send + Sync {
    fn device_info(&self, device_id: u32) -> CResult<DeviceInfo>;

    fn set_compensation_mode(&self, target_id: u32, reference_id: u32, mode: CompensationMode) -> CResult<()>;

    fn set_compensation_parameters(&self, params: CompensationParameters) -> CResult<CompensationParameters>;

    fn reset_zero_pose(&self) -> CResult<()>;
}

/// Receive loop state, owned by the server thread
struct ServerLoop {
    namespace: Arc<dyn QueueNamespace>,
    handler: Arc<dyn ControlHandler>,
    sessions: HashMap<u32, Arc<dyn MessageQueue>>,
    next_client_id: u32,
    client_count: Arc<AtomicUsize>,
}

impl ServerLoop {
    fn handle(&mut self, request: Request) {
        let message_id = request.message_id;
        let client_id = request.client_id;

        match request.kind {
            RequestKind::ClientConnect {
                protocol_version,
                queue_name,
            } => self.connect(message_id, protocol_version, &queue_name),

            RequestKind::ClientDisconnect => {
                if self.sessions.contains_key(&client_id) {
                    log::info!("Client disconnected: client id {}", client_id);
                    if message_id != 0 {
                        self.send_reply(client_id, Reply::generic(message_id, ReplyStatus::Ok));
                    }
                    self.sessions.remove(&client_id);
                    self.client_count.store(self.sessions.len(), Ordering::Relaxed);
                } else {
                    log::error!("Error during client disconnect: unknown client id {}", client_id);
                }
            }

            RequestKind::Ping { nonce } => {
                log::trace!("Ping received: client id {}, nonce {}", client_id, nonce);
                if message_id != 0 {
                    let reply = Reply::new(message_id, ReplyStatus::Ok, ReplyKind::Ping { nonce });
                    self.send_reply(client_id, reply);
                }
            }

            RequestKind::GetDeviceInfo { device_id } => {
                let reply = match self.handler.device_info(device_id) {
                    Ok(info) => Reply::new(
                        message_id,
                        ReplyStatus::Ok,
                        ReplyKind::DeviceInfo {
                            device_id: info.device_id,
                            device_class: info.device_class,
                            role: info.role,
                        },
                    ),
                    Err(e) => {
                        log::warn!("Device info for {} failed: {}", device_id, e);
                        Reply::generic(message_id, e.status())
                    }
                };
                if message_id != 0 {
                    self.send_reply(client_id, reply);
                }
            }

            RequestKind::SetCompensationMode {
                target_id,
                reference_id,
                mode,
            } => {
                let status = match self.handler.set_compensation_mode(target_id, reference_id, mode) {
                    Ok(()) => ReplyStatus::Ok,
                    Err(e) => {
                        log::error!(
                            "Error while setting compensation mode (target {}, reference {}): {}",
                            target_id,
                            reference_id,
                            e
                        );
                        e.status()
                    }
                };
                if message_id != 0 {
                    self.send_reply(client_id, Reply::generic(message_id, status));
                }
            }

            RequestKind::SetCompensationParameters(params) => {
                let status = match self.handler.set_compensation_parameters(params) {
                    Ok(_) => ReplyStatus::Ok,
                    Err(e) => {
                        log::error!("Error while setting compensation parameters: {}", e);
                        e.status()
                    }
                };
                if message_id != 0 {
                    self.send_reply(client_id, Reply::generic(message_id, status));
                }
            }

            RequestKind::ResetZeroPose => {
                let status = match self.handler.reset_zero_pose() {
                    Ok(()) => ReplyStatus::Ok,
                    Err(e) => {
                        log::error!("Error while resetting zero pose: {}", e);
                        e.status()
                    }
                };
                if message_id != 0 {
                    self.send_reply(client_id, Reply::generic(message_id, status));
                }
            }
        }
    }

    fn connect(&mut self, message_id: u32, protocol_version: u32, queue_name: &str) {
        let queue = match self.namespace.open(queue_name) {
            Ok(queue) => queue,
            Err(e) => {
                log::error!(
                    "Error during client connect: cannot open queue \"{}\": {} ({})",
                    queue_name,
                    e,
                    ReplyStatus::SharedMemoryError
                );
                return;
            }
        };

        if protocol_version != PROTOCOL_VERSION {
            log::info!(
                "Client (queue \"{}\") reports incompatible protocol version {}",
                queue_name,
                protocol_version
            );
            let reply = Reply::new(
                message_id,
                ReplyStatus::InvalidVersion,
                ReplyKind::ClientConnect {
                    client_id: 0,
                    protocol_version: PROTOCOL_VERSION,
                },
            );
            if let Err(e) = queue.send(&reply.encode()) {
                log::error!("Error sending version mismatch reply: {}", e);
            }
            return;
        }

        let client_id = self.next_client_id;
        self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
        self.sessions.insert(client_id, queue);
        self.client_count.store(self.sessions.len(), Ordering::Relaxed);
        log::info!("New client connected: queue \"{}\", client id {}", queue_name, client_id);

        let reply = Reply::new(
            message_id,
            ReplyStatus::Ok,
            ReplyKind::ClientConnect {
                client_id,
                protocol_version: PROTOCOL_VERSION,
            },
        );
        self.send_reply(client_id, reply);
    }

    /// Answer a record whose body failed to decode
    fn reject(&mut self, record: &[u8]) {
        let Ok(header) = Request::decode_header(record) else {
            return;
        };
        if header.message_id == 0 || header.kind == CLIENT_CONNECT_TAG {
            return;
        }
        self.send_reply(
            header.client_id,
            Reply::generic(header.message_id, ReplyStatus::InvalidOperation),
        );
    }

    fn send_reply(&mut self, client_id: u32, reply: Reply) {
        let Some(queue) = self.sessions.get(&client_id) else {
            log::error!("Error sending reply: unknown client id {}", client_id);
            return;
        };
        match queue.send(&reply.encode()) {
            Ok(()) => {}
            Err(QueueError::Closed(name)) => {
                log::warn!("Client {} queue {} closed, dropping session", client_id, name);
                self.sessions.remove(&client_id);
                self.client_count.store(self.sessions.len(), Ordering::Relaxed);
            }
            Err(e) => log::error!("Error sending reply to client {}: {}", client_id, e),
        }
    }
}

/// Control channel server running on its own thread
pub struct IpcServer {
    queue_name: String,
    stop: Arc<AtomicBool>,
    client_count: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

impl IpcServer {
    /// Create the request queue and start the receive loop
    pub fn start(
        namespace: Arc<dyn QueueNamespace>,
        config: &ServerConfig,
        handler: Arc<dyn ControlHandler>,
    ) -> Result<Self, QueueError> {
        // leftovers from a previous run
        match namespace.remove(&config.queue_name) {
            Ok(()) | Err(QueueError::NotFound(_)) => {}
            Err(e) => log::warn!("Could not remove old queue {}: {}", config.queue_name, e),
        }
        let queue = namespace.create(&config.queue_name, config.max_messages, REQUEST_SIZE)?;

        let stop = Arc::new(AtomicBool::new(false));
        let client_count = Arc::new(AtomicUsize::new(0));
        let timeout = config.receive_timeout();
        let mut server_loop = ServerLoop {
            namespace: Arc::clone(&namespace),
            handler,
            sessions: HashMap::new(),
            next_client_id: 1,
            client_count: Arc::clone(&client_count),
        };

        let thread_stop = Arc::clone(&stop);
        let queue_name = config.queue_name.clone();
        let thread = std::thread::Builder::new()
            .name("ipc-server".to_string())
            .spawn(move || {
                log::debug!("IPC server thread started on {}", queue.name());
                receive_loop(&mut server_loop, queue.as_ref(), timeout, &thread_stop);
                if let Err(e) = namespace.remove(queue.name()) {
                    log::warn!("Could not remove queue {}: {}", queue.name(), e);
                }
                log::debug!("IPC server thread stopped");
            })?;

        log::info!("IPC server listening on {}", queue_name);
        Ok(Self {
            queue_name,
            stop,
            client_count,
            thread: Some(thread),
        })
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the receive loop and wait for it
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("IPC server thread panicked");
            }
        }
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn receive_loop(server: &mut ServerLoop, queue: &dyn MessageQueue, timeout: Duration, stop: &AtomicBool) {
    // one spare byte so oversized records are detected
    let mut buf = [0u8; REQUEST_SIZE + 1];
    while !stop.load(Ordering::Acquire) {
        let len = match queue.timed_receive(&mut buf, timeout) {
            Ok(Some(len)) => len,
            Ok(None) => continue,
            Err(e) => {
                log::error!("Error in IPC server receive loop: {}", e);
                std::thread::sleep(timeout);
                continue;
            }
        };
        if len != REQUEST_SIZE {
            log::error!(
                "Error in IPC server receive loop: received size is wrong ({} != {})",
                len,
                REQUEST_SIZE
            );
            continue;
        }
        match Request::decode(&buf[..len]) {
            Ok(request) => {
                log::trace!("IPC request received: {:?}", request.kind);
                server.handle(request);
            }
            Err(e) => {
                log::error!("Error in IPC server receive loop: {}", e);
                server.reject(&buf[..len]);
            }
        }
    }
}
