//! Named message queues carrying fixed-size records.
//!
//! [`MemoryNamespace`] keeps queues inside one process; [`DatagramNamespace`]
//! maps each queue to a Unix datagram socket so separate processes can talk.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue {0} already exists")]
    AlreadyExists(String),

    #[error("Queue {0} not found")]
    NotFound(String),

    #[error("Queue {0} is full")]
    Full(String),

    #[error("Queue {0} is closed")]
    Closed(String),

    #[error("Record of {size} bytes exceeds queue limit {max}")]
    TooLarge { size: usize, max: usize },

    #[error("Queue I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One direction of a channel
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, record: &[u8]) -> Result<(), QueueError>;

    /// Wait up to `timeout` for one record; returns its length, or `None` on timeout.
    ///
    /// `buf` must hold the queue's maximum record size.
    fn timed_receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, QueueError>;
}

/// Creates, opens and removes queues by name
pub trait QueueNamespace: Send + Sync {
    fn create(
        &self,
        name: &str,
        max_messages: usize,
        max_size: usize,
    ) -> Result<Arc<dyn MessageQueue>, QueueError>;

    fn open(&self, name: &str) -> Result<Arc<dyn MessageQueue>, QueueError>;

    fn remove(&self, name: &str) -> Result<(), QueueError>;
}

// ===== In-process backend =====

struct MemoryQueue {
    name: String,
    max_size: usize,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl MessageQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, record: &[u8]) -> Result<(), QueueError> {
        if record.len() > self.max_size {
            return Err(QueueError::TooLarge {
                size: record.len(),
                max: self.max_size,
            });
        }
        self.tx.try_send(record.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full(self.name.clone()),
            TrySendError::Disconnected(_) => QueueError::Closed(self.name.clone()),
        })
    }

    fn timed_receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, QueueError> {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => {
                let len = record.len().min(buf.len());
                buf[..len].copy_from_slice(&record[..len]);
                Ok(Some(record.len()))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(QueueError::Closed(self.name.clone())),
        }
    }
}

/// Named bounded queues shared by everything holding a clone of the namespace
#[derive(Clone, Default)]
pub struct MemoryNamespace {
    queues: Arc<Mutex<HashMap<String, Arc<MemoryQueue>>>>,
}

impl MemoryNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<MemoryQueue>>> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl QueueNamespace for MemoryNamespace {
    fn create(
        &self,
        name: &str,
        max_messages: usize,
        max_size: usize,
    ) -> Result<Arc<dyn MessageQueue>, QueueError> {
        let mut queues = self.queues();
        if queues.contains_key(name) {
            return Err(QueueError::AlreadyExists(name.to_string()));
        }
        let (tx, rx) = channel::bounded(max_messages.max(1));
        let queue = Arc::new(MemoryQueue {
            name: name.to_string(),
            max_size,
            tx,
            rx,
        });
        queues.insert(name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    fn open(&self, name: &str) -> Result<Arc<dyn MessageQueue>, QueueError> {
        self.queues()
            .get(name)
            .cloned()
            .map(|q| q as Arc<dyn MessageQueue>)
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }

    fn remove(&self, name: &str) -> Result<(), QueueError> {
        self.queues()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotFound(name.to_string()))
    }
}

// ===== Cross-process backend =====

#[cfg(unix)]
pub use self::unix::DatagramNamespace;

#[cfg(unix)]
mod unix {
    use super::{MessageQueue, QueueError, QueueNamespace};
    use std::io::ErrorKind;
    use std::os::unix::net::UnixDatagram;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    /// Queue owned by its creator: bound socket that receives records
    struct BoundQueue {
        name: String,
        max_size: usize,
        socket: UnixDatagram,
    }

    /// Queue opened by a sender: unbound socket addressed at the owner's path
    struct ConnectedQueue {
        name: String,
        path: PathBuf,
        socket: UnixDatagram,
    }

    fn send_to(socket: &UnixDatagram, name: &str, path: &Path, record: &[u8]) -> Result<(), QueueError> {
        match socket.send_to(record, path) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(QueueError::Full(name.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound || e.kind() == ErrorKind::ConnectionRefused => {
                Err(QueueError::Closed(name.to_string()))
            }
            Err(e) => Err(QueueError::Io(e)),
        }
    }

    impl MessageQueue for BoundQueue {
        fn name(&self) -> &str {
            &self.name
        }

        fn send(&self, record: &[u8]) -> Result<(), QueueError> {
            if record.len() > self.max_size {
                return Err(QueueError::TooLarge {
                    size: record.len(),
                    max: self.max_size,
                });
            }
            let path = self
                .socket
                .local_addr()?
                .as_pathname()
                .map(Path::to_path_buf)
                .ok_or_else(|| QueueError::Closed(self.name.clone()))?;
            let sender = UnixDatagram::unbound()?;
            send_to(&sender, &self.name, &path, record)
        }

        fn timed_receive(&self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, QueueError> {
            // zero read timeouts are rejected by the socket
            self.socket
                .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
            match self.socket.recv(buf) {
                Ok(len) => Ok(Some(len)),
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                    Ok(None)
                }
                Err(e) => Err(QueueError::Io(e)),
            }
        }
    }

    impl MessageQueue for ConnectedQueue {
        fn name(&self) -> &str {
            &self.name
        }

        fn send(&self, record: &[u8]) -> Result<(), QueueError> {
            send_to(&self.socket, &self.name, &self.path, record)
        }

        fn timed_receive(&self, _buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, QueueError> {
            // send-only handle
            std::thread::sleep(timeout);
            Ok(None)
        }
    }

    /// Queues as datagram sockets under one directory
    #[derive(Clone, Debug)]
    pub struct DatagramNamespace {
        dir: PathBuf,
    }

    impl DatagramNamespace {
        pub fn new(dir: impl Into<PathBuf>) -> Result<Self, QueueError> {
            let dir = dir.into();
            std::fs::create_dir_all(&dir)?;
            Ok(Self { dir })
        }

        pub fn path_of(&self, name: &str) -> PathBuf {
            self.dir.join(format!("{}.sock", name))
        }
    }

    impl QueueNamespace for DatagramNamespace {
        fn create(
            &self,
            name: &str,
            _max_messages: usize,
            max_size: usize,
        ) -> Result<Arc<dyn MessageQueue>, QueueError> {
            let path = self.path_of(name);
            if path.exists() {
                // a live owner answers; a stale socket file is reclaimed
                let liveness = UnixDatagram::unbound()?;
                if liveness.connect(&path).is_ok() {
                    return Err(QueueError::AlreadyExists(name.to_string()));
                }
                log::warn!("Removing stale queue socket {}", path.display());
                std::fs::remove_file(&path)?;
            }
            let socket = UnixDatagram::bind(&path)?;
            Ok(Arc::new(BoundQueue {
                name: name.to_string(),
                max_size,
                socket,
            }))
        }

        fn open(&self, name: &str) -> Result<Arc<dyn MessageQueue>, QueueError> {
            let path = self.path_of(name);
            if !path.exists() {
                return Err(QueueError::NotFound(name.to_string()));
            }
            let socket = UnixDatagram::unbound()?;
            socket.set_nonblocking(true)?;
            Ok(Arc::new(ConnectedQueue {
                name: name.to_string(),
                path,
                socket,
            }))
        }

        fn remove(&self, name: &str) -> Result<(), QueueError> {
            match std::fs::remove_file(self.path_of(name)) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Err(QueueError::NotFound(name.to_string())),
                Err(e) => Err(QueueError::Io(e)),
            }
        }
    }
}

/// Namespace for cross-process use on this platform
#[cfg(unix)]
pub fn default_namespace(dir: &std::path::Path) -> Result<Arc<dyn QueueNamespace>, QueueError> {
    Ok(Arc::new(DatagramNamespace::new(dir)?))
}

#[cfg(not(unix))]
pub fn default_namespace(_dir: &std::path::Path) -> Result<Arc<dyn QueueNamespace>, QueueError> {
    log::warn!("No cross-process queue backend on this platform, using in-process queues");
    Ok(Arc::new(MemoryNamespace::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_queue_send_receive() {
        let ns = MemoryNamespace::new();
        let owner = ns.create("q", 4, 8).unwrap();
        let sender = ns.open("q").unwrap();
        sender.send(&[1, 2, 3]).unwrap();

        let mut buf = [0u8; 8];
        let len = owner.timed_receive(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(len, Some(3));
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(owner.timed_receive(&mut buf, Duration::from_millis(5)).unwrap(), None);
    }

    #[test]
    fn test_memory_queue_limits() {
        let ns = MemoryNamespace::new();
        let queue = ns.create("q", 1, 4).unwrap();
        assert!(matches!(queue.send(&[0; 5]), Err(QueueError::TooLarge { size: 5, max: 4 })));
        queue.send(&[0; 4]).unwrap();
        assert!(matches!(queue.send(&[0; 4]), Err(QueueError::Full(_))));
        assert!(matches!(ns.create("q", 1, 4), Err(QueueError::AlreadyExists(_))));
    }

    #[test]
    fn test_memory_queue_remove() {
        let ns = MemoryNamespace::new();
        ns.create("q", 1, 4).unwrap();
        ns.remove("q").unwrap();
        assert!(matches!(ns.open("q"), Err(QueueError::NotFound(_))));
        assert!(matches!(ns.remove("q"), Err(QueueError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_datagram_queue_preserves_records() {
        let dir = std::env::temp_dir().join(format!("mocomp_queue_test_{}", std::process::id()));
        let ns = DatagramNamespace::new(&dir).unwrap();
        let owner = ns.create("records", 10, 32).unwrap();
        let sender = ns.open("records").unwrap();
        sender.send(&[7u8; 32]).unwrap();
        sender.send(&[9u8; 5]).unwrap();

        let mut buf = [0u8; 64];
        assert_eq!(owner.timed_receive(&mut buf, Duration::from_millis(100)).unwrap(), Some(32));
        assert_eq!(owner.timed_receive(&mut buf, Duration::from_millis(100)).unwrap(), Some(5));
        assert_eq!(&buf[..5], &[9u8; 5]);
        assert_eq!(owner.timed_receive(&mut buf, Duration::from_millis(10)).unwrap(), None);

        ns.remove("records").unwrap();
        assert!(matches!(ns.open("records"), Err(QueueError::NotFound(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
