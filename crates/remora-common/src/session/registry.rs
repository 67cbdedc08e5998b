use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use super::receiver::{BlobReader, ReceiverSession};
use super::sender::SenderSession;
use super::source::BlobSource;
use super::{BlobSession, ScmSink, Teardown};
use crate::protocol::{sha256_hex, BlobSessionRef, RemoraError, Result, SessionControlMessage};

/// Length of a session key in hex characters.
const KEY_LENGTH: usize = 32;

/// Per-connection table of live blob sessions, keyed by session key.
///
/// Cloning yields another handle to the same table. A session removes itself
/// when it finishes; [`abort_all`](Self::abort_all) ends whatever is left
/// when the connection goes away.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    sessions: Mutex<HashMap<String, Arc<dyn BlobSession>>>,
    counter: AtomicU64,
    chunk_size: usize,
}

impl RegistryInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn BlobSession>>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn remove(&self, key: &str) {
        if self.lock().remove(key).is_some() {
            tracing::debug!("blob session {} removed", key);
        }
    }
}

impl SessionRegistry {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                counter: AtomicU64::new(0),
                chunk_size,
            }),
        }
    }

    /// A fresh key: hashed time, random id and a per-registry counter.
    pub fn generate_key(&self) -> String {
        loop {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or_default();
            let count = self.inner.counter.fetch_add(1, Ordering::Relaxed);
            let seed = format!("{}:{}:{}", nanos, uuid::Uuid::new_v4(), count);
            let key = sha256_hex(seed.as_bytes())[..KEY_LENGTH].to_string();
            if !self.contains(&key) {
                return key;
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn teardown(&self, key: &str) -> Teardown {
        Teardown {
            registry: Arc::downgrade(&self.inner),
            key: key.to_string(),
        }
    }

    /// Inserts a session. On a key collision the existing session is kept.
    fn register(&self, session: Arc<dyn BlobSession>) -> Result<()> {
        let mut sessions = self.inner.lock();
        let key = session.key().to_string();
        if sessions.contains_key(&key) {
            tracing::warn!("blob session key collision on {}, keeping the existing session", key);
            return Err(RemoraError::InvalidRequest(format!(
                "blob session {} is already registered",
                key
            )));
        }
        sessions.insert(key, session);
        Ok(())
    }

    /// Registers the sending side of `source`. Nothing is sent until the
    /// peer acknowledges the returned session.
    pub fn start_sender(&self, source: BlobSource, sink: Arc<dyn ScmSink>) -> Result<BlobSessionRef> {
        let key = self.generate_key();
        let (mime, producer, on_error) = source.into_parts();
        let session = SenderSession::new(
            key.clone(),
            producer,
            on_error,
            sink,
            self.inner.chunk_size,
            self.teardown(&key),
        );
        self.register(Arc::new(session))?;
        tracing::debug!("blob sender {} registered ({})", key, mime);
        Ok(BlobSessionRef { key, mime })
    }

    /// Registers the receiving side of a session announced by the peer and
    /// sends `ACK`.
    pub async fn start_receiver(
        &self,
        reference: &BlobSessionRef,
        sink: Arc<dyn ScmSink>,
    ) -> Result<BlobReader> {
        let (session, reader) = ReceiverSession::new(
            reference.key.clone(),
            reference.mime.clone(),
            sink,
            self.teardown(&reference.key),
        );
        let session = Arc::new(session);
        self.register(session.clone())?;

        if let Err(e) = session.open().await {
            self.inner.remove(&reference.key);
            return Err(e);
        }
        tracing::debug!("blob receiver {} opened", reference.key);
        Ok(reader)
    }

    /// Hands a control message (and its raw chunk frame) to its session.
    pub async fn route(&self, scm: SessionControlMessage, chunk: Option<Vec<u8>>) {
        let session = self.inner.lock().get(&scm.key).cloned();
        match session {
            Some(session) => session.on_scm(scm, chunk).await,
            None => tracing::warn!("{:?} for unknown blob session {}", scm.command, scm.key),
        }
    }

    /// Ends one session, if it is still live.
    pub fn abort(&self, key: &str) {
        let session = self.inner.lock().remove(key);
        if let Some(session) = session {
            session.abort();
        }
    }

    /// Ends every live session.
    pub fn abort_all(&self) {
        let sessions: Vec<_> = self.inner.lock().drain().map(|(_, s)| s).collect();
        if !sessions.is_empty() {
            tracing::debug!("aborting {} blob sessions", sessions.len());
        }
        for session in sessions {
            session.abort();
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .finish()
    }
}
