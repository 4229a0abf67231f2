use std::{
    hash::{Hash, Hasher},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

use crate::{cert::Certificate, cert::VERIFY_OK, cipher::CipherSuite, ProtocolVersion};

/// Longest session id, in bytes.
pub const MAX_SESSION_ID_LENGTH: usize = 32;
/// Session id length used by SSLv2.
pub const SSL2_SESSION_ID_LENGTH: usize = 16;
/// Longest session id context, in bytes.
pub const MAX_SID_CTX_LENGTH: usize = 32;

/// Seconds since the epoch.
pub(crate) fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// A session id or session id context: up to 32 bytes with an explicit
/// length.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionId {
    len: u8,
    bytes: [u8; MAX_SESSION_ID_LENGTH],
}

impl SessionId {
    /// An empty id
    pub const EMPTY: Self = Self {
        len: 0,
        bytes: [0; MAX_SESSION_ID_LENGTH],
    };

    /// `None` if `id` is longer than 32 bytes
    pub fn new(id: &[u8]) -> Option<Self> {
        if id.len() > MAX_SESSION_ID_LENGTH {
            return None;
        }
        let mut bytes = [0; MAX_SESSION_ID_LENGTH];
        bytes[..id.len()].copy_from_slice(id);
        Some(Self {
            len: id.len() as u8,
            bytes,
        })
    }

    /// The id bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Zero length
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The cache hash: the first four bytes, little endian. Shorter ids
    /// are zero padded.
    pub fn hash_prefix(&self) -> u32 {
        u32::from_le_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// The identity under which a session is cached: version and id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SessionKey {
    pub(crate) version: ProtocolVersion,
    pub(crate) id: SessionId,
}

// Only the id prefix is hashed; equality still compares the whole key.
impl Hash for SessionKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.id.hash_prefix());
    }
}

#[derive(Debug)]
struct SessionInner {
    version: ProtocolVersion,
    id: SessionId,
    sid_ctx: SessionId,
    master_key: Bytes,
    cipher: &'static CipherSuite,
    peer_chain: Vec<Certificate>,
    verify_result: i64,
    server_name: Option<String>,
    ticket: Option<Bytes>,
    time: u64,
    timeout: u64,
}

/// A resumable session.
///
/// Cloning takes another reference; the record is released when the last
/// reference, held by the cache or by a connection or by the application,
/// goes away.
#[derive(Clone, Debug)]
pub struct Session(Arc<SessionInner>);

impl Session {
    /// Protocol version
    pub fn version(&self) -> ProtocolVersion {
        self.0.version
    }

    /// Session id
    pub fn id(&self) -> &SessionId {
        &self.0.id
    }

    /// The session id context the session was established under
    pub fn sid_ctx(&self) -> &SessionId {
        &self.0.sid_ctx
    }

    /// Master secret
    pub fn master_key(&self) -> &Bytes {
        &self.0.master_key
    }

    /// Negotiated cipher suite
    pub fn cipher(&self) -> &'static CipherSuite {
        self.0.cipher
    }

    /// The peer's certificate
    pub fn peer_certificate(&self) -> Option<&Certificate> {
        self.0.peer_chain.first()
    }

    /// The peer's certificate chain, leaf first
    pub fn peer_cert_chain(&self) -> &[Certificate] {
        &self.0.peer_chain
    }

    /// Outcome of the peer certificate verification
    pub fn verify_result(&self) -> i64 {
        self.0.verify_result
    }

    /// Server name requested when the session was established
    pub fn server_name(&self) -> Option<&str> {
        self.0.server_name.as_deref()
    }

    /// Opaque session ticket
    pub fn ticket(&self) -> Option<&Bytes> {
        self.0.ticket.as_ref()
    }

    /// Creation time, seconds since the epoch
    pub fn time(&self) -> u64 {
        self.0.time
    }

    /// Lifetime in seconds
    pub fn timeout(&self) -> u64 {
        self.0.timeout
    }

    /// Expiry time, seconds since the epoch
    pub fn expiry(&self) -> u64 {
        self.0.time.saturating_add(self.0.timeout)
    }

    /// Expired at `t`
    pub fn is_expired(&self, t: u64) -> bool {
        self.expiry() < t
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles refer to the same record
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// A builder preloaded with this session's fields
    pub fn to_builder(&self) -> SessionBuilder {
        SessionBuilder {
            version: self.0.version,
            id: self.0.id,
            sid_ctx: self.0.sid_ctx,
            master_key: self.0.master_key.clone(),
            cipher: self.0.cipher,
            peer_chain: self.0.peer_chain.clone(),
            verify_result: self.0.verify_result,
            server_name: self.0.server_name.clone(),
            ticket: self.0.ticket.clone(),
            time: Some(self.0.time),
            timeout: self.0.timeout,
        }
    }

    pub(crate) fn key(&self) -> SessionKey {
        SessionKey {
            version: self.0.version,
            id: self.0.id,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.0.version == other.0.version && self.0.id == other.0.id
    }
}

impl Eq for Session {}

/// Assembles a [`Session`].
#[derive(Clone, Debug)]
pub struct SessionBuilder {
    version: ProtocolVersion,
    id: SessionId,
    sid_ctx: SessionId,
    master_key: Bytes,
    cipher: &'static CipherSuite,
    peer_chain: Vec<Certificate>,
    verify_result: i64,
    server_name: Option<String>,
    ticket: Option<Bytes>,
    time: Option<u64>,
    timeout: u64,
}

impl SessionBuilder {
    /// Starts a session for `version` and `cipher`
    pub fn new(version: ProtocolVersion, cipher: &'static CipherSuite) -> Self {
        Self {
            version,
            id: SessionId::EMPTY,
            sid_ctx: SessionId::EMPTY,
            master_key: Bytes::new(),
            cipher,
            peer_chain: Vec::new(),
            verify_result: VERIFY_OK,
            server_name: None,
            ticket: None,
            time: None,
            timeout: 0,
        }
    }

    /// Sets the session id
    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    /// Sets the session id context
    pub fn with_sid_ctx(mut self, sid_ctx: SessionId) -> Self {
        self.sid_ctx = sid_ctx;
        self
    }

    /// Sets the master secret
    pub fn with_master_key(mut self, key: Bytes) -> Self {
        self.master_key = key;
        self
    }

    /// Sets the cipher suite
    pub fn with_cipher(mut self, cipher: &'static CipherSuite) -> Self {
        self.cipher = cipher;
        self
    }

    /// Sets the peer certificate chain
    pub fn with_peer_chain(mut self, chain: Vec<Certificate>) -> Self {
        self.peer_chain = chain;
        self
    }

    /// Sets the verify result
    pub fn with_verify_result(mut self, result: i64) -> Self {
        self.verify_result = result;
        self
    }

    /// Sets the server name
    pub fn with_server_name(mut self, name: Option<String>) -> Self {
        self.server_name = name;
        self
    }

    /// Sets the ticket
    pub fn with_ticket(mut self, ticket: Bytes) -> Self {
        self.ticket = Some(ticket);
        self
    }

    /// Sets the creation time; defaults to now
    pub fn with_time(mut self, time: u64) -> Self {
        self.time = Some(time);
        self
    }

    /// Sets the lifetime in seconds
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = timeout;
        self
    }

    /// Finishes the session
    pub fn build(self) -> Session {
        Session(Arc::new(SessionInner {
            version: self.version,
            id: self.id,
            sid_ctx: self.sid_ctx,
            master_key: self.master_key,
            cipher: self.cipher,
            peer_chain: self.peer_chain,
            verify_result: self.verify_result,
            server_name: self.server_name,
            ticket: self.ticket,
            time: self.time.unwrap_or_else(now),
            timeout: self.timeout,
        }))
    }
}
