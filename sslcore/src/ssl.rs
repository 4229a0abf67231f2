use crate::{
    bio::Bios,
    cache::{SessionCacheMode, Stat},
    callback::{
        DuplicateIO, GenerateSessionIdCallback, IOCallbacks, InfoCallback, InfoEvent, MsgCallback,
        RetryReason, VerifyCallback,
    },
    cert::{CertSet, Certificate, VERIFY_OK},
    cipher::{put_cipher_code, CipherList, CipherSuite, FALLBACK_SCSV, RENEGOTIATION_SCSV},
    context::Context,
    ctrl::{self, to_flags, CallbackCtrl, Mode, Options},
    error::{AlertDescription, Error, ErrorKind, Poll, PollResult, Result, SslError},
    method::{fill_random, step_name, CipherState, RecordLayer, DTLS_MIN_MTU},
    session::{now, Session, SessionId, MAX_SESSION_ID_LENGTH, SSL2_SESSION_ID_LENGTH},
    Method, ProtocolVersion, Role, SslVerifyMode,
};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use std::{
    ops::{Deref, DerefMut},
    sync::Arc,
};

/// Attempts at drawing a random session id that is not in the cache yet.
const MAX_SESSION_ID_ATTEMPTS: usize = 10;

bitflags::bitflags! {
    /// Which close notify alerts have been exchanged.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ShutdownFlags: u8 {
        /// We sent a close notify
        const SENT = 1;
        /// The peer sent a close notify
        const RECEIVED = 2;
    }
}

/// Where a connection is in its handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    /// No handshake has run since creation or the last clear
    Before(Role),
    /// A renegotiation was requested and starts with the next handshake
    /// call
    Renegotiate,
    /// Client handshake in progress, at the given step
    Connect(u16),
    /// Server handshake in progress, at the given step
    Accept(u16),
    /// Handshake complete
    Ok,
}

/// The I/O direction a connection is blocked on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Want {
    /// Not blocked
    #[default]
    Nothing,
    /// Waiting for the transport to deliver bytes
    Reading,
    /// Waiting for the transport to take bytes
    Writing,
    /// Waiting for the client certificate callback
    X509Lookup,
}

/// Stores configurations we want to initialize a [`Connection`] with.
pub struct ConnectionConfig<IO: IOCallbacks> {
    /// I/O callback handlers
    pub io: IO,
    /// Separate transport for outgoing records. When unset, `io` is used
    /// in both directions.
    pub write_io: Option<IO>,
    /// If set, the server name a client asks for.
    pub server_name_indicator: Option<String>,
    /// SSL Verify mode, overriding the context's.
    pub ssl_verify_mode: Option<SslVerifyMode>,
    /// Session to offer for resumption.
    pub session: Option<Session>,
    /// If set and the connection is datagram based, sets its MTU.
    ///
    /// Values below the minimum datagram MTU are ignored.
    pub dtls_mtu: Option<u16>,
    /// Cipher rule replacing the context's list for this connection.
    pub cipher_list: Option<String>,
}

impl<IO: IOCallbacks> ConnectionConfig<IO> {
    /// Creates a default [`Self`]. A set of IO callbacks implementing
    /// [`IOCallbacks`] must be provided.
    pub fn new(io: IO) -> Self {
        Self {
            io,
            write_io: Default::default(),
            server_name_indicator: Default::default(),
            ssl_verify_mode: Default::default(),
            session: Default::default(),
            dtls_mtu: Default::default(),
            cipher_list: Default::default(),
        }
    }

    /// When `cond` is True call `func` on `Self`
    pub fn when<F>(self, cond: bool, func: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        if cond {
            func(self)
        } else {
            self
        }
    }

    /// When `maybe` is Some(_) call `func` on `Self` and the contained value
    pub fn when_some<F, T>(self, maybe: Option<T>, func: F) -> Self
    where
        F: FnOnce(Self, T) -> Self,
    {
        if let Some(t) = maybe {
            func(self, t)
        } else {
            self
        }
    }

    /// Sets [`Self::write_io`]
    pub fn with_write_io(mut self, io: IO) -> Self {
        self.write_io = Some(io);
        self
    }

    /// Sets [`Self::server_name_indicator`]
    pub fn with_sni(mut self, hostname: &str) -> Self {
        self.server_name_indicator = Some(hostname.to_string());
        self
    }

    /// Sets [`Self::ssl_verify_mode`]
    pub fn with_ssl_verify_mode(mut self, mode: SslVerifyMode) -> Self {
        self.ssl_verify_mode = Some(mode);
        self
    }

    /// Sets [`Self::session`]
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Sets [`Self::dtls_mtu`]
    pub fn with_dtls_mtu(mut self, mtu: u16) -> Self {
        self.dtls_mtu = Some(mtu);
        self
    }

    /// Sets [`Self::cipher_list`]
    pub fn with_cipher_list(mut self, rule: &str) -> Self {
        self.cipher_list = Some(rule.to_string());
        self
    }
}

/// Error creating a [`Connection`] object.
#[derive(Error, Debug)]
pub enum NewConnectionError {
    /// The protocol method could not set up its per-connection state
    #[error("Failed to allocate connection")]
    CreateFailed,

    /// A setup operation on the new connection
    #[error("Failed to setup connection: {0}: {1}")]
    SetupFailed(&'static str, Error),
}

/// Everything a connection knows apart from its transport.
///
/// This is what callbacks get to see, and what the protocol methods
/// operate on. [`Connection`] dereferences to it.
pub struct ConnectionState {
    pub(crate) method: Method,
    pub(crate) ctx: Context,
    pub(crate) initial_ctx: Context,
    pub(crate) handshake_func: Option<Role>,
    pub(crate) server: bool,
    pub(crate) state: HandshakeState,
    pub(crate) rwstate: Want,
    pub(crate) in_handshake: u32,
    pub(crate) version: ProtocolVersion,
    pub(crate) client_version: u16,
    pub(crate) options: Options,
    pub(crate) mode: Mode,
    pub(crate) read_ahead: bool,
    pub(crate) max_cert_list: i64,
    pub(crate) mtu: u64,
    pub(crate) quiet_shutdown: bool,
    pub(crate) shutdown: ShutdownFlags,
    pub(crate) hit: bool,
    pub(crate) new_session: bool,
    pub(crate) error: Option<ErrorKind>,

    pub(crate) cert: Arc<CertSet>,
    pub(crate) verify_mode: SslVerifyMode,
    pub(crate) verify_depth: u32,
    pub(crate) verify_callback: Option<VerifyCallback>,
    pub(crate) verify_result: i64,

    pub(crate) sid_ctx: SessionId,
    pub(crate) session: Option<Session>,
    pub(crate) server_name: Option<String>,
    pub(crate) cipher_list: Option<CipherList>,
    pub(crate) peer_ciphers: Option<CipherList>,

    pub(crate) msg_callback: Option<MsgCallback>,
    pub(crate) msg_callback_arg: i64,
    pub(crate) info_callback: Option<InfoCallback>,
    pub(crate) generate_session_id: Option<GenerateSessionIdCallback>,

    pub(crate) enc_read: Option<CipherState>,
    pub(crate) enc_write: Option<CipherState>,
    pub(crate) s3: RecordLayer,
}

impl ConnectionState {
    /// Inherits the context's settings. The role is guessed from the
    /// method until `set_connect_state` or `set_accept_state` is called.
    fn new(ctx: &Context) -> std::result::Result<Self, NewConnectionError> {
        let method = ctx.method();
        let role = if method.can_accept() {
            Role::Server
        } else {
            Role::Client
        };

        let mut s = {
            let cfg = ctx.config();
            Self {
                method,
                ctx: ctx.clone(),
                initial_ctx: ctx.clone(),
                handshake_func: None,
                server: role == Role::Server,
                state: HandshakeState::Before(role),
                rwstate: Want::Nothing,
                in_handshake: 0,
                version: method.version(),
                client_version: method.version().wire(),
                options: cfg.options,
                mode: cfg.mode,
                read_ahead: cfg.read_ahead,
                max_cert_list: cfg.max_cert_list,
                mtu: 0,
                quiet_shutdown: cfg.quiet_shutdown,
                shutdown: ShutdownFlags::empty(),
                hit: false,
                new_session: false,
                error: None,
                cert: Arc::new(cfg.cert.clone()),
                verify_mode: cfg.verify_mode,
                verify_depth: cfg.verify_depth,
                verify_callback: cfg.verify_callback.clone(),
                verify_result: VERIFY_OK,
                sid_ctx: cfg.sid_ctx,
                session: None,
                server_name: None,
                cipher_list: None,
                peer_ciphers: None,
                msg_callback: cfg.msg_callback.clone(),
                msg_callback_arg: cfg.msg_callback_arg,
                info_callback: None,
                generate_session_id: cfg.generate_session_id.clone(),
                enc_read: None,
                enc_write: None,
                s3: RecordLayer::default(),
            }
        };

        if !method.table().new(&mut s) {
            return Err(NewConnectionError::CreateFailed);
        }
        Ok(s)
    }

    fn set_role(&mut self, role: Role) {
        self.server = role == Role::Server;
        self.shutdown = ShutdownFlags::empty();
        self.state = HandshakeState::Before(role);
        self.handshake_func = Some(role);
        self.enc_read = None;
        self.enc_write = None;
    }

    /// Makes this connection the client side of the next handshake.
    pub fn set_connect_state(&mut self) {
        self.set_role(Role::Client)
    }

    /// Makes this connection the server side of the next handshake.
    pub fn set_accept_state(&mut self) {
        self.set_role(Role::Server)
    }

    /// Whether the connection acts as a server
    pub fn is_server(&self) -> bool {
        self.server
    }

    /// Asks for a new handshake on an established connection. It starts
    /// with the next read, write or handshake call.
    pub fn renegotiate(&mut self) -> i32 {
        self.s3.renegotiate = true;
        self.new_session = true;
        self.method.table().renegotiate(self)
    }

    /// Whether the peer supports secure renegotiation.
    pub fn is_secure_renegotiation_supported(&self) -> bool {
        self.s3.send_connection_binding
    }

    /// Whether a renegotiation has been requested or is running.
    pub fn renegotiate_pending(&self) -> bool {
        self.s3.renegotiate || self.new_session
    }

    /// Number of renegotiations started since the counter was last reset
    pub fn num_renegotiations(&self) -> u64 {
        self.s3.num_renegotiations
    }

    /// Resets the renegotiation counter, returning its previous value
    pub fn clear_num_renegotiations(&mut self) -> u64 {
        std::mem::take(&mut self.s3.num_renegotiations)
    }

    /// Number of renegotiations over the lifetime of the connection
    pub fn total_renegotiations(&self) -> u64 {
        self.s3.total_renegotiations
    }

    /// Forgets the current session and prepares the connection for a new
    /// handshake with the same settings.
    pub fn clear(&mut self) -> Result<()> {
        if self.clear_bad_session() {
            self.session = None;
        }
        self.error = None;
        self.hit = false;
        self.shutdown = ShutdownFlags::empty();

        if self.new_session {
            return Err(Error::fatal(ErrorKind::InternalError(
                "clear during renegotiation",
            )));
        }

        let role = if self.server { Role::Server } else { Role::Client };
        self.state = HandshakeState::Before(role);
        self.version = self.method.version();
        self.client_version = self.version.wire();
        self.rwstate = Want::Nothing;
        self.enc_read = None;
        self.enc_write = None;

        let ctx_method = self.ctx.method();
        if self.in_handshake == 0 && self.session.is_none() && self.method != ctx_method {
            self.method.table().free(self);
            self.method = ctx_method;
            if !ctx_method.table().new(self) {
                return Err(Error::fatal(ErrorKind::InternalError("method setup failed")));
            }
        } else {
            self.method.table().clear(self);
        }
        Ok(())
    }

    /// A session that was not shut down properly cannot be resumed: drop
    /// it from the cache. Returns whether it was removed.
    pub(crate) fn clear_bad_session(&mut self) -> bool {
        match &self.session {
            Some(session) if !self.shutdown.contains(ShutdownFlags::SENT) && !self.in_init() => {
                log::debug!("Removing session that was not shut down cleanly");
                self.initial_ctx.remove_session(session);
                true
            }
            _ => false,
        }
    }

    /// Replaces the protocol method, resetting the per-version state when
    /// the version changes.
    pub fn set_ssl_method(&mut self, method: Method) -> Result<()> {
        if method == self.method {
            return Ok(());
        }
        if method.version() == self.method.version() {
            self.method = method;
            return Ok(());
        }
        self.method.table().free(self);
        self.method = method;
        if !method.table().new(self) {
            return Err(Error::fatal(ErrorKind::InternalError("method setup failed")));
        }
        Ok(())
    }

    /// The protocol method in use
    pub fn get_ssl_method(&self) -> Method {
        self.method
    }

    /// Offers `session` for resumption on the next handshake, switching to
    /// the method of the session's version. `None` drops the current
    /// session and reverts to the context's method.
    pub fn set_session(&mut self, session: Option<Session>) -> Result<()> {
        match session {
            Some(session) => {
                let method = self
                    .ctx
                    .method()
                    .for_version(session.version())
                    .or_else(|| self.method.for_version(session.version()))
                    .ok_or(Error::fatal(ErrorKind::UnableToFindSslMethod))?;
                self.set_ssl_method(method)?;
                self.verify_result = session.verify_result();
                self.session = Some(session);
            }
            None => {
                self.session = None;
                self.set_ssl_method(self.ctx.method())?;
            }
        }
        Ok(())
    }

    /// The current session, if any.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Another reference to the current session.
    pub fn get1_session(&self) -> Option<Session> {
        self.session.clone()
    }

    /// Whether the last handshake resumed a session
    pub fn session_reused(&self) -> bool {
        self.hit
    }

    /// Starts a fresh session for a full handshake. Servers also pick its
    /// id here.
    pub(crate) fn get_new_session(&mut self, server: bool) -> std::result::Result<(), ErrorKind> {
        let timeout = match self.initial_ctx.timeout() {
            0 => self.method.table().get_timeout(),
            t => t,
        };
        self.session = None;
        self.s3.tmp.session_time = now();
        self.s3.tmp.session_timeout = timeout;
        self.verify_result = VERIFY_OK;

        self.s3.tmp.session_id = if server {
            self.generate_session_id()?
        } else {
            SessionId::EMPTY
        };
        Ok(())
    }

    fn generate_session_id(&self) -> std::result::Result<SessionId, ErrorKind> {
        let len = if self.version == ProtocolVersion::SslV2 {
            SSL2_SESSION_ID_LENGTH
        } else {
            MAX_SESSION_ID_LENGTH
        };
        let cb = self
            .generate_session_id
            .clone()
            .or_else(|| self.initial_ctx.config().generate_session_id.clone());

        let mut buf = [0u8; MAX_SESSION_ID_LENGTH];
        let id = match cb {
            Some(cb) => {
                let n = cb(self, &mut buf[..len]).ok_or(ErrorKind::SessionIdCallbackFailed)?;
                if n == 0 || n > len {
                    return Err(ErrorKind::SessionIdHasBadLength);
                }
                let n = if self.version == ProtocolVersion::SslV2 {
                    buf[n..len].fill(0);
                    len
                } else {
                    n
                };
                SessionId::new(&buf[..n]).ok_or(ErrorKind::SessionIdHasBadLength)?
            }
            None => {
                let mut attempts = 0;
                loop {
                    fill_random(&mut buf[..len])?;
                    let id = SessionId::new(&buf[..len]).ok_or(ErrorKind::InternalError("id length"))?;
                    if !self.has_matching_session_id(id.as_bytes()) {
                        break id;
                    }
                    attempts += 1;
                    if attempts == MAX_SESSION_ID_ATTEMPTS {
                        return Err(ErrorKind::SessionIdConflict);
                    }
                }
            }
        };

        if self.has_matching_session_id(id.as_bytes()) {
            return Err(ErrorKind::SessionIdConflict);
        }
        Ok(id)
    }

    /// Whether the context's cache already holds a session with `id` for
    /// this connection's version.
    pub fn has_matching_session_id(&self, id: &[u8]) -> bool {
        if id.len() > MAX_SESSION_ID_LENGTH {
            return false;
        }
        let mut padded = [0u8; MAX_SESSION_ID_LENGTH];
        padded[..id.len()].copy_from_slice(id);
        let len = if self.version == ProtocolVersion::SslV2 {
            id.len().max(SSL2_SESSION_ID_LENGTH)
        } else {
            id.len()
        };
        match SessionId::new(&padded[..len]) {
            Some(id) => self.initial_ctx.cache_contains(self.version, &id),
            None => false,
        }
    }

    /// Looks up the session a client asked to resume. `Ok(true)` means it
    /// was found, is usable and is now the connection's session.
    pub(crate) fn get_prev_session(&mut self, id: &[u8]) -> std::result::Result<bool, ErrorKind> {
        if id.is_empty() || id.len() > MAX_SESSION_ID_LENGTH {
            return Ok(false);
        }
        let ctx = self.initial_ctx.clone();
        let mode = ctx.session_cache_mode();

        let mut found = None;
        if !mode.contains(SessionCacheMode::NO_INTERNAL_LOOKUP) {
            found = ctx.lookup_session(self.version, id);
            if found.is_none() {
                ctx.incr(Stat::Misses);
            }
        }

        if found.is_none() {
            let cb = ctx.config().get_session_cb.clone();
            if let Some(cb) = cb {
                found = cb(self, id);
                if let Some(session) = &found {
                    ctx.incr(Stat::CbHit);
                    if !mode.contains(SessionCacheMode::NO_INTERNAL_STORE) {
                        ctx.add_session(session);
                    }
                }
            }
        }

        let Some(session) = found else {
            return Ok(false);
        };

        if session.version() != self.version {
            log::debug!("Cached session is for {}", session.version().as_str());
            return Ok(false);
        }
        if *session.sid_ctx() != self.sid_ctx {
            log::debug!("Cached session belongs to another session id context");
            return Ok(false);
        }
        if self.verify_mode.verifies_peer() && self.sid_ctx.is_empty() {
            // A session without a context could have been verified by
            // anybody.
            return Err(ErrorKind::SessionIdContextUninitialized);
        }
        if session.is_expired(now()) {
            ctx.incr(Stat::Timeouts);
            ctx.remove_session(&session);
            return Ok(false);
        }

        ctx.incr(Stat::Hit);
        self.verify_result = session.verify_result();
        self.session = Some(session);
        Ok(true)
    }

    /// Hands a freshly established session to the cache and the new
    /// session callback, and flushes expired entries every 255 handshakes.
    pub(crate) fn update_cache(&mut self, mode: SessionCacheMode) {
        let Some(session) = self.session.clone() else {
            return;
        };
        if session.id().is_empty() {
            return;
        }

        let ctx = self.initial_ctx.clone();
        let cache_mode = ctx.session_cache_mode();
        if cache_mode.intersects(mode) && !self.hit {
            let stored = cache_mode.contains(SessionCacheMode::NO_INTERNAL_STORE)
                || ctx.add_session(&session);
            if stored {
                let cb = ctx.config().new_session_cb.clone();
                if let Some(cb) = cb {
                    if !cb(self, session.clone()) {
                        log::trace!("New session callback released the session");
                    }
                }
            }
        }

        if !cache_mode.contains(SessionCacheMode::NO_AUTO_CLEAR) && cache_mode.contains(mode) {
            let good = if mode.contains(SessionCacheMode::CLIENT) {
                Stat::ConnectGood
            } else {
                Stat::AcceptGood
            };
            if ctx.stats().get(good) & 0xff == 0xff {
                log::debug!("Flushing expired sessions");
                ctx.flush_sessions(now());
            }
        }
    }

    /// Sets the session id context that cached sessions must match.
    pub fn set_session_id_context(&mut self, sid_ctx: &[u8]) -> Result<()> {
        self.sid_ctx =
            SessionId::new(sid_ctx).ok_or(Error::fatal(ErrorKind::SessionIdContextTooLong))?;
        Ok(())
    }

    /// The session id context
    pub fn session_id_context(&self) -> &[u8] {
        self.sid_ctx.as_bytes()
    }

    /// The context currently used for certificates and settings. Differs
    /// from the one the connection was created with after a server name
    /// callback switched it.
    pub fn get_context(&self) -> &Context {
        &self.ctx
    }

    /// The context the connection was created with. Sessions are cached
    /// there.
    pub fn get_initial_context(&self) -> &Context {
        &self.initial_ctx
    }

    /// Switches to `ctx`, taking over its certificates. `None` switches
    /// back to the context the connection was created with.
    pub fn set_context(&mut self, ctx: Option<&Context>) -> Context {
        let ctx = ctx.cloned().unwrap_or_else(|| self.initial_ctx.clone());
        if self.ctx.ptr_eq(&ctx) {
            return ctx;
        }
        self.cert = Arc::new(ctx.config().cert.clone());
        self.ctx = ctx.clone();
        ctx
    }

    /// Encodes the client's cipher offer into `out`, followed by the
    /// signalling suites. Returns the number of bytes written.
    pub(crate) fn cipher_list_to_bytes(&self, out: &mut BytesMut) -> usize {
        let table = self.method.table();
        let start = out.len();
        let ciphers = self.get_ciphers();
        for cipher in ciphers.iter().filter(|c| c.usable_with(self.version)) {
            table.put_cipher_by_char(cipher, out);
        }
        if out.len() == start {
            return 0;
        }

        let width = table.cipher_code_width();
        if !self.s3.renegotiating {
            put_cipher_code(RENEGOTIATION_SCSV, width, out);
        }
        if self.mode.contains(Mode::SEND_FALLBACK_SCSV) {
            put_cipher_code(FALLBACK_SCSV, width, out);
        }
        out.len() - start
    }

    /// Decodes the cipher list of a client hello. Signalling suites update
    /// the connection instead of appearing in the result, unknown codes
    /// are skipped.
    pub(crate) fn bytes_to_cipher_list(
        &mut self,
        bytes: &[u8],
    ) -> std::result::Result<CipherList, ErrorKind> {
        let table = self.method.table();
        let width = table.cipher_code_width();
        if bytes.len() % width != 0 {
            return Err(ErrorKind::ErrorInReceivedCipherList);
        }

        self.s3.send_connection_binding = false;
        let mut suites = Vec::with_capacity(bytes.len() / width);
        for code in bytes.chunks_exact(width) {
            match crate::cipher::get_cipher_code(code) {
                Some(RENEGOTIATION_SCSV) => {
                    if self.s3.renegotiating {
                        return Err(ErrorKind::ScsvReceivedWhenRenegotiating);
                    }
                    self.s3.send_connection_binding = true;
                }
                Some(FALLBACK_SCSV) => {
                    if !self.check_proto_version() {
                        return Err(ErrorKind::InappropriateFallback);
                    }
                }
                _ => {
                    if let Some(suite) = table.get_cipher_by_char(code) {
                        suites.push(suite);
                    }
                }
            }
        }
        Ok(CipherList::from_suites(suites))
    }

    /// Whether the negotiated version is the best one the context allows.
    fn check_proto_version(&self) -> bool {
        let ctx_method = self.ctx.method();
        if self.version == ctx_method.version() {
            return true;
        }
        if ctx_method.is_flexible() {
            if !self.options.contains(Options::NO_TLSV1) {
                return self.version == ProtocolVersion::TlsV1;
            }
            if !self.options.contains(Options::NO_SSLV3) {
                return self.version == ProtocolVersion::SslV3;
            }
            if !self.options.contains(Options::NO_SSLV2) {
                return self.version == ProtocolVersion::SslV2;
            }
        }
        false
    }

    /// The connection's cipher list, or the context's when none was set.
    pub fn get_ciphers(&self) -> CipherList {
        self.cipher_list
            .clone()
            .unwrap_or_else(|| self.ctx.get_ciphers())
    }

    /// Name of the `n`th cipher in preference order
    pub fn get_cipher_list(&self, n: usize) -> Option<&'static str> {
        self.get_ciphers().get(n).map(|c| c.name)
    }

    /// Replaces the cipher list of this connection.
    pub fn set_cipher_list(&mut self, rule: &str) -> Result<()> {
        self.cipher_list = Some(CipherList::new(rule, self.method.version())?);
        Ok(())
    }

    /// On a server, the names of the ciphers the client offered.
    pub fn get_shared_ciphers(&self) -> Option<String> {
        if !self.server {
            return None;
        }
        self.peer_ciphers.as_ref().map(CipherList::names)
    }

    /// The cipher of the current session
    pub fn get_current_cipher(&self) -> Option<&'static CipherSuite> {
        self.session.as_ref().map(Session::cipher)
    }

    /// Get the current cipher name, if available
    pub fn get_current_cipher_name(&self) -> Option<String> {
        self.get_current_cipher().map(|c| c.name.to_string())
    }

    /// Connection level control commands, see [`crate::ctrl`]. Commands
    /// not handled here go to the protocol method.
    pub fn ctrl(&mut self, cmd: i32, larg: i64) -> i64 {
        match cmd {
            ctrl::GET_READ_AHEAD => self.read_ahead as i64,
            ctrl::SET_READ_AHEAD => std::mem::replace(&mut self.read_ahead, larg != 0) as i64,
            ctrl::SET_MSG_CALLBACK_ARG => {
                self.msg_callback_arg = larg;
                1
            }
            ctrl::OPTIONS => {
                self.options |= Options::from_bits_retain(to_flags(larg));
                self.options.bits() as i64
            }
            ctrl::CLEAR_OPTIONS => {
                self.options &= !Options::from_bits_retain(to_flags(larg));
                self.options.bits() as i64
            }
            ctrl::MODE => {
                self.mode |= Mode::from_bits_retain(to_flags(larg));
                self.mode.bits() as i64
            }
            ctrl::CLEAR_MODE => {
                self.mode &= !Mode::from_bits_retain(to_flags(larg));
                self.mode.bits() as i64
            }
            ctrl::GET_MAX_CERT_LIST => self.max_cert_list,
            ctrl::SET_MAX_CERT_LIST => std::mem::replace(&mut self.max_cert_list, larg),
            ctrl::SET_MTU => self.set_mtu(larg),
            ctrl::GET_RI_SUPPORT => self.s3.send_connection_binding as i64,
            _ => {
                let table = self.method.table();
                table.ctrl(self, cmd, larg)
            }
        }
    }

    fn set_mtu(&mut self, mtu: i64) -> i64 {
        if !self.method.is_dtls() {
            log::warn!("MTU only applies to datagram connections");
            return 0;
        }
        if mtu < DTLS_MIN_MTU as i64 {
            log::warn!("MTU {mtu} is below the minimum of {DTLS_MIN_MTU}");
            return 0;
        }
        self.mtu = mtu as u64;
        mtu
    }

    /// Installs a callback through the control interface.
    pub fn callback_ctrl(&mut self, cb: CallbackCtrl) -> i64 {
        match cb {
            CallbackCtrl::MsgCallback(cb) => {
                self.msg_callback = Some(cb);
                1
            }
            other => {
                let table = self.method.table();
                table.callback_ctrl(Arc::make_mut(&mut self.cert), other)
            }
        }
    }

    /// Reports handshake progress to the connection's info callback, or
    /// the context's.
    pub(crate) fn notify(&self, event: InfoEvent) {
        let cb = self
            .info_callback
            .clone()
            .or_else(|| self.ctx.config().info_callback.clone());
        if let Some(cb) = cb {
            cb(self, event);
        }
    }

    /// Sets the info callback of this connection
    pub fn set_info_callback(&mut self, cb: Option<InfoCallback>) {
        self.info_callback = cb;
    }

    /// Sets the protocol trace callback of this connection
    pub fn set_msg_callback(&mut self, cb: Option<MsgCallback>) {
        self.msg_callback = cb;
    }

    /// Sets the session id generator of this connection
    pub fn set_generate_session_id(&mut self, cb: Option<GenerateSessionIdCallback>) {
        self.generate_session_id = cb;
    }

    /// Sets the peer verification mode and callback.
    pub fn set_verify(&mut self, mode: SslVerifyMode, cb: Option<VerifyCallback>) {
        self.verify_mode = mode;
        if cb.is_some() {
            self.verify_callback = cb;
        }
    }

    /// The peer verification mode
    pub fn verify_mode(&self) -> SslVerifyMode {
        self.verify_mode
    }

    /// Sets the maximum length of the peer's chain
    pub fn set_verify_depth(&mut self, depth: u32) {
        self.verify_depth = depth;
    }

    /// The maximum length of the peer's chain
    pub fn verify_depth(&self) -> u32 {
        self.verify_depth
    }

    /// Result of the last peer chain verification
    pub fn get_verify_result(&self) -> i64 {
        self.verify_result
    }

    /// Overrides the verification result
    pub fn set_verify_result(&mut self, result: i64) {
        self.verify_result = result;
    }

    /// The peer's certificate, from the current session.
    pub fn get_peer_certificate(&self) -> Option<&Certificate> {
        self.session.as_ref().and_then(Session::peer_certificate)
    }

    /// The peer's chain, from the current session.
    pub fn get_peer_cert_chain(&self) -> &[Certificate] {
        self.session
            .as_ref()
            .map(Session::peer_cert_chain)
            .unwrap_or_default()
    }

    /// Sets the server name a client asks for.
    pub fn set_server_name(&mut self, name: Option<String>) {
        self.server_name = name;
    }

    /// The requested server name, falling back to the one stored in the
    /// session.
    pub fn get_servername(&self) -> Option<&str> {
        self.server_name
            .as_deref()
            .or_else(|| self.session.as_ref().and_then(Session::server_name))
    }

    /// Get the protocol version, e.g. `TLSv1`.
    pub fn get_version(&self) -> &'static str {
        self.version.as_str()
    }

    /// The protocol version in use
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The handshake state
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Describes the handshake state
    pub fn state_string(&self) -> &'static str {
        match self.state {
            HandshakeState::Before(_) => "before handshake",
            HandshakeState::Renegotiate => "renegotiate",
            HandshakeState::Connect(step) | HandshakeState::Accept(step) => step_name(step),
            HandshakeState::Ok => "handshake done",
        }
    }

    /// Whether the handshake is complete
    pub fn is_init_finished(&self) -> bool {
        self.state == HandshakeState::Ok
    }

    /// Whether a handshake is needed or running
    pub fn in_init(&self) -> bool {
        self.state != HandshakeState::Ok
    }

    /// Whether no handshake has run yet
    pub fn in_before(&self) -> bool {
        matches!(self.state, HandshakeState::Before(_))
    }

    /// The I/O direction the last operation was blocked on
    pub fn want(&self) -> Want {
        self.rwstate
    }

    /// Decrypted application bytes waiting to be read
    pub fn pending(&self) -> usize {
        self.method.table().pending(self)
    }

    /// Close notify alerts exchanged so far
    pub fn get_shutdown(&self) -> ShutdownFlags {
        self.shutdown
    }

    /// Overrides the close notify bookkeeping
    pub fn set_shutdown(&mut self, flags: ShutdownFlags) {
        self.shutdown = flags;
    }

    /// Whether shutdown skips the close notify exchange
    pub fn get_quiet_shutdown(&self) -> bool {
        self.quiet_shutdown
    }

    /// See [`Self::get_quiet_shutdown`]
    pub fn set_quiet_shutdown(&mut self, quiet: bool) {
        self.quiet_shutdown = quiet;
    }

    /// The options in effect
    pub fn options(&self) -> Options {
        self.options
    }

    /// Adds `options`, returning the result
    pub fn set_options(&mut self, options: Options) -> Options {
        self.options |= options;
        self.options
    }

    /// Removes `options`, returning the result
    pub fn clear_options(&mut self, options: Options) -> Options {
        self.options &= !options;
        self.options
    }

    /// The modes in effect
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Adds `mode`, returning the result
    pub fn set_mode(&mut self, mode: Mode) -> Mode {
        self.mode |= mode;
        self.mode
    }

    /// Removes `mode`, returning the result
    pub fn clear_mode(&mut self, mode: Mode) -> Mode {
        self.mode &= !mode;
        self.mode
    }

    /// Whether the record layer reads more than it needs
    pub fn read_ahead(&self) -> bool {
        self.read_ahead
    }

    /// Default session lifetime of the method in use, in seconds
    pub fn get_default_timeout(&self) -> u64 {
        self.method.table().get_timeout()
    }
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.clear_bad_session();
        self.method.table().free(self);
    }
}

/// One end of an SSL/TLS connection over an [`IOCallbacks`] transport.
pub struct Connection<IO: IOCallbacks> {
    state: ConnectionState,
    bios: Bios<IO>,
}

impl<IO: IOCallbacks> Deref for Connection<IO> {
    type Target = ConnectionState;

    fn deref(&self) -> &ConnectionState {
        &self.state
    }
}

impl<IO: IOCallbacks> DerefMut for Connection<IO> {
    fn deref_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }
}

impl<IO: IOCallbacks> Connection<IO> {
    /// Invokes a new connection based on `ctx`, configured by `config`.
    pub fn new(
        ctx: &Context,
        config: ConnectionConfig<IO>,
    ) -> std::result::Result<Self, NewConnectionError> {
        let state = ConnectionState::new(ctx)?;
        let mut conn = Self {
            state,
            bios: Bios::new(config.io, config.write_io),
        };

        if let Some(name) = config.server_name_indicator {
            conn.state.set_server_name(Some(name));
        }

        if let Some(mode) = config.ssl_verify_mode {
            conn.state.verify_mode = mode;
        }

        if let Some(session) = config.session {
            conn.state
                .set_session(Some(session))
                .map_err(|e| NewConnectionError::SetupFailed("set session", e))?;
        }

        if let Some(mtu) = config.dtls_mtu {
            if conn.state.ctrl(ctrl::SET_MTU, i64::from(mtu)) == 0 {
                log::warn!("Ignoring MTU of {mtu}");
            }
        }

        if let Some(rule) = config.cipher_list {
            conn.state
                .set_cipher_list(&rule)
                .map_err(|e| NewConnectionError::SetupFailed("set cipher list", e))?;
        }

        Ok(conn)
    }

    /// Gets a reference to the IO callbacks
    pub fn io_cb(&self) -> &IO {
        self.bios.rbio().get_ref()
    }

    /// Gets a mutable reference to the IO callbacks
    pub fn io_cb_mut(&mut self) -> &mut IO {
        self.bios.rbio_mut().get_mut()
    }

    fn reset_error(&mut self) {
        self.state.error = None;
        self.state.rwstate = Want::Nothing;
    }

    /// Runs or continues the handshake. Returns `1` once it is complete.
    pub fn do_handshake(&mut self) -> i32 {
        self.reset_error();
        let Some(role) = self.state.handshake_func else {
            self.state.error = Some(ErrorKind::ConnectionTypeNotSet);
            return -1;
        };

        let table = self.state.method.table();
        table.renegotiate_check(&mut self.state);
        if !self.state.in_init() {
            return 1;
        }
        match role {
            Role::Client => table.connect(&mut self.state, &mut self.bios),
            Role::Server => table.accept(&mut self.state, &mut self.bios),
        }
    }

    /// Runs the handshake as a client.
    pub fn connect(&mut self) -> i32 {
        if self.state.handshake_func.is_none() {
            self.state.set_connect_state();
        }
        self.reset_error();
        let table = self.state.method.table();
        table.connect(&mut self.state, &mut self.bios)
    }

    /// Runs the handshake as a server.
    pub fn accept(&mut self) -> i32 {
        if self.state.handshake_func.is_none() {
            self.state.set_accept_state();
        }
        self.reset_error();
        let table = self.state.method.table();
        table.accept(&mut self.state, &mut self.bios)
    }

    fn check_initialized(&mut self) -> bool {
        if self.state.handshake_func.is_none() {
            self.state.error = Some(ErrorKind::Uninitialized);
            return false;
        }
        true
    }

    /// Reads application data into `buf`, running the handshake first if
    /// needed. Returns the number of bytes read, `0` at end of stream or a
    /// negative value, see [`Self::get_error`].
    pub fn read(&mut self, buf: &mut [u8]) -> isize {
        self.reset_error();
        if !self.check_initialized() {
            return -1;
        }
        if self.state.shutdown.contains(ShutdownFlags::RECEIVED) {
            return 0;
        }
        let table = self.state.method.table();
        table.read(&mut self.state, &mut self.bios, buf)
    }

    /// Like [`Self::read`] but leaves the data in place.
    pub fn peek(&mut self, buf: &mut [u8]) -> isize {
        self.reset_error();
        if !self.check_initialized() {
            return -1;
        }
        if self.state.shutdown.contains(ShutdownFlags::RECEIVED) {
            return 0;
        }
        let table = self.state.method.table();
        table.peek(&mut self.state, &mut self.bios, buf)
    }

    /// Writes application data. Unless partial writes are enabled all of
    /// `buf` is written before a positive count is returned.
    pub fn write(&mut self, buf: &[u8]) -> isize {
        self.reset_error();
        if !self.check_initialized() {
            return -1;
        }
        if self.state.shutdown.contains(ShutdownFlags::SENT) {
            self.state.error = Some(ErrorKind::ProtocolIsShutdown);
            return -1;
        }
        let table = self.state.method.table();
        table.write(&mut self.state, &mut self.bios, buf)
    }

    /// Sends our close notify. Returns `1` once both sides closed, `0`
    /// while the peer's close notify is outstanding.
    pub fn shutdown(&mut self) -> i32 {
        self.reset_error();
        if !self.check_initialized() {
            return -1;
        }
        if self.state.in_init() {
            return 1;
        }
        let table = self.state.method.table();
        table.shutdown(&mut self.state, &mut self.bios)
    }

    /// Classifies the return value `ret` of the previous operation.
    pub fn get_error(&self, ret: isize) -> SslError {
        if ret > 0 {
            return SslError::None;
        }
        if let Some(kind) = &self.state.error {
            return if kind.is_system() {
                SslError::Syscall
            } else {
                SslError::Ssl
            };
        }

        if ret < 0 {
            let retry = match self.state.rwstate {
                Want::Reading => self.bios.rbio().retry(),
                Want::Writing => self.bios.wbio().retry(),
                Want::X509Lookup => return SslError::WantX509Lookup,
                Want::Nothing => None,
            };
            match retry {
                Some(RetryReason::Read) => return SslError::WantRead,
                Some(RetryReason::Write) => return SslError::WantWrite,
                Some(RetryReason::Connect) => return SslError::WantConnect,
                Some(RetryReason::Accept) => return SslError::WantAccept,
                Some(RetryReason::Other) => return SslError::Syscall,
                None => {}
            }
        }

        if ret == 0 {
            let closed = self.state.shutdown.contains(ShutdownFlags::RECEIVED)
                && self.state.s3.warn_alert == Some(AlertDescription::CloseNotify);
            if self.state.version == ProtocolVersion::SslV2 || closed {
                return SslError::ZeroReturn;
            }
        }
        SslError::Syscall
    }

    /// Turns a failed operation into a [`Poll`].
    fn poll_error<T>(&mut self, ret: isize) -> PollResult<T> {
        if self.state.error == Some(ErrorKind::AppDataReady) {
            self.state.error = None;
            return self.handle_app_data().map(Poll::AppData);
        }
        match self.get_error(ret) {
            SslError::WantRead | SslError::WantAccept => Ok(Poll::PendingRead),
            SslError::WantWrite | SslError::WantConnect => Ok(Poll::PendingWrite),
            SslError::WantX509Lookup => Ok(Poll::PendingLookup),
            _ => Err(Error::fatal(
                self.state
                    .error
                    .clone()
                    .unwrap_or(ErrorKind::Io(std::io::ErrorKind::UnexpectedEof)),
            )),
        }
    }

    /// Application data that arrived while a renegotiation was in flight.
    fn handle_app_data(&mut self) -> Result<Bytes> {
        let data = self.state.s3.app_buf.split().freeze();
        if data.is_empty() {
            return Err(Error::AppData(ErrorKind::AppDataReady));
        }
        Ok(data)
    }

    /// Invokes the handshake on the connection.
    ///
    /// This is a non-blocking function, so may need to be called
    /// repeatedly until the transport can make progress.
    pub fn try_negotiate(&mut self) -> PollResult<()> {
        match self.do_handshake() {
            1 => Ok(Poll::Ready(())),
            ret => self.poll_error(ret as isize),
        }
    }

    /// Invokes shutdown on the connection.
    ///
    /// Returns `Ready(true)` once the peer's close notify was received as
    /// well, `Ready(false)` after ours was sent.
    pub fn try_shutdown(&mut self) -> PollResult<bool> {
        match self.shutdown() {
            1 => Ok(Poll::Ready(true)),
            0 => Ok(Poll::Ready(false)),
            ret => self.poll_error(ret as isize),
        }
    }

    /// Attempts to write `data_in` to the connection.
    ///
    /// The written bytes are removed from the buffer.
    pub fn try_write(&mut self, data_in: &mut BytesMut) -> PollResult<usize> {
        match self.try_write_slice(data_in) {
            Ok(Poll::Ready(n)) => {
                data_in.advance(n);
                Ok(Poll::Ready(n))
            }
            other => other,
        }
    }

    /// Attempts to write `data_in` to the connection.
    ///
    /// Returns the number of bytes written.
    pub fn try_write_slice(&mut self, data_in: &[u8]) -> PollResult<usize> {
        match self.write(data_in) {
            n if n > 0 => Ok(Poll::Ready(n as usize)),
            0 if data_in.is_empty() && self.state.error.is_none() => Ok(Poll::Ready(0)),
            ret => self.poll_error(ret),
        }
    }

    /// Attempts to read into the spare capacity of `data_out`.
    ///
    /// Never grows the buffer: reserve capacity before calling.
    pub fn try_read(&mut self, data_out: &mut BytesMut) -> PollResult<usize> {
        let start = data_out.len();
        data_out.resize(data_out.capacity(), 0);
        let res = self.try_read_slice(&mut data_out[start..]);
        let read = match &res {
            Ok(Poll::Ready(n)) => *n,
            _ => 0,
        };
        data_out.truncate(start + read);
        res
    }

    /// Attempts to read into `data_out`.
    ///
    /// Returns the number of bytes read, `Ready(0)` once the peer closed
    /// the connection.
    pub fn try_read_slice(&mut self, data_out: &mut [u8]) -> PollResult<usize> {
        match self.read(data_out) {
            n if n > 0 => Ok(Poll::Ready(n as usize)),
            0 if data_out.is_empty() && self.state.error.is_none() => Ok(Poll::Ready(0)),
            0 if self.get_error(0) == SslError::ZeroReturn => Ok(Poll::Ready(0)),
            ret => self.poll_error(ret),
        }
    }

    /// Starts, or continues, a secure renegotiation.
    ///
    /// Does nothing when the peer does not support secure renegotiation.
    /// Application data received meanwhile is handed out as
    /// [`Poll::AppData`].
    pub fn try_rehandshake(&mut self) -> PollResult<()> {
        if !self.state.is_secure_renegotiation_supported() {
            return Ok(Poll::Ready(()));
        }
        if !self.state.s3.renegotiate && !self.state.in_init() {
            self.state.renegotiate();
        }
        self.try_negotiate()
    }
}

impl<IO: DuplicateIO> Connection<IO> {
    /// Creates a second connection with the same settings, session and
    /// handshake state, over a duplicate of the transport.
    pub fn dup(&self) -> std::result::Result<Self, NewConnectionError> {
        let bios = self.bios.duplicate().map_err(|e| {
            NewConnectionError::SetupFailed("duplicate transport", Error::fatal(e.into()))
        })?;

        let src = &self.state;
        let mut s = ConnectionState::new(&src.ctx)?;
        match &src.session {
            Some(session) => {
                s.set_session(Some(session.clone()))
                    .map_err(|e| NewConnectionError::SetupFailed("copy session", e))?;
                s.set_ssl_method(src.method)
                    .map_err(|e| NewConnectionError::SetupFailed("copy method", e))?;
                s.cert = src.cert.clone();
            }
            None => {
                s.set_ssl_method(src.method)
                    .map_err(|e| NewConnectionError::SetupFailed("copy method", e))?;
                s.cert = Arc::new(CertSet::clone(&src.cert));
            }
        }

        s.sid_ctx = src.sid_ctx;
        s.version = src.version;
        s.client_version = src.client_version;
        s.options = src.options;
        s.mode = src.mode;
        s.max_cert_list = src.max_cert_list;
        s.read_ahead = src.read_ahead;
        s.mtu = src.mtu;
        s.msg_callback = src.msg_callback.clone();
        s.msg_callback_arg = src.msg_callback_arg;
        s.verify_mode = src.verify_mode;
        s.verify_depth = src.verify_depth;
        s.verify_callback = src.verify_callback.clone();
        s.generate_session_id = src.generate_session_id.clone();
        s.info_callback = src.info_callback.clone();
        s.server_name = src.server_name.clone();
        s.cipher_list = src.cipher_list.clone();
        s.rwstate = src.rwstate;
        s.in_handshake = src.in_handshake;
        s.handshake_func = src.handshake_func;
        s.server = src.server;
        s.s3.renegotiate = src.s3.renegotiate;
        s.new_session = src.new_session;
        s.quiet_shutdown = src.quiet_shutdown;
        s.shutdown = src.shutdown;
        s.state = src.state;
        s.hit = src.hit;

        Ok(Connection { state: s, bios })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cache::SessionCacheMode,
        callback::IOCallbackResult,
        context::ContextBuilder,
        test_helpers::{
            client_context, make_connected_pair, rsa_identity, server_context, NoIOCallbacks,
            TcpIOCallbacks, INIT_ENV_LOGGER,
        },
        Method, TLS_MAX_RECORD_SIZE,
    };

    use std::sync::atomic::{AtomicUsize, Ordering};

    use test_case::test_case;

    fn make_connected_clients() -> (Connection<TcpIOCallbacks>, Connection<TcpIOCallbacks>) {
        make_connected_pair(
            &client_context(Method::TlsV1Client),
            &server_context(Method::TlsV1Server),
        )
    }

    #[test]
    fn try_negotiate() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        // Internally this calls `try_negotiate`
        let (client, server) = make_connected_clients();
        assert_eq!(client.get_version(), "TLSv1");
        assert_eq!(server.get_version(), "TLSv1");
        assert!(!client.session_reused());
        assert_eq!(client.state_string(), "handshake done");
    }

    #[test]
    fn handshake_without_role_fails() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let ctx = client_context(Method::TlsV1);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();

        assert_eq!(conn.do_handshake(), -1);
        assert_eq!(conn.get_error(-1), SslError::Ssl);
        assert!(matches!(
            conn.try_negotiate(),
            Err(Error::Fatal(ErrorKind::ConnectionTypeNotSet))
        ));
    }

    #[test]
    fn io_before_role_is_uninitialized() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let ctx = client_context(Method::TlsV1);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();

        assert_eq!(conn.read(&mut [0; 8]), -1);
        assert_eq!(conn.error, Some(ErrorKind::Uninitialized));
        assert_eq!(conn.write(b"hello"), -1);
        assert_eq!(conn.error, Some(ErrorKind::Uninitialized));
        assert_eq!(conn.shutdown(), -1);
    }

    #[test]
    fn shutdown_during_handshake_is_a_no_op() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let ctx = client_context(Method::TlsV1Client);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();
        conn.set_connect_state();

        assert_eq!(conn.shutdown(), 1);
        assert!(conn.get_shutdown().is_empty());
    }

    #[test]
    fn dual_role_method_defaults_to_server() {
        let ctx = client_context(Method::TlsV1);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();
        assert!(conn.is_server());
        assert!(conn.in_before());

        conn.set_connect_state();
        assert!(!conn.is_server());
        assert_eq!(conn.state(), HandshakeState::Before(Role::Client));
    }

    #[test]
    fn try_write_trivial() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);
        const TEXT: &str = "Hello World";

        let (mut client, _server) = make_connected_clients();

        let mut bytes = BytesMut::from(TEXT.as_bytes());

        // Validate that trivial invocations does not break anything
        match client.try_write(&mut bytes) {
            Ok(Poll::Ready(n)) => {
                assert!(bytes.is_empty(), "Bytes should have been consumed");
                assert_eq!(
                    n,
                    TEXT.len(),
                    "The number of bytes reported to be written should match"
                );
            }
            x => {
                panic!("Expected bytes to be written! Got {x:?}")
            }
        }
    }

    #[test]
    fn zero_length_write_is_ready() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, server) = make_connected_clients();
        assert!(matches!(client.try_write_slice(&[]), Ok(Poll::Ready(0))));
        assert!(server.io_cb().pending_input().is_empty());
    }

    // A zero length write produces no record, so the reader is left waiting
    #[test_case(0 => panics)]
    #[test_case("Hello World".len() => "Hello World".len())]
    #[test_case(TLS_MAX_RECORD_SIZE - 1 => TLS_MAX_RECORD_SIZE - 1)]
    // More than one invocation to `try_read` would be required here
    #[test_case(TLS_MAX_RECORD_SIZE => panics)]
    fn try_read_and_write_roundtrip_once(len: usize) -> usize {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let text = "A".repeat(len);

        let (mut client, mut server) = make_connected_clients();

        let mut client_bytes = BytesMut::from(text.as_bytes());

        assert_eq!(client_bytes.capacity(), len);

        let Ok(Poll::Ready(_)) = client.try_write(&mut client_bytes) else {
            panic!("Unusual write behavior for this payload");
        };

        let mut server_bytes = BytesMut::with_capacity(text.len());

        match server.try_read(&mut server_bytes) {
            Ok(Poll::Ready(n)) => {
                let read_result = String::from_utf8_lossy(&server_bytes);

                assert_eq!(n, text.len());
                assert_eq!(read_result, text);

                n
            }
            e => panic!("Expected bytes to be read! Got {e:?}"),
        }
    }

    #[test]
    fn read_before_data_is_pending() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (_client, mut server) = make_connected_clients();
        let mut buf = BytesMut::with_capacity(16);
        assert!(matches!(server.try_read(&mut buf), Ok(Poll::PendingRead)));
        assert!(buf.is_empty());
        assert_eq!(server.want(), Want::Reading);
    }

    #[test]
    fn peek_leaves_data_in_place() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, mut server) = make_connected_clients();
        assert_eq!(client.write(b"hello"), 5);

        let mut buf = [0; 5];
        assert_eq!(server.peek(&mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(server.pending(), 5);

        let mut buf = [0; 3];
        assert_eq!(server.read(&mut buf), 3);
        assert_eq!(server.pending(), 2);
    }

    #[test]
    fn shutdown_exchange() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, mut server) = make_connected_clients();

        assert!(matches!(client.try_shutdown(), Ok(Poll::Ready(false))));
        assert_eq!(client.get_shutdown(), ShutdownFlags::SENT);

        // The server sees the close notify as the end of the stream
        let mut buf = BytesMut::with_capacity(16);
        assert!(matches!(server.try_read(&mut buf), Ok(Poll::Ready(0))));
        assert_eq!(server.get_error(0), SslError::ZeroReturn);
        assert!(server.get_shutdown().contains(ShutdownFlags::RECEIVED));

        assert!(matches!(server.try_shutdown(), Ok(Poll::Ready(true))));
        assert!(matches!(client.try_shutdown(), Ok(Poll::Ready(true))));

        assert!(matches!(
            client.try_write_slice(b"late"),
            Err(Error::Fatal(ErrorKind::ProtocolIsShutdown))
        ));
    }

    #[test]
    fn try_rehandshake() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, mut server) = make_connected_clients();

        assert!(client.is_secure_renegotiation_supported());
        assert!(server.is_secure_renegotiation_supported());

        const TEST: &str = "foobar";

        for _ in 0..5 {
            let mut bytes = BytesMut::from(TEST.as_bytes());

            // Keep invoking `try_rehandshake` to progress the secure
            // renegotiation.
            match client.try_rehandshake() {
                Ok(Poll::Ready(_)) => {
                    break;
                }
                Ok(Poll::PendingRead | Poll::PendingWrite) => {}
                Ok(Poll::AppData(_) | Poll::PendingLookup) => {
                    panic!("Should not receive AppData from anywhere")
                }
                Err(e) => panic!("{e}"),
            }

            // Writes wait until the renegotiation completes
            match client.try_write(&mut bytes) {
                Ok(Poll::Ready(_) | Poll::PendingRead | Poll::PendingWrite) => {}
                Ok(Poll::AppData(_) | Poll::PendingLookup) => {
                    panic!("Should not receive AppData from anywhere")
                }
                Err(e) => panic!("{e}"),
            };

            let mut server_bytes = BytesMut::with_capacity(TEST.len());
            match server.try_read(&mut server_bytes) {
                Ok(Poll::Ready(_) | Poll::PendingRead | Poll::PendingWrite) => {}
                Ok(Poll::AppData(b)) => {
                    assert_eq!(b, TEST);
                    // `server_bytes` should not have been modified if appdata
                    // is discovered.
                    assert!(server_bytes.is_empty());
                }
                Ok(Poll::PendingLookup) => panic!("No certificate lookup expected"),
                Err(e) => panic!("{e}"),
            };
        }

        // A resumed renegotiation ends with the client's finished, which
        // the server only consumes on its next read
        for _ in 0..5 {
            if server.is_init_finished() {
                break;
            }
            let mut server_bytes = BytesMut::with_capacity(TEST.len());
            match server.try_read(&mut server_bytes) {
                Ok(Poll::Ready(_) | Poll::PendingRead | Poll::PendingWrite) => {}
                Ok(Poll::AppData(b)) => assert_eq!(b, TEST),
                Ok(Poll::PendingLookup) => panic!("No certificate lookup expected"),
                Err(e) => panic!("{e}"),
            }
        }

        assert!(server.is_init_finished());
        assert!(!client.renegotiate_pending());
        assert!(!server.renegotiate_pending());
        assert_eq!(client.total_renegotiations(), 1);
        assert!(client.is_init_finished());
    }

    #[test]
    fn app_data_during_renegotiation() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, mut server) = make_connected_clients();

        // Client hello goes out, the client now waits for the server
        assert!(matches!(client.try_rehandshake(), Ok(Poll::PendingRead)));

        // A plain application data record queued behind the client hello
        let mut record = vec![23, 3, 1, 0, 6];
        record.extend_from_slice(b"foobar");
        assert!(matches!(
            client.io_cb_mut().send(&record),
            crate::IOCallbackResult::Ok(11)
        ));

        let mut buf = BytesMut::with_capacity(16);
        match server.try_read(&mut buf) {
            Ok(Poll::AppData(data)) => assert_eq!(&data[..], b"foobar"),
            other => panic!("Expected application data, got {other:?}"),
        }
        assert!(buf.is_empty());
        assert!(server.in_init());
    }

    #[test]
    fn get_current_cipher_name() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (client, server) = make_connected_clients();

        let client_cipher = client.get_current_cipher_name().unwrap();
        assert_eq!(Some(client_cipher.clone()), server.get_current_cipher_name());
        assert!(client.get_ciphers().find(client.get_current_cipher().unwrap().id).is_some());
        assert!(server.get_shared_ciphers().unwrap().contains(&client_cipher));
        assert_eq!(client.get_shared_ciphers(), None);
    }

    #[test_case(SslVerifyMode::SslVerifyNone, SslVerifyMode::SslVerifyNone)]
    #[test_case(SslVerifyMode::SslVerifyPeer, SslVerifyMode::SslVerifyNone)]
    #[test_case(SslVerifyMode::SslVerifyFailIfNoPeerCert, SslVerifyMode::SslVerifyNone => panics "PeerDidNotReturnCertificate")]
    #[test_case(SslVerifyMode::SslVerifyNone, SslVerifyMode::SslVerifyPeer => panics "UnableToGetIssuerCert")]
    fn test_client_set_verify(server_mode: SslVerifyMode, client_mode: SslVerifyMode) {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        // No trust anchors: the client cannot verify the server
        let client_ctx = ContextBuilder::new(Method::TlsV1Client).unwrap().build();
        let server_ctx = server_context(Method::TlsV1Server);

        let (client_io, server_io) = TcpIOCallbacks::pair();
        let mut client = client_ctx
            .new_connection(ConnectionConfig::new(client_io).with_ssl_verify_mode(client_mode))
            .unwrap();
        let mut server = server_ctx
            .new_connection(ConnectionConfig::new(server_io).with_ssl_verify_mode(server_mode))
            .unwrap();
        client.set_connect_state();
        server.set_accept_state();

        for _ in 0..7 {
            let _ = client.try_negotiate().unwrap();
            let _ = server.try_negotiate().unwrap();
        }

        assert!(client.is_init_finished());
        assert!(server.is_init_finished());
        assert_eq!(server.get_peer_certificate(), None);
    }

    #[test]
    fn client_certificate_is_verified() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (ca, _) = rsa_identity("ca", 2048);
        let (cert, key) = rsa_identity("client", 2048);
        let client_ctx = ContextBuilder::new(Method::TlsV1Client)
            .unwrap()
            .with_certificate(cert.clone())
            .with_private_key(key)
            .unwrap()
            .build();
        let (server_cert, server_key) = rsa_identity("server", 2048);
        let server_ctx = ContextBuilder::new(Method::TlsV1Server)
            .unwrap()
            .with_certificate(server_cert)
            .with_private_key(server_key)
            .unwrap()
            .with_root_certificate(ca)
            .with_verify_method(SslVerifyMode::SslVerifyFailIfNoPeerCert)
            .build();

        let (_client, server) = make_connected_pair(&client_ctx, &server_ctx);
        assert_eq!(server.get_peer_certificate(), Some(&cert));
        assert_eq!(server.get_verify_result(), VERIFY_OK);
    }

    #[test]
    fn sni_reaches_server() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let client_ctx = client_context(Method::TlsV1Client);
        let server_ctx = server_context(Method::TlsV1Server);

        let (client_io, server_io) = TcpIOCallbacks::pair();
        let mut client = client_ctx
            .new_connection(ConnectionConfig::new(client_io).with_sni("example.com"))
            .unwrap();
        let mut server = server_ctx
            .new_connection(ConnectionConfig::new(server_io))
            .unwrap();
        client.set_connect_state();
        server.set_accept_state();

        for _ in 0..7 {
            let _ = client.try_negotiate().unwrap();
            let _ = server.try_negotiate().unwrap();
        }

        assert!(server.is_init_finished());
        assert_eq!(server.get_servername(), Some("example.com"));
    }

    #[test]
    fn ctrl_commands() {
        let ctx = client_context(Method::TlsV1Client);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();

        assert_eq!(conn.ctrl(ctrl::GET_READ_AHEAD, 0), 0);
        assert_eq!(conn.ctrl(ctrl::SET_READ_AHEAD, 1), 0);
        assert!(conn.read_ahead());

        assert_eq!(conn.ctrl(ctrl::SET_MAX_CERT_LIST, 1024), 100 * 1024);
        assert_eq!(conn.ctrl(ctrl::GET_MAX_CERT_LIST, 0), 1024);

        let bits = conn.ctrl(ctrl::MODE, Mode::AUTO_RETRY.bits() as i64);
        assert!(Mode::from_bits_retain(bits as u32).contains(Mode::AUTO_RETRY));
        conn.ctrl(ctrl::CLEAR_MODE, Mode::AUTO_RETRY.bits() as i64);
        assert!(!conn.mode().contains(Mode::AUTO_RETRY));

        conn.ctrl(ctrl::OPTIONS, Options::NO_SSLV2.bits() as i64);
        assert!(conn.options().contains(Options::NO_SSLV2));

        // Not a datagram connection
        assert_eq!(conn.ctrl(ctrl::SET_MTU, 1400), 0);
        assert_eq!(conn.ctrl(ctrl::GET_RI_SUPPORT, 0), 0);
    }

    #[test_case(1400 => 1400)]
    #[test_case(100 => 0)]
    fn dtls_mtu(mtu: i64) -> i64 {
        let ctx = client_context(Method::DtlsV1Client);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();
        conn.ctrl(ctrl::SET_MTU, mtu)
    }

    #[test]
    fn session_id_context_too_long() {
        let ctx = client_context(Method::TlsV1Client);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();
        assert_eq!(
            conn.set_session_id_context(&[0; 33]),
            Err(Error::fatal(ErrorKind::SessionIdContextTooLong))
        );
        conn.set_session_id_context(b"app").unwrap();
        assert_eq!(conn.session_id_context(), b"app");
    }

    #[test]
    fn cipher_list_override() {
        let ctx = client_context(Method::TlsV1Client);
        let conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks).with_cipher_list("AES128-SHA"))
            .unwrap();
        assert_eq!(conn.get_cipher_list(0), Some("AES128-SHA"));
        assert_eq!(conn.get_cipher_list(1), None);

        let err = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks).with_cipher_list("BOGUS"))
            .err()
            .unwrap();
        assert!(matches!(err, NewConnectionError::SetupFailed("set cipher list", _)));
    }

    #[test]
    fn resumed_session_is_reused() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let client_ctx = client_context(Method::TlsV1Client);
        let server_ctx = server_context(Method::TlsV1Server);

        let session = {
            let (mut client, mut server) = make_connected_pair(&client_ctx, &server_ctx);
            let session = client.get1_session().unwrap();
            let _ = client.try_shutdown().unwrap();
            let _ = server.try_shutdown().unwrap();
            session
        };
        assert_eq!(server_ctx.sess_number(), 1);

        let (client_io, server_io) = TcpIOCallbacks::pair();
        let mut client = client_ctx
            .new_connection(ConnectionConfig::new(client_io).with_session(session.clone()))
            .unwrap();
        let mut server = server_ctx
            .new_connection(ConnectionConfig::new(server_io))
            .unwrap();
        client.set_connect_state();
        server.set_accept_state();
        for _ in 0..7 {
            let _ = client.try_negotiate().unwrap();
            let _ = server.try_negotiate().unwrap();
        }

        assert!(client.session_reused());
        assert!(server.session_reused());
        assert_eq!(client.session().unwrap().id(), session.id());
        assert_eq!(server_ctx.stats().get(Stat::Hit), 1);
        assert_eq!(client_ctx.stats().get(Stat::Hit), 1);
    }

    #[test]
    fn unclean_close_evicts_session() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let client_ctx = client_context(Method::TlsV1Client);
        let server_ctx = server_context(Method::TlsV1Server);
        {
            let _pair = make_connected_pair(&client_ctx, &server_ctx);
            assert_eq!(server_ctx.sess_number(), 1);
        }
        assert_eq!(server_ctx.sess_number(), 0);
    }

    #[test]
    fn clear_allows_a_new_handshake() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, mut server) = make_connected_clients();
        let _ = client.try_shutdown().unwrap();
        let _ = server.try_shutdown().unwrap();

        client.clear().unwrap();
        assert!(client.in_before());
        assert!(client.get_shutdown().is_empty());
        // A clean shutdown keeps the session for resumption
        assert!(client.session().is_some());
    }

    #[test]
    fn clear_refused_during_renegotiation() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (mut client, _server) = make_connected_clients();
        client.renegotiate();
        assert!(client.clear().is_err());
    }

    #[test]
    fn set_session_switches_method() {
        let ctx = client_context(Method::TlsClient);
        let mut conn = ctx
            .new_connection(ConnectionConfig::new(NoIOCallbacks))
            .unwrap();
        let session = crate::SessionBuilder::new(
            ProtocolVersion::SslV3,
            CipherSuite::lookup(0x002f).unwrap(),
        )
        .build();

        conn.set_session(Some(session)).unwrap();
        assert_eq!(conn.get_ssl_method(), Method::SslV3Client);
        assert_eq!(conn.version(), ProtocolVersion::SslV3);

        conn.set_session(None).unwrap();
        assert_eq!(conn.get_ssl_method(), Method::TlsClient);
    }

    #[test]
    fn dup_copies_settings_and_session() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (client, _server) = make_connected_clients();
        let copy = client.dup().unwrap();

        assert!(copy.is_init_finished());
        assert!(!copy.is_server());
        assert!(copy.session().unwrap().ptr_eq(client.session().unwrap()));
        assert_eq!(copy.get_version(), client.get_version());
        assert!(Arc::ptr_eq(&copy.cert, &client.cert));
    }

    #[test]
    fn server_generates_session_ids_with_callback() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let client_ctx = client_context(Method::TlsV1Client);
        let server_ctx = server_context(Method::TlsV1Server);
        server_ctx.config_mut().generate_session_id = Some(Arc::new(move |_: &ConnectionState, id: &mut [u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            id[..4].copy_from_slice(b"sess");
            Some(4)
        }));

        let (client, server) = make_connected_pair(&client_ctx, &server_ctx);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.session().unwrap().id().as_bytes(), b"sess");
        assert!(server.has_matching_session_id(b"sess"));
    }

    #[test]
    fn session_cache_disabled_sends_empty_id() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let client_ctx = client_context(Method::TlsV1Client);
        let server_ctx = server_context(Method::TlsV1Server);
        server_ctx.set_session_cache_mode(SessionCacheMode::empty());

        let (client, _server) = make_connected_pair(&client_ctx, &server_ctx);
        assert!(client.session().unwrap().id().is_empty());
        assert_eq!(server_ctx.sess_number(), 0);
    }

    #[test]
    fn records_carry_the_negotiated_suite() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let (client, server) = make_connected_clients();
        let cipher = client.get_current_cipher().unwrap();

        let write = client.enc_write.as_ref().unwrap();
        assert_eq!(write.suite.id, cipher.id);
        // The finished message went out protected
        assert!(write.sequence >= 1);
        assert_eq!(server.enc_read.as_ref().unwrap().suite.id, cipher.id);
    }

    // Accepts one canned record, then fails every send
    struct BrokenSendIO {
        input: BytesMut,
        sends: Arc<AtomicUsize>,
    }

    impl IOCallbacks for BrokenSendIO {
        fn recv(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize> {
            if self.input.is_empty() {
                return IOCallbackResult::WouldBlock;
            }
            let n = buf.len().min(self.input.len());
            buf[..n].copy_from_slice(&self.input.split_to(n));
            IOCallbackResult::Ok(n)
        }

        fn send(&mut self, _buf: &[u8]) -> IOCallbackResult<usize> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            IOCallbackResult::Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn failed_alert_keeps_the_original_error() {
        INIT_ENV_LOGGER.get_or_init(env_logger::init);

        let sends = Arc::new(AtomicUsize::new(0));
        let io = BrokenSendIO {
            input: BytesMut::from(&[22u8, 0x99, 0x99, 0, 0][..]),
            sends: sends.clone(),
        };
        let ctx = server_context(Method::TlsV1Server);
        let mut server = ctx.new_connection(ConnectionConfig::new(io)).unwrap();
        server.set_accept_state();

        let err = server.try_negotiate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::WrongVersionNumber);
        // The protocol_version alert was attempted
        assert!(sends.load(Ordering::SeqCst) >= 1);
    }
}
