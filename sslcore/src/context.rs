use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::{
    cache::{SessionCache, SessionCacheMode, SessionStats, Stat, SESSION_CACHE_MAX_SIZE_DEFAULT},
    callback::{
        ClientCertCallback, GenerateSessionIdCallback, GetSessionCallback, IOCallbacks,
        InfoCallback, MsgCallback, NewSessionCallback, PasswordCallback, RemoveSessionCallback,
        ServerNameCallback, VerifyCallback,
    },
    cert::{
        CertSet, Certificate, CertificateVerifier, IssuerNameVerifier, PrivateKey, TmpKey,
        TmpKeyCallback, DEFAULT_VERIFY_DEPTH,
    },
    cipher::{CipherList, DEFAULT_CIPHER_RULE},
    ctrl::{self, to_flags, CallbackCtrl, Mode, Options, DEFAULT_MAX_CERT_LIST},
    error::{Error, ErrorKind, Result},
    session::{Session, SessionId, MAX_SID_CTX_LENGTH},
    ssl::{Connection, ConnectionConfig, NewConnectionError},
    Method, ProtocolVersion, SslVerifyMode,
};

/// Error creating a [`ContextBuilder`] object.
#[derive(Error, Debug)]
pub enum NewContextBuilderError {
    /// The default cipher rule selects nothing usable with the method's
    /// version
    #[error("Library has no ciphers")]
    LibraryHasNoCiphers,
}

/// Settings shared by every connection of a context. Connections copy
/// most of them when they are created.
pub(crate) struct ContextConfig {
    pub(crate) options: Options,
    pub(crate) mode: Mode,
    pub(crate) read_ahead: bool,
    pub(crate) max_cert_list: i64,
    pub(crate) quiet_shutdown: bool,
    pub(crate) cipher_list: CipherList,

    pub(crate) cert: CertSet,
    pub(crate) extra_certs: Vec<Certificate>,
    pub(crate) roots: Vec<Certificate>,
    pub(crate) verifier: Arc<dyn CertificateVerifier>,
    pub(crate) verify_mode: SslVerifyMode,
    pub(crate) verify_depth: u32,
    pub(crate) verify_callback: Option<VerifyCallback>,

    pub(crate) sid_ctx: SessionId,
    pub(crate) cache_mode: SessionCacheMode,
    pub(crate) session_timeout: u64,

    pub(crate) msg_callback: Option<MsgCallback>,
    pub(crate) msg_callback_arg: i64,
    pub(crate) info_callback: Option<InfoCallback>,
    pub(crate) new_session_cb: Option<NewSessionCallback>,
    pub(crate) remove_session_cb: Option<RemoveSessionCallback>,
    pub(crate) get_session_cb: Option<GetSessionCallback>,
    pub(crate) generate_session_id: Option<GenerateSessionIdCallback>,
    pub(crate) password_cb: Option<PasswordCallback>,
    pub(crate) servername_cb: Option<ServerNameCallback>,
    pub(crate) client_cert_cb: Option<ClientCertCallback>,
}

impl ContextConfig {
    fn new(method: Method, cipher_list: CipherList) -> Self {
        Self {
            options: Options::LEGACY_SERVER_CONNECT,
            mode: Mode::empty(),
            read_ahead: false,
            max_cert_list: DEFAULT_MAX_CERT_LIST,
            quiet_shutdown: false,
            cipher_list,
            cert: CertSet::new(),
            extra_certs: Vec::new(),
            roots: Vec::new(),
            verifier: Arc::new(IssuerNameVerifier),
            verify_mode: SslVerifyMode::default(),
            verify_depth: DEFAULT_VERIFY_DEPTH,
            verify_callback: None,
            sid_ctx: SessionId::EMPTY,
            cache_mode: SessionCacheMode::default(),
            session_timeout: method.table().get_timeout(),
            msg_callback: None,
            msg_callback_arg: 0,
            info_callback: None,
            new_session_cb: None,
            remove_session_cb: None,
            get_session_cb: None,
            generate_session_id: None,
            password_cb: None,
            servername_cb: None,
            client_cert_cb: None,
        }
    }
}

fn sid_ctx_from(sid_ctx: &[u8]) -> Result<SessionId> {
    if sid_ctx.len() > MAX_SID_CTX_LENGTH {
        return Err(Error::fatal(ErrorKind::SessionIdContextTooLong));
    }
    SessionId::new(sid_ctx).ok_or(Error::fatal(ErrorKind::SessionIdContextTooLong))
}

/// Produces a [`Context`] once built.
pub struct ContextBuilder {
    method: Method,
    config: ContextConfig,
    cache_size: usize,
}

impl std::fmt::Debug for ContextBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuilder")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl ContextBuilder {
    /// Starts a context for `method` with the default cipher list
    pub fn new(method: Method) -> std::result::Result<Self, NewContextBuilderError> {
        let cipher_list = CipherList::new(DEFAULT_CIPHER_RULE, method.version())
            .map_err(|_| NewContextBuilderError::LibraryHasNoCiphers)?;

        Ok(Self {
            method,
            config: ContextConfig::new(method, cipher_list),
            cache_size: SESSION_CACHE_MAX_SIZE_DEFAULT,
        })
    }

    /// When `cond` is True call fallible `func` on `Self`
    pub fn try_when<F>(self, cond: bool, func: F) -> Result<Self>
    where
        F: FnOnce(Self) -> Result<Self>,
    {
        if cond {
            func(self)
        } else {
            Ok(self)
        }
    }

    /// When `maybe` is Some(_) call fallible `func` on `Self` and the
    /// contained value
    pub fn try_when_some<F, T>(self, maybe: Option<T>, func: F) -> Result<Self>
    where
        F: FnOnce(Self, T) -> Result<Self>,
    {
        if let Some(t) = maybe {
            func(self, t)
        } else {
            Ok(self)
        }
    }

    /// Adds a trust anchor for peer verification
    pub fn with_root_certificate(mut self, root: Certificate) -> Self {
        self.config.roots.push(root);
        self
    }

    /// Replaces the chain verifier
    pub fn with_certificate_verifier(mut self, verifier: Arc<dyn CertificateVerifier>) -> Self {
        self.config.verifier = verifier;
        self
    }

    /// Sets the cipher list from a rule string
    pub fn with_cipher_list(mut self, cipher_list: &str) -> Result<Self> {
        self.config.cipher_list = CipherList::new(cipher_list, self.method.version())?;
        Ok(self)
    }

    /// Installs the certificate presented to peers
    pub fn with_certificate(mut self, cert: Certificate) -> Self {
        self.config.cert.set_certificate(cert);
        self
    }

    /// Adds an intermediate certificate sent after the leaf
    pub fn with_chain_certificate(mut self, cert: Certificate) -> Self {
        self.config.extra_certs.push(cert);
        self
    }

    /// Installs the private key of the certificate. Encrypted keys are
    /// unlocked through the password callback, which must therefore be set
    /// first.
    pub fn with_private_key(mut self, key: PrivateKey) -> Result<Self> {
        let key = if key.is_encrypted() {
            let passphrase = self.config.password_cb.as_ref().and_then(|cb| cb(false));
            key.decrypt(passphrase.as_deref())?
        } else {
            key
        };
        self.config.cert.set_private_key(key)?;
        Ok(self)
    }

    /// Sets the callback supplying private key passphrases
    pub fn with_password_callback(mut self, cb: PasswordCallback) -> Self {
        self.config.password_cb = Some(cb);
        self
    }

    /// Sets the peer verification mode
    pub fn with_verify_method(mut self, mode: SslVerifyMode) -> Self {
        self.config.verify_mode = mode;
        self
    }

    /// Sets the maximum verification depth
    pub fn with_verify_depth(mut self, depth: u32) -> Self {
        self.config.verify_depth = depth;
        self
    }

    /// Sets the callback which may override the verification verdict
    pub fn with_verify_callback(mut self, cb: VerifyCallback) -> Self {
        self.config.verify_callback = Some(cb);
        self
    }

    /// Sets the session id context sessions are bound to
    pub fn with_session_id_context(mut self, sid_ctx: &[u8]) -> Result<Self> {
        self.config.sid_ctx = sid_ctx_from(sid_ctx)?;
        Ok(self)
    }

    /// Sets which roles cache sessions
    pub fn with_session_cache_mode(mut self, mode: SessionCacheMode) -> Self {
        self.config.cache_mode = mode;
        self
    }

    /// Bounds the session cache; 0 means unbounded
    pub fn with_session_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Sets the lifetime of new sessions, in seconds
    pub fn with_session_timeout(mut self, timeout: u64) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    /// Adds option bits
    pub fn with_options(mut self, options: Options) -> Self {
        self.config.options |= options;
        self
    }

    /// Adds mode bits
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.config.mode |= mode;
        self
    }

    /// Reads as much as available instead of record by record
    pub fn with_read_ahead(mut self, read_ahead: bool) -> Self {
        self.config.read_ahead = read_ahead;
        self
    }

    /// Bounds the certificate list accepted from peers
    pub fn with_max_cert_list(mut self, max: i64) -> Self {
        self.config.max_cert_list = max;
        self
    }

    /// Skips the close_notify exchange on shutdown
    pub fn with_quiet_shutdown(mut self, quiet: bool) -> Self {
        self.config.quiet_shutdown = quiet;
        self
    }

    /// Sets the temporary RSA key for export suites
    pub fn with_tmp_rsa(mut self, key: TmpKey) -> Self {
        self.config.cert.set_tmp_rsa(key);
        self
    }

    /// Sets the callback supplying temporary RSA keys
    pub fn with_tmp_rsa_callback(mut self, cb: TmpKeyCallback) -> Self {
        self.config.cert.set_tmp_rsa_callback(cb);
        self
    }

    /// Sets the ephemeral DH parameters
    pub fn with_tmp_dh(mut self, key: TmpKey) -> Self {
        self.config.cert.set_tmp_dh(key);
        self
    }

    /// Sets the callback supplying DH parameters
    pub fn with_tmp_dh_callback(mut self, cb: TmpKeyCallback) -> Self {
        self.config.cert.set_tmp_dh_callback(cb);
        self
    }

    /// Sets the ephemeral ECDH key
    pub fn with_tmp_ecdh(mut self, key: TmpKey) -> Self {
        self.config.cert.set_tmp_ecdh(key);
        self
    }

    /// Sets the callback supplying ECDH keys
    pub fn with_tmp_ecdh_callback(mut self, cb: TmpKeyCallback) -> Self {
        self.config.cert.set_tmp_ecdh_callback(cb);
        self
    }

    /// Sets the callback told about new sessions
    pub fn with_new_session_callback(mut self, cb: NewSessionCallback) -> Self {
        self.config.new_session_cb = Some(cb);
        self
    }

    /// Sets the callback told about sessions leaving the cache
    pub fn with_remove_session_callback(mut self, cb: RemoveSessionCallback) -> Self {
        self.config.remove_session_cb = Some(cb);
        self
    }

    /// Sets the external session lookup
    pub fn with_get_session_callback(mut self, cb: GetSessionCallback) -> Self {
        self.config.get_session_cb = Some(cb);
        self
    }

    /// Sets the session id generator
    pub fn with_generate_session_id(mut self, cb: GenerateSessionIdCallback) -> Self {
        self.config.generate_session_id = Some(cb);
        self
    }

    /// Sets the handshake progress callback
    pub fn with_info_callback(mut self, cb: InfoCallback) -> Self {
        self.config.info_callback = Some(cb);
        self
    }

    /// Sets the record tracing callback
    pub fn with_msg_callback(mut self, cb: MsgCallback) -> Self {
        self.config.msg_callback = Some(cb);
        self
    }

    /// Sets the server name callback
    pub fn with_servername_callback(mut self, cb: ServerNameCallback) -> Self {
        self.config.servername_cb = Some(cb);
        self
    }

    /// Sets the client certificate callback
    pub fn with_client_cert_callback(mut self, cb: ClientCertCallback) -> Self {
        self.config.client_cert_cb = Some(cb);
        self
    }

    /// Finalizes a [`Context`]
    pub fn build(self) -> Context {
        Context(Arc::new(ContextInner {
            method: RwLock::new(self.method),
            config: RwLock::new(self.config),
            cache: SessionCache::new(self.cache_size),
            stats: SessionStats::default(),
        }))
    }
}

struct ContextInner {
    method: RwLock<Method>,
    config: RwLock<ContextConfig>,
    cache: SessionCache,
    stats: SessionStats,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let removed = self.cache.flush(0);
        if let Some(cb) = &self.config.get_mut().remove_session_cb {
            for session in &removed {
                cb(session);
            }
        }
    }
}

/// Shared configuration and session cache of a group of connections.
///
/// Cloning takes another reference. The cache is flushed, and the remove
/// callback told about every session in it, when the last reference goes.
#[derive(Clone)]
pub struct Context(Arc<ContextInner>);

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method())
            .field("sessions", &self.sess_number())
            .finish_non_exhaustive()
    }
}

impl Context {
    pub(crate) fn config(&self) -> RwLockReadGuard<'_, ContextConfig> {
        self.0.config.read()
    }

    pub(crate) fn config_mut(&self) -> RwLockWriteGuard<'_, ContextConfig> {
        self.0.config.write()
    }

    /// Gets the underlying [`Method`]
    pub fn method(&self) -> Method {
        *self.0.method.read()
    }

    /// Switches the method, resetting the cipher list to the default for
    /// its version
    pub fn set_ssl_version(&self, method: Method) -> Result<()> {
        let cipher_list = CipherList::new(DEFAULT_CIPHER_RULE, method.version())
            .map_err(|_| Error::fatal(ErrorKind::LibraryHasNoCiphers))?;
        *self.0.method.write() = method;
        self.config_mut().cipher_list = cipher_list;
        Ok(())
    }

    /// Creates a new connection using this context
    pub fn new_connection<IO: IOCallbacks>(
        &self,
        config: ConnectionConfig<IO>,
    ) -> std::result::Result<Connection<IO>, NewConnectionError> {
        Connection::new(self, config)
    }

    /// Whether both handles refer to the same context
    pub fn ptr_eq(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live references
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// The statistics counters
    pub fn stats(&self) -> &SessionStats {
        &self.0.stats
    }

    pub(crate) fn incr(&self, stat: Stat) -> u64 {
        self.0.stats.incr(stat)
    }

    fn notify_removed(&self, sessions: &[Session]) {
        if sessions.is_empty() {
            return;
        }
        let cb = self.config().remove_session_cb.clone();
        if let Some(cb) = cb {
            for session in sessions {
                cb(session);
            }
        }
    }

    /// Adds a session to the cache, taking a reference. Returns `false`
    /// if a session with the same version and id is already cached.
    /// Sessions pushed out by the size bound count as `cache_full`.
    pub fn add_session(&self, session: &Session) -> bool {
        let insertion = self.0.cache.insert(session);
        for _ in &insertion.evicted {
            self.incr(Stat::CacheFull);
        }
        self.notify_removed(&insertion.evicted);
        insertion.inserted
    }

    /// Drops the cache's reference to `session`, if it holds one
    pub fn remove_session(&self, session: &Session) -> bool {
        match self.0.cache.remove(session) {
            Some(removed) => {
                self.notify_removed(std::slice::from_ref(&removed));
                true
            }
            None => false,
        }
    }

    /// Removes every session expired at `t`; 0 removes all of them
    pub fn flush_sessions(&self, t: u64) {
        let removed = self.0.cache.flush(t);
        self.notify_removed(&removed);
    }

    /// Finds a cached session
    pub fn lookup_session(&self, version: ProtocolVersion, id: &[u8]) -> Option<Session> {
        let id = SessionId::new(id)?;
        self.0.cache.lookup(version, &id)
    }

    pub(crate) fn cache_contains(&self, version: ProtocolVersion, id: &SessionId) -> bool {
        self.0.cache.contains(version, id)
    }

    /// Number of cached sessions
    pub fn sess_number(&self) -> usize {
        self.0.cache.len()
    }

    /// Sets the cache mode, returning the previous one
    pub fn set_session_cache_mode(&self, mode: SessionCacheMode) -> SessionCacheMode {
        std::mem::replace(&mut self.config_mut().cache_mode, mode)
    }

    /// The cache mode
    pub fn session_cache_mode(&self) -> SessionCacheMode {
        self.config().cache_mode
    }

    /// Sets the cache bound, returning the previous one
    pub fn set_session_cache_size(&self, size: usize) -> usize {
        self.0.cache.set_max_size(size)
    }

    /// The cache bound
    pub fn session_cache_size(&self) -> usize {
        self.0.cache.max_size()
    }

    /// Sets the lifetime of new sessions, returning the previous one
    pub fn set_timeout(&self, timeout: u64) -> u64 {
        std::mem::replace(&mut self.config_mut().session_timeout, timeout)
    }

    /// Lifetime of new sessions, in seconds
    pub fn timeout(&self) -> u64 {
        self.config().session_timeout
    }

    /// Adds option bits, returning the new options
    pub fn set_options(&self, options: Options) -> Options {
        let mut config = self.config_mut();
        config.options |= options;
        config.options
    }

    /// Clears option bits, returning the new options
    pub fn clear_options(&self, options: Options) -> Options {
        let mut config = self.config_mut();
        config.options &= !options;
        config.options
    }

    /// Current options
    pub fn options(&self) -> Options {
        self.config().options
    }

    /// Adds mode bits, returning the new mode
    pub fn set_mode(&self, mode: Mode) -> Mode {
        let mut config = self.config_mut();
        config.mode |= mode;
        config.mode
    }

    /// Clears mode bits, returning the new mode
    pub fn clear_mode(&self, mode: Mode) -> Mode {
        let mut config = self.config_mut();
        config.mode &= !mode;
        config.mode
    }

    /// Current mode
    pub fn mode(&self) -> Mode {
        self.config().mode
    }

    /// Replaces the cipher list of new connections
    pub fn set_cipher_list(&self, rule: &str) -> Result<()> {
        let list = CipherList::new(rule, self.method().version())?;
        self.config_mut().cipher_list = list;
        Ok(())
    }

    /// The cipher list of new connections
    pub fn get_ciphers(&self) -> CipherList {
        self.config().cipher_list.clone()
    }

    /// Checks that the configured certificate and key belong together
    pub fn check_private_key(&self) -> Result<()> {
        self.config().cert.check_private_key()
    }

    /// Sets the session id context of new connections
    pub fn set_session_id_context(&self, sid_ctx: &[u8]) -> Result<()> {
        self.config_mut().sid_ctx = sid_ctx_from(sid_ctx)?;
        Ok(())
    }

    /// Sets the verification mode and callback of new connections
    pub fn set_verify(&self, mode: SslVerifyMode, cb: Option<VerifyCallback>) {
        let mut config = self.config_mut();
        config.verify_mode = mode;
        config.verify_callback = cb;
    }

    /// Sets the verification depth of new connections
    pub fn set_verify_depth(&self, depth: u32) {
        self.config_mut().verify_depth = depth;
    }

    /// Sets the callback told about new sessions
    pub fn set_new_session_callback(&self, cb: Option<NewSessionCallback>) {
        self.config_mut().new_session_cb = cb;
    }

    /// Sets the callback told about sessions leaving the cache
    pub fn set_remove_session_callback(&self, cb: Option<RemoveSessionCallback>) {
        self.config_mut().remove_session_cb = cb;
    }

    /// Sets the external session lookup
    pub fn set_get_session_callback(&self, cb: Option<GetSessionCallback>) {
        self.config_mut().get_session_cb = cb;
    }

    /// Sets the session id generator
    pub fn set_generate_session_id(&self, cb: Option<GenerateSessionIdCallback>) {
        self.config_mut().generate_session_id = cb;
    }

    /// Sets the handshake progress callback of new connections
    pub fn set_info_callback(&self, cb: Option<InfoCallback>) {
        self.config_mut().info_callback = cb;
    }

    /// Sets the server name callback
    pub fn set_servername_callback(&self, cb: Option<ServerNameCallback>) {
        self.config_mut().servername_cb = cb;
    }

    /// Sets the client certificate callback
    pub fn set_client_cert_callback(&self, cb: Option<ClientCertCallback>) {
        self.config_mut().client_cert_cb = cb;
    }

    /// Generic control interface, see [`crate::ctrl`] for commands.
    /// Unknown commands go to the method.
    pub fn ctrl(&self, cmd: i32, larg: i64) -> i64 {
        let stat = |s: Stat| self.0.stats.get(s) as i64;
        match cmd {
            ctrl::GET_READ_AHEAD => self.config().read_ahead as i64,
            ctrl::SET_READ_AHEAD => {
                std::mem::replace(&mut self.config_mut().read_ahead, larg != 0) as i64
            }
            ctrl::SET_MSG_CALLBACK_ARG => {
                self.config_mut().msg_callback_arg = larg;
                1
            }
            ctrl::GET_MAX_CERT_LIST => self.config().max_cert_list,
            ctrl::SET_MAX_CERT_LIST => std::mem::replace(&mut self.config_mut().max_cert_list, larg),
            ctrl::SET_SESS_CACHE_SIZE => self.set_session_cache_size(larg.max(0) as usize) as i64,
            ctrl::GET_SESS_CACHE_SIZE => self.session_cache_size() as i64,
            ctrl::SET_SESS_CACHE_MODE => self
                .set_session_cache_mode(SessionCacheMode::from_bits_retain(to_flags(larg)))
                .bits() as i64,
            ctrl::GET_SESS_CACHE_MODE => self.session_cache_mode().bits() as i64,
            ctrl::SESS_NUMBER => self.sess_number() as i64,
            ctrl::SESS_CONNECT => stat(Stat::Connect),
            ctrl::SESS_CONNECT_GOOD => stat(Stat::ConnectGood),
            ctrl::SESS_CONNECT_RENEGOTIATE => stat(Stat::ConnectRenegotiate),
            ctrl::SESS_ACCEPT => stat(Stat::Accept),
            ctrl::SESS_ACCEPT_GOOD => stat(Stat::AcceptGood),
            ctrl::SESS_ACCEPT_RENEGOTIATE => stat(Stat::AcceptRenegotiate),
            ctrl::SESS_HIT => stat(Stat::Hit),
            ctrl::SESS_CB_HIT => stat(Stat::CbHit),
            ctrl::SESS_MISSES => stat(Stat::Misses),
            ctrl::SESS_TIMEOUTS => stat(Stat::Timeouts),
            ctrl::SESS_CACHE_FULL => stat(Stat::CacheFull),
            ctrl::OPTIONS => {
                self.set_options(Options::from_bits_retain(to_flags(larg)))
                    .bits() as i64
            }
            ctrl::CLEAR_OPTIONS => {
                self.clear_options(Options::from_bits_retain(to_flags(larg)))
                    .bits() as i64
            }
            ctrl::MODE => self.set_mode(Mode::from_bits_retain(to_flags(larg))).bits() as i64,
            ctrl::CLEAR_MODE => self.clear_mode(Mode::from_bits_retain(to_flags(larg))).bits() as i64,
            _ => {
                let method = self.method();
                method.table().ctx_ctrl(&self.config().cert, cmd, larg)
            }
        }
    }

    /// Installs a callback by kind. Returns 1 when handled.
    pub fn callback_ctrl(&self, cb: CallbackCtrl) -> i64 {
        match cb {
            CallbackCtrl::MsgCallback(cb) => {
                self.config_mut().msg_callback = Some(cb);
                1
            }
            CallbackCtrl::ServerName(cb) => {
                self.config_mut().servername_cb = Some(cb);
                1
            }
            other => {
                let method = self.method();
                method.table().callback_ctrl(&mut self.config_mut().cert, other)
            }
        }
    }
}
