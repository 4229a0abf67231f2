use std::sync::Arc;

use crate::{
    cert::{Certificate, PrivateKey, VerifyError},
    error::AlertDescription,
    session::Session,
    ssl::ConnectionState,
    Context, ProtocolVersion,
};

/// Return type for [`IOCallbacks`] operations.
#[derive(Debug)]
pub enum IOCallbackResult<T> {
    /// Success
    Ok(T),
    /// The operation would block, retry once the transport is ready.
    /// Use [`IOCallbacks::retry_reason`] to refine why.
    WouldBlock,
    /// Any other error
    Err(std::io::Error),
}

/// Why a transport operation asked to be retried.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// The transport needs to become readable
    Read,
    /// The transport needs to become writable
    Write,
    /// The underlying link is still connecting
    Connect,
    /// The underlying link is still being accepted
    Accept,
    /// Something the connection cannot act on
    Other,
}

/// The application provided byte-stream transport.
///
/// Both methods are non-blocking. A [`IOCallbackResult::WouldBlock`]
/// return records a retry reason which
/// [`crate::Connection::get_error`] later consults.
pub trait IOCallbacks {
    /// Called when the connection wishes to receive some data.
    ///
    /// Should read as many bytes as possible into `buf` and return
    /// the number of bytes. `Ok(0)` signals end of stream.
    fn recv(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize>;

    /// Called when the connection wishes to send some data
    ///
    /// Should write as many bytes from `buf` as possible and return
    /// the number of bytes.
    fn send(&mut self, buf: &[u8]) -> IOCallbackResult<usize>;

    /// Refines the reason of the last [`IOCallbackResult::WouldBlock`].
    ///
    /// `None` means the obvious direction: read for `recv`, write for
    /// `send`.
    fn retry_reason(&self) -> Option<RetryReason> {
        None
    }
}

/// Transports that can be duplicated, needed by [`crate::Connection::dup`].
pub trait DuplicateIO: IOCallbacks + Sized {
    /// Produces an independent handle onto the same underlying channel.
    fn duplicate(&self) -> std::io::Result<Self>;
}

/// Record trace handed to the message callback.
#[derive(Debug)]
pub struct MsgInfo<'a> {
    /// `true` for records we send
    pub write: bool,
    /// Record layer version
    pub version: ProtocolVersion,
    /// Record content type
    pub content_type: u8,
    /// Record payload
    pub data: &'a [u8],
    /// The value set through `SET_MSG_CALLBACK_ARG`
    pub arg: i64,
}

/// Handshake progress events reported to the info callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoEvent {
    /// A handshake (initial or renegotiation) begins
    HandshakeStart,
    /// A handshake finished successfully
    HandshakeDone,
    /// An alert was read from the peer
    ReadAlert {
        /// Alert level was fatal
        fatal: bool,
        /// Alert description
        description: AlertDescription,
    },
    /// An alert was written to the peer
    WriteAlert {
        /// Alert level was fatal
        fatal: bool,
        /// Alert description
        description: AlertDescription,
    },
}

/// State handed to the verify callback.
#[derive(Debug)]
pub struct VerifyContext<'a> {
    /// The chain presented by the peer, leaf first
    pub chain: &'a [Certificate],
    /// Maximum permitted depth
    pub depth: u32,
    /// The verdict of the certificate verifier
    pub error: Option<VerifyError>,
}

/// What the server name callback wants done.
pub enum ServerNameAction {
    /// Keep the current context
    Accept,
    /// Abort the handshake with `unrecognized_name`
    Reject,
    /// Continue with the certificates and settings of another context
    SwitchContext(Context),
}

/// Answer of the client certificate callback.
pub enum ClientCertLookup {
    /// Present this certificate
    Provide(Certificate, PrivateKey),
    /// Continue without a certificate
    NoCertificate,
    /// Not ready yet; the handshake reports `WANT_X509_LOOKUP`
    Retry,
}

/// Invoked after a session was added to the cache (or would have been, if
/// internal storage is disabled). Receives a reference to the session and
/// returns `true` if it keeps that reference.
pub type NewSessionCallback = Arc<dyn Fn(&ConnectionState, Session) -> bool + Send + Sync>;
/// Invoked for every session leaving the cache.
pub type RemoveSessionCallback = Arc<dyn Fn(&Session) + Send + Sync>;
/// Consulted by servers when the internal cache does not know a session id.
pub type GetSessionCallback =
    Arc<dyn Fn(&ConnectionState, &[u8]) -> Option<Session> + Send + Sync>;
/// Fills the buffer with a session id, returning its length.
pub type GenerateSessionIdCallback =
    Arc<dyn Fn(&ConnectionState, &mut [u8]) -> Option<usize> + Send + Sync>;
/// Given the verifier's verdict, decides whether to proceed.
pub type VerifyCallback = Arc<dyn Fn(bool, &VerifyContext<'_>) -> bool + Send + Sync>;
/// Protocol tracing.
pub type MsgCallback = Arc<dyn Fn(&MsgInfo<'_>) + Send + Sync>;
/// Handshake progress notifications.
pub type InfoCallback = Arc<dyn Fn(&ConnectionState, InfoEvent) + Send + Sync>;
/// Supplies the passphrase for encrypted private keys. The argument is
/// `true` when the key is being written rather than read.
pub type PasswordCallback = Arc<dyn Fn(bool) -> Option<String> + Send + Sync>;
/// Server side handling of the requested server name.
pub type ServerNameCallback =
    Arc<dyn Fn(&ConnectionState, &str) -> ServerNameAction + Send + Sync>;
/// Client side selection of a certificate when the server requests one.
pub type ClientCertCallback = Arc<dyn Fn(&ConnectionState) -> ClientCertLookup + Send + Sync>;
