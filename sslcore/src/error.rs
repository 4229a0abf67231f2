use bytes::Bytes;
use thiserror::Error;

use crate::cert::VerifyError;

/// The `Result::Ok` for a non-blocking operation.
#[derive(Debug)]
pub enum Poll<T> {
    /// Underlying IO operations are still ongoing. No output has been generated
    /// yet. A write is pending
    PendingWrite,
    /// Underlying IO operations are still ongoing. No output has been generated
    /// yet. A read is pending
    PendingRead,
    /// A client certificate callback deferred its answer. Call again once the
    /// callback is able to provide one.
    PendingLookup,
    /// An output has been generated.
    Ready(T),
    /// When under renegotiation the peer may keep sending application data.
    /// This variant carries data that arrived while the handshake was being
    /// driven.
    AppData(Bytes),
}

#[derive(Clone, Error, Debug, PartialEq, Eq)]
/// The failure result of an operation.
pub enum Error {
    /// Application data was announced during a renegotiation but could not
    /// be extracted.
    #[error("App Data: {0}")]
    AppData(ErrorKind),
    /// Top-level errors from connection and context operations.
    #[error("Fatal: {0}")]
    Fatal(ErrorKind),
}

impl Error {
    /// Construct a fatal error
    pub(crate) fn fatal(kind: ErrorKind) -> Self {
        Self::Fatal(kind)
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AppData(e) => e,
            Error::Fatal(e) => e,
        }
        .clone()
    }
}

/// Classification of the result of a connection operation, as computed by
/// [`crate::Connection::get_error`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SslError {
    /// The operation completed.
    None,
    /// A protocol level failure.
    Ssl,
    /// The operation needs the transport to become readable.
    WantRead,
    /// The operation needs the transport to become writable.
    WantWrite,
    /// A certificate lookup callback asked to be called again.
    WantX509Lookup,
    /// An I/O fault, or an unexpected end of stream.
    Syscall,
    /// The peer closed the protocol session cleanly.
    ZeroReturn,
    /// The transport has not finished connecting.
    WantConnect,
    /// The transport has not finished accepting.
    WantAccept,
}

/// Alert descriptions carried by alert records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertDescription {
    /// `close_notify`
    CloseNotify,
    /// `unexpected_message`
    UnexpectedMessage,
    /// `record_overflow`
    RecordOverflow,
    /// `handshake_failure`
    HandshakeFailure,
    /// `bad_certificate`
    BadCertificate,
    /// `illegal_parameter`
    IllegalParameter,
    /// `unknown_ca`
    UnknownCa,
    /// `decode_error`
    DecodeError,
    /// `decrypt_error`
    DecryptError,
    /// `protocol_version`
    ProtocolVersion,
    /// `internal_error`
    InternalError,
    /// `inappropriate_fallback`
    InappropriateFallback,
    /// `no_renegotiation`
    NoRenegotiation,
    /// `unrecognized_name`
    UnrecognizedName,
    /// Any other code
    Unknown(u8),
}

impl From<u8> for AlertDescription {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::CloseNotify,
            10 => Self::UnexpectedMessage,
            22 => Self::RecordOverflow,
            40 => Self::HandshakeFailure,
            42 => Self::BadCertificate,
            47 => Self::IllegalParameter,
            48 => Self::UnknownCa,
            50 => Self::DecodeError,
            51 => Self::DecryptError,
            70 => Self::ProtocolVersion,
            80 => Self::InternalError,
            86 => Self::InappropriateFallback,
            100 => Self::NoRenegotiation,
            112 => Self::UnrecognizedName,
            other => Self::Unknown(other),
        }
    }
}

impl From<AlertDescription> for u8 {
    fn from(alert: AlertDescription) -> u8 {
        match alert {
            AlertDescription::CloseNotify => 0,
            AlertDescription::UnexpectedMessage => 10,
            AlertDescription::RecordOverflow => 22,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::BadCertificate => 42,
            AlertDescription::IllegalParameter => 47,
            AlertDescription::UnknownCa => 48,
            AlertDescription::DecodeError => 50,
            AlertDescription::DecryptError => 51,
            AlertDescription::ProtocolVersion => 70,
            AlertDescription::InternalError => 80,
            AlertDescription::InappropriateFallback => 86,
            AlertDescription::NoRenegotiation => 100,
            AlertDescription::UnrecognizedName => 112,
            AlertDescription::Unknown(code) => code,
        }
    }
}

/// The reason an operation failed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// Read, write or shutdown before a handshake entry point was chosen
    #[error("Connection is uninitialized")]
    Uninitialized,
    /// `do_handshake` before `set_connect_state`/`set_accept_state`
    #[error("Connection type not set")]
    ConnectionTypeNotSet,
    /// Write after our close notify has been sent
    #[error("Protocol is shutdown")]
    ProtocolIsShutdown,
    /// A cipher rule selected nothing
    #[error("No cipher match")]
    NoCipherMatch,
    /// The method offers no cipher suite at all
    #[error("Library has no ciphers")]
    LibraryHasNoCiphers,
    /// Client and server have no usable suite in common
    #[error("No shared cipher")]
    NoSharedCipher,
    /// The resumed session's cipher is missing from the client hello
    #[error("Required cipher missing")]
    RequiredCipherMissing,
    /// A fallback SCSV arrived with a downgraded version
    #[error("Inappropriate fallback")]
    InappropriateFallback,
    /// The renegotiation SCSV arrived during a renegotiation
    #[error("SCSV received when renegotiating")]
    ScsvReceivedWhenRenegotiating,
    /// The received cipher list is malformed
    #[error("Error in received cipher list")]
    ErrorInReceivedCipherList,
    /// No certificate is loaded
    #[error("No certificate assigned")]
    NoCertificateAssigned,
    /// No private key is loaded
    #[error("No private key assigned")]
    NoPrivateKeyAssigned,
    /// The private key does not belong to the certificate
    #[error("Key values mismatch")]
    KeyValuesMismatch,
    /// The password callback was missing or returned the wrong passphrase
    #[error("Bad password read")]
    BadPassword,
    /// A session id context longer than 32 bytes
    #[error("Session id context too long")]
    SessionIdContextTooLong,
    /// Could not generate a session id that is not already cached
    #[error("Session id conflict")]
    SessionIdConflict,
    /// The session id generator returned an invalid length
    #[error("Session id has bad length")]
    SessionIdHasBadLength,
    /// Peer verification requested without a session id context
    #[error("Session id context uninitialized")]
    SessionIdContextUninitialized,
    /// No method exists for the session's protocol version
    #[error("Unable to find SSL method")]
    UnableToFindSslMethod,
    /// The peer uses a protocol version this method does not speak
    #[error("Wrong version number")]
    WrongVersionNumber,
    /// A message that is not valid in the current state
    #[error("Unexpected message")]
    UnexpectedMessage,
    /// A message or record could not be decoded
    #[error("Decode error: {0}")]
    DecodeError(&'static str),
    /// A record longer than the permitted maximum
    #[error("Record too large")]
    RecordTooLarge,
    /// The finished message does not match the transcript
    #[error("Digest check failed")]
    DigestCheckFailed,
    /// Peer certificate verification failed
    #[error("Certificate verify failed: {0}")]
    CertificateVerifyFailed(VerifyError),
    /// The peer did not return a certificate when one was required
    #[error("Peer did not return a certificate")]
    PeerDidNotReturnCertificate,
    /// The peer sent an alert
    #[error("Alert received: {description:?} (fatal: {fatal})")]
    AlertReceived {
        /// Whether the alert level was fatal
        fatal: bool,
        /// The alert description
        description: AlertDescription,
    },
    /// Renegotiation with a peer that does not support secure renegotiation
    #[error("Unsafe legacy renegotiation disabled")]
    UnsafeLegacyRenegotiationDisabled,
    /// The server name callback rejected the requested name
    #[error("Server name rejected")]
    ServerNameRejected,
    /// Application data arrived while a renegotiation was running
    #[error("Application data ready")]
    AppDataReady,
    /// A retried write passed fewer bytes, or a moved buffer
    #[error("Bad write retry")]
    BadWriteRetry,
    /// The session id generator failed to produce an id
    #[error("Session id callback failed")]
    SessionIdCallbackFailed,
    /// A handshake message longer than permitted
    #[error("Excessive message size")]
    ExcessiveMessageSize,
    /// The server picked a cipher we did not offer, or not the one of the
    /// resumed session
    #[error("Wrong cipher returned")]
    WrongCipherReturned,
    /// The server resumed a session that belongs to another session id
    /// context
    #[error("Attempt to reuse session in different context")]
    AttemptToReuseSessionInDifferentContext,
    /// A handshake triggered from within a read failed without a cause
    #[error("Handshake failure")]
    HandshakeFailure,
    /// The method does not implement the requested operation
    #[error("Undefined function")]
    UndefinedFunction,
    /// An inconsistency in the state machine
    #[error("Internal error: {0}")]
    InternalError(&'static str),
    /// The transport reported an error
    #[error("I/O error: {0}")]
    Io(std::io::ErrorKind),
}

impl ErrorKind {
    /// Whether this cause originates in the system layer rather than the
    /// protocol logic.
    pub fn is_system(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind())
    }
}

/// Describes an outcome that is asynchronous. Connection operations can
/// report a `WANT_READ`/`WANT_WRITE`-ish classification, which is not fatal
/// and indicates that the caller should retry again (usually after doing some
/// form of rectification like handling the IO buffers)
pub type PollResult<T> = std::result::Result<Poll<T>, Error>;

/// Describes an outcome that is synchronous.
pub type Result<T> = std::result::Result<T, Error>;
