//! Numeric control commands and the option and mode bit sets they drive.
//!
//! Command numbers follow the values applications of the classic C API
//! already use, so a command table can be ported as is.

use bitflags::bitflags;

use crate::{callback::MsgCallback, callback::ServerNameCallback, cert::TmpKeyCallback};

/// Whether a temporary RSA key must be supplied
pub const NEED_TMP_RSA: i32 = 1;
/// Whether the last handshake resumed a session
pub const GET_SESSION_REUSED: i32 = 8;
/// Whether the server requested a client certificate
pub const GET_CLIENT_CERT_REQUEST: i32 = 9;
/// Renegotiations since the last clear
pub const GET_NUM_RENEGOTIATIONS: i32 = 10;
/// Resets the renegotiation counter, returning its previous value
pub const CLEAR_NUM_RENEGOTIATIONS: i32 = 11;
/// Renegotiations over the connection's lifetime
pub const GET_TOTAL_RENEGOTIATIONS: i32 = 12;
/// Sets the value handed to the message callback
pub const SET_MSG_CALLBACK_ARG: i32 = 16;
/// Sets the DTLS path MTU
pub const SET_MTU: i32 = 17;

/// Number of cached sessions
pub const SESS_NUMBER: i32 = 20;
/// Client handshakes started
pub const SESS_CONNECT: i32 = 21;
/// Client handshakes completed
pub const SESS_CONNECT_GOOD: i32 = 22;
/// Client renegotiations started
pub const SESS_CONNECT_RENEGOTIATE: i32 = 23;
/// Server handshakes started
pub const SESS_ACCEPT: i32 = 24;
/// Server handshakes completed
pub const SESS_ACCEPT_GOOD: i32 = 25;
/// Server renegotiations started
pub const SESS_ACCEPT_RENEGOTIATE: i32 = 26;
/// Internal cache hits
pub const SESS_HIT: i32 = 27;
/// Get-session callback hits
pub const SESS_CB_HIT: i32 = 28;
/// Offered sessions not found
pub const SESS_MISSES: i32 = 29;
/// Offered sessions expired
pub const SESS_TIMEOUTS: i32 = 30;
/// Evictions due to a full cache
pub const SESS_CACHE_FULL: i32 = 31;

/// Sets option bits, returning the new options
pub const OPTIONS: i32 = 32;
/// Sets mode bits, returning the new mode
pub const MODE: i32 = 33;

/// Read-ahead flag
pub const GET_READ_AHEAD: i32 = 40;
/// Sets read-ahead, returning the previous value
pub const SET_READ_AHEAD: i32 = 41;
/// Sets the cache bound, returning the previous one
pub const SET_SESS_CACHE_SIZE: i32 = 42;
/// The cache bound
pub const GET_SESS_CACHE_SIZE: i32 = 43;
/// Sets the cache mode, returning the previous one
pub const SET_SESS_CACHE_MODE: i32 = 44;
/// The cache mode
pub const GET_SESS_CACHE_MODE: i32 = 45;

/// Longest certificate list accepted from the peer
pub const GET_MAX_CERT_LIST: i32 = 50;
/// Sets the certificate list bound, returning the previous one
pub const SET_MAX_CERT_LIST: i32 = 51;

/// Whether the peer supports secure renegotiation
pub const GET_RI_SUPPORT: i32 = 76;
/// Clears option bits, returning the new options
pub const CLEAR_OPTIONS: i32 = 77;
/// Clears mode bits, returning the new mode
pub const CLEAR_MODE: i32 = 78;

/// Default bound on the peer's certificate list, in bytes.
pub const DEFAULT_MAX_CERT_LIST: i64 = 1024 * 100;

bitflags! {
    /// Behaviour switches of a context or connection.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Options: u32 {
        /// Connect to servers that do not support secure renegotiation
        const LEGACY_SERVER_CONNECT = 0x0000_0004;
        /// Do not issue session tickets
        const NO_TICKET = 0x0000_4000;
        /// Always run a full handshake when renegotiating as a server
        const NO_SESSION_RESUMPTION_ON_RENEGOTIATION = 0x0001_0000;
        /// Renegotiate with peers lacking secure renegotiation
        const ALLOW_UNSAFE_LEGACY_RENEGOTIATION = 0x0004_0000;
        /// Pick the server's preferred cipher instead of the client's
        const CIPHER_SERVER_PREFERENCE = 0x0040_0000;
        /// Refuse SSLv2 in the version flexible method
        const NO_SSLV2 = 0x0100_0000;
        /// Refuse SSLv3 in the version flexible method
        const NO_SSLV3 = 0x0200_0000;
        /// Refuse TLSv1 in the version flexible method
        const NO_TLSV1 = 0x0400_0000;
    }
}

bitflags! {
    /// I/O behaviour of a context or connection.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Mode: u32 {
        /// `write` may return after part of the buffer was sent
        const ENABLE_PARTIAL_WRITE = 0x0001;
        /// A retried `write` may pass a different buffer
        const ACCEPT_MOVING_WRITE_BUFFER = 0x0002;
        /// `read` retries internally after handling a handshake record
        const AUTO_RETRY = 0x0004;
        /// Announce a fallback connection attempt
        const SEND_FALLBACK_SCSV = 0x0080;
    }
}

/// Callbacks installable through `callback_ctrl`.
pub enum CallbackCtrl {
    /// Record tracing
    MsgCallback(MsgCallback),
    /// Temporary RSA key supplier
    TmpRsa(TmpKeyCallback),
    /// Temporary DH parameter supplier
    TmpDh(TmpKeyCallback),
    /// Temporary ECDH key supplier
    TmpEcdh(TmpKeyCallback),
    /// Server name handling; contexts only
    ServerName(ServerNameCallback),
}

pub(crate) fn to_flags(larg: i64) -> u32 {
    larg as u32
}
