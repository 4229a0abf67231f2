//! Protocol method tables.
//!
//! Every [`Method`] resolves to a static [`ProtocolMethod`] which carries
//! the version specific behaviour of a connection: the handshake entry
//! points, record I/O, renegotiation and the `ctrl` commands the version
//! understands. Stream versions share one engine; SSLv2 differs in its
//! cipher code width, its default session timeout and its control
//! surface, and the flexible methods negotiate a version before handing
//! over to the fixed method of that version.

mod handshake;
mod record;

use bytes::BytesMut;

pub(crate) use handshake::{fill_random, step_name};
pub(crate) use record::{CipherState, RecordLayer};

use crate::{
    bio::RecordIo,
    cert::CertSet,
    cipher::{get_cipher_code, put_cipher_code, CipherSuite},
    ctrl::{self, CallbackCtrl},
    error::ErrorKind,
    ssl::ConnectionState,
    Method, ProtocolVersion,
};

/// Smallest MTU accepted for datagram connections.
pub(crate) const DTLS_MIN_MTU: u64 = 228;

/// Why the engine stopped before completing an operation.
#[derive(Debug)]
pub(crate) enum Interrupt {
    /// The transport would block; `rwstate` tells in which direction
    Retry,
    /// End of stream, or the peer's close notify
    Eof,
    /// Application data arrived during a renegotiation and was stashed
    AppData,
    /// The operation failed
    Fatal(ErrorKind),
}

impl From<ErrorKind> for Interrupt {
    fn from(kind: ErrorKind) -> Self {
        Self::Fatal(kind)
    }
}

pub(crate) type Flow<T> = std::result::Result<T, Interrupt>;

/// Per-version behaviour of a connection.
///
/// Integer returns follow the classic convention: positive on success,
/// `0` on a clean stop or end of stream and `-1` when the caller has to
/// consult `get_error`.
pub(crate) trait ProtocolMethod: Sync {
    fn version(&self) -> ProtocolVersion;

    fn can_connect(&self) -> bool;

    fn can_accept(&self) -> bool;

    /// Negotiates the version with the peer
    fn is_flexible(&self) -> bool {
        false
    }

    fn is_dtls(&self) -> bool {
        self.version() == ProtocolVersion::DtlsV1
    }

    /// Sets up the per-connection record state
    fn new(&self, s: &mut ConnectionState) -> bool {
        s.s3 = RecordLayer::with_buffers();
        s.version = self.version();
        true
    }

    fn free(&self, s: &mut ConnectionState) {
        s.s3 = RecordLayer::default();
    }

    fn clear(&self, s: &mut ConnectionState) {
        s.s3.reset();
        s.version = self.version();
    }

    fn connect(&self, s: &mut ConnectionState, io: &mut dyn RecordIo) -> i32 {
        if !self.can_connect() {
            return undefined_function(s);
        }
        let res = handshake::connect(s, io);
        record::finish(s, io, res.map(|()| 1))
    }

    fn accept(&self, s: &mut ConnectionState, io: &mut dyn RecordIo) -> i32 {
        if !self.can_accept() {
            return undefined_function(s);
        }
        let res = handshake::accept(s, io);
        record::finish(s, io, res.map(|()| 1))
    }

    fn read(&self, s: &mut ConnectionState, io: &mut dyn RecordIo, buf: &mut [u8]) -> isize {
        let res = record::read_app(s, io, buf, false);
        record::finish_len(s, io, res)
    }

    fn peek(&self, s: &mut ConnectionState, io: &mut dyn RecordIo, buf: &mut [u8]) -> isize {
        let res = record::read_app(s, io, buf, true);
        record::finish_len(s, io, res)
    }

    fn write(&self, s: &mut ConnectionState, io: &mut dyn RecordIo, buf: &[u8]) -> isize {
        let res = record::write_app(s, io, buf);
        record::finish_len(s, io, res)
    }

    fn shutdown(&self, s: &mut ConnectionState, io: &mut dyn RecordIo) -> i32 {
        record::shutdown(s, io)
    }

    /// Requests a renegotiation, started by the next `renegotiate_check`
    fn renegotiate(&self, s: &mut ConnectionState) -> i32 {
        if s.handshake_func.is_none() {
            // Not connected yet, the first handshake covers it
            return 1;
        }
        s.s3.renegotiate = true;
        1
    }

    /// Moves a requested renegotiation into the handshake state once no
    /// record is half read or half written.
    fn renegotiate_check(&self, s: &mut ConnectionState) -> i32 {
        if !s.s3.renegotiate || !s.s3.is_idle() || s.in_init() {
            return 0;
        }
        s.state = crate::ssl::HandshakeState::Renegotiate;
        s.s3.renegotiate = false;
        s.s3.num_renegotiations += 1;
        s.s3.total_renegotiations += 1;
        1
    }

    fn pending(&self, s: &ConnectionState) -> usize {
        s.s3.app_buf.len()
    }

    /// Default session lifetime in seconds
    fn get_timeout(&self) -> u64 {
        7200
    }

    fn ctrl(&self, s: &mut ConnectionState, cmd: i32, _larg: i64) -> i64 {
        match cmd {
            ctrl::GET_SESSION_REUSED => s.hit as i64,
            ctrl::GET_CLIENT_CERT_REQUEST => (s.s3.tmp.cert_req != 0) as i64,
            ctrl::GET_NUM_RENEGOTIATIONS => s.s3.num_renegotiations as i64,
            ctrl::CLEAR_NUM_RENEGOTIATIONS => {
                let n = s.s3.num_renegotiations;
                s.s3.num_renegotiations = 0;
                n as i64
            }
            ctrl::GET_TOTAL_RENEGOTIATIONS => s.s3.total_renegotiations as i64,
            ctrl::NEED_TMP_RSA => s.cert.need_tmp_rsa() as i64,
            _ => 0,
        }
    }

    fn ctx_ctrl(&self, cert: &CertSet, cmd: i32, _larg: i64) -> i64 {
        match cmd {
            ctrl::NEED_TMP_RSA => cert.need_tmp_rsa() as i64,
            _ => 0,
        }
    }

    fn callback_ctrl(&self, cert: &mut CertSet, cb: CallbackCtrl) -> i64 {
        match cb {
            CallbackCtrl::TmpRsa(cb) => cert.set_tmp_rsa_callback(cb),
            CallbackCtrl::TmpDh(cb) => cert.set_tmp_dh_callback(cb),
            CallbackCtrl::TmpEcdh(cb) => cert.set_tmp_ecdh_callback(cb),
            CallbackCtrl::MsgCallback(_) | CallbackCtrl::ServerName(_) => return 0,
        }
        1
    }

    /// Bytes per cipher code in hellos
    fn cipher_code_width(&self) -> usize {
        2
    }

    fn put_cipher_by_char(&self, cipher: &CipherSuite, out: &mut BytesMut) -> usize {
        put_cipher_code(cipher.id, self.cipher_code_width(), out)
    }

    fn get_cipher_by_char(&self, bytes: &[u8]) -> Option<&'static CipherSuite> {
        get_cipher_code(bytes).and_then(CipherSuite::lookup)
    }
}

fn undefined_function(s: &mut ConnectionState) -> i32 {
    log::debug!("{:?} has no handler for this role", s.method);
    s.error = Some(ErrorKind::UndefinedFunction);
    0
}

/// SSLv3, TLSv1 and DTLSv1.
pub(crate) struct StreamMethod {
    version: ProtocolVersion,
    connect: bool,
    accept: bool,
}

impl ProtocolMethod for StreamMethod {
    fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn can_connect(&self) -> bool {
        self.connect
    }

    fn can_accept(&self) -> bool {
        self.accept
    }
}

/// SSLv2: three byte cipher codes and a short session lifetime.
pub(crate) struct Ssl2Method {
    connect: bool,
    accept: bool,
}

impl ProtocolMethod for Ssl2Method {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::SslV2
    }

    fn can_connect(&self) -> bool {
        self.connect
    }

    fn can_accept(&self) -> bool {
        self.accept
    }

    fn get_timeout(&self) -> u64 {
        300
    }

    fn ctrl(&self, s: &mut ConnectionState, cmd: i32, _larg: i64) -> i64 {
        match cmd {
            ctrl::GET_SESSION_REUSED => s.hit as i64,
            _ => 0,
        }
    }

    fn ctx_ctrl(&self, _cert: &CertSet, _cmd: i32, _larg: i64) -> i64 {
        0
    }

    fn callback_ctrl(&self, _cert: &mut CertSet, _cb: CallbackCtrl) -> i64 {
        0
    }

    fn cipher_code_width(&self) -> usize {
        3
    }
}

/// Starts at the highest enabled version and switches to the fixed method
/// of whatever version the hellos settle on.
pub(crate) struct FlexibleMethod {
    connect: bool,
    accept: bool,
}

impl ProtocolMethod for FlexibleMethod {
    fn version(&self) -> ProtocolVersion {
        ProtocolVersion::TlsV1
    }

    fn can_connect(&self) -> bool {
        self.connect
    }

    fn can_accept(&self) -> bool {
        self.accept
    }

    fn is_flexible(&self) -> bool {
        true
    }
}

const fn stream(version: ProtocolVersion, connect: bool, accept: bool) -> StreamMethod {
    StreamMethod {
        version,
        connect,
        accept,
    }
}

static SSLV2: Ssl2Method = Ssl2Method {
    connect: true,
    accept: true,
};
static SSLV2_CLIENT: Ssl2Method = Ssl2Method {
    connect: true,
    accept: false,
};
static SSLV2_SERVER: Ssl2Method = Ssl2Method {
    connect: false,
    accept: true,
};
static SSLV3: StreamMethod = stream(ProtocolVersion::SslV3, true, true);
static SSLV3_CLIENT: StreamMethod = stream(ProtocolVersion::SslV3, true, false);
static SSLV3_SERVER: StreamMethod = stream(ProtocolVersion::SslV3, false, true);
static TLSV1: StreamMethod = stream(ProtocolVersion::TlsV1, true, true);
static TLSV1_CLIENT: StreamMethod = stream(ProtocolVersion::TlsV1, true, false);
static TLSV1_SERVER: StreamMethod = stream(ProtocolVersion::TlsV1, false, true);
static DTLSV1: StreamMethod = stream(ProtocolVersion::DtlsV1, true, true);
static DTLSV1_CLIENT: StreamMethod = stream(ProtocolVersion::DtlsV1, true, false);
static DTLSV1_SERVER: StreamMethod = stream(ProtocolVersion::DtlsV1, false, true);
static FLEXIBLE: FlexibleMethod = FlexibleMethod {
    connect: true,
    accept: true,
};
static FLEXIBLE_CLIENT: FlexibleMethod = FlexibleMethod {
    connect: true,
    accept: false,
};
static FLEXIBLE_SERVER: FlexibleMethod = FlexibleMethod {
    connect: false,
    accept: true,
};

pub(crate) fn table_for(method: Method) -> &'static dyn ProtocolMethod {
    match method {
        Method::SslV2 => &SSLV2,
        Method::SslV2Client => &SSLV2_CLIENT,
        Method::SslV2Server => &SSLV2_SERVER,
        Method::SslV3 => &SSLV3,
        Method::SslV3Client => &SSLV3_CLIENT,
        Method::SslV3Server => &SSLV3_SERVER,
        Method::TlsV1 => &TLSV1,
        Method::TlsV1Client => &TLSV1_CLIENT,
        Method::TlsV1Server => &TLSV1_SERVER,
        Method::DtlsV1 => &DTLSV1,
        Method::DtlsV1Client => &DTLSV1_CLIENT,
        Method::DtlsV1Server => &DTLSV1_SERVER,
        Method::Tls => &FLEXIBLE,
        Method::TlsClient => &FLEXIBLE_CLIENT,
        Method::TlsServer => &FLEXIBLE_SERVER,
    }
}
