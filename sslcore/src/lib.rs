//! The `sslcore` crate implements the connection state machine of an
//! SSL/TLS endpoint together with the session cache shared by all
//! connections of a context.
//!
//! Cryptography, certificate path validation and the exact wire formats of
//! each protocol version are out of scope; a compact built-in record engine
//! stands in for them so that handshakes, resumption, renegotiation and
//! shutdown can be driven end to end over any [`IOCallbacks`] transport.

mod bio;
mod cache;
mod callback;
mod cert;
mod cipher;
mod context;
pub mod ctrl;
mod error;
mod method;
mod session;
mod ssl;

#[cfg(test)]
mod test_helpers;

pub use cache::{SessionCacheMode, SessionStats, Stat, SESSION_CACHE_MAX_SIZE_DEFAULT};
pub use callback::*;
pub use cert::*;
pub use cipher::*;
pub use context::*;
pub use ctrl::{CallbackCtrl, Mode, Options};
pub use ssl::*;

pub use error::{AlertDescription, Error, ErrorKind, Poll, PollResult, Result, SslError};
pub use session::{
    Session, SessionBuilder, SessionId, MAX_SESSION_ID_LENGTH, MAX_SID_CTX_LENGTH,
    SSL2_SESSION_ID_LENGTH,
};

/// Record size is defined as `2^14 + 1`.
///
/// A single call to [`Connection::write`] sends at most `2^14` bytes of
/// application data per record, so payloads of this size take two records.
pub const TLS_MAX_RECORD_SIZE: usize = 2usize.pow(14) + 1;

/// Protocol versions, with their wire encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    /// SSL 2.0
    SslV2,
    /// SSL 3.0
    SslV3,
    /// TLS 1.0
    TlsV1,
    /// DTLS 1.0
    DtlsV1,
    /// Anything else
    Unknown,
}

impl ProtocolVersion {
    /// The version number carried in hellos and record headers
    pub fn wire(self) -> u16 {
        match self {
            Self::SslV2 => 0x0002,
            Self::SslV3 => 0x0300,
            Self::TlsV1 => 0x0301,
            Self::DtlsV1 => 0xFEFF,
            Self::Unknown => 0,
        }
    }

    /// Decodes a wire version number
    pub fn from_wire(v: u16) -> Self {
        match v {
            0x0002 => Self::SslV2,
            0x0300 => Self::SslV3,
            0x0301 => Self::TlsV1,
            0xFEFF => Self::DtlsV1,
            _ => Self::Unknown,
        }
    }

    /// The name reported by [`ConnectionState::get_version`]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SslV2 => "SSLv2",
            Self::SslV3 => "SSLv3",
            Self::TlsV1 => "TLSv1",
            Self::DtlsV1 => "DTLSv1",
            Self::Unknown => "unknown",
        }
    }
}

/// Which end of a connection we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Initiates the handshake
    Client,
    /// Answers the handshake
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Roles {
    Both,
    Client,
    Server,
}

/// Selects the protocol method table of a [`Context`].
///
/// Each version exists as a client-only, server-only and dual role
/// method. The `Tls*` family negotiates SSLv3 or TLSv1 with the peer and
/// then continues with the matching fixed-version method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// SSLv2, either role
    SslV2,
    /// SSLv2 client
    SslV2Client,
    /// SSLv2 server
    SslV2Server,
    /// SSLv3, either role
    SslV3,
    /// SSLv3 client
    SslV3Client,
    /// SSLv3 server
    SslV3Server,
    /// TLSv1, either role
    TlsV1,
    /// TLSv1 client
    TlsV1Client,
    /// TLSv1 server
    TlsV1Server,
    /// DTLSv1, either role
    DtlsV1,
    /// DTLSv1 client
    DtlsV1Client,
    /// DTLSv1 server
    DtlsV1Server,
    /// Version flexible, either role
    Tls,
    /// Version flexible client
    TlsClient,
    /// Version flexible server
    TlsServer,
}

impl Method {
    fn parts(self) -> (Option<ProtocolVersion>, Roles) {
        use ProtocolVersion::*;
        match self {
            Self::SslV2 => (Some(SslV2), Roles::Both),
            Self::SslV2Client => (Some(SslV2), Roles::Client),
            Self::SslV2Server => (Some(SslV2), Roles::Server),
            Self::SslV3 => (Some(SslV3), Roles::Both),
            Self::SslV3Client => (Some(SslV3), Roles::Client),
            Self::SslV3Server => (Some(SslV3), Roles::Server),
            Self::TlsV1 => (Some(TlsV1), Roles::Both),
            Self::TlsV1Client => (Some(TlsV1), Roles::Client),
            Self::TlsV1Server => (Some(TlsV1), Roles::Server),
            Self::DtlsV1 => (Some(DtlsV1), Roles::Both),
            Self::DtlsV1Client => (Some(DtlsV1), Roles::Client),
            Self::DtlsV1Server => (Some(DtlsV1), Roles::Server),
            Self::Tls => (None, Roles::Both),
            Self::TlsClient => (None, Roles::Client),
            Self::TlsServer => (None, Roles::Server),
        }
    }

    /// The version a connection starts out with. The flexible methods
    /// start at their highest version.
    pub fn version(self) -> ProtocolVersion {
        self.parts().0.unwrap_or(ProtocolVersion::TlsV1)
    }

    /// Whether this method negotiates its version with the peer
    pub fn is_flexible(self) -> bool {
        self.parts().0.is_none()
    }

    /// Whether connections can act as clients
    pub fn can_connect(self) -> bool {
        self.parts().1 != Roles::Server
    }

    /// Whether connections can act as servers
    pub fn can_accept(self) -> bool {
        self.parts().1 != Roles::Client
    }

    /// Whether this is a datagram method
    pub fn is_dtls(self) -> bool {
        self.parts().0 == Some(ProtocolVersion::DtlsV1)
    }

    /// The fixed-version method with the same roles as `self`
    pub fn for_version(self, version: ProtocolVersion) -> Option<Method> {
        use ProtocolVersion::*;
        let method = match (version, self.parts().1) {
            (SslV2, Roles::Both) => Self::SslV2,
            (SslV2, Roles::Client) => Self::SslV2Client,
            (SslV2, Roles::Server) => Self::SslV2Server,
            (SslV3, Roles::Both) => Self::SslV3,
            (SslV3, Roles::Client) => Self::SslV3Client,
            (SslV3, Roles::Server) => Self::SslV3Server,
            (TlsV1, Roles::Both) => Self::TlsV1,
            (TlsV1, Roles::Client) => Self::TlsV1Client,
            (TlsV1, Roles::Server) => Self::TlsV1Server,
            (DtlsV1, Roles::Both) => Self::DtlsV1,
            (DtlsV1, Roles::Client) => Self::DtlsV1Client,
            (DtlsV1, Roles::Server) => Self::DtlsV1Server,
            (Unknown, _) => return None,
        };
        Some(method)
    }

    pub(crate) fn table(self) -> &'static dyn method::ProtocolMethod {
        method::table_for(self)
    }
}

/// SSL Verification method
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SslVerifyMode {
    /// No verification done
    #[default]
    SslVerifyNone,
    /// Verify peers certificate
    SslVerifyPeer,
    /// Verify client certificate (applies only to server)
    SslVerifyFailIfNoPeerCert,
}

impl SslVerifyMode {
    /// Whether the peer's certificate is requested and checked
    pub fn verifies_peer(self) -> bool {
        self != Self::SslVerifyNone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(ProtocolVersion::SslV2 => "SSLv2")]
    #[test_case(ProtocolVersion::SslV3 => "SSLv3")]
    #[test_case(ProtocolVersion::TlsV1 => "TLSv1")]
    #[test_case(ProtocolVersion::DtlsV1 => "DTLSv1")]
    #[test_case(ProtocolVersion::Unknown => "unknown")]
    fn version_names(v: ProtocolVersion) -> &'static str {
        assert_eq!(ProtocolVersion::from_wire(v.wire()), v);
        v.as_str()
    }

    #[test_case(Method::TlsV1Client => (true, false))]
    #[test_case(Method::TlsV1Server => (false, true))]
    #[test_case(Method::DtlsV1 => (true, true))]
    #[test_case(Method::TlsServer => (false, true))]
    fn method_roles(method: Method) -> (bool, bool) {
        (method.can_connect(), method.can_accept())
    }

    #[test]
    fn flexible_method_resolves_keeping_roles() {
        assert!(Method::TlsClient.is_flexible());
        assert_eq!(Method::TlsClient.version(), ProtocolVersion::TlsV1);
        assert_eq!(
            Method::TlsClient.for_version(ProtocolVersion::SslV3),
            Some(Method::SslV3Client)
        );
        assert_eq!(Method::Tls.for_version(ProtocolVersion::Unknown), None);
        assert!(!Method::SslV3.is_flexible());
    }
}
