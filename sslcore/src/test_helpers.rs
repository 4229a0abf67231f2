//! Fixtures shared by the unit tests.

use std::{
    rc::Rc,
    sync::{Mutex, OnceLock},
};

use bytes::{Buf, BytesMut};

use crate::{
    callback::{DuplicateIO, IOCallbackResult, IOCallbacks},
    cert::{Certificate, KeyAlgorithm, PrivateKey, SignatureAlgorithm},
    context::{Context, ContextBuilder},
    ssl::{Connection, ConnectionConfig},
    Method,
};

pub(crate) static INIT_ENV_LOGGER: OnceLock<()> = OnceLock::new();

// Panics if any I/O is attempted, use for tests where no I/O is expected
pub(crate) struct NoIOCallbacks;

impl IOCallbacks for NoIOCallbacks {
    fn recv(&mut self, _buf: &mut [u8]) -> IOCallbackResult<usize> {
        panic!("Unexpected recv on NoIOCallbacks")
    }

    fn send(&mut self, _buf: &[u8]) -> IOCallbackResult<usize> {
        panic!("Unexpected send on NoIOCallbacks")
    }
}

// TCP stream semantics: allows partial reads from a continuous buffer
pub(crate) struct TcpIOCallbacks {
    r: Rc<Mutex<BytesMut>>,
    w: Rc<Mutex<BytesMut>>,
}

impl TcpIOCallbacks {
    pub(crate) fn pair() -> (Self, Self) {
        let left_to_right = Rc::new(Mutex::new(Default::default()));
        let right_to_left = Rc::new(Mutex::new(Default::default()));

        let left = TcpIOCallbacks {
            r: right_to_left.clone(),
            w: left_to_right.clone(),
        };

        let right = TcpIOCallbacks {
            r: left_to_right,
            w: right_to_left,
        };

        (left, right)
    }

    /// Bytes sent by the other end and not read yet
    pub(crate) fn pending_input(&self) -> BytesMut {
        self.r.lock().unwrap().clone()
    }
}

impl IOCallbacks for TcpIOCallbacks {
    fn recv(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize> {
        let mut r = self.r.lock().unwrap();
        if r.is_empty() {
            return IOCallbackResult::WouldBlock;
        }

        let n = std::cmp::min(buf.len(), r.len());
        buf[..n].copy_from_slice(&r[..n]);
        r.advance(n);
        IOCallbackResult::Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> IOCallbackResult<usize> {
        let mut w = self.w.lock().unwrap();
        w.extend_from_slice(buf);
        IOCallbackResult::Ok(buf.len())
    }
}

impl DuplicateIO for TcpIOCallbacks {
    fn duplicate(&self) -> std::io::Result<Self> {
        Ok(Self {
            r: self.r.clone(),
            w: self.w.clone(),
        })
    }
}

/// A certificate for `subject` issued by "ca", and its key.
pub(crate) fn rsa_identity(subject: &str, bits: u32) -> (Certificate, PrivateKey) {
    let key = PrivateKey::generate(KeyAlgorithm::Rsa, bits).unwrap();
    let cert = Certificate::issue(subject, "ca", &key, SignatureAlgorithm::Sha1WithRsa);
    (cert, key)
}

pub(crate) fn server_context(method: Method) -> Context {
    let (cert, key) = rsa_identity("server", 2048);
    ContextBuilder::new(method)
        .unwrap_or_else(|e| panic!("new({method:?}): {e}"))
        .with_certificate(cert)
        .with_private_key(key)
        .unwrap()
        .with_session_id_context(b"sslcore-tests")
        .unwrap()
        .build()
}

pub(crate) fn client_context(method: Method) -> Context {
    let (ca, _) = rsa_identity("ca", 2048);
    ContextBuilder::new(method)
        .unwrap_or_else(|e| panic!("new({method:?}): {e}"))
        .with_root_certificate(ca)
        .build()
}

/// Runs a full handshake between fresh connections of the two contexts.
pub(crate) fn make_connected_pair(
    client_ctx: &Context,
    server_ctx: &Context,
) -> (Connection<TcpIOCallbacks>, Connection<TcpIOCallbacks>) {
    let (client_io, server_io) = TcpIOCallbacks::pair();

    let mut client = client_ctx
        .new_connection(ConnectionConfig::new(client_io))
        .unwrap();
    let mut server = server_ctx
        .new_connection(ConnectionConfig::new(server_io))
        .unwrap();
    client.set_connect_state();
    server.set_accept_state();

    for _ in 0..7 {
        let _ = client.try_negotiate().unwrap();
        let _ = server.try_negotiate().unwrap();
        // Progress is made because one of the above will have
        // written and the other will have PendingRead...
    }

    assert!(client.is_init_finished());
    assert!(server.is_init_finished());

    (client, server)
}
