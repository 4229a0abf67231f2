//! Session resumption across connections that share a context.

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{Arc, Mutex, OnceLock},
};

use bytes::{Buf, BytesMut};
use sslcore::{
    Certificate, Connection, ConnectionConfig, ConnectionState, Context, ContextBuilder,
    IOCallbackResult, IOCallbacks, KeyAlgorithm, Method, Poll, PrivateKey, Session,
    SessionCacheMode, SignatureAlgorithm, Stat,
};

static INIT_ENV_LOGGER: OnceLock<()> = OnceLock::new();

/// One direction of an in-memory stream.
type Pipe = Rc<RefCell<BytesMut>>;

struct MemoryIO {
    r: Pipe,
    w: Pipe,
}

impl MemoryIO {
    fn pair() -> (Self, Self) {
        let a: Pipe = Default::default();
        let b: Pipe = Default::default();
        (
            Self {
                r: a.clone(),
                w: b.clone(),
            },
            Self { r: b, w: a },
        )
    }
}

impl IOCallbacks for MemoryIO {
    fn recv(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize> {
        let mut r = self.r.borrow_mut();
        if r.is_empty() {
            return IOCallbackResult::WouldBlock;
        }
        let n = buf.len().min(r.len());
        buf[..n].copy_from_slice(&r[..n]);
        r.advance(n);
        IOCallbackResult::Ok(n)
    }

    fn send(&mut self, buf: &[u8]) -> IOCallbackResult<usize> {
        self.w.borrow_mut().extend_from_slice(buf);
        IOCallbackResult::Ok(buf.len())
    }
}

fn identity(subject: &str) -> (Certificate, PrivateKey) {
    let key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).unwrap();
    let cert = Certificate::issue(subject, "ca", &key, SignatureAlgorithm::Sha1WithRsa);
    (cert, key)
}

fn server_builder() -> ContextBuilder {
    let (cert, key) = identity("server");
    ContextBuilder::new(Method::TlsV1Server)
        .unwrap()
        .with_certificate(cert)
        .with_private_key(key)
        .unwrap()
        .with_session_id_context(b"resumption")
        .unwrap()
}

fn client_ctx() -> Context {
    ContextBuilder::new(Method::TlsV1Client).unwrap().build()
}

/// Handshakes, optionally offering `session`, then shuts both ends down
/// cleanly. Returns whether the session was reused and the client's
/// session afterwards.
fn run(client_ctx: &Context, server_ctx: &Context, session: Option<Session>) -> (bool, Session) {
    run_with(client_ctx, server_ctx, session, |_| {})
}

fn run_with(
    client_ctx: &Context,
    server_ctx: &Context,
    session: Option<Session>,
    setup_server: impl FnOnce(&mut Connection<MemoryIO>),
) -> (bool, Session) {
    let (client_io, server_io) = MemoryIO::pair();
    let mut client = client_ctx
        .new_connection(ConnectionConfig::new(client_io).when_some(session, |c, s| c.with_session(s)))
        .unwrap();
    let mut server = server_ctx
        .new_connection(ConnectionConfig::new(server_io))
        .unwrap();
    client.set_connect_state();
    server.set_accept_state();
    setup_server(&mut server);

    for _ in 0..7 {
        let _ = client.try_negotiate().unwrap();
        let _ = server.try_negotiate().unwrap();
    }
    assert!(client.is_init_finished());
    assert!(server.is_init_finished());
    assert_eq!(client.session_reused(), server.session_reused());

    assert!(matches!(client.try_shutdown(), Ok(Poll::Ready(false))));
    assert!(matches!(server.try_shutdown(), Ok(Poll::Ready(_))));

    (client.session_reused(), client.get1_session().unwrap())
}

#[test]
fn resume_from_internal_cache() {
    INIT_ENV_LOGGER.get_or_init(env_logger::init);

    let client_ctx = client_ctx();
    let server_ctx = server_builder().build();

    let (reused, session) = run(&client_ctx, &server_ctx, None);
    assert!(!reused);
    assert_eq!(server_ctx.sess_number(), 1);
    assert_eq!(server_ctx.stats().get(Stat::Misses), 0);

    let (reused, resumed) = run(&client_ctx, &server_ctx, Some(session.clone()));
    assert!(reused);
    assert!(resumed.ptr_eq(&session));
    assert_eq!(server_ctx.stats().get(Stat::Hit), 1);
    assert_eq!(server_ctx.stats().get(Stat::AcceptGood), 2);
    assert_eq!(server_ctx.sess_number(), 1);
}

#[test]
fn unknown_session_falls_back_to_full_handshake() {
    INIT_ENV_LOGGER.get_or_init(env_logger::init);

    let client_ctx = client_ctx();
    let first_server = server_builder().build();
    let second_server = server_builder().build();

    let (_, session) = run(&client_ctx, &first_server, None);
    let (reused, fresh) = run(&client_ctx, &second_server, Some(session.clone()));

    assert!(!reused);
    assert_ne!(fresh.id(), session.id());
    assert_eq!(second_server.stats().get(Stat::Misses), 1);
    assert_eq!(second_server.sess_number(), 1);
}

#[test]
fn session_id_context_must_match() {
    INIT_ENV_LOGGER.get_or_init(env_logger::init);

    let client_ctx = client_ctx();
    let server_ctx = server_builder().build();

    let (_, session) = run(&client_ctx, &server_ctx, None);
    let (reused, _) = run_with(&client_ctx, &server_ctx, Some(session), |server| {
        server.set_session_id_context(b"elsewhere").unwrap();
    });
    assert!(!reused);
    assert_eq!(server_ctx.stats().get(Stat::Hit), 0);
}

#[test]
fn external_cache_through_callbacks() {
    INIT_ENV_LOGGER.get_or_init(env_logger::init);

    let store: Arc<Mutex<Vec<Session>>> = Default::default();
    let stored = store.clone();
    let lookup = store.clone();

    let server_ctx = server_builder()
        .with_session_cache_mode(SessionCacheMode::SERVER | SessionCacheMode::NO_INTERNAL)
        .with_new_session_callback(Arc::new(move |_: &ConnectionState, session: Session| {
            stored.lock().unwrap().push(session);
            true
        }))
        .with_get_session_callback(Arc::new(move |_: &ConnectionState, id: &[u8]| {
            lookup
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id().as_bytes() == id)
                .cloned()
        }))
        .build();
    let client_ctx = client_ctx();

    let (_, session) = run(&client_ctx, &server_ctx, None);
    assert_eq!(store.lock().unwrap().len(), 1);
    assert_eq!(server_ctx.sess_number(), 0);

    let (reused, _) = run(&client_ctx, &server_ctx, Some(session));
    assert!(reused);
    assert_eq!(server_ctx.stats().get(Stat::CbHit), 1);
    // Nothing was looked up internally
    assert_eq!(server_ctx.stats().get(Stat::Misses), 0);
    assert_eq!(server_ctx.sess_number(), 0);
    // A resumed session is not announced again
    assert_eq!(store.lock().unwrap().len(), 1);
}

#[test]
fn expired_session_is_not_resumed() {
    INIT_ENV_LOGGER.get_or_init(env_logger::init);

    let removed = Arc::new(Mutex::new(0));
    let counter = removed.clone();
    let server_ctx = server_builder()
        .with_session_timeout(1)
        .with_remove_session_callback(Arc::new(move |_: &Session| {
            *counter.lock().unwrap() += 1;
        }))
        .build();
    let client_ctx = client_ctx();

    let (_, session) = run(&client_ctx, &server_ctx, None);
    // The server's cached copy carries its context's timeout
    let cached = server_ctx
        .lookup_session(session.version(), session.id().as_bytes())
        .expect("cached on the server");
    assert_eq!(cached.timeout(), 1);
    drop(cached);

    std::thread::sleep(std::time::Duration::from_secs(2));

    let (reused, _) = run(&client_ctx, &server_ctx, Some(session));
    assert!(!reused);
    assert_eq!(server_ctx.stats().get(Stat::Timeouts), 1);
    assert_eq!(*removed.lock().unwrap(), 1);
    // Only the new full handshake's session remains
    assert_eq!(server_ctx.sess_number(), 1);
}

#[test]
fn client_cache_mode_stores_client_sessions() {
    INIT_ENV_LOGGER.get_or_init(env_logger::init);

    let client_ctx = ContextBuilder::new(Method::TlsV1Client)
        .unwrap()
        .with_session_cache_mode(SessionCacheMode::CLIENT)
        .build();
    let server_ctx = server_builder().build();

    let (_, session) = run(&client_ctx, &server_ctx, None);
    assert_eq!(client_ctx.sess_number(), 1);
    assert!(client_ctx
        .lookup_session(session.version(), session.id().as_bytes())
        .is_some_and(|s| s.ptr_eq(&session)));
}
