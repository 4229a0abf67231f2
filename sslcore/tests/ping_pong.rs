//! Ping-pong exchanges between a client and a server over local sockets.

use sslcore::{
    Certificate, ConnectionConfig, ContextBuilder, ErrorKind, IOCallbacks, KeyAlgorithm, Method,
    PrivateKey, Role, SignatureAlgorithm,
};

use async_trait::async_trait;
use bytes::BytesMut;
use test_case::test_case;
use tokio::net::{UnixDatagram, UnixStream};

#[async_trait]
trait SockIO {
    async fn ready(&self, interest: tokio::io::Interest) -> std::io::Result<tokio::io::Ready>;

    fn try_recv(&self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn try_send(&self, buf: &[u8]) -> std::io::Result<usize>;
}

struct SockIOCallbacks<IOCB: SockIO>(std::rc::Rc<IOCB>);

// `#[derive(Clone)]` insists on `IOCB` being `Clone`, which isn't needed due to our `Rc`
impl<IOCB: SockIO> Clone for SockIOCallbacks<IOCB> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<IOCB: SockIO> SockIOCallbacks<IOCB> {
    async fn poll(&self, interest: tokio::io::Interest) {
        let _ = self.0.ready(interest).await.unwrap();
    }
}

macro_rules! retry_io {
    { $iocb:expr, $f:expr } => {
        loop {
            match $f {
                Ok(sslcore::Poll::PendingRead) => $iocb.poll(tokio::io::Interest::READABLE).await,
                Ok(sslcore::Poll::PendingWrite) => $iocb.poll(tokio::io::Interest::WRITABLE).await,
                Ok(sslcore::Poll::Ready(ok)) => break Ok(ok),
                Ok(sslcore::Poll::AppData(_)) => panic!("Unexpected/Unhandled AppData"),
                Ok(sslcore::Poll::PendingLookup) => panic!("No certificate lookup expected"),
                Err(err) => break Err(err),
            };
        }
    }
}

impl<IOCB: SockIO> IOCallbacks for SockIOCallbacks<IOCB> {
    fn recv(&mut self, buf: &mut [u8]) -> sslcore::IOCallbackResult<usize> {
        match self.0.try_recv(buf) {
            Ok(nr) => sslcore::IOCallbackResult::Ok(nr),
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock) => {
                sslcore::IOCallbackResult::WouldBlock
            }
            Err(err) => sslcore::IOCallbackResult::Err(err),
        }
    }

    fn send(&mut self, buf: &[u8]) -> sslcore::IOCallbackResult<usize> {
        match self.0.try_send(buf) {
            Ok(nr) => sslcore::IOCallbackResult::Ok(nr),
            Err(err) if matches!(err.kind(), std::io::ErrorKind::WouldBlock) => {
                sslcore::IOCallbackResult::WouldBlock
            }
            Err(err) => sslcore::IOCallbackResult::Err(err),
        }
    }
}

#[async_trait]
impl SockIO for tokio::net::UnixDatagram {
    async fn ready(&self, interest: tokio::io::Interest) -> std::io::Result<tokio::io::Ready> {
        Self::ready(self, interest).await
    }

    fn try_recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        Self::try_recv(self, buf)
    }

    fn try_send(&self, buf: &[u8]) -> std::io::Result<usize> {
        Self::try_send(self, buf)
    }
}

#[async_trait]
impl SockIO for tokio::net::UnixStream {
    async fn ready(&self, interest: tokio::io::Interest) -> std::io::Result<tokio::io::Ready> {
        Self::ready(self, interest).await
    }

    fn try_recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        Self::try_read(self, buf)
    }

    fn try_send(&self, buf: &[u8]) -> std::io::Result<usize> {
        Self::try_write(self, buf)
    }
}

fn identity(subject: &str) -> (Certificate, PrivateKey) {
    let key = PrivateKey::generate(KeyAlgorithm::Rsa, 2048).expect("generate key");
    let cert = Certificate::issue(subject, "ca", &key, SignatureAlgorithm::Sha1WithRsa);
    (cert, key)
}

/// Runs the client side. Only a failed handshake is reported as an error.
async fn client<S: SockIO>(sock: S, method: Method) -> sslcore::Result<()> {
    let sock = std::rc::Rc::new(sock);

    let (ca_cert, _) = identity("ca");

    let ctx = ContextBuilder::new(method)
        .expect("[Client] new ContextBuilder")
        .with_root_certificate(ca_cert)
        .build();

    let io = SockIOCallbacks(sock);
    let mut conn = ctx
        .new_connection(ConnectionConfig::new(io.clone()))
        .expect("[Client] Create client connection");
    conn.set_connect_state();

    println!("[Client] Connecting...");
    retry_io! { io, conn.try_negotiate() }?;

    assert!(conn.is_init_finished());

    println!("[Client] Starting ping/pong loop");

    let mut buf = BytesMut::with_capacity(1900);

    for ping in ["Hello", "Goodbye", "QUIT"] {
        println!("[Client] Send {ping}");

        let mut ping: BytesMut = ping.into();
        let _nr = retry_io! { io, conn.try_write(&mut ping) }.expect("[Client] try_write");

        buf.clear();

        let nr = retry_io! { io, conn.try_read(&mut buf) }.expect("[Client] try_read");
        let pong = String::from_utf8_lossy(&buf[..nr]);
        println!("[Client] Got pong: {pong}");
    }

    let _ = retry_io! { io, conn.try_shutdown() }.expect("[Client] try_shutdown");

    println!("[Client] Finished");
    Ok(())
}

/// Runs the server side, echoing every ping until "QUIT".
async fn server<S: SockIO>(sock: S, method: Method) -> sslcore::Result<()> {
    let sock = std::rc::Rc::new(sock);

    let (cert, key) = identity("server");

    let ctx = ContextBuilder::new(method)
        .expect("[Server] new ContextBuilder")
        .with_certificate(cert)
        .with_private_key(key)
        .expect("[Server] add private key")
        .build();

    let io = SockIOCallbacks(sock);
    let mut conn = ctx
        .new_connection(ConnectionConfig::new(io.clone()))
        .expect("[Server] Create server connection");
    conn.set_accept_state();

    println!("[Server] Connecting...");
    retry_io! { io, conn.try_negotiate() }?;

    assert!(conn.is_init_finished());

    let mut buf = BytesMut::with_capacity(1900);

    println!("[Server] Starting ping/pong loop");

    loop {
        buf.clear();
        let nr = retry_io! { io, conn.try_read(&mut buf) }.expect("[Server] try_read");
        let ping = String::from_utf8_lossy(&buf[..nr]);
        println!("[Server] Got ping: {ping}");

        // We don't reuse buf since we don't want to mess with truncate and reexpand.

        let mut pong: BytesMut = ping.as_ref().into();
        let _nr = retry_io! { io, conn.try_write(&mut pong) }.expect("[Server] try_write");

        if ping == "QUIT" {
            break;
        }
    }

    // The client's close notify is the end of the stream
    buf.clear();
    let nr = retry_io! { io, conn.try_read(&mut buf) }.expect("[Server] try_read");
    assert_eq!(nr, 0);

    println!("[Server] Finished");
    Ok(())
}

#[tokio::test]
async fn dtls() {
    // Communicate over a local datagram socket for simplicity
    let (client_sock, server_sock) = UnixDatagram::pair().expect("UnixDatagram");

    let client = client(client_sock, Method::DtlsV1Client);
    let server = server(server_sock, Method::DtlsV1Server);

    // Note that this runs concurrently but not in parallel
    let (client, server) = tokio::join!(client, server);
    client.expect("[Client] try_negotiate");
    server.expect("[Server] try_negotiate");
}

#[test_case(Method::TlsClient, Method::TlsServer; "client_any_server_any")]
#[test_case(Method::TlsClient, Method::SslV3Server; "client_any_server_ssl3")]
#[test_case(Method::TlsV1Client, Method::TlsServer; "client_tls1_server_any")]
#[test_case(Method::SslV3Client, Method::SslV3Server; "client_ssl3_server_ssl3")]
#[tokio::test]
async fn tls(client_method: Method, server_method: Method) {
    // Communicate over a local stream socket for simplicity
    let (client_sock, server_sock) = UnixStream::pair().expect("UnixStream");

    let client = client(client_sock, client_method);
    let server = server(server_sock, server_method);

    let (client, server) = tokio::join!(client, server);
    client.expect("[Client] try_negotiate");
    server.expect("[Server] try_negotiate");
}

#[test_case(Method::TlsV1Client, Method::SslV3Server, Role::Client; "client_tls1_server_ssl3")]
#[test_case(Method::SslV3Client, Method::TlsV1Server, Role::Server; "client_ssl3_server_tls1")]
#[tokio::test]
async fn tls_version_mismatch(client_method: Method, server_method: Method, rejecting: Role) {
    let (client_sock, server_sock) = UnixStream::pair().expect("UnixStream");

    let client = client(client_sock, client_method);
    let server = server(server_sock, server_method);

    let (client, server) = tokio::join!(client, server);
    let (rejected, peer) = match rejecting {
        Role::Client => (client, server),
        Role::Server => (server, client),
    };
    assert_eq!(
        rejected.expect_err("version accepted").kind(),
        ErrorKind::WrongVersionNumber
    );
    // The other end sees the alert or the closed socket
    assert!(peer.is_err());
}
