//! Client and server handshake state machines.
//!
//! Each step either completes and moves `state` forward, or returns an
//! [`Interrupt`] leaving `state` where it was so the same step runs again
//! on the next call. Flights are written into the buffering layer and
//! pushed to the transport by a single flush step.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    record::{self, CHANGE_CIPHER_SPEC, HANDSHAKE, MAX_PLAIN_LENGTH},
    CipherState, Flow, Interrupt,
};
use crate::{
    bio::RecordIo,
    cache::{SessionCacheMode, Stat},
    callback::{ClientCertLookup, IOCallbackResult, InfoEvent, ServerNameAction, VerifyContext},
    cert::{Certificate, KeySlot, TmpKey, VerifyError},
    cipher::{Algorithms, CipherList, CipherSuite},
    ctrl::Options,
    error::{AlertDescription, ErrorKind},
    session::{SessionBuilder, SessionId, MAX_SESSION_ID_LENGTH},
    ssl::{ConnectionState, HandshakeState, ShutdownFlags, Want},
    ProtocolVersion, Role, SslVerifyMode,
};

pub(crate) const HELLO_REQUEST: u8 = 0;
pub(crate) const CLIENT_HELLO: u8 = 1;
pub(crate) const SERVER_HELLO: u8 = 2;
pub(crate) const CERTIFICATE: u8 = 11;
pub(crate) const SERVER_KEY_EXCHANGE: u8 = 12;
pub(crate) const CERTIFICATE_REQUEST: u8 = 13;
pub(crate) const SERVER_HELLO_DONE: u8 = 14;
pub(crate) const CLIENT_KEY_EXCHANGE: u8 = 16;
pub(crate) const FINISHED: u8 = 20;

pub(crate) const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const RANDOM_LEN: usize = 32;
const MASTER_KEY_LEN: usize = 48;
const FINISHED_LEN: usize = 12;
const CLIENT_LABEL: &[u8; 4] = b"CLNT";
const SERVER_LABEL: &[u8; 4] = b"SRVR";

pub(crate) const ST_START: u16 = 0x0000;
const ST_FLUSH: u16 = 0x0001;
const ST_DONE: u16 = 0x0003;

const CW_CLNT_HELLO: u16 = 0x1110;
const CR_SRVR_HELLO: u16 = 0x1120;
const CR_CERT: u16 = 0x1130;
const CR_KEY_EXCH: u16 = 0x1140;
const CR_CERT_REQ: u16 = 0x1150;
const CR_SRVR_DONE: u16 = 0x1160;
const CW_CERT: u16 = 0x1170;
const CW_KEY_EXCH: u16 = 0x1180;
const CW_CHANGE: u16 = 0x11a0;
const CW_FINISHED: u16 = 0x11b0;
const CR_CHANGE: u16 = 0x11c0;
const CR_FINISHED: u16 = 0x11d0;

const SR_CLNT_HELLO: u16 = 0x2110;
const SW_HELLO_REQ: u16 = 0x2120;
const SW_SRVR_HELLO: u16 = 0x2130;
const SW_CERT: u16 = 0x2140;
const SW_KEY_EXCH: u16 = 0x2150;
const SW_CERT_REQ: u16 = 0x2160;
const SW_SRVR_DONE: u16 = 0x2170;
const SR_CERT: u16 = 0x2180;
const SR_KEY_EXCH: u16 = 0x2190;
const SR_CHANGE: u16 = 0x21a0;
const SR_FINISHED: u16 = 0x21b0;
const SW_CHANGE: u16 = 0x21c0;
const SW_FINISHED: u16 = 0x21d0;

/// Human readable name of a handshake step.
pub(crate) fn step_name(step: u16) -> &'static str {
    match step {
        ST_START => "before handshake",
        ST_FLUSH => "flushing flight",
        ST_DONE => "handshake done",
        CW_CLNT_HELLO => "write client hello",
        CR_SRVR_HELLO => "read server hello",
        CR_CERT => "read server certificate",
        CR_KEY_EXCH => "read server key exchange",
        CR_CERT_REQ => "read server certificate request",
        CR_SRVR_DONE => "read server done",
        CW_CERT => "write client certificate",
        CW_KEY_EXCH => "write client key exchange",
        CW_CHANGE | SW_CHANGE => "write change cipher spec",
        CW_FINISHED | SW_FINISHED => "write finished",
        CR_CHANGE | SR_CHANGE => "read change cipher spec",
        CR_FINISHED | SR_FINISHED => "read finished",
        SR_CLNT_HELLO => "read client hello",
        SW_HELLO_REQ => "write hello request",
        SW_SRVR_HELLO => "write server hello",
        SW_CERT => "write certificate",
        SW_KEY_EXCH => "write key exchange",
        SW_CERT_REQ => "write certificate request",
        SW_SRVR_DONE => "write server done",
        SR_CERT => "read client certificate",
        SR_KEY_EXCH => "read client key exchange",
        _ => "unknown state",
    }
}

pub(crate) fn fill_random(buf: &mut [u8]) -> Result<(), ErrorKind> {
    getrandom::fill(buf).map_err(|_| ErrorKind::InternalError("random source failed"))
}

fn fnv1a(mut hash: u64, data: &[u8]) -> u64 {
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn finished_body(s: &ConnectionState, label: &[u8; 4]) -> [u8; FINISHED_LEN] {
    let mut hash = fnv1a(FNV_OFFSET, label);
    hash = fnv1a(hash, &s.s3.transcript.to_be_bytes());
    hash = fnv1a(hash, &s.s3.master_key);
    let mut out = [0; FINISHED_LEN];
    out[..4].copy_from_slice(label);
    out[4..].copy_from_slice(&hash.to_be_bytes());
    out
}

fn take(body: &mut Bytes, n: usize, what: &'static str) -> Flow<Bytes> {
    if body.remaining() < n {
        return Err(ErrorKind::DecodeError(what).into());
    }
    Ok(body.split_to(n))
}

fn take_u8(body: &mut Bytes, what: &'static str) -> Flow<u8> {
    if !body.has_remaining() {
        return Err(ErrorKind::DecodeError(what).into());
    }
    Ok(body.get_u8())
}

fn take_u16(body: &mut Bytes, what: &'static str) -> Flow<u16> {
    if body.remaining() < 2 {
        return Err(ErrorKind::DecodeError(what).into());
    }
    Ok(body.get_u16())
}

fn expect_end(body: &Bytes, what: &'static str) -> Flow<()> {
    if body.has_remaining() {
        return Err(ErrorKind::DecodeError(what).into());
    }
    Ok(())
}

fn header(buf: &[u8]) -> Option<(u8, usize)> {
    match buf {
        [ty, a, b, c, ..] => Some((*ty, u32::from_be_bytes([0, *a, *b, *c]) as usize)),
        _ => None,
    }
}

fn message_limit(s: &ConnectionState, ty: u8) -> usize {
    if ty == CERTIFICATE {
        s.max_cert_list.max(0) as usize
    } else {
        MAX_PLAIN_LENGTH
    }
}

/// Reads one more record while a handshake is running.
fn next_handshake_record(s: &mut ConnectionState, io: &mut dyn RecordIo, want_ccs: bool) -> Flow<()> {
    let (content_type, payload) = record::read_record(s, io)?;
    match content_type {
        HANDSHAKE if !want_ccs => {
            s.s3.hs_buf.extend_from_slice(&payload);
            Ok(())
        }
        CHANGE_CIPHER_SPEC if want_ccs => {
            if payload[..] != [1] {
                return Err(ErrorKind::DecodeError("change cipher spec").into());
            }
            let suite = s
                .s3
                .tmp
                .new_cipher
                .ok_or(ErrorKind::InternalError("no cipher to change to"))?;
            let epoch = s.enc_read.as_ref().map_or(0, |c| c.epoch).wrapping_add(1);
            s.enc_read = Some(CipherState::new(suite, epoch));
            s.s3.change_cipher_spec = true;
            Ok(())
        }
        record::ALERT => record::handle_alert(s, &payload),
        record::APPLICATION_DATA if s.s3.renegotiating => {
            log::debug!("Application data during renegotiation, {} bytes", payload.len());
            s.s3.app_buf.extend_from_slice(&payload);
            Err(Interrupt::AppData)
        }
        _ => Err(ErrorKind::UnexpectedMessage.into()),
    }
}

/// Waits until a complete message heads the handshake buffer, returning
/// its type.
fn message_ready(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<u8> {
    loop {
        if let Some((ty, len)) = header(&s.s3.hs_buf) {
            if !s.server && ty == HELLO_REQUEST && len == 0 {
                log::trace!("Ignoring hello request during handshake");
                s.s3.hs_buf.advance(4);
                continue;
            }
            if len > message_limit(s, ty) {
                return Err(ErrorKind::ExcessiveMessageSize.into());
            }
            if s.s3.hs_buf.len() >= 4 + len {
                return Ok(ty);
            }
        }
        next_handshake_record(s, io, false)?;
    }
}

/// Removes the message at the head of the handshake buffer and adds it to
/// the transcript.
fn take_message(s: &mut ConnectionState, expected: u8) -> Flow<Bytes> {
    let (ty, len) =
        header(&s.s3.hs_buf).ok_or(ErrorKind::InternalError("no handshake message"))?;
    if ty != expected {
        log::debug!("Expected handshake message {expected}, got {ty}");
        return Err(ErrorKind::UnexpectedMessage.into());
    }
    let msg = s.s3.hs_buf.split_to(4 + len).freeze();
    s.s3.transcript = fnv1a(s.s3.transcript, &msg);
    Ok(msg.slice(4..))
}

fn get_message(s: &mut ConnectionState, io: &mut dyn RecordIo, expected: u8) -> Flow<Bytes> {
    message_ready(s, io)?;
    take_message(s, expected)
}

fn write_message(s: &mut ConnectionState, io: &mut dyn RecordIo, ty: u8, body: &[u8]) -> Flow<()> {
    let mut msg = BytesMut::with_capacity(4 + body.len());
    msg.put_u8(ty);
    msg.put_uint(body.len() as u64, 3);
    msg.put_slice(body);
    if ty != HELLO_REQUEST {
        s.s3.transcript = fnv1a(s.s3.transcript, &msg);
    }
    record::write_records(s, io, HANDSHAKE, &msg)
}

fn write_ccs(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    let suite = s
        .s3
        .tmp
        .new_cipher
        .ok_or(ErrorKind::InternalError("no cipher to change to"))?;
    record::write_records(s, io, CHANGE_CIPHER_SPEC, &[1])?;
    let epoch = s.enc_write.as_ref().map_or(0, |c| c.epoch).wrapping_add(1);
    s.enc_write = Some(CipherState::new(suite, epoch));
    Ok(())
}

fn read_ccs(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    while !s.s3.change_cipher_spec {
        if !s.s3.hs_buf.is_empty() {
            return Err(ErrorKind::UnexpectedMessage.into());
        }
        next_handshake_record(s, io, true)?;
    }
    Ok(())
}

fn write_finished(s: &mut ConnectionState, io: &mut dyn RecordIo, label: &[u8; 4]) -> Flow<()> {
    let body = finished_body(s, label);
    write_message(s, io, FINISHED, &body)
}

fn read_finished(s: &mut ConnectionState, io: &mut dyn RecordIo, label: &[u8; 4]) -> Flow<()> {
    if !s.s3.change_cipher_spec {
        return Err(ErrorKind::UnexpectedMessage.into());
    }
    message_ready(s, io)?;
    let expected = finished_body(s, label);
    let body = take_message(s, FINISHED)?;
    if body[..] != expected[..] {
        return Err(ErrorKind::DigestCheckFailed.into());
    }
    s.s3.change_cipher_spec = false;
    Ok(())
}

fn flush(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    record::write_pending(s, io)?;
    s.rwstate = Want::Writing;
    match io.flush() {
        IOCallbackResult::Ok(()) => {
            s.rwstate = Want::Nothing;
            Ok(())
        }
        IOCallbackResult::WouldBlock => Err(Interrupt::Retry),
        IOCallbackResult::Err(e) => Err(Interrupt::Fatal(e.into())),
    }
}

fn begin(s: &mut ConnectionState, io: &mut dyn RecordIo, role: Role) {
    s.server = role == Role::Server;
    s.notify(InfoEvent::HandshakeStart);
    io.push_buffer();
    s.s3.begin_handshake();
}

fn negotiated_cipher(s: &ConnectionState) -> Flow<&'static CipherSuite> {
    s.s3
        .tmp
        .new_cipher
        .ok_or_else(|| ErrorKind::InternalError("no cipher negotiated").into())
}

/// Runs whichever handshake the connection was set up for.
pub(crate) fn drive(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    match s.handshake_func {
        Some(Role::Client) if s.method.can_connect() => connect(s, io),
        Some(Role::Server) if s.method.can_accept() => accept(s, io),
        Some(_) => Err(ErrorKind::UndefinedFunction.into()),
        None => Err(ErrorKind::ConnectionTypeNotSet.into()),
    }
}

pub(crate) fn connect(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    s.in_handshake += 1;
    let res = connect_steps(s, io);
    s.in_handshake -= 1;
    res
}

pub(crate) fn accept(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    s.in_handshake += 1;
    let res = accept_steps(s, io);
    s.in_handshake -= 1;
    res
}

fn connect_steps(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    loop {
        let step = match s.state {
            HandshakeState::Ok => return Ok(()),
            HandshakeState::Before(_) => ST_START,
            HandshakeState::Renegotiate => {
                s.new_session = true;
                s.s3.renegotiating = true;
                s.ctx.incr(Stat::ConnectRenegotiate);
                ST_START
            }
            HandshakeState::Connect(step) => step,
            HandshakeState::Accept(_) => {
                return Err(ErrorKind::InternalError("connect while accepting").into())
            }
        };
        log::trace!("Client: {}", step_name(step));

        let next = match step {
            ST_START => {
                begin(s, io, Role::Client);
                s.ctx.incr(Stat::Connect);
                CW_CLNT_HELLO
            }
            CW_CLNT_HELLO => {
                write_client_hello(s, io)?;
                s.s3.tmp.next_state = CR_SRVR_HELLO;
                ST_FLUSH
            }
            ST_FLUSH => {
                flush(s, io)?;
                s.s3.tmp.next_state
            }
            CR_SRVR_HELLO => {
                read_server_hello(s, io)?;
                if s.hit {
                    CR_CHANGE
                } else {
                    CR_CERT
                }
            }
            CR_CERT => {
                read_server_certificate(s, io)?;
                CR_KEY_EXCH
            }
            CR_KEY_EXCH => {
                read_server_key_exchange(s, io)?;
                CR_CERT_REQ
            }
            CR_CERT_REQ => {
                if message_ready(s, io)? == CERTIFICATE_REQUEST {
                    let body = take_message(s, CERTIFICATE_REQUEST)?;
                    expect_end(&body, "certificate request")?;
                    s.s3.tmp.cert_req = 1;
                }
                CR_SRVR_DONE
            }
            CR_SRVR_DONE => {
                let body = get_message(s, io, SERVER_HELLO_DONE)?;
                expect_end(&body, "server hello done")?;
                if s.s3.tmp.cert_req != 0 {
                    CW_CERT
                } else {
                    CW_KEY_EXCH
                }
            }
            CW_CERT => {
                write_client_certificate(s, io)?;
                CW_KEY_EXCH
            }
            CW_KEY_EXCH => {
                let mut premaster = [0u8; MASTER_KEY_LEN];
                fill_random(&mut premaster)?;
                let mut body = BytesMut::with_capacity(2 + MASTER_KEY_LEN);
                body.put_u16(MASTER_KEY_LEN as u16);
                body.put_slice(&premaster);
                write_message(s, io, CLIENT_KEY_EXCHANGE, &body)?;
                s.s3.master_key = Bytes::copy_from_slice(&premaster);
                CW_CHANGE
            }
            CW_CHANGE => {
                write_ccs(s, io)?;
                CW_FINISHED
            }
            CW_FINISHED => {
                write_finished(s, io, CLIENT_LABEL)?;
                s.s3.tmp.next_state = if s.hit { ST_DONE } else { CR_CHANGE };
                ST_FLUSH
            }
            CR_CHANGE => {
                read_ccs(s, io)?;
                CR_FINISHED
            }
            CR_FINISHED => {
                read_finished(s, io, SERVER_LABEL)?;
                if s.hit {
                    CW_CHANGE
                } else {
                    ST_DONE
                }
            }
            ST_DONE => {
                io.pop_buffer();
                if !s.hit {
                    establish_session(s)?;
                }
                s.new_session = false;
                s.s3.renegotiating = false;
                s.update_cache(SessionCacheMode::CLIENT);
                if s.hit {
                    s.ctx.incr(Stat::Hit);
                }
                s.ctx.incr(Stat::ConnectGood);
                s.state = HandshakeState::Ok;
                log::debug!(
                    "Client handshake done: {} {} (resumed: {})",
                    s.version.as_str(),
                    s.s3.tmp.new_cipher.map_or("", |c| c.name),
                    s.hit
                );
                s.notify(InfoEvent::HandshakeDone);
                return Ok(());
            }
            _ => return Err(ErrorKind::InternalError("unknown client state").into()),
        };
        s.state = HandshakeState::Connect(next);
    }
}

fn accept_steps(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    loop {
        let step = match s.state {
            HandshakeState::Ok => return Ok(()),
            HandshakeState::Before(_) => ST_START,
            HandshakeState::Renegotiate => {
                s.new_session = true;
                begin(s, io, Role::Server);
                s.ctx.incr(Stat::AcceptRenegotiate);
                s.state = HandshakeState::Accept(SW_HELLO_REQ);
                continue;
            }
            HandshakeState::Accept(step) => step,
            HandshakeState::Connect(_) => {
                return Err(ErrorKind::InternalError("accept while connecting").into())
            }
        };
        log::trace!("Server: {}", step_name(step));

        let next = match step {
            ST_START => {
                begin(s, io, Role::Server);
                s.ctx.incr(Stat::Accept);
                SR_CLNT_HELLO
            }
            SW_HELLO_REQ => {
                s.shutdown = ShutdownFlags::empty();
                write_message(s, io, HELLO_REQUEST, &[])?;
                s.s3.tmp.next_state = ST_DONE;
                ST_FLUSH
            }
            ST_FLUSH => {
                flush(s, io)?;
                s.s3.tmp.next_state
            }
            SR_CLNT_HELLO => {
                read_client_hello(s, io)?;
                SW_SRVR_HELLO
            }
            SW_SRVR_HELLO => {
                write_server_hello(s, io)?;
                if s.hit {
                    SW_CHANGE
                } else {
                    SW_CERT
                }
            }
            SW_CERT => {
                let cipher = negotiated_cipher(s)?;
                if !cipher.algorithms.contains(Algorithms::A_NULL) {
                    let leaf = s
                        .cert
                        .get_server_send_cert(cipher)
                        .cloned()
                        .ok_or(ErrorKind::NoCertificateAssigned)?;
                    let chain = own_chain(s, leaf);
                    write_certificate(s, io, &chain)?;
                }
                SW_KEY_EXCH
            }
            SW_KEY_EXCH => {
                write_server_key_exchange(s, io)?;
                SW_CERT_REQ
            }
            SW_CERT_REQ => {
                let cipher = negotiated_cipher(s)?;
                if s.verify_mode.verifies_peer() && !cipher.algorithms.contains(Algorithms::A_NULL)
                {
                    write_message(s, io, CERTIFICATE_REQUEST, &[])?;
                    s.s3.tmp.cert_req = 1;
                }
                SW_SRVR_DONE
            }
            SW_SRVR_DONE => {
                write_message(s, io, SERVER_HELLO_DONE, &[])?;
                s.s3.tmp.next_state = SR_CERT;
                ST_FLUSH
            }
            SR_CERT => {
                if s.s3.tmp.cert_req != 0 {
                    read_client_certificate(s, io)?;
                }
                SR_KEY_EXCH
            }
            SR_KEY_EXCH => {
                let mut body = get_message(s, io, CLIENT_KEY_EXCHANGE)?;
                let len = take_u16(&mut body, "client key exchange")? as usize;
                if len != MASTER_KEY_LEN {
                    return Err(ErrorKind::DecodeError("premaster secret length").into());
                }
                let premaster = take(&mut body, len, "client key exchange")?;
                expect_end(&body, "client key exchange")?;
                s.s3.master_key = premaster;
                SR_CHANGE
            }
            SR_CHANGE => {
                read_ccs(s, io)?;
                SR_FINISHED
            }
            SR_FINISHED => {
                read_finished(s, io, CLIENT_LABEL)?;
                if s.hit {
                    ST_DONE
                } else {
                    SW_CHANGE
                }
            }
            SW_CHANGE => {
                write_ccs(s, io)?;
                SW_FINISHED
            }
            SW_FINISHED => {
                write_finished(s, io, SERVER_LABEL)?;
                s.s3.tmp.next_state = if s.hit { SR_CHANGE } else { ST_DONE };
                ST_FLUSH
            }
            ST_DONE => {
                io.pop_buffer();
                s.state = HandshakeState::Ok;
                if s.s3.tmp.hello_seen {
                    if !s.hit {
                        establish_session(s)?;
                    }
                    s.new_session = false;
                    s.s3.renegotiating = false;
                    s.update_cache(SessionCacheMode::SERVER);
                    s.ctx.incr(Stat::AcceptGood);
                    log::debug!(
                        "Server handshake done: {} {} (resumed: {})",
                        s.version.as_str(),
                        s.s3.tmp.new_cipher.map_or("", |c| c.name),
                        s.hit
                    );
                    s.notify(InfoEvent::HandshakeDone);
                } else {
                    log::debug!("Hello request sent");
                }
                return Ok(());
            }
            _ => return Err(ErrorKind::InternalError("unknown server state").into()),
        };
        s.state = HandshakeState::Accept(next);
    }
}

/// Handles a handshake message arriving while no handshake runs. Returns
/// whether a renegotiation handshake should run now.
pub(crate) fn unsolicited(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<bool> {
    let Some((ty, len)) = header(&s.s3.hs_buf) else {
        return Ok(false);
    };
    if len > message_limit(s, ty) {
        return Err(ErrorKind::ExcessiveMessageSize.into());
    }
    if s.s3.hs_buf.len() < 4 + len {
        return Ok(false);
    }

    match (s.server, ty) {
        (false, HELLO_REQUEST) => {
            s.s3.hs_buf.advance(4 + len);
            if len != 0 {
                return Err(ErrorKind::DecodeError("hello request").into());
            }
            if s.session.is_none() || s.in_init() || s.s3.renegotiate {
                log::debug!("Ignoring hello request");
                return Ok(false);
            }
            let table = s.method.table();
            table.renegotiate(s);
            Ok(table.renegotiate_check(s) == 1)
        }
        (true, CLIENT_HELLO) => {
            let allow_unsafe = (s.options | s.ctx.options())
                .contains(Options::ALLOW_UNSAFE_LEGACY_RENEGOTIATION);
            if !s.s3.send_connection_binding
                && s.version.wire() > ProtocolVersion::SslV3.wire()
                && !allow_unsafe
            {
                log::debug!("Refusing insecure renegotiation");
                s.s3.hs_buf.advance(4 + len);
                record::send_alert(s, io, false, AlertDescription::NoRenegotiation)?;
                return Ok(false);
            }
            s.state = HandshakeState::Accept(ST_START);
            s.new_session = true;
            s.s3.renegotiating = true;
            Ok(true)
        }
        _ => Err(ErrorKind::UnexpectedMessage.into()),
    }
}

/// Our certificate followed by the context's chain certificates.
fn own_chain(s: &ConnectionState, leaf: Certificate) -> Vec<Certificate> {
    let mut chain = vec![leaf];
    chain.extend(s.ctx.config().extra_certs.iter().cloned());
    chain
}

fn write_certificate(s: &mut ConnectionState, io: &mut dyn RecordIo, chain: &[Certificate]) -> Flow<()> {
    let mut body = BytesMut::new();
    body.put_u16(chain.len() as u16);
    for cert in chain {
        cert.encode(&mut body);
    }
    write_message(s, io, CERTIFICATE, &body)
}

fn parse_certificate(mut body: Bytes) -> Flow<Vec<Certificate>> {
    let count = take_u16(&mut body, "certificate count")?;
    let mut chain = Vec::with_capacity(count as usize);
    for _ in 0..count {
        chain.push(Certificate::decode(&mut body).map_err(|e| e.kind())?);
    }
    expect_end(&body, "certificate list")?;
    Ok(chain)
}

/// Verifies the peer's chain, letting the verify callback override the
/// verdict, and records the result on the connection.
fn verify_chain(s: &mut ConnectionState, chain: &[Certificate]) -> Result<(), VerifyError> {
    let (verifier, roots) = {
        let config = s.ctx.config();
        (config.verifier.clone(), config.roots.clone())
    };
    let verdict = verifier.verify(chain, &roots, s.verify_depth);
    let mut ok = verdict.is_ok();
    let mut error = verdict.err();
    if let Some(cb) = s.verify_callback.clone() {
        let ctx = VerifyContext {
            chain,
            depth: s.verify_depth,
            error,
        };
        ok = cb(ok, &ctx);
        if !ok && error.is_none() {
            error = Some(VerifyError::ApplicationVerification);
        }
    }
    s.verify_result = error.map_or(crate::cert::VERIFY_OK, VerifyError::code);
    match (ok, error) {
        (true, _) => Ok(()),
        (false, e) => Err(e.unwrap_or(VerifyError::ApplicationVerification)),
    }
}

fn establish_session(s: &mut ConnectionState) -> Flow<()> {
    let cipher = negotiated_cipher(s)?;
    let session = SessionBuilder::new(s.version, cipher)
        .with_id(s.s3.tmp.session_id)
        .with_sid_ctx(s.sid_ctx)
        .with_master_key(s.s3.master_key.clone())
        .with_peer_chain(std::mem::take(&mut s.s3.peer_chain))
        .with_verify_result(s.verify_result)
        .with_server_name(s.server_name.clone())
        .with_time(s.s3.tmp.session_time)
        .with_timeout(s.s3.tmp.session_timeout)
        .build();
    s.session = Some(session);
    Ok(())
}

fn write_client_hello(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    s.shutdown = ShutdownFlags::empty();
    if s.method.is_flexible() {
        s.version = if !s.options.contains(Options::NO_TLSV1) {
            ProtocolVersion::TlsV1
        } else if !s.options.contains(Options::NO_SSLV3) {
            ProtocolVersion::SslV3
        } else {
            return Err(ErrorKind::UnableToFindSslMethod.into());
        };
    }

    let offered = match &s.session {
        Some(session) if session.version() == s.version && !session.id().is_empty() => {
            *session.id()
        }
        _ => {
            s.session = None;
            SessionId::EMPTY
        }
    };
    s.s3.tmp.offered_id = offered;
    s.client_version = s.version.wire();
    fill_random(&mut s.s3.client_random)?;

    let mut ciphers = BytesMut::new();
    if s.cipher_list_to_bytes(&mut ciphers) == 0 {
        return Err(ErrorKind::NoCipherMatch.into());
    }

    let sni = s.server_name.clone().unwrap_or_default();
    let mut body = BytesMut::new();
    body.put_u16(s.client_version);
    body.put_slice(&s.s3.client_random);
    body.put_u8(offered.len() as u8);
    body.put_slice(offered.as_bytes());
    body.put_u16(ciphers.len() as u16);
    body.put_slice(&ciphers);
    body.put_u16(sni.len() as u16);
    body.put_slice(sni.as_bytes());
    body.put_u8(s.s3.renegotiating as u8);
    write_message(s, io, CLIENT_HELLO, &body)
}

fn read_server_hello(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    s.s3.first_packet = true;
    let res = get_message(s, io, SERVER_HELLO);
    if !matches!(res, Err(Interrupt::Retry)) {
        s.s3.first_packet = false;
    }
    let mut body = res?;

    let version = take_u16(&mut body, "server version")?;
    let random = take(&mut body, RANDOM_LEN, "server random")?;
    let sid_len = take_u8(&mut body, "session id")? as usize;
    if sid_len > MAX_SESSION_ID_LENGTH {
        return Err(ErrorKind::SessionIdHasBadLength.into());
    }
    let sid = take(&mut body, sid_len, "session id")?;
    let width = s.method.table().cipher_code_width();
    let code = take(&mut body, width, "cipher")?;
    let ri = take_u8(&mut body, "renegotiation info")? != 0;
    expect_end(&body, "server hello")?;

    if s.method.is_flexible() {
        let picked = ProtocolVersion::from_wire(version);
        let enabled = match picked {
            ProtocolVersion::TlsV1 => !s.options.contains(Options::NO_TLSV1),
            ProtocolVersion::SslV3 => !s.options.contains(Options::NO_SSLV3),
            _ => false,
        };
        if !enabled {
            return Err(ErrorKind::WrongVersionNumber.into());
        }
        s.method = s
            .method
            .for_version(picked)
            .ok_or(ErrorKind::UnableToFindSslMethod)?;
        s.version = picked;
        log::debug!("Negotiated {}", picked.as_str());
    } else if version != s.version.wire() {
        return Err(ErrorKind::WrongVersionNumber.into());
    }
    s.s3.server_random.copy_from_slice(&random);

    let sid = SessionId::new(&sid).ok_or(ErrorKind::SessionIdHasBadLength)?;
    s.hit = !sid.is_empty() && sid == s.s3.tmp.offered_id;
    if s.hit {
        let session = s
            .session
            .clone()
            .ok_or(ErrorKind::InternalError("resumed without a session"))?;
        if *session.sid_ctx() != s.sid_ctx {
            return Err(ErrorKind::AttemptToReuseSessionInDifferentContext.into());
        }
        s.s3.master_key = session.master_key().clone();
        s.verify_result = session.verify_result();
    } else {
        s.get_new_session(false)?;
        s.s3.tmp.session_id = sid;
    }

    let table = s.method.table();
    let cipher = table
        .get_cipher_by_char(&code)
        .ok_or(ErrorKind::WrongCipherReturned)?;
    let offered = s.get_ciphers().find(cipher.id).is_some();
    let resumed_matches = match (&s.session, s.hit) {
        (Some(session), true) => session.cipher().id == cipher.id,
        _ => true,
    };
    if !offered || !cipher.usable_with(s.version) || !resumed_matches {
        return Err(ErrorKind::WrongCipherReturned.into());
    }
    s.s3.tmp.new_cipher = Some(cipher);

    let allow_unsafe = s.options.contains(Options::ALLOW_UNSAFE_LEGACY_RENEGOTIATION);
    if !ri && !allow_unsafe {
        if s.s3.renegotiating || !s.options.contains(Options::LEGACY_SERVER_CONNECT) {
            return Err(ErrorKind::UnsafeLegacyRenegotiationDisabled.into());
        }
    }
    s.s3.send_connection_binding = ri;
    Ok(())
}

fn read_server_certificate(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    let cipher = negotiated_cipher(s)?;
    if cipher.algorithms.contains(Algorithms::A_NULL) {
        return Ok(());
    }
    let body = get_message(s, io, CERTIFICATE)?;
    let chain = parse_certificate(body)?;
    if chain.is_empty() {
        return Err(ErrorKind::PeerDidNotReturnCertificate.into());
    }
    if let Err(e) = verify_chain(s, &chain) {
        if s.verify_mode != SslVerifyMode::SslVerifyNone {
            return Err(ErrorKind::CertificateVerifyFailed(e).into());
        }
        log::debug!("Ignoring server certificate verification failure: {e}");
    }
    s.s3.peer_chain = chain;
    Ok(())
}

fn read_server_key_exchange(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    let cipher = negotiated_cipher(s)?;
    let alg = cipher.algorithms;
    let ephemeral = alg.intersects(Algorithms::K_EDH | Algorithms::K_ECDHE);
    let optional = alg.contains(Algorithms::K_RSA);

    if message_ready(s, io)? != SERVER_KEY_EXCHANGE {
        if ephemeral {
            return Err(ErrorKind::HandshakeFailure.into());
        }
        return Ok(());
    }
    if !ephemeral && !optional {
        return Err(ErrorKind::UnexpectedMessage.into());
    }
    let mut body = take_message(s, SERVER_KEY_EXCHANGE)?;
    let _kind = take_u8(&mut body, "key exchange kind")?;
    if body.remaining() != 4 {
        return Err(ErrorKind::DecodeError("key exchange parameters").into());
    }
    s.s3.tmp.peer_tmp = Some(TmpKey {
        bits: body.get_u32(),
    });
    Ok(())
}

fn write_client_certificate(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    let configured = match (s.cert.certificate(), s.cert.private_key()) {
        (Some(cert), Some(_)) => Some(cert.clone()),
        _ => None,
    };
    let leaf = match configured {
        Some(cert) => Some(cert),
        None => {
            let cb = s.ctx.config().client_cert_cb.clone();
            match cb.map(|cb| cb(s)) {
                Some(ClientCertLookup::Provide(cert, key)) => {
                    let set = Arc::make_mut(&mut s.cert);
                    set.set_certificate(cert.clone());
                    set.set_private_key(key).map_err(|e| e.kind())?;
                    Some(cert)
                }
                Some(ClientCertLookup::Retry) => {
                    s.rwstate = Want::X509Lookup;
                    return Err(Interrupt::Retry);
                }
                Some(ClientCertLookup::NoCertificate) | None => None,
            }
        }
    };
    s.rwstate = Want::Nothing;

    let chain = match leaf {
        Some(leaf) => own_chain(s, leaf),
        None => {
            log::debug!("No client certificate to send");
            s.s3.tmp.cert_req = 2;
            Vec::new()
        }
    };
    write_certificate(s, io, &chain)
}

/// Whether `cipher` is acceptable to both sides and to our certificates.
fn cipher_acceptable(s: &ConnectionState, cipher: &CipherSuite) -> bool {
    cipher.usable_with(s.version) && s.cert.supports(cipher)
}

/// Picks the suite to use from the client's offer.
pub(crate) fn choose_cipher(s: &ConnectionState, client: &CipherList) -> Option<&'static CipherSuite> {
    let ours = s.get_ciphers();
    let (prio, allow) = if s.options.contains(Options::CIPHER_SERVER_PREFERENCE) {
        (&ours, client)
    } else {
        (client, &ours)
    };
    let chosen = prio
        .iter()
        .filter(|c| allow.find(c.id).is_some())
        .find(|c| cipher_acceptable(s, c));
    chosen
}

fn read_client_hello(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    s.shutdown = ShutdownFlags::empty();
    s.s3.first_packet = true;
    let res = get_message(s, io, CLIENT_HELLO);
    if !matches!(res, Err(Interrupt::Retry)) {
        s.s3.first_packet = false;
    }
    let mut body = res?;

    let client_version = take_u16(&mut body, "client version")?;
    let random = take(&mut body, RANDOM_LEN, "client random")?;
    let sid_len = take_u8(&mut body, "session id")? as usize;
    if sid_len > MAX_SESSION_ID_LENGTH {
        return Err(ErrorKind::DecodeError("session id length").into());
    }
    let sid = take(&mut body, sid_len, "session id")?;
    let cipher_len = take_u16(&mut body, "cipher list")? as usize;
    let cipher_bytes = take(&mut body, cipher_len, "cipher list")?;
    let sni_len = take_u16(&mut body, "server name")? as usize;
    let sni = take(&mut body, sni_len, "server name")?;
    let ri = take_u8(&mut body, "renegotiation info")? != 0;
    expect_end(&body, "client hello")?;

    s.client_version = client_version;
    choose_server_version(s, client_version)?;
    s.s3.client_random.copy_from_slice(&random);

    let resumable = !sid.is_empty()
        && !(s.s3.renegotiating
            && s.options.contains(Options::NO_SESSION_RESUMPTION_ON_RENEGOTIATION));
    s.hit = resumable && s.get_prev_session(&sid)?;
    if !s.hit {
        s.get_new_session(true)?;
    }

    let client_ciphers = s.bytes_to_cipher_list(&cipher_bytes)?;
    if ri {
        s.s3.send_connection_binding = true;
    }

    if s.hit {
        let session = s
            .session
            .clone()
            .ok_or(ErrorKind::InternalError("resumed without a session"))?;
        if client_ciphers.find(session.cipher().id).is_none() {
            return Err(ErrorKind::RequiredCipherMissing.into());
        }
        s.s3.tmp.new_cipher = Some(session.cipher());
        s.s3.master_key = session.master_key().clone();
    }

    if !sni.is_empty() {
        let name = String::from_utf8(sni.to_vec())
            .map_err(|_| ErrorKind::DecodeError("server name"))?;
        s.server_name = Some(name.clone());
        let mut cb = s.ctx.config().servername_cb.clone();
        if cb.is_none() {
            cb = s.initial_ctx.config().servername_cb.clone();
        }
        if let Some(cb) = cb {
            match cb(s, &name) {
                ServerNameAction::Accept => {}
                ServerNameAction::Reject => return Err(ErrorKind::ServerNameRejected.into()),
                ServerNameAction::SwitchContext(ctx) => {
                    log::debug!("Switching context for {name}");
                    s.set_context(Some(&ctx));
                }
            }
        }
    }

    if !s.hit {
        let cipher = choose_cipher(s, &client_ciphers).ok_or(ErrorKind::NoSharedCipher)?;
        s.s3.tmp.new_cipher = Some(cipher);
    }
    s.peer_ciphers = Some(client_ciphers);
    s.s3.tmp.hello_seen = true;
    Ok(())
}

fn choose_server_version(s: &mut ConnectionState, client_version: u16) -> Flow<()> {
    if s.method.is_flexible() {
        let version = if client_version >= ProtocolVersion::TlsV1.wire()
            && !s.options.contains(Options::NO_TLSV1)
        {
            ProtocolVersion::TlsV1
        } else if client_version >= ProtocolVersion::SslV3.wire()
            && !s.options.contains(Options::NO_SSLV3)
        {
            ProtocolVersion::SslV3
        } else {
            return Err(ErrorKind::WrongVersionNumber.into());
        };
        s.method = s
            .method
            .for_version(version)
            .ok_or(ErrorKind::UnableToFindSslMethod)?;
        s.version = version;
        log::debug!("Negotiated {}", version.as_str());
    } else if s.method.is_dtls() {
        if client_version != s.version.wire() {
            return Err(ErrorKind::WrongVersionNumber.into());
        }
    } else if client_version < s.version.wire() {
        return Err(ErrorKind::WrongVersionNumber.into());
    }
    Ok(())
}

fn write_server_hello(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    fill_random(&mut s.s3.server_random)?;
    let cipher = negotiated_cipher(s)?;
    let sid = match (&s.session, s.hit) {
        (Some(session), true) => *session.id(),
        _ => {
            if !s.initial_ctx.session_cache_mode().contains(SessionCacheMode::SERVER) {
                s.s3.tmp.session_id = SessionId::EMPTY;
            }
            s.s3.tmp.session_id
        }
    };

    let mut body = BytesMut::new();
    body.put_u16(s.version.wire());
    body.put_slice(&s.s3.server_random);
    body.put_u8(sid.len() as u8);
    body.put_slice(sid.as_bytes());
    s.method.table().put_cipher_by_char(cipher, &mut body);
    body.put_u8(s.s3.send_connection_binding as u8);
    write_message(s, io, SERVER_HELLO, &body)
}

fn write_server_key_exchange(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    let cipher = negotiated_cipher(s)?;
    let alg = cipher.algorithms;
    let rsa_enc = s.cert.slot(KeySlot::RsaEnc).private_key.as_ref().map(|k| k.bits());

    let (kind, key) = if alg.contains(Algorithms::K_EDH) {
        (1u8, s.cert.tmp_dh_for(cipher))
    } else if alg.contains(Algorithms::K_ECDHE) {
        (2, s.cert.tmp_ecdh_for(cipher))
    } else if alg.contains(Algorithms::K_RSA)
        && rsa_enc.map_or(true, |bits| {
            cipher.is_export() && bits > cipher.export_pkey_length()
        })
    {
        (0, s.cert.tmp_rsa_for(cipher))
    } else {
        return Ok(());
    };

    let key = key.ok_or_else(|| {
        log::debug!("No temporary key for {}", cipher.name);
        ErrorKind::HandshakeFailure
    })?;
    let mut body = BytesMut::with_capacity(5);
    body.put_u8(kind);
    body.put_u32(key.bits);
    write_message(s, io, SERVER_KEY_EXCHANGE, &body)
}

fn read_client_certificate(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    let body = get_message(s, io, CERTIFICATE)?;
    let chain = parse_certificate(body)?;
    if chain.is_empty() {
        if s.verify_mode == SslVerifyMode::SslVerifyFailIfNoPeerCert {
            return Err(ErrorKind::PeerDidNotReturnCertificate.into());
        }
        log::debug!("Client sent no certificate");
        return Ok(());
    }
    verify_chain(s, &chain).map_err(ErrorKind::CertificateVerifyFailed)?;
    s.s3.peer_chain = chain;
    Ok(())
}
