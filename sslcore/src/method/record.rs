//! Record framing, alerts, application data and shutdown.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{handshake, Flow, Interrupt};
use crate::{
    bio::RecordIo,
    callback::{IOCallbackResult, InfoEvent, MsgInfo},
    cert::{Certificate, TmpKey, VerifyError},
    cipher::CipherSuite,
    ctrl::Mode,
    error::{AlertDescription, ErrorKind},
    session::SessionId,
    ssl::{ConnectionState, HandshakeState, ShutdownFlags, Want},
    ProtocolVersion,
};

pub(crate) const CHANGE_CIPHER_SPEC: u8 = 20;
pub(crate) const ALERT: u8 = 21;
pub(crate) const HANDSHAKE: u8 = 22;
pub(crate) const APPLICATION_DATA: u8 = 23;

/// Largest plaintext fragment a record may carry.
pub(crate) const MAX_PLAIN_LENGTH: usize = 16384;

const HEADER_LEN: usize = 5;
const DTLS_HEADER_LEN: usize = 13;
const READ_AHEAD_CHUNK: usize = MAX_PLAIN_LENGTH + DTLS_HEADER_LEN;

const LEVEL_WARNING: u8 = 1;
const LEVEL_FATAL: u8 = 2;

/// Protection state of one direction once a change cipher spec has been
/// processed.
#[derive(Clone, Debug)]
pub(crate) struct CipherState {
    pub(crate) suite: &'static CipherSuite,
    pub(crate) epoch: u16,
    pub(crate) sequence: u64,
}

impl CipherState {
    pub(crate) fn new(suite: &'static CipherSuite, epoch: u16) -> Self {
        Self {
            suite,
            epoch,
            sequence: 0,
        }
    }
}

/// Scratch state of the handshake in progress. Reset whenever a
/// handshake starts.
#[derive(Debug, Default)]
pub(crate) struct HandshakeTmp {
    pub(crate) new_cipher: Option<&'static CipherSuite>,
    /// 0: not requested, 1: requested, 2: requested but we have nothing
    /// to send
    pub(crate) cert_req: u8,
    pub(crate) next_state: u16,
    /// Id the new session will carry
    pub(crate) session_id: SessionId,
    pub(crate) session_time: u64,
    pub(crate) session_timeout: u64,
    /// Id the client offered for resumption
    pub(crate) offered_id: SessionId,
    /// Ephemeral parameters announced by the server
    pub(crate) peer_tmp: Option<TmpKey>,
    /// A hello was processed, as opposed to only sending a hello request
    pub(crate) hello_seen: bool,
}

/// An application write whose record has not fully left yet.
#[derive(Clone, Copy, Debug)]
struct PendingWrite {
    ptr: usize,
    tot: usize,
    ret: usize,
}

/// Record layer and handshake state of a stream or datagram connection.
#[derive(Debug, Default)]
pub(crate) struct RecordLayer {
    /// Received bytes not yet parsed into records
    pub(crate) rbuf: BytesMut,
    /// Framed records not yet accepted by the transport
    pub(crate) wbuf: BytesMut,
    wbuf_type: Option<u8>,
    wpend: Option<PendingWrite>,
    /// Bytes of an interrupted application write already sent
    pub(crate) wnum: usize,
    /// Application data received but not yet returned by `read`
    pub(crate) app_buf: BytesMut,
    /// Handshake fragments not yet consumed
    pub(crate) hs_buf: BytesMut,
    pub(crate) alert_dispatch: bool,
    send_alert: [u8; 2],
    plain_read_seq: u64,
    plain_write_seq: u64,

    pub(crate) client_random: [u8; 32],
    pub(crate) server_random: [u8; 32],
    pub(crate) transcript: u64,
    pub(crate) master_key: Bytes,
    pub(crate) peer_chain: Vec<Certificate>,
    pub(crate) tmp: HandshakeTmp,
    /// The peer's change cipher spec arrived; its finished is next
    pub(crate) change_cipher_spec: bool,

    /// A renegotiation was requested and waits for `renegotiate_check`
    pub(crate) renegotiate: bool,
    /// A renegotiation handshake is running
    pub(crate) renegotiating: bool,
    pub(crate) num_renegotiations: u64,
    pub(crate) total_renegotiations: u64,
    /// The peer supports secure renegotiation
    pub(crate) send_connection_binding: bool,

    pub(crate) warn_alert: Option<AlertDescription>,
    pub(crate) fatal_alert: Option<AlertDescription>,
    /// Accept any known record version while the hellos are exchanged
    pub(crate) first_packet: bool,
}

impl RecordLayer {
    pub(crate) fn with_buffers() -> Self {
        Self {
            rbuf: BytesMut::with_capacity(READ_AHEAD_CHUNK),
            wbuf: BytesMut::with_capacity(READ_AHEAD_CHUNK),
            ..Default::default()
        }
    }

    /// Forgets all protocol state, keeping the buffer allocations.
    pub(crate) fn reset(&mut self) {
        let mut rbuf = std::mem::take(&mut self.rbuf);
        let mut wbuf = std::mem::take(&mut self.wbuf);
        rbuf.clear();
        wbuf.clear();
        *self = Self {
            rbuf,
            wbuf,
            ..Default::default()
        };
    }

    /// No record is half read or half written.
    pub(crate) fn is_idle(&self) -> bool {
        self.rbuf.is_empty() && self.wbuf.is_empty()
    }

    pub(crate) fn begin_handshake(&mut self) {
        self.transcript = handshake::FNV_OFFSET;
        self.tmp = HandshakeTmp::default();
        self.change_cipher_spec = false;
        self.peer_chain.clear();
    }
}

fn header_len(s: &ConnectionState) -> usize {
    if s.method.is_dtls() {
        DTLS_HEADER_LEN
    } else {
        HEADER_LEN
    }
}

/// Largest application data fragment per record. Datagram connections
/// with an MTU keep records within it.
fn max_fragment(s: &ConnectionState) -> usize {
    if s.method.is_dtls() && s.mtu > 0 {
        MAX_PLAIN_LENGTH.min((s.mtu as usize).saturating_sub(DTLS_HEADER_LEN))
    } else {
        MAX_PLAIN_LENGTH
    }
}

fn msg_callback(s: &ConnectionState, write: bool, content_type: u8, data: &[u8]) {
    if let Some(cb) = &s.msg_callback {
        cb(&MsgInfo {
            write,
            version: s.version,
            content_type,
            data,
            arg: s.msg_callback_arg,
        });
    }
}

/// Reads until `rbuf` holds at least `need` bytes.
fn fill(s: &mut ConnectionState, io: &mut dyn RecordIo, need: usize) -> Flow<()> {
    let greedy = s.read_ahead || s.method.is_dtls();
    while s.s3.rbuf.len() < need {
        let have = s.s3.rbuf.len();
        let want = if greedy {
            (need - have).max(READ_AHEAD_CHUNK)
        } else {
            need - have
        };
        s.s3.rbuf.resize(have + want, 0);
        s.rwstate = Want::Reading;
        let n = match io.read(&mut s.s3.rbuf[have..]) {
            IOCallbackResult::Ok(n) => n,
            IOCallbackResult::WouldBlock => {
                s.s3.rbuf.truncate(have);
                return Err(Interrupt::Retry);
            }
            IOCallbackResult::Err(e) => {
                s.s3.rbuf.truncate(have);
                return Err(Interrupt::Fatal(e.into()));
            }
        };
        s.s3.rbuf.truncate(have + n);
        if n == 0 {
            log::debug!("Transport reached end of stream");
            return Err(Interrupt::Eof);
        }
    }
    Ok(())
}

/// Reads the next record, returning its content type and payload.
pub(crate) fn read_record(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<(u8, Bytes)> {
    let dtls = s.method.is_dtls();
    loop {
        let hdr = header_len(s);
        fill(s, io, hdr)?;

        let b = &s.s3.rbuf;
        let content_type = b[0];
        let version = u16::from_be_bytes([b[1], b[2]]);
        let (epoch, len) = if dtls {
            (
                u16::from_be_bytes([b[3], b[4]]),
                u16::from_be_bytes([b[11], b[12]]) as usize,
            )
        } else {
            (0, u16::from_be_bytes([b[3], b[4]]) as usize)
        };

        if s.s3.first_packet {
            if ProtocolVersion::from_wire(version) == ProtocolVersion::Unknown {
                return Err(ErrorKind::WrongVersionNumber.into());
            }
        } else if version != s.version.wire() {
            log::debug!(
                "Record version {version:#06x} while speaking {}",
                s.version.as_str()
            );
            return Err(ErrorKind::WrongVersionNumber.into());
        }
        if len > MAX_PLAIN_LENGTH {
            return Err(ErrorKind::RecordTooLarge.into());
        }

        fill(s, io, hdr + len)?;
        let mut record = s.s3.rbuf.split_to(hdr + len).freeze();
        record.advance(hdr);
        s.rwstate = Want::Nothing;

        let expected_epoch = s.enc_read.as_ref().map_or(0, |c| c.epoch);
        if dtls && epoch != expected_epoch {
            log::trace!("Dropping record of epoch {epoch}, expecting {expected_epoch}");
            continue;
        }
        match &mut s.enc_read {
            Some(state) => state.sequence += 1,
            None => s.s3.plain_read_seq += 1,
        }

        log::trace!("Read record type {content_type}, {len} bytes");
        msg_callback(s, false, content_type, &record);
        return Ok((content_type, record));
    }
}

/// Appends one record to the write buffer.
fn frame_record(s: &mut ConnectionState, content_type: u8, payload: &[u8]) {
    let (epoch, seq, suite) = match &mut s.enc_write {
        Some(state) => {
            let seq = state.sequence;
            state.sequence += 1;
            (state.epoch, seq, state.suite.name)
        }
        None => {
            let seq = s.s3.plain_write_seq;
            s.s3.plain_write_seq += 1;
            (0, seq, "NULL")
        }
    };

    let dtls = s.method.is_dtls();
    let w = &mut s.s3.wbuf;
    w.put_u8(content_type);
    w.put_u16(s.version.wire());
    if dtls {
        w.put_u16(epoch);
        w.put_slice(&seq.to_be_bytes()[2..]);
    }
    w.put_u16(payload.len() as u16);
    w.put_slice(payload);
    s.s3.wbuf_type = Some(content_type);

    log::trace!(
        "Wrote record type {content_type}, {} bytes, seq {seq} under {suite}",
        payload.len()
    );
    msg_callback(s, true, content_type, payload);
}

/// Pushes the write buffer into the transport.
pub(crate) fn write_pending(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    while !s.s3.wbuf.is_empty() {
        s.rwstate = Want::Writing;
        match io.write(&s.s3.wbuf) {
            IOCallbackResult::Ok(0) => {
                return Err(ErrorKind::Io(std::io::ErrorKind::WriteZero).into())
            }
            IOCallbackResult::Ok(n) => s.s3.wbuf.advance(n),
            IOCallbackResult::WouldBlock => return Err(Interrupt::Retry),
            IOCallbackResult::Err(e) => return Err(Interrupt::Fatal(e.into())),
        }
    }
    s.s3.wbuf_type = None;
    s.rwstate = Want::Nothing;
    Ok(())
}

/// Frames `data` as records of `content_type` and writes them.
pub(crate) fn write_records(
    s: &mut ConnectionState,
    io: &mut dyn RecordIo,
    content_type: u8,
    data: &[u8],
) -> Flow<()> {
    write_pending(s, io)?;
    for chunk in data.chunks(MAX_PLAIN_LENGTH) {
        frame_record(s, content_type, chunk);
    }
    write_pending(s, io)
}

/// Queues an alert and sends it unless other records are still waiting
/// to be written. A fatal alert invalidates the connection's session.
pub(crate) fn send_alert(
    s: &mut ConnectionState,
    io: &mut dyn RecordIo,
    fatal: bool,
    description: AlertDescription,
) -> Flow<()> {
    if fatal {
        if let Some(session) = s.session.clone() {
            s.initial_ctx.remove_session(&session);
        }
    }
    let level = if fatal { LEVEL_FATAL } else { LEVEL_WARNING };
    s.s3.alert_dispatch = true;
    s.s3.send_alert = [level, description.into()];
    if s.s3.wbuf.is_empty() {
        dispatch_alert(s, io)
    } else {
        Ok(())
    }
}

/// Writes the queued alert. On a blocked transport the alert stays
/// queued.
pub(crate) fn dispatch_alert(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    s.s3.alert_dispatch = false;
    if let Err(e) = write_alert_record(s, io) {
        s.s3.alert_dispatch = true;
        return Err(e);
    }

    let [level, code] = s.s3.send_alert;
    let fatal = level == LEVEL_FATAL;
    let description = AlertDescription::from(code);
    if fatal {
        if let IOCallbackResult::Err(e) = io.flush() {
            log::debug!("Flushing fatal alert failed: {e}");
        }
    }
    log::debug!("Sent alert {description:?} (fatal: {fatal})");
    s.notify(InfoEvent::WriteAlert { fatal, description });
    Ok(())
}

fn write_alert_record(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    if s.s3.wbuf_type != Some(ALERT) {
        write_pending(s, io)?;
        let alert = s.s3.send_alert;
        frame_record(s, ALERT, &alert);
    }
    write_pending(s, io)
}

/// Processes a received alert.
pub(crate) fn handle_alert(s: &mut ConnectionState, payload: &[u8]) -> Flow<()> {
    let [level, code] = payload else {
        return Err(ErrorKind::DecodeError("alert length").into());
    };
    let description = AlertDescription::from(*code);
    let fatal = *level == LEVEL_FATAL;
    log::debug!("Received alert {description:?} (fatal: {fatal})");
    s.notify(InfoEvent::ReadAlert { fatal, description });

    match *level {
        LEVEL_WARNING => {
            s.s3.warn_alert = Some(description);
            match description {
                AlertDescription::CloseNotify => {
                    s.shutdown |= ShutdownFlags::RECEIVED;
                    Err(Interrupt::Eof)
                }
                AlertDescription::NoRenegotiation => Err(ErrorKind::AlertReceived {
                    fatal: false,
                    description,
                }
                .into()),
                _ => Ok(()),
            }
        }
        LEVEL_FATAL => {
            s.rwstate = Want::Nothing;
            s.s3.fatal_alert = Some(description);
            s.shutdown |= ShutdownFlags::RECEIVED;
            if let Some(session) = s.session.clone() {
                s.initial_ctx.remove_session(&session);
            }
            Err(ErrorKind::AlertReceived {
                fatal: true,
                description,
            }
            .into())
        }
        _ => Err(ErrorKind::DecodeError("alert level").into()),
    }
}

/// The alert announcing a failure to the peer, if any.
pub(crate) fn alert_for(kind: &ErrorKind) -> Option<AlertDescription> {
    use AlertDescription as A;
    let alert = match kind {
        ErrorKind::UnexpectedMessage => A::UnexpectedMessage,
        ErrorKind::DecodeError(_) | ErrorKind::ErrorInReceivedCipherList => A::DecodeError,
        ErrorKind::WrongVersionNumber => A::ProtocolVersion,
        ErrorKind::RecordTooLarge => A::RecordOverflow,
        ErrorKind::NoSharedCipher
        | ErrorKind::PeerDidNotReturnCertificate
        | ErrorKind::HandshakeFailure
        | ErrorKind::UnsafeLegacyRenegotiationDisabled
        | ErrorKind::ScsvReceivedWhenRenegotiating
        | ErrorKind::AlertReceived { fatal: false, .. } => A::HandshakeFailure,
        ErrorKind::InappropriateFallback => A::InappropriateFallback,
        ErrorKind::RequiredCipherMissing
        | ErrorKind::WrongCipherReturned
        | ErrorKind::AttemptToReuseSessionInDifferentContext
        | ErrorKind::ExcessiveMessageSize => A::IllegalParameter,
        ErrorKind::ServerNameRejected => A::UnrecognizedName,
        ErrorKind::DigestCheckFailed => A::DecryptError,
        ErrorKind::CertificateVerifyFailed(e) => match e {
            VerifyError::UnableToGetIssuerCert => A::UnknownCa,
            VerifyError::CertChainTooLong | VerifyError::CertRejected => A::BadCertificate,
            VerifyError::ApplicationVerification => A::HandshakeFailure,
        },
        ErrorKind::InternalError(_) => A::InternalError,
        _ => return None,
    };
    Some(alert)
}

/// Records `kind` as the connection's error and tells the peer.
pub(crate) fn fatal(s: &mut ConnectionState, io: &mut dyn RecordIo, kind: ErrorKind) {
    log::debug!("Connection failed: {kind}");
    let alert = alert_for(&kind);
    s.error = Some(kind);
    if let Some(description) = alert {
        if let Err(e) = send_alert(s, io, true, description) {
            log::debug!("Could not send {description:?} alert: {e:?}");
        }
    }
}

pub(crate) fn finish(s: &mut ConnectionState, io: &mut dyn RecordIo, res: Flow<i32>) -> i32 {
    match res {
        Ok(n) => n,
        Err(Interrupt::Retry) => -1,
        Err(Interrupt::Eof) => 0,
        Err(Interrupt::AppData) => {
            s.error = Some(ErrorKind::AppDataReady);
            -1
        }
        Err(Interrupt::Fatal(kind)) => {
            fatal(s, io, kind);
            -1
        }
    }
}

pub(crate) fn finish_len(s: &mut ConnectionState, io: &mut dyn RecordIo, res: Flow<usize>) -> isize {
    match res {
        Ok(n) => n as isize,
        Err(e) => finish(s, io, Err(e)) as isize,
    }
}

/// Runs the handshake from within a read or write.
fn implicit_handshake(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    match handshake::drive(s, io) {
        Err(Interrupt::Eof) => Err(ErrorKind::HandshakeFailure.into()),
        other => other,
    }
}

/// After a handshake ran inside `read`, report a read retry unless the
/// application asked for automatic retries.
fn auto_retry(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    if !s.mode.contains(Mode::AUTO_RETRY) && s.s3.rbuf.is_empty() {
        s.rwstate = Want::Reading;
        io.set_read_retry();
        return Err(Interrupt::Retry);
    }
    Ok(())
}

pub(crate) fn read_app(
    s: &mut ConnectionState,
    io: &mut dyn RecordIo,
    buf: &mut [u8],
    peek: bool,
) -> Flow<usize> {
    if s.s3.renegotiate {
        s.method.table().renegotiate_check(s);
    }
    loop {
        if !s.s3.app_buf.is_empty() {
            let n = buf.len().min(s.s3.app_buf.len());
            buf[..n].copy_from_slice(&s.s3.app_buf[..n]);
            if !peek {
                s.s3.app_buf.advance(n);
            }
            s.rwstate = Want::Nothing;
            return Ok(n);
        }

        if s.in_init() && s.in_handshake == 0 {
            implicit_handshake(s, io)?;
            continue;
        }

        let (content_type, payload) = read_record(s, io)?;
        match content_type {
            APPLICATION_DATA => s.s3.app_buf.extend_from_slice(&payload),
            HANDSHAKE => {
                s.s3.hs_buf.extend_from_slice(&payload);
                if handshake::unsolicited(s, io)? {
                    implicit_handshake(s, io)?;
                    auto_retry(s, io)?;
                }
            }
            ALERT => handle_alert(s, &payload)?,
            _ => return Err(ErrorKind::UnexpectedMessage.into()),
        }
    }
}

/// Writes one record of application data, or finishes the record of an
/// earlier call that the transport did not take completely.
fn write_app_record(s: &mut ConnectionState, io: &mut dyn RecordIo, chunk: &[u8]) -> Flow<usize> {
    if let Some(pending) = s.s3.wpend {
        let moved = pending.ptr != chunk.as_ptr() as usize
            && !s.mode.contains(Mode::ACCEPT_MOVING_WRITE_BUFFER);
        if pending.tot > chunk.len() || moved {
            return Err(ErrorKind::BadWriteRetry.into());
        }
        write_pending(s, io)?;
        s.s3.wpend = None;
        return Ok(pending.ret);
    }

    write_pending(s, io)?;
    if chunk.is_empty() {
        return Ok(0);
    }
    frame_record(s, APPLICATION_DATA, chunk);
    s.s3.wpend = Some(PendingWrite {
        ptr: chunk.as_ptr() as usize,
        tot: chunk.len(),
        ret: chunk.len(),
    });
    write_pending(s, io)?;
    s.s3.wpend = None;
    Ok(chunk.len())
}

pub(crate) fn write_app(s: &mut ConnectionState, io: &mut dyn RecordIo, buf: &[u8]) -> Flow<usize> {
    if s.s3.renegotiate {
        s.method.table().renegotiate_check(s);
    }
    s.rwstate = Want::Nothing;
    let mut tot = std::mem::take(&mut s.s3.wnum);

    if s.in_init() && s.in_handshake == 0 {
        if let Err(e) = implicit_handshake(s, io) {
            s.s3.wnum = tot;
            return Err(e);
        }
    }

    if buf.len() < tot {
        return Err(ErrorKind::BadWriteRetry.into());
    }

    let max = max_fragment(s);
    let mut n = buf.len() - tot;
    loop {
        let nw = n.min(max);
        let written = match write_app_record(s, io, &buf[tot..tot + nw]) {
            Ok(written) => written,
            Err(e) => {
                s.s3.wnum = tot;
                return Err(e);
            }
        };
        if written == n || s.mode.contains(Mode::ENABLE_PARTIAL_WRITE) {
            return Ok(tot + written);
        }
        n -= written;
        tot += written;
    }
}

/// Waits for the peer's close notify, discarding anything else.
fn await_close_notify(s: &mut ConnectionState, io: &mut dyn RecordIo) -> Flow<()> {
    while !s.shutdown.contains(ShutdownFlags::RECEIVED) {
        let (content_type, payload) = read_record(s, io)?;
        match content_type {
            ALERT => match handle_alert(s, &payload) {
                Err(Interrupt::Eof) => return Ok(()),
                other => other?,
            },
            APPLICATION_DATA | HANDSHAKE => {
                log::trace!(
                    "Discarding {} bytes of type {content_type} while shutting down",
                    payload.len()
                );
            }
            _ => return Err(ErrorKind::UnexpectedMessage.into()),
        }
    }
    Ok(())
}

/// Two phase close: the first call sends our close notify, later calls
/// wait for the peer's. Returns 1 once both directions are closed, 0
/// after only our side closed and -1 when the transport blocks.
pub(crate) fn shutdown(s: &mut ConnectionState, io: &mut dyn RecordIo) -> i32 {
    if s.quiet_shutdown || matches!(s.state, HandshakeState::Before(_)) {
        s.shutdown = ShutdownFlags::SENT | ShutdownFlags::RECEIVED;
        return 1;
    }

    if !s.shutdown.contains(ShutdownFlags::SENT) {
        s.shutdown |= ShutdownFlags::SENT;
        if let Err(Interrupt::Fatal(kind)) =
            send_alert(s, io, false, AlertDescription::CloseNotify)
        {
            s.error = Some(kind);
            return -1;
        }
        if s.s3.alert_dispatch {
            return -1;
        }
    } else if s.s3.alert_dispatch {
        match dispatch_alert(s, io) {
            Ok(()) => {}
            Err(Interrupt::Fatal(kind)) => {
                s.error = Some(kind);
                return -1;
            }
            Err(_) => return -1,
        }
    } else if !s.shutdown.contains(ShutdownFlags::RECEIVED) {
        if let Err(Interrupt::Fatal(kind)) = await_close_notify(s, io) {
            fatal(s, io, kind);
            return -1;
        }
        if !s.shutdown.contains(ShutdownFlags::RECEIVED) {
            return -1;
        }
    }

    if s.shutdown.contains(ShutdownFlags::SENT | ShutdownFlags::RECEIVED) && !s.s3.alert_dispatch {
        1
    } else {
        0
    }
}
