//! Per-connection protocol state machine.
//!
//! A connection goes through the fixed newstyle handshake, option
//! negotiation until the client picks an export with `NBD_OPT_GO`, and then
//! read-only transmission. During transmission a reader task decodes
//! requests into a queue while reads are served by their own tasks, so
//! replies may go out in any order. Every reply is written under one writer
//! lock so that a reply header and its data are never interleaved with
//! another reply.

use std::io;
use std::sync::Arc;

use nbd::{
    ClientHandshake, InfoExport, NbdCommand, NbdError, NbdReply, NbdRequest, OptionHeader,
    OptionReplyHeader, ServerHandshake, NBD_EINVAL, NBD_EIO, NBD_ENOTSUP,
    NBD_FLAG_CAN_MULTI_CONN, NBD_FLAG_FIXED_NEWSTYLE, NBD_FLAG_HAS_FLAGS, NBD_FLAG_READ_ONLY,
    NBD_FLAG_SEND_CACHE, NBD_OPT_ABORT, NBD_OPT_EXPORT_NAME, NBD_OPT_GO, NBD_OPT_INFO,
    NBD_OPT_STRUCTURED_REPLY, NBD_REP_ACK, NBD_REP_ERR_INVALID, NBD_REP_ERR_POLICY,
    NBD_REP_ERR_SHUTDOWN, NBD_REP_ERR_TOO_BIG, NBD_REP_ERR_UNKNOWN, NBD_REP_ERR_UNSUP,
    NBD_REP_INFO,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use super::exports::Exports;
use crate::backend::{Backend, ReadAt};
use crate::buffer::{BufferPool, BUFFER_SIZE};
use crate::scope::{Cause, Scope};

/// Handshake flags advertised by the server.
pub const SERVER_FLAGS: u16 = NBD_FLAG_FIXED_NEWSTYLE;

/// Transmission flags of every export.
pub const TRANSMISSION_FLAGS: u16 =
    NBD_FLAG_HAS_FLAGS | NBD_FLAG_READ_ONLY | NBD_FLAG_CAN_MULTI_CONN | NBD_FLAG_SEND_CACHE;

/// Decoded requests waiting to be dispatched.
const REQUEST_QUEUE_DEPTH: usize = 32;

/// Consecutive backend errors tolerated after a read reply has begun.
const IO_ERROR_THRESHOLD: u32 = 30;

/// Stands in for data that could not be read once a reply has begun.
const FILLER_PATTERN: [u8; 16] = [
    0xee, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8, 0xe9, 0xea, 0xeb, 0xec, 0xed,
    0xee,
];

const MSG_FIXED_NEWSTYLE: &[u8] = b"this server requires fixed newstyle negotiation";
const MSG_STRUCTURED_REPLY: &[u8] = b"structured replies must be negotiated before NBD_OPT_GO";
const MSG_UNKNOWN_EXPORT: &[u8] = b"requested export is not available";

/// Serve one client connection until it disconnects, fails, or `scope` is
/// cancelled.
///
/// The backend negotiated by the client is closed when the connection ends.
pub async fn serve<S>(
    mut stream: S,
    exports: &dyn Exports,
    scope: &Scope,
    pool: &Arc<BufferPool>,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::select! {
        biased;
        result = handshake(&mut stream) => result?,
        _ = scope.cancelled() => return Err(shutdown_error(scope)),
    }

    let backend = negotiate(&mut stream, exports, scope, pool).await?;
    let result = transmission(stream, backend.clone(), scope, pool).await;
    if let Err(e) = backend.close().await {
        warn!(error = %e, "closing export backend failed");
    }
    result
}

async fn handshake<S>(stream: &mut S) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = ServerHandshake {
        flags: SERVER_FLAGS,
    };
    stream.write_all(&hello.to_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; ClientHandshake::SIZE_BYTES];
    stream.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    let reply = ClientHandshake::from_bytes(&buf);
    if reply.padding != 0 || reply.flags != SERVER_FLAGS {
        return Err(NbdError::HandshakeRejected {
            reason: format!(
                "unexpected client flags: padding=0x{:04x} flags=0x{:04x}",
                reply.padding, reply.flags
            ),
        });
    }
    Ok(())
}

async fn negotiate<S>(
    stream: &mut S,
    exports: &dyn Exports,
    scope: &Scope,
    pool: &Arc<BufferPool>,
) -> Result<Backend, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut structured_replies = false;

    loop {
        let OptionHeader { option, length } = tokio::select! {
            biased;
            header = read_option_header(stream) => header?,
            _ = scope.cancelled() => return Err(shutdown_error(scope)),
        };
        if scope.is_cancelled() {
            send_reply(stream, option, NBD_REP_ERR_SHUTDOWN, &[]).await?;
            return Err(shutdown_error(scope));
        }

        debug!(option, length, "NBD option");

        match option {
            NBD_OPT_EXPORT_NAME => {
                send_reply(stream, option, NBD_REP_ERR_POLICY, MSG_FIXED_NEWSTYLE).await?;
                return Err(NbdError::LegacyNegotiation);
            }
            NBD_OPT_ABORT => {
                discard(stream, u64::from(length)).await?;
                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                return Err(NbdError::Aborted);
            }
            NBD_OPT_STRUCTURED_REPLY => {
                if length != 0 {
                    discard(stream, u64::from(length)).await?;
                    send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                    continue;
                }
                structured_replies = true;
                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
            }
            NBD_OPT_GO | NBD_OPT_INFO => {
                let negotiated = export_info(
                    stream,
                    option,
                    length,
                    structured_replies,
                    exports,
                    pool,
                )
                .await?;
                if let Some(backend) = negotiated {
                    return Ok(backend);
                }
            }
            _ => {
                discard(stream, u64::from(length)).await?;
                send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
            }
        }
    }
}

/// Answer `NBD_OPT_INFO` or `NBD_OPT_GO`.
///
/// Returns the backend when a `GO` succeeded. Refusals are reported to the
/// client and negotiation continues.
async fn export_info<S>(
    stream: &mut S,
    option: u32,
    length: u32,
    structured_replies: bool,
    exports: &dyn Exports,
    pool: &Arc<BufferPool>,
) -> Result<Option<Backend>, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let length = length as usize;
    if length > BUFFER_SIZE {
        discard(stream, length as u64).await?;
        send_reply(stream, option, NBD_REP_ERR_TOO_BIG, &[]).await?;
        return Ok(None);
    }
    if option == NBD_OPT_GO && !structured_replies {
        discard(stream, length as u64).await?;
        send_reply(stream, option, NBD_REP_ERR_POLICY, MSG_STRUCTURED_REPLY).await?;
        return Ok(None);
    }

    let name = {
        let mut buf = pool.get();
        let payload = &mut buf[..length];
        stream.read_exact(payload).await.map_err(closed_on_eof)?;
        parse_export_name(payload)
    };
    let Some(name) = name else {
        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
        return Ok(None);
    };

    let backend = match exports.lookup(&name).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!(export = %name, error = %e, "export lookup failed");
            send_reply(stream, option, NBD_REP_ERR_UNKNOWN, MSG_UNKNOWN_EXPORT).await?;
            return Ok(None);
        }
    };

    let info = InfoExport {
        size_bytes: backend.size(),
        transmission_flags: TRANSMISSION_FLAGS,
    };
    send_reply(stream, option, NBD_REP_INFO, &info.to_bytes()).await?;
    send_reply(stream, option, NBD_REP_ACK, &[]).await?;

    if option == NBD_OPT_GO {
        info!(export = %name, size_bytes = info.size_bytes, "export negotiated");
        return Ok(Some(backend));
    }
    if let Err(e) = backend.close().await {
        warn!(export = %name, error = %e, "closing export backend failed");
    }
    Ok(None)
}

/// Export name from an `INFO`/`GO` payload: a 32-bit name length, the name,
/// and a 16-bit count of information requests.
fn parse_export_name(payload: &[u8]) -> Option<String> {
    if payload.len() < 6 {
        return None;
    }
    let name_len = u32::from_be_bytes(payload[0..4].try_into().ok()?) as usize;
    let end = 4usize.checked_add(name_len)?;
    if end.checked_add(2)? > payload.len() {
        return None;
    }
    String::from_utf8(payload[4..end].to_vec()).ok()
}

async fn read_option_header<S>(stream: &mut S) -> Result<OptionHeader, NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; OptionHeader::SIZE_BYTES];
    stream.read_exact(&mut buf).await.map_err(closed_on_eof)?;
    OptionHeader::from_bytes(&buf)
}

async fn send_reply<S>(stream: &mut S, option: u32, reply: u32, data: &[u8]) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let header = OptionReplyHeader {
        option,
        reply,
        length: data.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

async fn transmission<S>(
    stream: S,
    backend: Backend,
    scope: &Scope,
    pool: &Arc<BufferPool>,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn = scope.child();
    let (reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let (tx, mut rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let mut receiver = tokio::spawn(receive_requests(reader, tx, conn.clone()).in_current_span());
    let reads = TaskTracker::new();

    let result = loop {
        let req = tokio::select! {
            _ = conn.cancelled() => break Err(cancel_error(&conn)),
            req = rx.recv() => match req {
                Some(req) => req,
                None => break match (&mut receiver).await {
                    Ok(Ok(())) => Err(cancel_error(&conn)),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(NbdError::Io(io::Error::other(e))),
                },
            },
        };

        debug!(
            command = ?req.command,
            handle = req.handle,
            offset = req.offset,
            length = req.length,
            "NBD request"
        );

        if req.flags != 0 {
            if let Err(e) = send_simple_reply(&writer, NbdReply::error(req.handle, NBD_EINVAL)).await
            {
                break Err(e);
            }
            continue;
        }

        match req.command {
            NbdCommand::Read => {
                let backend = backend.clone();
                let writer = Arc::clone(&writer);
                let pool = Arc::clone(pool);
                let conn = conn.clone();
                reads.spawn(
                    async move {
                        let mut buf = pool.get();
                        if let Err(e) = serve_read(&backend, &*writer, &mut buf[..], req).await {
                            warn!(handle = req.handle, error = %e, "NBD_CMD_READ failed");
                            conn.cancel(Cause::Failed(format!("NBD_CMD_READ: {e}")));
                        }
                    }
                    .in_current_span(),
                );
            }
            NbdCommand::Disconnect => {
                debug!("client requested disconnect");
                break Ok(());
            }
            _ => {
                if let Err(e) =
                    send_simple_reply(&writer, NbdReply::error(req.handle, NBD_ENOTSUP)).await
                {
                    break Err(e);
                }
            }
        }
    };

    conn.cancel(Cause::ClientDisconnect);
    receiver.abort();
    let _ = receiver.await;
    reads.close();
    reads.wait().await;
    result
}

/// Decode requests from the client and queue them for dispatch.
///
/// Write payloads are drained here so the stream stays framed. Returns
/// `Ok(())` when `scope` is cancelled or the dispatcher is gone.
async fn receive_requests<R>(
    mut reader: R,
    tx: mpsc::Sender<NbdRequest>,
    scope: Scope,
) -> Result<(), NbdError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; NbdRequest::SIZE_BYTES];
    loop {
        tokio::select! {
            _ = scope.cancelled() => return Ok(()),
            result = reader.read_exact(&mut header) => {
                result.map_err(closed_on_eof)?;
            }
        }

        let req = NbdRequest::from_bytes(&header)?;
        if req.command.has_payload() {
            tokio::select! {
                _ = scope.cancelled() => return Ok(()),
                result = discard(&mut reader, u64::from(req.length)) => result?,
            }
        }
        if tx.send(req).await.is_err() {
            return Ok(());
        }
    }
}

/// Serve one `NBD_CMD_READ`, streaming the data in `buf`-sized slices.
///
/// Before anything has been written, a backend error becomes an `EIO`
/// reply. Once the ok header is out, the reply has to carry exactly
/// `length` bytes, so failing slices are retried and after more than
/// [`IO_ERROR_THRESHOLD`] consecutive errors replaced by
/// [`FILLER_PATTERN`]. Errors writing to the client are returned.
pub(crate) async fn serve_read<R, W>(
    backend: &R,
    writer: &Mutex<W>,
    buf: &mut [u8],
    req: NbdRequest,
) -> Result<(), NbdError>
where
    R: ReadAt + ?Sized,
    W: AsyncWrite + Unpin + Send,
{
    let Some(end) = req.offset.checked_add(u64::from(req.length)) else {
        return send_simple_reply(writer, NbdReply::error(req.handle, NBD_EINVAL)).await;
    };

    // Held from the ok header until the last data byte.
    let mut reply: Option<MutexGuard<'_, W>> = None;
    if req.length == 0 {
        reply = Some(begin_reply(writer, req.handle).await?);
    }

    let mut cursor = req.offset;
    let mut errors = 0u32;
    while cursor < end {
        let want = (end - cursor).min(buf.len() as u64) as usize;
        let slice = &mut buf[..want];

        let n = match backend.read_at(slice, cursor).await {
            Ok(n) => {
                errors = 0;
                n
            }
            Err(e) if reply.is_none() => {
                warn!(offset = cursor, error = %e, "NBD_CMD_READ: backend read failed");
                return send_simple_reply(writer, NbdReply::error(req.handle, NBD_EIO)).await;
            }
            Err(e) => {
                errors += 1;
                if errors <= IO_ERROR_THRESHOLD {
                    debug!(offset = cursor, attempt = errors, error = %e, "NBD_CMD_READ: retrying");
                    continue;
                }
                warn!(
                    offset = cursor,
                    length = want,
                    error = %e,
                    "NBD_CMD_READ: giving up on backend, sending filler data"
                );
                fill(slice);
                want
            }
        };
        if n == 0 {
            continue;
        }

        if reply.is_none() {
            reply = Some(begin_reply(writer, req.handle).await?);
        }
        if let Some(w) = reply.as_mut() {
            w.write_all(&slice[..n]).await?;
        }
        cursor += n as u64;
    }

    if let Some(mut w) = reply {
        w.flush().await?;
    }
    Ok(())
}

async fn begin_reply<W>(writer: &Mutex<W>, handle: u64) -> Result<MutexGuard<'_, W>, NbdError>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    w.write_all(&NbdReply::ok(handle).to_bytes()).await?;
    Ok(w)
}

async fn send_simple_reply<W>(writer: &Mutex<W>, reply: NbdReply) -> Result<(), NbdError>
where
    W: AsyncWrite + Unpin,
{
    let mut w = writer.lock().await;
    w.write_all(&reply.to_bytes()).await?;
    w.flush().await?;
    Ok(())
}

fn fill(buf: &mut [u8]) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b = FILLER_PATTERN[i % FILLER_PATTERN.len()];
    }
}

/// Skip `len` bytes of client input.
async fn discard<R>(reader: &mut R, len: u64) -> Result<(), NbdError>
where
    R: AsyncRead + Unpin,
{
    if len == 0 {
        return Ok(());
    }
    let copied = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    if copied < len {
        return Err(NbdError::ClientClosed);
    }
    Ok(())
}

fn closed_on_eof(e: io::Error) -> NbdError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NbdError::ClientClosed
    } else {
        NbdError::Io(e)
    }
}

fn shutdown_error(scope: &Scope) -> NbdError {
    NbdError::Shutdown {
        cause: scope.cause().unwrap_or(Cause::Shutdown).to_string(),
    }
}

fn cancel_error(scope: &Scope) -> NbdError {
    match scope.cause() {
        Some(Cause::ClientDisconnect) => NbdError::ClientClosed,
        Some(Cause::Failed(message)) => NbdError::Io(io::Error::other(message)),
        _ => shutdown_error(scope),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use nbd::{
        client_handshake, export_request, read_option_reply, send_option, NbdClient,
        NBD_CMD_FLAG_FUA, NBD_OPT_LIST,
    };
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    use super::*;
    use crate::error::CacheError;
    use crate::nbd::StaticExports;

    const EXPORT: &str = "disk.img";

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn start(data: Vec<u8>) -> (DuplexStream, Scope, JoinHandle<Result<(), NbdError>>) {
        let exports = StaticExports::new().with(EXPORT, Backend::Memory(Bytes::from(data)));
        let (client, server) = duplex(1 << 20);
        let scope = Scope::root();
        let pool = BufferPool::new();
        let task_scope = scope.clone();
        let handle =
            tokio::spawn(async move { serve(server, &exports, &task_scope, &pool).await });
        (client, scope, handle)
    }

    async fn structured(client: &mut DuplexStream) {
        client_handshake(client).await.unwrap();
        send_option(client, NBD_OPT_STRUCTURED_REPLY, &[]).await.unwrap();
        let (reply, _) = read_option_reply(client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ACK);
    }

    #[tokio::test]
    async fn handshake_rejects_unexpected_flags() {
        let (mut client, _scope, handle) = start(pattern(16));

        let mut hello = [0u8; ServerHandshake::SIZE_BYTES];
        client.read_exact(&mut hello).await.unwrap();
        assert_eq!(
            ServerHandshake::from_bytes(&hello).unwrap().flags,
            NBD_FLAG_FIXED_NEWSTYLE
        );

        let reply = ClientHandshake {
            padding: 0,
            flags: NBD_FLAG_FIXED_NEWSTYLE | nbd::NBD_FLAG_C_NO_ZEROES,
        };
        client.write_all(&reply.to_bytes()).await.unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(NbdError::HandshakeRejected { .. })));
    }

    #[tokio::test]
    async fn go_requires_structured_replies() {
        let (mut client, _scope, handle) = start(pattern(16));
        client_handshake(&mut client).await.unwrap();

        send_option(&mut client, NBD_OPT_GO, &export_request(EXPORT))
            .await
            .unwrap();
        let (reply, _) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.option, NBD_OPT_GO);
        assert_eq!(reply.reply, NBD_REP_ERR_POLICY);

        send_option(&mut client, NBD_OPT_ABORT, &[]).await.unwrap();
        let (reply, _) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ACK);

        assert!(matches!(handle.await.unwrap(), Err(NbdError::Aborted)));
    }

    #[tokio::test]
    async fn info_reports_one_export_record_then_ack() {
        let (mut client, _scope, handle) = start(pattern(5000));
        structured(&mut client).await;

        send_option(&mut client, NBD_OPT_INFO, &export_request(EXPORT))
            .await
            .unwrap();
        let (reply, data) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_INFO);
        let info = InfoExport::from_bytes(&data).unwrap();
        assert_eq!(info.size_bytes, 5000);
        assert_eq!(info.transmission_flags, TRANSMISSION_FLAGS);

        let (reply, data) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ACK);
        assert!(data.is_empty());

        drop(client);
        assert!(matches!(handle.await.unwrap(), Err(NbdError::ClientClosed)));
    }

    #[tokio::test]
    async fn unknown_export_keeps_negotiating() {
        let (mut client, _scope, handle) = start(pattern(16));
        structured(&mut client).await;

        send_option(&mut client, NBD_OPT_GO, &export_request("missing"))
            .await
            .unwrap();
        let (reply, data) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ERR_UNKNOWN);
        assert_eq!(data, MSG_UNKNOWN_EXPORT);

        send_option(&mut client, NBD_OPT_ABORT, &[]).await.unwrap();
        let (reply, _) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ACK);
        assert!(matches!(handle.await.unwrap(), Err(NbdError::Aborted)));
    }

    #[tokio::test]
    async fn malformed_options_are_refused_and_negotiation_continues() {
        let (mut client, _scope, handle) = start(pattern(16));
        structured(&mut client).await;

        let cases: Vec<(u32, Vec<u8>, u32)> = vec![
            (NBD_OPT_GO, vec![0u8; BUFFER_SIZE + 1], NBD_REP_ERR_TOO_BIG),
            (NBD_OPT_GO, vec![0, 0, 0], NBD_REP_ERR_INVALID),
            (NBD_OPT_INFO, vec![0, 0, 0, 100, b'a', b'b', 0, 0], NBD_REP_ERR_INVALID),
            (NBD_OPT_STRUCTURED_REPLY, vec![1], NBD_REP_ERR_INVALID),
            (NBD_OPT_LIST, vec![], NBD_REP_ERR_UNSUP),
        ];
        for (option, payload, expected) in cases {
            send_option(&mut client, option, &payload).await.unwrap();
            let (reply, _) = read_option_reply(&mut client).await.unwrap();
            assert_eq!(reply.option, option);
            assert_eq!(reply.reply, expected, "option {option}");
        }

        send_option(&mut client, NBD_OPT_GO, &export_request(EXPORT))
            .await
            .unwrap();
        let (reply, _) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_INFO);
        let (reply, _) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ACK);

        let req = NbdRequest {
            flags: 0,
            command: NbdCommand::Disconnect,
            handle: 1,
            offset: 0,
            length: 0,
        };
        client.write_all(&req.to_bytes()).await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn export_name_is_refused() {
        let (mut client, _scope, handle) = start(pattern(16));
        client_handshake(&mut client).await.unwrap();

        send_option(&mut client, NBD_OPT_EXPORT_NAME, EXPORT.as_bytes())
            .await
            .unwrap();
        let (reply, data) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ERR_POLICY);
        assert_eq!(data, MSG_FIXED_NEWSTYLE);

        assert!(matches!(
            handle.await.unwrap(),
            Err(NbdError::LegacyNegotiation)
        ));
    }

    #[tokio::test]
    async fn shutdown_during_negotiation_is_reported() {
        let (mut client, scope, handle) = start(pattern(16));
        client_handshake(&mut client).await.unwrap();

        send_option(&mut client, NBD_OPT_STRUCTURED_REPLY, &[])
            .await
            .unwrap();
        scope.cancel(Cause::Shutdown);

        let (reply, _) = read_option_reply(&mut client).await.unwrap();
        assert_eq!(reply.reply, NBD_REP_ERR_SHUTDOWN);
        assert!(handle.await.unwrap().unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn idle_negotiation_ends_on_shutdown() {
        let (mut client, scope, handle) = start(pattern(16));
        client_handshake(&mut client).await.unwrap();

        scope.cancel(Cause::Shutdown);
        assert!(handle.await.unwrap().unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn reads_return_export_bytes() {
        let data = pattern(200_000);
        let (stream, _scope, handle) = start(data.clone());
        let mut client = NbdClient::connect(stream, EXPORT).await.unwrap();
        assert_eq!(client.size_bytes, 200_000);
        assert!(client.is_read_only());
        assert!(client.can_multi_conn());

        let got = client.read(0, 200_000).await.unwrap();
        assert_eq!(&got[..], &data[..]);

        let got = client.read(199_990, 10).await.unwrap();
        assert_eq!(&got[..], &data[199_990..]);

        let got = client.read(100, 0).await.unwrap();
        assert!(got.is_empty());

        client.disconnect().await.unwrap();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn read_past_end_fails_with_eio() {
        let (stream, _scope, _handle) = start(pattern(1000));
        let mut client = NbdClient::connect(stream, EXPORT).await.unwrap();

        let err = client.read(1000, 10).await.unwrap_err();
        assert!(matches!(err, NbdError::ServerError { code: NBD_EIO }));
    }

    #[tokio::test]
    async fn read_across_end_is_padded_with_filler() {
        let data = pattern(1000);
        let (stream, _scope, _handle) = start(data.clone());
        let mut client = NbdClient::connect(stream, EXPORT).await.unwrap();

        let got = client.read(995, 10).await.unwrap();
        assert_eq!(&got[..5], &data[995..]);
        assert_eq!(&got[5..], &FILLER_PATTERN[..5]);
    }

    #[tokio::test]
    async fn flagged_and_unsupported_requests_are_refused() {
        let data = pattern(1000);
        let (stream, _scope, _handle) = start(data.clone());
        let mut client = NbdClient::connect(stream, EXPORT).await.unwrap();

        let handle = client
            .send_request(NbdCommand::Read, NBD_CMD_FLAG_FUA, 0, 10)
            .await
            .unwrap();
        let reply = client.read_reply().await.unwrap();
        assert_eq!(reply.handle, handle);
        assert_eq!(reply.error, NBD_EINVAL);

        client
            .send_request(NbdCommand::Write, 0, 0, 5)
            .await
            .unwrap();
        client.send_payload(b"hello").await.unwrap();
        assert_eq!(client.read_reply().await.unwrap().error, NBD_ENOTSUP);

        for command in [NbdCommand::Flush, NbdCommand::Trim, NbdCommand::Cache] {
            client.send_request(command, 0, 0, 10).await.unwrap();
            assert_eq!(client.read_reply().await.unwrap().error, NBD_ENOTSUP);
        }

        // Still framed after the drained write payload.
        let got = client.read(10, 20).await.unwrap();
        assert_eq!(&got[..], &data[10..30]);
    }

    #[tokio::test]
    async fn bad_request_magic_is_fatal() {
        let (stream, _scope, handle) = start(pattern(16));
        let client = NbdClient::connect(stream, EXPORT).await.unwrap();
        let mut stream = client.into_inner();

        stream
            .write_all(&[0xabu8; NbdRequest::SIZE_BYTES])
            .await
            .unwrap();
        assert!(matches!(
            handle.await.unwrap(),
            Err(NbdError::InvalidMagic { .. })
        ));
    }

    #[tokio::test]
    async fn client_eof_ends_transmission() {
        let (stream, _scope, handle) = start(pattern(16));
        let client = NbdClient::connect(stream, EXPORT).await.unwrap();
        drop(client);

        assert!(matches!(handle.await.unwrap(), Err(NbdError::ClientClosed)));
    }

    #[tokio::test]
    async fn shutdown_ends_transmission() {
        let (stream, scope, handle) = start(pattern(16));
        let _client = NbdClient::connect(stream, EXPORT).await.unwrap();

        scope.cancel(Cause::Shutdown);
        assert!(handle.await.unwrap().unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_releases_stalled_write_payload() {
        let (stream, scope, handle) = start(pattern(16));
        let mut client = NbdClient::connect(stream, EXPORT).await.unwrap();

        client
            .send_request(NbdCommand::Write, 0, 0, 1_000_000)
            .await
            .unwrap();
        client.send_payload(&[0u8; 10]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        scope.cancel(Cause::Shutdown);
        assert!(handle.await.unwrap().unwrap_err().is_shutdown());

        // The server side of the stream is gone once serve returns.
        let mut stream = client.into_inner();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf))
            .await
            .expect("connection still open after shutdown")
            .unwrap();
        assert_eq!(n, 0);
    }

    /// Serves `good` bytes and fails every read beyond them.
    struct Flaky {
        data: Vec<u8>,
        good: u64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ReadAt for Flaky {
        async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if offset >= self.good {
                return Err(CacheError::remote("injected failure"));
            }
            let n = buf.len().min((self.good - offset) as usize);
            let start = offset as usize;
            buf[..n].copy_from_slice(&self.data[start..start + n]);
            Ok(n)
        }
    }

    fn read_request(offset: u64, length: u32) -> NbdRequest {
        NbdRequest {
            flags: 0,
            command: NbdCommand::Read,
            handle: 7,
            offset,
            length,
        }
    }

    #[tokio::test]
    async fn failure_before_reply_sends_eio() {
        let backend = Flaky {
            data: pattern(100),
            good: 0,
            calls: AtomicUsize::new(0),
        };
        let writer = Mutex::new(Vec::new());
        let mut buf = vec![0u8; 64];

        serve_read(&backend, &writer, &mut buf, read_request(0, 300))
            .await
            .unwrap();

        let out = writer.into_inner();
        assert_eq!(out, NbdReply::error(7, NBD_EIO).to_bytes());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_after_reply_keeps_byte_count() {
        let data = pattern(300);
        let backend = Flaky {
            data: data.clone(),
            good: 100,
            calls: AtomicUsize::new(0),
        };
        let writer = Mutex::new(Vec::new());
        let mut buf = vec![0u8; 64];

        serve_read(&backend, &writer, &mut buf, read_request(0, 300))
            .await
            .unwrap();

        let out = writer.into_inner();
        assert_eq!(out.len(), NbdReply::SIZE_BYTES + 300);
        assert_eq!(&out[..NbdReply::SIZE_BYTES], &NbdReply::ok(7).to_bytes());

        let body = &out[NbdReply::SIZE_BYTES..];
        assert_eq!(&body[..100], &data[..100]);
        for (i, b) in body[100..].iter().enumerate() {
            assert_eq!(*b, FILLER_PATTERN[i % FILLER_PATTERN.len()]);
        }
        assert!(backend.calls.load(Ordering::SeqCst) > IO_ERROR_THRESHOLD as usize);
    }

    #[test]
    fn export_name_parsing() {
        assert_eq!(
            parse_export_name(&export_request("disk")).as_deref(),
            Some("disk")
        );
        assert_eq!(parse_export_name(&export_request("")).as_deref(), Some(""));
        assert_eq!(parse_export_name(&[0, 0, 0, 4, b'd', b'i', b's', b'k']), None);
        assert_eq!(parse_export_name(&[0xff, 0xff, 0xff, 0xff, 0, 0]), None);
    }
}
