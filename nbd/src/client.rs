//! NBD client implementation.
//!
//! This client implements the fixed newstyle handshake and the read-only
//! subset of the transmission phase. It is used by tests and tooling to
//! talk to NBD servers over any async stream.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// Read the server greeting and answer with the flags the server offered.
///
/// Returns the handshake flags advertised by the server.
pub async fn client_handshake<S>(stream: &mut S) -> Result<u16, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; ServerHandshake::SIZE_BYTES];
    stream.read_exact(&mut hello).await?;
    let hello = ServerHandshake::from_bytes(&hello)?;
    if hello.flags & NBD_FLAG_FIXED_NEWSTYLE == 0 {
        return Err(NbdError::NegotiationFailed {
            reason: "server does not support fixed newstyle",
        });
    }

    let reply = ClientHandshake {
        padding: 0,
        flags: hello.flags & (NBD_FLAG_C_FIXED_NEWSTYLE | NBD_FLAG_C_NO_ZEROES),
    };
    stream.write_all(&reply.to_bytes()).await?;
    Ok(hello.flags)
}

/// Send one option request with its payload.
pub async fn send_option<S>(stream: &mut S, option: u32, data: &[u8]) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let header = OptionHeader {
        option,
        length: data.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

/// Read one option reply and its data.
pub async fn read_option_reply<S>(stream: &mut S) -> Result<(OptionReplyHeader, Vec<u8>), NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; OptionReplyHeader::SIZE_BYTES];
    stream.read_exact(&mut header).await?;
    let header = OptionReplyHeader::from_bytes(&header)?;

    // Bound allocation to prevent DoS from malicious servers
    let length = header.length as usize;
    if length > OPTION_REPLY_MAX_BYTES {
        return Err(NbdError::RequestTooLarge {
            length_bytes: header.length,
            max_bytes: OPTION_REPLY_MAX_BYTES as u32,
        });
    }

    let mut data = vec![0u8; length];
    stream.read_exact(&mut data).await?;
    Ok((header, data))
}

/// Encode the payload of `NBD_OPT_GO` / `NBD_OPT_INFO` without information requests.
pub fn export_request(export_name: &str) -> Vec<u8> {
    let name = export_name.as_bytes();
    let mut data = Vec::with_capacity(4 + name.len() + 2);
    data.extend_from_slice(&(name.len() as u32).to_be_bytes());
    data.extend_from_slice(name);
    data.extend_from_slice(&0u16.to_be_bytes()); // no info requests
    data
}

/// NBD client for connecting to NBD servers.
pub struct NbdClient<S> {
    stream: S,
    handle_counter: AtomicU64,
    /// Size of the export in bytes.
    pub size_bytes: u64,
    /// Transmission flags advertised by the server.
    pub transmission_flags: u16,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect to an NBD server and negotiate the export.
    ///
    /// Structured replies are requested before `NBD_OPT_GO`.
    pub async fn connect(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        client_handshake(&mut stream).await?;

        send_option(&mut stream, NBD_OPT_STRUCTURED_REPLY, &[]).await?;
        let (reply, _) = read_option_reply(&mut stream).await?;
        if reply.reply != NBD_REP_ACK {
            return Err(NbdError::OptionRejected {
                option: NBD_OPT_STRUCTURED_REPLY,
                reply: reply.reply,
            });
        }

        send_option(&mut stream, NBD_OPT_GO, &export_request(export_name)).await?;

        // Read option replies until we get NBD_REP_ACK
        let mut size_bytes = 0u64;
        let mut transmission_flags = 0u16;
        loop {
            let (reply, data) = read_option_reply(&mut stream).await?;
            if reply.reply == NBD_REP_INFO {
                if let Some(info) = InfoExport::from_bytes(&data) {
                    size_bytes = info.size_bytes;
                    transmission_flags = info.transmission_flags;
                }
            } else if reply.reply == NBD_REP_ACK {
                break;
            } else if is_reply_error(reply.reply) {
                return Err(NbdError::OptionRejected {
                    option: NBD_OPT_GO,
                    reply: reply.reply,
                });
            }
        }

        Ok(Self {
            stream,
            handle_counter: AtomicU64::new(0),
            size_bytes,
            transmission_flags,
        })
    }

    fn next_handle(&self) -> u64 {
        self.handle_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a raw request without waiting for its reply.
    ///
    /// Returns the handle the reply will carry. Replies to pipelined requests
    /// may arrive in any order.
    pub async fn send_request(
        &mut self,
        command: NbdCommand,
        flags: u16,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle();
        let req = NbdRequest {
            flags,
            command,
            handle,
            offset,
            length,
        };
        self.stream.write_all(&req.to_bytes()).await?;
        Ok(handle)
    }

    /// Send raw payload bytes following a request header.
    pub async fn send_payload(&mut self, data: &[u8]) -> Result<(), NbdError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Read the next simple reply header.
    pub async fn read_reply(&mut self) -> Result<NbdReply, NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        NbdReply::from_bytes(&buf)
    }

    /// Read `length` bytes of reply data.
    pub async fn read_data(&mut self, length: u32) -> Result<Bytes, NbdError> {
        let mut data = BytesMut::with_capacity(length as usize);
        data.resize(length as usize, 0);
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "failed to read {} bytes of response data: {}",
                length, e
            )))
        })?;
        Ok(data.freeze())
    }

    /// Read data from the device.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self
            .send_request(NbdCommand::Read, 0, offset, length)
            .await?;
        let reply = self.read_reply().await?;

        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }

        self.read_data(length).await
    }

    /// Disconnect from the server.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0, 0).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Check if the export is read-only.
    pub fn is_read_only(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_READ_ONLY) != 0
    }

    /// Check if the server allows several connections to the same export.
    pub fn can_multi_conn(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_CAN_MULTI_CONN) != 0
    }

    /// Give back the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}
