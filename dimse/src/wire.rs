//! Asynchronous PDU transport helpers.
//!
//! The PDU codec itself is transport-agnostic and incremental;
//! these helpers feed it from a tokio byte stream,
//! buffering partial reads until a full PDU is available.
use std::io::Cursor;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use radlink_ul::pdu::{read_pdu, write_pdu, Pdu, MAXIMUM_PDU_SIZE, MINIMUM_PDU_SIZE};

use crate::connection::{
    ConnectionClosedSnafu, ReceivePduSnafu, Result, SendPduSnafu, WireSnafu, WriteTimeoutSnafu,
};

/// Read one full PDU from the byte stream,
/// keeping partial bytes in `read_buffer` between calls.
pub(crate) async fn read_pdu_from_wire<R>(
    reader: &mut R,
    read_buffer: &mut BytesMut,
    max_pdu_length: u32,
    strict: bool,
) -> Result<Pdu>
where
    R: AsyncRead + Unpin,
{
    // the codec only admits limits within the absolute bounds,
    // regardless of what the peer advertised
    let max_pdu_length = max_pdu_length.clamp(MINIMUM_PDU_SIZE, MAXIMUM_PDU_SIZE);
    loop {
        let mut cursor = Cursor::new(&read_buffer[..]);
        if let Some(pdu) = read_pdu(&mut cursor, max_pdu_length, strict).context(ReceivePduSnafu)? {
            let consumed = cursor.position() as usize;
            read_buffer.advance(consumed);
            return Ok(pdu);
        }

        let mut chunk = [0u8; 8192];
        let bytes_read = reader.read(&mut chunk).await.context(WireSnafu)?;
        if bytes_read == 0 {
            return ConnectionClosedSnafu.fail();
        }
        read_buffer.extend_from_slice(&chunk[..bytes_read]);
    }
}

/// Encode and send one PDU,
/// bounding the socket write by `write_timeout`.
pub(crate) async fn write_pdu_to_wire<W>(
    writer: &mut W,
    buffer: &mut Vec<u8>,
    pdu: &Pdu,
    write_timeout: Duration,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    buffer.clear();
    write_pdu(buffer, pdu).context(SendPduSnafu)?;
    match tokio::time::timeout(write_timeout, writer.write_all(buffer)).await {
        Ok(result) => result.context(WireSnafu),
        Err(_) => WriteTimeoutSnafu.fail(),
    }
}
