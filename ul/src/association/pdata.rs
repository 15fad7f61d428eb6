use std::{
    collections::VecDeque,
    io::{Cursor, Read, Write},
};

use bytes::{Buf, BytesMut};
use tracing::warn;

use crate::pdu::{read_pdu, Pdu, PDU_HEADER_SIZE};

/// The smallest PDV payload size the writer will use,
/// even if the peer advertised a pathologically small maximum PDU length.
/// Well below the minimum PDU size mandated by the standard,
/// so it can only be reached on non-conforming input.
const MINIMUM_FRAGMENT_SIZE: u32 = 1024;

/// The PDV payload capacity admitted by a peer
/// with the given maximum PDU length, kept even-sized.
///
/// A single PDV item spends 4 bytes on its own length
/// plus 2 on the context ID and message control header.
#[inline]
fn fragment_capacity(max_pdu_length: u32) -> u32 {
    let cap = max_pdu_length.saturating_sub(6).max(MINIMUM_FRAGMENT_SIZE);
    cap & !1
}

/// A writer of one logical stream of P-Data.
///
/// Bytes written through the [standard writer](std::io::Write) interface
/// are sent as successive P-DATA-TF PDUs,
/// split automatically whenever they outgrow
/// the maximum PDU length admitted by the peer.
///
/// # Example
///
/// Obtained from an association through its `send_pdata` method:
///
/// ```no_run
/// # use std::io::Write;
/// # use radlink_ul::association::ClientAssociationOptions;
/// # use radlink_ul::pdu::{Pdu, PDataValue, PDataValueType};
/// # fn command_data() -> Vec<u8> { unimplemented!() }
/// # fn dicom_data() -> &'static [u8] { unimplemented!() }
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut association = ClientAssociationOptions::new()
///    .with_abstract_syntax("1.2.840.10008.1.1")
///    .establish("129.168.0.5:104")?;
///
/// let presentation_context_id = association.association().accepted_contexts().next().unwrap().id();
///
/// // send a command first
/// association.send(&Pdu::PData {
///     data: vec![PDataValue {
///         presentation_context_id,
///         value_type: PDataValueType::Command,
///         is_last: true,
///         data: command_data(),
///     }],
/// });
///
/// // then send a DICOM object which may be split into multiple PDUs
/// let mut pdata = association.send_pdata(presentation_context_id);
/// pdata.write_all(dicom_data())?;
/// pdata.finish()?;
///
/// let pdu_ac = association.receive()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct PDataWriter<W: Write> {
    stream: W,
    presentation_context_id: u8,
    /// PDV payload accumulated for the next PDU
    fragment: Vec<u8>,
    capacity: usize,
    done: bool,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new P-Data value writer.
    ///
    /// `max_pdu_length` is the maximum value of the PDU-length property
    /// admitted by the peer.
    pub(crate) fn new(stream: W, presentation_context_id: u8, max_pdu_length: u32) -> Self {
        let capacity = fragment_capacity(max_pdu_length) as usize;
        PDataWriter {
            stream,
            presentation_context_id,
            fragment: Vec::with_capacity(capacity),
            capacity,
            done: false,
        }
    }

    /// Declare to have finished sending P-Data fragments,
    /// thus emitting the last P-Data fragment PDU.
    ///
    /// This is also done automatically once the P-Data writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.done {
            self.done = true;
            // odd-length payloads take a single padding byte,
            // which is not part of the message data itself
            if self.fragment.len() % 2 == 1 {
                self.fragment.push(0);
            }
            self.emit(true)?;
        }
        Ok(())
    }

    /// Write out the accumulated fragment as a single P-DATA-TF PDU.
    fn emit(&mut self, is_last: bool) -> std::io::Result<()> {
        let pdv_length = self.fragment.len() as u32 + 2;
        let mut head = [0u8; (PDU_HEADER_SIZE + 6) as usize];
        head[0] = 0x04;
        head[2..6].copy_from_slice(&(pdv_length + 4).to_be_bytes());
        head[6..10].copy_from_slice(&pdv_length.to_be_bytes());
        head[10] = self.presentation_context_id;
        head[11] = if is_last { 0x02 } else { 0x00 };

        self.stream.write_all(&head)?;
        self.stream.write_all(&self.fragment)?;
        self.fragment.clear();
        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let room = self.capacity - self.fragment.len();
        if buf.len() < room {
            self.fragment.extend_from_slice(buf);
            Ok(buf.len())
        } else {
            // top up the fragment and send it off,
            // leaving the rest for subsequent writes
            self.fragment.extend_from_slice(&buf[..room]);
            self.emit(false)?;
            Ok(room)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // deferred until `finish`
        Ok(())
    }
}

/// Dropping the writer emits the final fragment PDU
/// in case [`finish`](PDataWriter::finish) was never called.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A reader of one logical stream of P-Data.
///
/// The [standard reader](std::io::Read) interface yields
/// the reassembled bytes of incoming Data messages,
/// pulling further PDUs from the remote node as needed
/// until the fragment marked as last has been consumed.
#[must_use]
pub struct PDataReader<'a, R> {
    /// reassembled message bytes pending consumption
    pending: VecDeque<u8>,
    stream: R,
    /// incoming bytes not yet decoded into a PDU,
    /// shared with the owning association
    read_buffer: &'a mut BytesMut,
    presentation_context_id: Option<u8>,
    max_data_length: u32,
    last_pdu: bool,
}

impl<'a, R> PDataReader<'a, R> {
    pub(crate) fn new(stream: R, read_buffer: &'a mut BytesMut, max_data_length: u32) -> Self {
        PDataReader {
            pending: VecDeque::with_capacity(max_data_length as usize),
            stream,
            read_buffer,
            presentation_context_id: None,
            max_data_length,
            last_pdu: false,
        }
    }

    /// Declare no intention to read more PDUs from the remote node.
    ///
    /// Attempting to read more bytes
    /// will only consume the inner buffer and not result in
    /// more PDUs being received.
    pub fn stop_receiving(&mut self) -> std::io::Result<()> {
        self.last_pdu = true;
        Ok(())
    }
}

impl<R> PDataReader<'_, R>
where
    R: Read,
{
    /// Pull one more P-Data PDU from the stream
    /// and append its PDV payloads to the pending bytes.
    fn fetch_pdu(&mut self) -> std::io::Result<()> {
        let pdu = loop {
            let mut cursor = Cursor::new(&self.read_buffer[..]);
            if let Some(pdu) = read_pdu(&mut cursor, self.max_data_length, false)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
            {
                let consumed = cursor.position() as usize;
                self.read_buffer.advance(consumed);
                break pdu;
            }
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ));
            }
            self.read_buffer.extend_from_slice(&chunk[..n]);
        };

        match pdu {
            Pdu::PData { data } => {
                for pdv in data {
                    match self.presentation_context_id {
                        None => {
                            self.presentation_context_id = Some(pdv.presentation_context_id);
                        }
                        Some(id) if id != pdv.presentation_context_id => {
                            warn!(
                                "received PData value of presentation context {}, expected {}",
                                pdv.presentation_context_id, id
                            );
                        }
                        Some(_) => {}
                    }
                    self.pending.extend(pdv.data);
                    self.last_pdu = pdv.is_last;
                }
                Ok(())
            }
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "unexpected PDU type while reading P-Data",
            )),
        }
    }
}

impl<R> Read for PDataReader<'_, R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.pending.is_empty() {
            if self.last_pdu {
                // reached the end of the P-Data stream
                return Ok(0);
            }
            self.fetch_pdu()?;
        }
        Read::read(&mut self.pending, buf)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};

    use bytes::BytesMut;

    use crate::pdu::{read_pdu, write_pdu, Pdu, MINIMUM_PDU_SIZE, PDU_HEADER_SIZE};
    use crate::pdu::{PDataValue, PDataValueType};

    use super::{PDataReader, PDataWriter};

    fn read_all_pdus(mut bytes: &[u8]) -> Vec<Pdu> {
        let mut out = vec![];
        loop {
            let mut cursor = Cursor::new(bytes);
            match read_pdu(&mut cursor, MINIMUM_PDU_SIZE, true).unwrap() {
                Some(pdu) => {
                    bytes = &bytes[cursor.position() as usize..];
                    out.push(pdu);
                }
                None => break,
            }
        }
        assert!(bytes.is_empty());
        out
    }

    #[test]
    fn writes_single_pdu_when_payload_fits() {
        let context_id = 5;
        let payload: Vec<u8> = (0..64).collect();

        let mut out = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut out, context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(&out);
        assert_eq!(pdus.len(), 1);
        match &pdus[0] {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 1);
                let pdv = &data[0];
                assert_eq!(pdv.value_type, PDataValueType::Data);
                assert_eq!(pdv.presentation_context_id, context_id);
                assert!(pdv.is_last);
                assert_eq!(pdv.data, payload);
            }
            pdu => panic!("expected PData, got {:?}", pdu),
        }
    }

    #[test]
    fn splits_large_payloads_across_pdus() {
        let context_id = 32;
        let payload: Vec<_> = (0..9000).map(|x: u32| x as u8).collect();

        let mut out = Vec::new();
        {
            let mut writer = PDataWriter::new(&mut out, context_id, MINIMUM_PDU_SIZE);
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(&out);
        assert_eq!(pdus.len(), 3);

        let mut reassembled: Vec<u8> = Vec::new();
        for (i, pdu) in pdus.iter().enumerate() {
            match pdu {
                Pdu::PData { data } => {
                    assert_eq!(data.len(), 1);
                    let pdv = &data[0];
                    assert_eq!(pdv.value_type, PDataValueType::Data);
                    assert_eq!(pdv.presentation_context_id, context_id);
                    assert_eq!(pdv.is_last, i == 2);
                    if !pdv.is_last {
                        // intermediate fragments fill the admitted PDU size
                        assert_eq!(pdv.data.len(), (MINIMUM_PDU_SIZE - PDU_HEADER_SIZE) as usize);
                    }
                    reassembled.extend(&pdv.data);
                }
                pdu => panic!("expected PData, got {:?}", pdu),
            }
        }
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn reassembles_payload_spread_over_pdus() {
        let context_id = 32;
        let payload: Vec<_> = (0..9000).map(|x: u32| x as u8).collect();

        let mut pdu_stream = Vec::new();
        for (i, part) in payload.chunks(3000).enumerate() {
            write_pdu(
                &mut pdu_stream,
                &Pdu::PData {
                    data: vec![PDataValue {
                        value_type: PDataValueType::Data,
                        data: part.to_owned(),
                        presentation_context_id: context_id,
                        is_last: i == 2,
                    }],
                },
            )
            .unwrap();
        }

        let mut out = Vec::new();
        {
            let mut read_buffer = BytesMut::new();
            let mut reader = PDataReader::new(
                Cursor::new(&pdu_stream),
                &mut read_buffer,
                MINIMUM_PDU_SIZE,
            );
            reader.read_to_end(&mut out).unwrap();
        }
        assert_eq!(out, payload);
    }

    #[test]
    fn pathological_max_pdu_length_still_makes_progress() {
        let context_id = 1;
        let payload = vec![0x55u8; 4096];

        let mut out = Vec::new();
        {
            // a peer declaring a max PDU length of 16 bytes is non-conforming;
            // the writer falls back to a minimum fragment size
            let mut writer = PDataWriter::new(&mut out, context_id, 16);
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }

        let pdus = read_all_pdus(&out);
        assert!(pdus.len() <= 5, "expected few fragments, got {}", pdus.len());
    }
}
