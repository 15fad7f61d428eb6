//! DIMSE message framing and reassembly.
//!
//! The send path splits an encoded command set
//! and its optional data set
//! into presentation data values (PDVs)
//! bounded by the maximum PDU length negotiated with the peer.
//! The receive path collects incoming PDV fragments
//! per presentation context
//! until a complete [`Message`](crate::message::Message) can be yielded.
use std::collections::HashMap;
use std::io::Write;

use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_object::{InMemDicomObject, ReadError};
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use snafu::{ensure, OptionExt, ResultExt, Snafu};

use radlink_ul::association::Association;
use radlink_ul::pdu::{PDataValue, PDataValueType, Pdu, MAXIMUM_PDU_SIZE, PDU_HEADER_SIZE};

use crate::command::CommandSet;
use crate::message::{Message, MessageDataset};

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("PDV received on unknown presentation context {}", id))]
    UnknownPresentationContext { id: u8 },

    #[snafu(display(
        "command fragment received on context {} while a message is still being reassembled",
        id
    ))]
    InterleavedCommand { id: u8 },

    #[snafu(display("data fragment received on context {} with no preceding command", id))]
    StrayDataFragment { id: u8 },

    /// could not decode the reassembled command set
    #[snafu(display("could not decode command set: {}", source))]
    DecodeCommand { source: crate::command::Error },

    /// could not decode the reassembled data set
    #[snafu(display("could not decode data set: {}", source))]
    DecodeDataset { source: ReadError },

    #[snafu(display("transfer syntax {} is not supported", uid))]
    UnsupportedTransferSyntax { uid: String },

    /// failed to write reassembled bytes to the data set sink
    SinkWrite { source: std::io::Error },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The fixed PDV overhead within a P-DATA-TF PDU:
/// 4-byte item length, 1-byte presentation context id,
/// 1-byte message control header.
pub const PDV_HEADER_SIZE: u32 = 6;

/// The smallest PDV payload the framer will emit,
/// applied when the negotiated maximum PDU length
/// is too small to make progress.
/// Well below the minimum PDU size mandated by the standard,
/// so it is only reached on non-conforming input.
const MINIMUM_FRAGMENT_SIZE: u32 = 1024;

/// The largest PDV payload admitted by one PDU
/// of the given maximum on-wire length.
fn max_fragment_size(max_pdu_length: u32) -> usize {
    let size = max_pdu_length
        .saturating_sub(PDU_HEADER_SIZE + PDV_HEADER_SIZE)
        .max(MINIMUM_FRAGMENT_SIZE);
    // fragments are kept even so that only the final one may need padding
    (size & !1) as usize
}

/// Bound a peer-advertised maximum PDU length
/// by what the codec can actually read back.
fn effective_max_pdu_length(max_pdu_length: u32) -> u32 {
    max_pdu_length.min(MAXIMUM_PDU_SIZE)
}

/// Append `payload` to `pdus` as a sequence of single-PDV P-DATA-TF PDUs
/// of at most `fragment_size` bytes each.
///
/// The final fragment is marked as last
/// and padded to an even number of bytes.
fn split_into_pdvs(
    pdus: &mut Vec<Pdu>,
    presentation_context_id: u8,
    value_type: PDataValueType,
    payload: &[u8],
    fragment_size: usize,
) {
    if payload.is_empty() {
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last: true,
                data: Vec::new(),
            }],
        });
        return;
    }

    let mut chunks = payload.chunks(fragment_size).peekable();
    while let Some(chunk) = chunks.next() {
        let is_last = chunks.peek().is_none();
        let mut data = chunk.to_vec();
        if is_last && data.len() % 2 == 1 {
            // PDU-level padding only, never part of the message itself
            data.push(0);
        }
        pdus.push(Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id,
                value_type,
                is_last,
                data,
            }],
        });
    }
}

/// Split an encoded command set and its optional data set
/// into P-DATA-TF PDUs bounded by `max_pdu_length`.
///
/// When both streams fit into a single PDU,
/// they are coalesced into one P-DATA-TF with two PDVs.
pub fn fragment(
    presentation_context_id: u8,
    command: &[u8],
    dataset: Option<&[u8]>,
    max_pdu_length: u32,
) -> Vec<Pdu> {
    let max_pdu_length = effective_max_pdu_length(max_pdu_length);
    let fragment_size = max_fragment_size(max_pdu_length);

    if let Some(data) = dataset {
        let command_padded = command.len() + (command.len() & 1);
        let data_padded = data.len() + (data.len() & 1);
        let coalesced = command_padded
            + data_padded
            + 2 * PDV_HEADER_SIZE as usize
            + PDU_HEADER_SIZE as usize;
        if coalesced <= max_pdu_length as usize {
            let mut command_value = command.to_vec();
            if command_value.len() % 2 == 1 {
                command_value.push(0);
            }
            let mut data_value = data.to_vec();
            if data_value.len() % 2 == 1 {
                data_value.push(0);
            }
            return vec![Pdu::PData {
                data: vec![
                    PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Command,
                        is_last: true,
                        data: command_value,
                    },
                    PDataValue {
                        presentation_context_id,
                        value_type: PDataValueType::Data,
                        is_last: true,
                        data: data_value,
                    },
                ],
            }];
        }
    }

    let mut pdus = Vec::new();
    split_into_pdvs(
        &mut pdus,
        presentation_context_id,
        PDataValueType::Command,
        command,
        fragment_size,
    );
    if let Some(data) = dataset {
        split_into_pdvs(
            &mut pdus,
            presentation_context_id,
            PDataValueType::Data,
            data,
            fragment_size,
        );
    }
    pdus
}

/// The outcome of pushing one PDV into the [`Reassembler`].
#[derive(Debug)]
pub enum PushOutcome {
    /// More fragments are needed before a message can be produced.
    Incomplete,
    /// The command stream completed and declared a data set,
    /// which is expected to follow on the same context.
    ///
    /// At this point a data set sink may be installed
    /// through [`Reassembler::divert`]
    /// to stream the incoming bytes instead of buffering them.
    CommandComplete { presentation_context_id: u8 },
    /// A complete DIMSE message was reassembled.
    Message(Message),
}

#[derive(Default)]
struct Progress {
    command_buffer: Vec<u8>,
    command: Option<CommandSet>,
    data_buffer: Vec<u8>,
    sink: Option<Box<dyn Write + Send>>,
    bytes_diverted: u64,
}

/// Reassembles incoming PDV streams into complete DIMSE messages.
///
/// The reassembler keeps at most one in-progress command buffer
/// and one in-progress data buffer per presentation context,
/// since the protocol never interleaves two messages
/// on the same context before the first is complete.
pub struct Reassembler {
    /// accepted transfer syntax per presentation context id
    transfer_syntaxes: HashMap<u8, String>,
    in_progress: HashMap<u8, Progress>,
}

impl Reassembler {
    /// Create a reassembler for the given accepted presentation contexts.
    pub fn new<I>(accepted_contexts: I) -> Self
    where
        I: IntoIterator<Item = (u8, String)>,
    {
        Reassembler {
            transfer_syntaxes: accepted_contexts.into_iter().collect(),
            in_progress: HashMap::new(),
        }
    }

    /// Create a reassembler covering the accepted contexts
    /// of a negotiated association.
    pub fn for_association(association: &Association) -> Self {
        Reassembler::new(association.accepted_contexts().map(|pc| {
            (
                pc.id(),
                pc.accepted_transfer_syntax().unwrap_or_default().to_string(),
            )
        }))
    }

    /// The command set reassembled so far on the given context,
    /// available between the completion of the command stream
    /// and the completion of its data stream.
    pub fn command_for(&self, presentation_context_id: u8) -> Option<&CommandSet> {
        self.in_progress
            .get(&presentation_context_id)
            .and_then(|p| p.command.as_ref())
    }

    /// Divert the remaining data set bytes of the given context
    /// into a caller-provided sink,
    /// bounding memory use for large incoming transfers.
    ///
    /// Bytes already buffered are moved to the sink first.
    pub fn divert(
        &mut self,
        presentation_context_id: u8,
        mut sink: Box<dyn Write + Send>,
    ) -> Result<()> {
        if let Some(progress) = self.in_progress.get_mut(&presentation_context_id) {
            if !progress.data_buffer.is_empty() {
                sink.write_all(&progress.data_buffer).context(SinkWriteSnafu)?;
                progress.bytes_diverted += progress.data_buffer.len() as u64;
                progress.data_buffer.clear();
            }
            progress.sink = Some(sink);
        }
        Ok(())
    }

    /// Push one incoming PDV into the reassembler.
    pub fn push(&mut self, pdv: PDataValue) -> Result<PushOutcome> {
        let id = pdv.presentation_context_id;
        let transfer_syntax = self
            .transfer_syntaxes
            .get(&id)
            .context(UnknownPresentationContextSnafu { id })?
            .clone();

        let progress = self.in_progress.entry(id).or_default();

        match pdv.value_type {
            PDataValueType::Command => {
                ensure!(progress.command.is_none(), InterleavedCommandSnafu { id });
                progress.command_buffer.extend_from_slice(&pdv.data);
                if !pdv.is_last {
                    return Ok(PushOutcome::Incomplete);
                }

                let command =
                    CommandSet::decode(&progress.command_buffer).context(DecodeCommandSnafu)?;
                progress.command_buffer.clear();

                if command.has_dataset() {
                    progress.command = Some(command);
                    Ok(PushOutcome::CommandComplete {
                        presentation_context_id: id,
                    })
                } else {
                    self.in_progress.remove(&id);
                    Ok(PushOutcome::Message(Message {
                        presentation_context_id: id,
                        command,
                        dataset: MessageDataset::Absent,
                    }))
                }
            }
            PDataValueType::Data => {
                ensure!(progress.command.is_some(), StrayDataFragmentSnafu { id });

                match &mut progress.sink {
                    Some(sink) => {
                        sink.write_all(&pdv.data).context(SinkWriteSnafu)?;
                        progress.bytes_diverted += pdv.data.len() as u64;
                    }
                    None => progress.data_buffer.extend_from_slice(&pdv.data),
                }
                if !pdv.is_last {
                    return Ok(PushOutcome::Incomplete);
                }

                let mut progress = self
                    .in_progress
                    .remove(&id)
                    .unwrap_or_default();
                let command = progress
                    .command
                    .take()
                    .context(StrayDataFragmentSnafu { id })?;

                let dataset = match progress.sink.take() {
                    Some(mut sink) => {
                        sink.flush().context(SinkWriteSnafu)?;
                        MessageDataset::Diverted {
                            bytes_written: progress.bytes_diverted,
                        }
                    }
                    None => {
                        let ts = TransferSyntaxRegistry
                            .get(&transfer_syntax)
                            .context(UnsupportedTransferSyntaxSnafu {
                                uid: transfer_syntax.clone(),
                            })?;
                        let obj =
                            InMemDicomObject::read_dataset_with_ts(&progress.data_buffer[..], ts)
                                .context(DecodeDatasetSnafu)?;
                        MessageDataset::Object(obj)
                    }
                };

                Ok(PushOutcome::Message(Message {
                    presentation_context_id: id,
                    command,
                    dataset,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;
    use dicom_object::InMemDicomObject;
    use dicom_transfer_syntax_registry::entries;

    use crate::command::{CommandSet, Priority};

    use super::*;

    const IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
    const MR_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";

    fn reassembler() -> Reassembler {
        Reassembler::new([(1, IMPLICIT_VR_LE.to_string())])
    }

    fn sample_dataset() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "123456")),
        ])
    }

    fn encode_dataset(obj: &InMemDicomObject) -> Vec<u8> {
        let mut out = Vec::new();
        obj.write_dataset_with_ts(&mut out, &entries::IMPLICIT_VR_LITTLE_ENDIAN.erased())
            .unwrap();
        out
    }

    fn pdvs(pdus: Vec<Pdu>) -> impl Iterator<Item = PDataValue> {
        pdus.into_iter().flat_map(|pdu| match pdu {
            Pdu::PData { data } => data,
            pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
        })
    }

    #[test]
    fn command_only_round_trip() {
        let command = CommandSet::c_echo_rq(5);
        let pdus = fragment(1, &command.encode().unwrap(), None, 16_384);
        assert_eq!(pdus.len(), 1);

        let mut reassembler = reassembler();
        let mut messages = Vec::new();
        for pdv in pdvs(pdus) {
            if let PushOutcome::Message(msg) = reassembler.push(pdv).unwrap() {
                messages.push(msg);
            }
        }
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].command, command);
        assert!(matches!(messages[0].dataset, MessageDataset::Absent));
    }

    #[test]
    fn command_and_dataset_coalesce_into_one_pdu() {
        let command = CommandSet::c_store_rq(1, MR_STORAGE, "1.2.3.4", Priority::Medium);
        let dataset = sample_dataset();
        let pdus = fragment(
            1,
            &command.encode().unwrap(),
            Some(&encode_dataset(&dataset)),
            16_384,
        );
        assert_eq!(pdus.len(), 1);
        match &pdus[0] {
            Pdu::PData { data } => {
                assert_eq!(data.len(), 2);
                assert_eq!(data[0].value_type, PDataValueType::Command);
                assert!(data[0].is_last);
                assert_eq!(data[1].value_type, PDataValueType::Data);
                assert!(data[1].is_last);
            }
            pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
        }
    }

    #[test]
    fn fragmentation_reassembly_is_idempotent() {
        let command = CommandSet::c_store_rq(9, MR_STORAGE, "1.2.3.4.5", Priority::High);
        let dataset = sample_dataset();
        let dataset_bytes = encode_dataset(&dataset);

        for max_pdu_length in [4_096u32, 16_384, 131_072] {
            let pdus = fragment(
                1,
                &command.encode().unwrap(),
                Some(&dataset_bytes),
                max_pdu_length,
            );

            let mut reassembler = reassembler();
            let mut message = None;
            for pdv in pdvs(pdus) {
                if let PushOutcome::Message(msg) = reassembler.push(pdv).unwrap() {
                    message = Some(msg);
                }
            }
            let message = message.expect("a complete message");
            assert_eq!(message.command, command);
            assert_eq!(message.dataset(), Some(&dataset));
        }
    }

    #[test]
    fn large_dataset_is_split_and_reassembled() {
        // pixel-data-sized payload forced through small PDUs
        let payload = vec![0x42u8; 40_000];
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            dicom_core::PrimitiveValue::from(payload.clone()),
        )]);
        let command = CommandSet::c_store_rq(2, MR_STORAGE, "1.2.3.4", Priority::Medium);
        let dataset_bytes = encode_dataset(&dataset);

        let pdus = fragment(1, &command.encode().unwrap(), Some(&dataset_bytes), 4_096);
        assert!(pdus.len() > 2, "expected several fragments, got {}", pdus.len());
        for pdu in &pdus {
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        assert!(pdv.data.len() % 2 == 0);
                        assert!(pdv.data.len() + 12 <= 4_096);
                    }
                }
                pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
            }
        }

        let mut reassembler = reassembler();
        let mut message = None;
        for pdv in pdvs(pdus) {
            if let PushOutcome::Message(msg) = reassembler.push(pdv).unwrap() {
                message = Some(msg);
            }
        }
        let message = message.expect("a complete message");
        let received = message
            .dataset()
            .unwrap()
            .element(tags::PIXEL_DATA)
            .unwrap()
            .to_bytes()
            .unwrap();
        assert_eq!(received.as_ref(), &payload[..]);
    }

    #[test]
    fn peer_max_pdu_length_drives_fragment_count() {
        let command = CommandSet::c_store_rq(3, MR_STORAGE, "1.2.3.4", Priority::Medium);
        let command_bytes = command.encode().unwrap();
        let payload = vec![0x11u8; 100_000];

        // a server-advertised limit of 400 000 admits the whole message at once
        let pdus = fragment(1, &command_bytes, Some(&payload), 400_000);
        assert_eq!(pdus.len(), 1);

        // the default limit forces many fragments
        let pdus = fragment(1, &command_bytes, Some(&payload), 16_384);
        assert!(pdus.len() > 5);

        // an advertised limit beyond what the codec can read back
        // never yields a PDU larger than the absolute maximum
        let pdus = fragment(1, &command_bytes, Some(&vec![0x22u8; 500_000]), 4_000_000);
        for pdu in &pdus {
            match pdu {
                Pdu::PData { data } => {
                    for pdv in data {
                        assert!(pdv.data.len() + 12 <= MAXIMUM_PDU_SIZE as usize);
                    }
                }
                pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
            }
        }
    }

    #[test]
    fn pathological_max_pdu_length_still_makes_progress() {
        let command_bytes = CommandSet::c_echo_rq(1).encode().unwrap();
        let pdus = fragment(1, &command_bytes, Some(&vec![0u8; 4096]), 16);
        // the minimum fragment floor bounds the number of fragments
        assert!(pdus.len() <= 6, "got {} fragments", pdus.len());
    }

    #[test]
    fn odd_payload_is_padded_to_even_length() {
        let pdus = fragment(1, &[1, 2, 3], None, 4_096);
        match &pdus[0] {
            Pdu::PData { data } => {
                assert_eq!(data[0].data, vec![1, 2, 3, 0]);
            }
            pdu => panic!("expected P-DATA-TF, got {:?}", pdu),
        }
    }

    #[test]
    fn unknown_context_is_rejected() {
        let mut reassembler = reassembler();
        let err = reassembler
            .push(PDataValue {
                presentation_context_id: 99,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPresentationContext { id: 99 }));
    }

    #[test]
    fn data_before_command_is_rejected() {
        let mut reassembler = reassembler();
        let err = reassembler
            .push(PDataValue {
                presentation_context_id: 1,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![0; 4],
            })
            .unwrap_err();
        assert!(matches!(err, Error::StrayDataFragment { id: 1 }));
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn diverted_dataset_streams_into_sink() {
        let command = CommandSet::c_store_rq(7, MR_STORAGE, "1.2.3.4", Priority::Medium);
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PIXEL_DATA,
            VR::OB,
            dicom_core::PrimitiveValue::from(vec![0x33u8; 3000]),
        )]);
        let dataset_bytes = encode_dataset(&dataset);
        // a tiny limit falls back to the minimum fragment size,
        // so the data set spans several PDVs
        let pdus = fragment(1, &command.encode().unwrap(), Some(&dataset_bytes), 16);
        assert!(pdus.len() > 3);

        let sink = SharedSink::default();
        let mut reassembler = reassembler();
        let mut message = None;
        for pdv in pdvs(pdus) {
            match reassembler.push(pdv).unwrap() {
                PushOutcome::CommandComplete {
                    presentation_context_id,
                } => {
                    reassembler
                        .divert(presentation_context_id, Box::new(sink.clone()))
                        .unwrap();
                }
                PushOutcome::Message(msg) => message = Some(msg),
                PushOutcome::Incomplete => {}
            }
        }

        let message = message.expect("a complete message");
        match message.dataset {
            MessageDataset::Diverted { bytes_written } => {
                assert_eq!(bytes_written, dataset_bytes.len() as u64);
            }
            other => panic!("expected diverted dataset, got {:?}", other),
        }
        assert_eq!(*sink.0.lock().unwrap(), dataset_bytes);
    }
}
