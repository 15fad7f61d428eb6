//! Complete DIMSE messages.
use dicom_object::InMemDicomObject;

use crate::command::CommandSet;

/// The data set portion of a DIMSE message.
#[derive(Debug)]
pub enum MessageDataset {
    /// The command carries no data set.
    Absent,
    /// The data set, decoded in memory.
    Object(InMemDicomObject),
    /// The data set bytes were diverted into a caller-provided sink
    /// as they were reassembled,
    /// to bound memory use for large transfers.
    Diverted { bytes_written: u64 },
}

/// A complete DIMSE message:
/// a command set and an optional data set,
/// tagged with the presentation context it is exchanged on.
#[derive(Debug)]
pub struct Message {
    /// the identifier of the presentation context
    /// this message was (or is to be) exchanged on
    pub presentation_context_id: u8,
    /// the command set
    pub command: CommandSet,
    /// the data set, if the command declares one
    pub dataset: MessageDataset,
}

impl Message {
    /// Create a message with no data set,
    /// fixing the command's Data Set Type accordingly.
    pub fn command_only(presentation_context_id: u8, mut command: CommandSet) -> Self {
        command.set_has_dataset(false);
        Message {
            presentation_context_id,
            command,
            dataset: MessageDataset::Absent,
        }
    }

    /// Create a message carrying a data set,
    /// fixing the command's Data Set Type accordingly.
    pub fn with_dataset(
        presentation_context_id: u8,
        mut command: CommandSet,
        dataset: InMemDicomObject,
    ) -> Self {
        command.set_has_dataset(true);
        Message {
            presentation_context_id,
            command,
            dataset: MessageDataset::Object(dataset),
        }
    }

    /// The decoded data set, when one is present in memory.
    pub fn dataset(&self) -> Option<&InMemDicomObject> {
        match &self.dataset {
            MessageDataset::Object(obj) => Some(obj),
            _ => None,
        }
    }
}
