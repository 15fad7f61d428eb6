//! Typed views over extended negotiation application information.
//!
//! The service class application information of an extended negotiation
//! sub-item is an opaque byte string at the protocol level;
//! its meaning is fixed by the service class of the SOP class
//! it was proposed for (PS3.4).
//! The types in this module decode and encode the fixed-position layouts
//! of the query/retrieve and storage service classes.
//! Every field is optional on the wire:
//! an acceptor may confirm only a prefix of the proposed bytes,
//! so decoding tolerates short input by falling back to defaults.

fn flag_at(data: &[u8], position: usize) -> bool {
    data.get(position - 1).copied().unwrap_or(0) == 1
}

fn byte_at(data: &[u8], position: usize, default: u8) -> u8 {
    data.get(position - 1).copied().unwrap_or(default)
}

/// C-FIND service class application information (PS3.4 C.5.1).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CFindApplicationInfo {
    pub relational_queries: bool,
    pub date_time_matching: bool,
    pub fuzzy_semantic_matching: bool,
    pub timezone_query_adjustment: bool,
    pub enhanced_multi_frame_conversion: bool,
}

impl CFindApplicationInfo {
    pub fn from_bytes(data: &[u8]) -> Self {
        CFindApplicationInfo {
            relational_queries: flag_at(data, 1),
            date_time_matching: flag_at(data, 2),
            fuzzy_semantic_matching: flag_at(data, 3),
            timezone_query_adjustment: flag_at(data, 4),
            enhanced_multi_frame_conversion: flag_at(data, 5),
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        vec![
            self.relational_queries.into(),
            self.date_time_matching.into(),
            self.fuzzy_semantic_matching.into(),
            self.timezone_query_adjustment.into(),
            self.enhanced_multi_frame_conversion.into(),
        ]
    }
}

/// C-GET service class application information (PS3.4 C.5.3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CGetApplicationInfo {
    pub relational_retrieval: bool,
    pub enhanced_multi_frame_conversion: bool,
}

impl CGetApplicationInfo {
    pub fn from_bytes(data: &[u8]) -> Self {
        CGetApplicationInfo {
            relational_retrieval: flag_at(data, 1),
            enhanced_multi_frame_conversion: flag_at(data, 2),
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        vec![
            self.relational_retrieval.into(),
            self.enhanced_multi_frame_conversion.into(),
        ]
    }
}

/// C-MOVE service class application information (PS3.4 C.5.3).
///
/// The layout coincides with the C-GET variant;
/// a separate type keeps call sites honest about the operation
/// the information was proposed for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CMoveApplicationInfo {
    pub relational_retrieval: bool,
    pub enhanced_multi_frame_conversion: bool,
}

impl CMoveApplicationInfo {
    pub fn from_bytes(data: &[u8]) -> Self {
        CMoveApplicationInfo {
            relational_retrieval: flag_at(data, 1),
            enhanced_multi_frame_conversion: flag_at(data, 2),
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        vec![
            self.relational_retrieval.into(),
            self.enhanced_multi_frame_conversion.into(),
        ]
    }
}

/// The level of storage conformance of a C-STORE SCP (PS3.4 B.3.1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelOfSupport {
    Level0,
    Level1,
    Level2,
    NotApplicable,
}

impl LevelOfSupport {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LevelOfSupport::Level0,
            1 => LevelOfSupport::Level1,
            2 => LevelOfSupport::Level2,
            _ => LevelOfSupport::NotApplicable,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LevelOfSupport::Level0 => 0,
            LevelOfSupport::Level1 => 1,
            LevelOfSupport::Level2 => 2,
            LevelOfSupport::NotApplicable => 3,
        }
    }
}

/// The level of digital signature support of a C-STORE SCP (PS3.4 B.3.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LevelOfDigitalSignatureSupport {
    Unspecified,
    Level1,
    Level2,
    Level3,
}

impl LevelOfDigitalSignatureSupport {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LevelOfDigitalSignatureSupport::Level1,
            2 => LevelOfDigitalSignatureSupport::Level2,
            3 => LevelOfDigitalSignatureSupport::Level3,
            _ => LevelOfDigitalSignatureSupport::Unspecified,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            LevelOfDigitalSignatureSupport::Unspecified => 0,
            LevelOfDigitalSignatureSupport::Level1 => 1,
            LevelOfDigitalSignatureSupport::Level2 => 2,
            LevelOfDigitalSignatureSupport::Level3 => 3,
        }
    }
}

/// Whether a C-STORE SCP may coerce data elements (PS3.4 B.3.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementCoercion {
    DoesNotCoerce,
    MayCoerce,
    NotApplicable,
}

impl ElementCoercion {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ElementCoercion::DoesNotCoerce,
            1 => ElementCoercion::MayCoerce,
            _ => ElementCoercion::NotApplicable,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            ElementCoercion::DoesNotCoerce => 0,
            ElementCoercion::MayCoerce => 1,
            ElementCoercion::NotApplicable => 2,
        }
    }
}

/// C-STORE service class application information (PS3.4 B.3.1).
///
/// Bytes 2 and 4 of the layout are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CStoreApplicationInfo {
    pub level_of_support: LevelOfSupport,
    pub level_of_digital_signature_support: LevelOfDigitalSignatureSupport,
    pub element_coercion: ElementCoercion,
}

impl Default for CStoreApplicationInfo {
    fn default() -> Self {
        CStoreApplicationInfo {
            level_of_support: LevelOfSupport::NotApplicable,
            level_of_digital_signature_support: LevelOfDigitalSignatureSupport::Unspecified,
            element_coercion: ElementCoercion::NotApplicable,
        }
    }
}

impl CStoreApplicationInfo {
    pub fn from_bytes(data: &[u8]) -> Self {
        CStoreApplicationInfo {
            level_of_support: LevelOfSupport::from_u8(byte_at(data, 1, 3)),
            level_of_digital_signature_support: LevelOfDigitalSignatureSupport::from_u8(byte_at(
                data, 3, 0,
            )),
            element_coercion: ElementCoercion::from_u8(byte_at(data, 5, 2)),
        }
    }

    pub fn to_bytes(self) -> Vec<u8> {
        vec![
            self.level_of_support.to_u8(),
            0,
            self.level_of_digital_signature_support.to_u8(),
            0,
            self.element_coercion.to_u8(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_find_info_round_trip() {
        let info = CFindApplicationInfo {
            relational_queries: true,
            date_time_matching: true,
            fuzzy_semantic_matching: false,
            timezone_query_adjustment: true,
            enhanced_multi_frame_conversion: false,
        };
        assert_eq!(info.to_bytes(), vec![1, 1, 0, 1, 0]);
        assert_eq!(CFindApplicationInfo::from_bytes(&info.to_bytes()), info);
    }

    #[test]
    fn short_info_falls_back_to_defaults() {
        // the acceptor confirmed only the first byte
        let info = CFindApplicationInfo::from_bytes(&[1]);
        assert!(info.relational_queries);
        assert!(!info.date_time_matching);
        assert!(!info.enhanced_multi_frame_conversion);
    }

    #[test]
    fn c_store_info_round_trip() {
        let info = CStoreApplicationInfo {
            level_of_support: LevelOfSupport::Level2,
            level_of_digital_signature_support: LevelOfDigitalSignatureSupport::Level1,
            element_coercion: ElementCoercion::DoesNotCoerce,
        };
        assert_eq!(info.to_bytes(), vec![2, 0, 1, 0, 0]);
        assert_eq!(CStoreApplicationInfo::from_bytes(&info.to_bytes()), info);
        assert_eq!(
            CStoreApplicationInfo::from_bytes(&[]),
            CStoreApplicationInfo::default()
        );
    }
}
