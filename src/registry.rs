//! UID registry module.
//!
//! The registry is an explicitly constructed lookup table
//! mapping UID strings to their descriptors.
//! It is built once, never mutated afterwards,
//! and shared by reference (typically behind an [`Arc`](std::sync::Arc))
//! among the components that need to classify UIDs,
//! such as the presentation context negotiator.
//!
//! Looking up an unrecognized UID never fails:
//! a descriptor of kind [`UidKind::Unknown`] is synthesized instead,
//! so callers decide for themselves whether unknown means unacceptable.
use std::borrow::Cow;
use std::collections::HashMap;

/// Verification SOP Class (C-ECHO)
pub const VERIFICATION: &str = "1.2.840.10008.1.1";
/// Transfer Syntax: Implicit VR Little Endian
pub const IMPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2";
/// Transfer Syntax: Explicit VR Little Endian
pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
/// Transfer Syntax: Deflated Explicit VR Little Endian
pub const DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1.99";
/// Transfer Syntax: Explicit VR Big Endian (retired)
pub const EXPLICIT_VR_BIG_ENDIAN: &str = "1.2.840.10008.1.2.2";
/// Transfer Syntax: JPEG Baseline (Process 1)
pub const JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
/// Transfer Syntax: JPEG 2000 Image Compression
pub const JPEG_2000: &str = "1.2.840.10008.1.2.4.91";
/// Transfer Syntax: RLE Lossless
pub const RLE_LOSSLESS: &str = "1.2.840.10008.1.2.5";
/// Application Context Name: DICOM Application Context
pub const DICOM_APPLICATION_CONTEXT: &str = "1.2.840.10008.3.1.1.1";
/// SOP Class: Modality Worklist Information Model - FIND
pub const MODALITY_WORKLIST_FIND: &str = "1.2.840.10008.5.1.4.31";
/// SOP Class: Patient Root Query/Retrieve Information Model - FIND
pub const PATIENT_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.1.1";
/// SOP Class: Patient Root Query/Retrieve Information Model - MOVE
pub const PATIENT_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.1.2";
/// SOP Class: Patient Root Query/Retrieve Information Model - GET
pub const PATIENT_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.1.3";
/// SOP Class: Study Root Query/Retrieve Information Model - FIND
pub const STUDY_ROOT_QR_FIND: &str = "1.2.840.10008.5.1.4.1.2.2.1";
/// SOP Class: Study Root Query/Retrieve Information Model - MOVE
pub const STUDY_ROOT_QR_MOVE: &str = "1.2.840.10008.5.1.4.1.2.2.2";
/// SOP Class: Study Root Query/Retrieve Information Model - GET
pub const STUDY_ROOT_QR_GET: &str = "1.2.840.10008.5.1.4.1.2.2.3";
/// SOP Class: Computed Radiography Image Storage
pub const CR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.1";
/// SOP Class: CT Image Storage
pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
/// SOP Class: Ultrasound Image Storage
pub const US_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.6.1";
/// SOP Class: Magnetic Resonance Image Storage
pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
/// SOP Class: Secondary Capture Image Storage
pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
/// SOP Class: Digital X-Ray Image Storage - For Presentation
pub const DX_IMAGE_STORAGE_FOR_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.1";
/// SOP Class: Encapsulated PDF Storage
pub const ENCAPSULATED_PDF_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.104.1";
/// SOP Class: Basic Grayscale Print Management Meta SOP Class
pub const BASIC_GRAYSCALE_PRINT_MANAGEMENT_META: &str = "1.2.840.10008.5.1.1.9";
/// SOP Class: Printer
pub const PRINTER: &str = "1.2.840.10008.5.1.1.16";
/// Well-known SOP Instance: Printer SOP Instance
pub const PRINTER_INSTANCE: &str = "1.2.840.10008.5.1.1.17";
/// SOP Class: Storage Commitment Push Model
pub const STORAGE_COMMITMENT_PUSH_MODEL: &str = "1.2.840.10008.1.20.1";

/// The category of entity a UID identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum UidKind {
    TransferSyntax,
    SopClass,
    MetaSopClass,
    WellKnownSopInstance,
    ApplicationContextName,
    /// not present in the registry
    Unknown,
}

/// A description of a single UID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidDescriptor {
    uid: Cow<'static, str>,
    name: Cow<'static, str>,
    kind: UidKind,
    retired: bool,
}

impl UidDescriptor {
    /// The UID value proper.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// The keyword name of the UID.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The category of the identified entity.
    pub fn kind(&self) -> UidKind {
        self.kind
    }

    /// Whether the UID is retired from the standard.
    pub fn is_retired(&self) -> bool {
        self.retired
    }
}

/// An immutable table of UID descriptors.
///
/// Equality of entries is defined by UID string value alone,
/// so two descriptors for the same UID string refer to the same entity.
#[derive(Debug, Clone, Default)]
pub struct UidRegistry {
    entries: HashMap<&'static str, UidDescriptor>,
}

impl UidRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        UidRegistry::default()
    }

    /// Create a registry populated with the standard entries
    /// relevant to association negotiation and the DIMSE services:
    /// the common transfer syntaxes, the verification SOP class,
    /// the query/retrieve information models,
    /// a set of storage SOP classes,
    /// and the DICOM application context name.
    pub fn new_with_standard_entries() -> Self {
        let mut registry = UidRegistry::new();

        registry.put(
            IMPLICIT_VR_LITTLE_ENDIAN,
            "ImplicitVRLittleEndian",
            UidKind::TransferSyntax,
            false,
        );
        registry.put(
            EXPLICIT_VR_LITTLE_ENDIAN,
            "ExplicitVRLittleEndian",
            UidKind::TransferSyntax,
            false,
        );
        registry.put(
            DEFLATED_EXPLICIT_VR_LITTLE_ENDIAN,
            "DeflatedExplicitVRLittleEndian",
            UidKind::TransferSyntax,
            false,
        );
        registry.put(
            EXPLICIT_VR_BIG_ENDIAN,
            "ExplicitVRBigEndian",
            UidKind::TransferSyntax,
            true,
        );
        registry.put(
            JPEG_BASELINE,
            "JPEGBaseline8Bit",
            UidKind::TransferSyntax,
            false,
        );
        registry.put(JPEG_2000, "JPEG2000", UidKind::TransferSyntax, false);
        registry.put(RLE_LOSSLESS, "RLELossless", UidKind::TransferSyntax, false);

        registry.put(VERIFICATION, "Verification", UidKind::SopClass, false);

        registry.put(
            DICOM_APPLICATION_CONTEXT,
            "DICOMApplicationContext",
            UidKind::ApplicationContextName,
            false,
        );

        registry.put(
            MODALITY_WORKLIST_FIND,
            "ModalityWorklistInformationModelFind",
            UidKind::SopClass,
            false,
        );
        registry.put(
            PATIENT_ROOT_QR_FIND,
            "PatientRootQueryRetrieveInformationModelFind",
            UidKind::SopClass,
            false,
        );
        registry.put(
            PATIENT_ROOT_QR_MOVE,
            "PatientRootQueryRetrieveInformationModelMove",
            UidKind::SopClass,
            false,
        );
        registry.put(
            PATIENT_ROOT_QR_GET,
            "PatientRootQueryRetrieveInformationModelGet",
            UidKind::SopClass,
            false,
        );
        registry.put(
            STUDY_ROOT_QR_FIND,
            "StudyRootQueryRetrieveInformationModelFind",
            UidKind::SopClass,
            false,
        );
        registry.put(
            STUDY_ROOT_QR_MOVE,
            "StudyRootQueryRetrieveInformationModelMove",
            UidKind::SopClass,
            false,
        );
        registry.put(
            STUDY_ROOT_QR_GET,
            "StudyRootQueryRetrieveInformationModelGet",
            UidKind::SopClass,
            false,
        );

        registry.put(
            CR_IMAGE_STORAGE,
            "ComputedRadiographyImageStorage",
            UidKind::SopClass,
            false,
        );
        registry.put(CT_IMAGE_STORAGE, "CTImageStorage", UidKind::SopClass, false);
        registry.put(MR_IMAGE_STORAGE, "MRImageStorage", UidKind::SopClass, false);
        registry.put(
            US_IMAGE_STORAGE,
            "UltrasoundImageStorage",
            UidKind::SopClass,
            false,
        );
        registry.put(
            SECONDARY_CAPTURE_IMAGE_STORAGE,
            "SecondaryCaptureImageStorage",
            UidKind::SopClass,
            false,
        );
        registry.put(
            DX_IMAGE_STORAGE_FOR_PRESENTATION,
            "DigitalXRayImageStorageForPresentation",
            UidKind::SopClass,
            false,
        );
        registry.put(
            ENCAPSULATED_PDF_STORAGE,
            "EncapsulatedPDFStorage",
            UidKind::SopClass,
            false,
        );

        registry.put(
            STORAGE_COMMITMENT_PUSH_MODEL,
            "StorageCommitmentPushModel",
            UidKind::SopClass,
            false,
        );
        registry.put(
            BASIC_GRAYSCALE_PRINT_MANAGEMENT_META,
            "BasicGrayscalePrintManagementMeta",
            UidKind::MetaSopClass,
            false,
        );
        registry.put(PRINTER, "Printer", UidKind::SopClass, false);
        registry.put(
            PRINTER_INSTANCE,
            "PrinterInstance",
            UidKind::WellKnownSopInstance,
            false,
        );

        registry
    }

    fn put(&mut self, uid: &'static str, name: &'static str, kind: UidKind, retired: bool) {
        self.entries.insert(
            uid,
            UidDescriptor {
                uid: Cow::Borrowed(uid),
                name: Cow::Borrowed(name),
                kind,
                retired,
            },
        );
    }

    /// Look up a UID, synthesizing a descriptor of kind `Unknown`
    /// if the table has no entry for it.
    /// Malformed UID strings are not rejected,
    /// they simply come out as `Unknown`.
    pub fn lookup(&self, uid: &str) -> UidDescriptor {
        let trimmed = uid.trim_end_matches(|c: char| c == '\0' || c == ' ');
        match self.entries.get(trimmed) {
            Some(descriptor) => descriptor.clone(),
            None => UidDescriptor {
                uid: Cow::Owned(trimmed.to_string()),
                name: Cow::Borrowed("Unknown"),
                kind: UidKind::Unknown,
                retired: false,
            },
        }
    }

    /// Whether the given UID names a known, non-retired transfer syntax.
    pub fn is_supported_transfer_syntax(&self, uid: &str) -> bool {
        let descriptor = self.lookup(uid);
        descriptor.kind() == UidKind::TransferSyntax && !descriptor.is_retired()
    }

    /// The number of entries in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Check a string against the UID encoding rules:
/// only digits and dots, no empty components,
/// no leading zeros in multi-digit components,
/// and no more than 64 characters in total.
pub fn is_valid_uid_format(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.').all(|component| {
        !component.is_empty()
            && component.bytes().all(|b| b.is_ascii_digit())
            && (component.len() == 1 || !component.starts_with('0'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_standard_entries() {
        let registry = UidRegistry::new_with_standard_entries();

        let descriptor = registry.lookup(VERIFICATION);
        assert_eq!(descriptor.uid(), "1.2.840.10008.1.1");
        assert_eq!(descriptor.name(), "Verification");
        assert_eq!(descriptor.kind(), UidKind::SopClass);
        assert!(!descriptor.is_retired());

        let descriptor = registry.lookup(EXPLICIT_VR_BIG_ENDIAN);
        assert_eq!(descriptor.kind(), UidKind::TransferSyntax);
        assert!(descriptor.is_retired());
    }

    #[test]
    fn lookup_synthesizes_unknown_descriptors() {
        let registry = UidRegistry::new_with_standard_entries();

        let descriptor = registry.lookup("1.2.3.4.5");
        assert_eq!(descriptor.uid(), "1.2.3.4.5");
        assert_eq!(descriptor.kind(), UidKind::Unknown);

        // malformed strings are tolerated
        let descriptor = registry.lookup("not-a-uid");
        assert_eq!(descriptor.kind(), UidKind::Unknown);
    }

    #[test]
    fn lookup_ignores_trailing_padding() {
        let registry = UidRegistry::new_with_standard_entries();

        let descriptor = registry.lookup("1.2.840.10008.1.1\0");
        assert_eq!(descriptor.kind(), UidKind::SopClass);
    }

    #[test]
    fn transfer_syntax_support() {
        let registry = UidRegistry::new_with_standard_entries();

        assert!(registry.is_supported_transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN));
        assert!(registry.is_supported_transfer_syntax(EXPLICIT_VR_LITTLE_ENDIAN));
        // retired
        assert!(!registry.is_supported_transfer_syntax(EXPLICIT_VR_BIG_ENDIAN));
        // not a transfer syntax
        assert!(!registry.is_supported_transfer_syntax(VERIFICATION));
    }

    #[test]
    fn uid_format_validation() {
        assert!(is_valid_uid_format("1.2.840.10008.1.1"));
        assert!(is_valid_uid_format("0.1"));
        assert!(!is_valid_uid_format(""));
        assert!(!is_valid_uid_format("1..2"));
        assert!(!is_valid_uid_format("1.2."));
        assert!(!is_valid_uid_format("1.02"));
        assert!(!is_valid_uid_format("1.2a.3"));
        let too_long = "1.".repeat(40) + "1";
        assert!(!is_valid_uid_format(&too_long));
    }
}
