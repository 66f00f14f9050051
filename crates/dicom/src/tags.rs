//! DICOM attribute tags, written the way QIDO-RS expects them in query keys and JSON objects.

pub const STUDY_DATE: &str = "00080020";
pub const STUDY_TIME: &str = "00080030";
pub const ACCESSION_NUMBER: &str = "00080050";
pub const REFERRING_PHYSICIAN_NAME: &str = "00080090";
pub const STUDY_DESCRIPTION: &str = "00081030";

pub const PATIENT_NAME: &str = "00100010";
pub const PATIENT_ID: &str = "00100020";
pub const ISSUER_OF_PATIENT_ID: &str = "00100021";
pub const PATIENT_BIRTH_DATE: &str = "00100030";
pub const PATIENT_SEX: &str = "00100040";
pub const ADDITIONAL_PATIENT_HISTORY: &str = "001021B0";

pub const STUDY_INSTANCE_UID: &str = "0020000D";
pub const NUMBER_OF_STUDY_RELATED_INSTANCES: &str = "00201208";

pub const SCHEDULED_PROCEDURE_STEP_STATUS: &str = "00400020";
pub const SCHEDULED_PROCEDURE_STEP_SEQUENCE: &str = "00400100";
