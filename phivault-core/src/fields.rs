//! PHI field classification
//!
//! Every value handed to the encryption core is labelled with a [`PhiFieldType`].
//! The label drives two things: the sensitivity tier used for policy, and the
//! domain separation of search tokens and authenticated data.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PhiError;

/// Ordinal sensitivity classification (1 = most damaging on disclosure)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitivityTier {
    /// Identifiers that alone re-identify a person
    Critical = 1,
    /// Quasi-identifiers and clinical content
    High = 2,
    /// Secondary contacts
    Moderate = 3,
}

impl SensitivityTier {
    pub fn level(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for SensitivityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensitivityTier::Critical => write!(f, "tier 1 (critical)"),
            SensitivityTier::High => write!(f, "tier 2 (high)"),
            SensitivityTier::Moderate => write!(f, "tier 3 (moderate)"),
        }
    }
}

/// Logical PHI field categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhiFieldType {
    Ssn,
    PatientName,
    DateOfBirth,
    InsuranceId,
    Mrn,
    Email,
    Phone,
    Address,
    ClinicalNote,
    Transcription,
    Diagnosis,
    Medication,
    Allergy,
    EmergencyContact,
}

impl PhiFieldType {
    pub const ALL: [PhiFieldType; 14] = [
        PhiFieldType::Ssn,
        PhiFieldType::PatientName,
        PhiFieldType::DateOfBirth,
        PhiFieldType::InsuranceId,
        PhiFieldType::Mrn,
        PhiFieldType::Email,
        PhiFieldType::Phone,
        PhiFieldType::Address,
        PhiFieldType::ClinicalNote,
        PhiFieldType::Transcription,
        PhiFieldType::Diagnosis,
        PhiFieldType::Medication,
        PhiFieldType::Allergy,
        PhiFieldType::EmergencyContact,
    ];

    /// Stable label; part of every search token and AAD, so never rename.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhiFieldType::Ssn => "ssn",
            PhiFieldType::PatientName => "patient_name",
            PhiFieldType::DateOfBirth => "date_of_birth",
            PhiFieldType::InsuranceId => "insurance_id",
            PhiFieldType::Mrn => "mrn",
            PhiFieldType::Email => "email",
            PhiFieldType::Phone => "phone",
            PhiFieldType::Address => "address",
            PhiFieldType::ClinicalNote => "clinical_note",
            PhiFieldType::Transcription => "transcription",
            PhiFieldType::Diagnosis => "diagnosis",
            PhiFieldType::Medication => "medication",
            PhiFieldType::Allergy => "allergy",
            PhiFieldType::EmergencyContact => "emergency_contact",
        }
    }

    pub fn sensitivity_tier(&self) -> SensitivityTier {
        match self {
            PhiFieldType::Ssn
            | PhiFieldType::PatientName
            | PhiFieldType::DateOfBirth
            | PhiFieldType::InsuranceId
            | PhiFieldType::Mrn => SensitivityTier::Critical,

            PhiFieldType::Email
            | PhiFieldType::Phone
            | PhiFieldType::Address
            | PhiFieldType::ClinicalNote
            | PhiFieldType::Transcription
            | PhiFieldType::Diagnosis
            | PhiFieldType::Medication
            | PhiFieldType::Allergy => SensitivityTier::High,

            PhiFieldType::EmergencyContact => SensitivityTier::Moderate,
        }
    }
}

impl fmt::Display for PhiFieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhiFieldType {
    type Err = PhiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        PhiFieldType::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == wanted)
            .ok_or_else(|| PhiError::InvalidFieldType(s.to_string()))
    }
}
