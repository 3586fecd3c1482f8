// [libs/domain/models/src/hash.rs]
//! Hashes, hashlists and LM-half bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Hash type id hashcat assigns to LM.
pub const LM_HASH_TYPE: u32 = 3000;

/// The LM half of an empty string. Its plaintext side is known a priori, so
/// a crack of the sibling half completes the full hash automatically.
pub const LM_BLANK_HALF: &str = "aad3b435b51404ee";

/// One canonical hash, deduplicated by `hash_value` across every hashlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hash {
    pub id: Uuid,
    pub hash_value: String,
    /// Line exactly as uploaded, preserved for export.
    pub original_line: Option<String>,
    pub username: Option<String>,
    pub domain: Option<String>,
    pub hash_type_id: u32,
    pub is_cracked: bool,
    pub password: Option<String>,
}

/// A named collection of hashes. Membership is many-to-many: a crack of one
/// `hash_value` updates counters in every hashlist that links it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hashlist {
    pub id: Uuid,
    pub hash_type_id: u32,
    pub total: u64,
    pub cracked_count: u64,
    /// Digest of the regenerated uncracked file agents download.
    pub file_md5: Option<String>,
    pub has_mixed_work_factors: bool,
    /// Uploaded file kept verbatim for association-mode serving.
    pub original_file_path: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Per-LM-hash half tracking. The full hash flips `is_cracked` only when
/// both halves are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LmMetadata {
    pub hash_id: Uuid,
    pub first_half_cracked: bool,
    pub second_half_cracked: bool,
    pub first_half_plain: Option<String>,
    pub second_half_plain: Option<String>,
}

impl LmMetadata {
    pub fn is_fully_cracked(&self) -> bool {
        self.first_half_cracked && self.second_half_cracked
    }

    /// Joined plaintext once both halves are known.
    pub fn full_plaintext(&self) -> Option<String> {
        if !self.is_fully_cracked() {
            return None;
        }
        Some(format!(
            "{}{}",
            self.first_half_plain.as_deref().unwrap_or(""),
            self.second_half_plain.as_deref().unwrap_or("")
        ))
    }
}

/// Splits a 32-char LM hash value into its two 16-char halves.
pub fn lm_halves(hash_value: &str) -> Option<(&str, &str)> {
    if hash_value.len() != 32 {
        return None;
    }
    Some(hash_value.split_at(16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lm_halves_splits_exact_32() {
        let value = "299bd128c1101fd6aad3b435b51404ee";
        let (first, second) = lm_halves(value).expect("32 chars split");
        assert_eq!(first, "299bd128c1101fd6");
        assert_eq!(second, LM_BLANK_HALF);
        assert!(lm_halves("abc").is_none());
    }

    #[test]
    fn lm_metadata_completes_only_with_both_halves() {
        let mut meta = LmMetadata {
            first_half_cracked: true,
            first_half_plain: Some("PASSWO".into()),
            ..LmMetadata::default()
        };
        assert!(!meta.is_fully_cracked());
        assert_eq!(meta.full_plaintext(), None);

        meta.second_half_cracked = true;
        meta.second_half_plain = Some("RD".into());
        assert!(meta.is_fully_cracked());
        assert_eq!(meta.full_plaintext().as_deref(), Some("PASSWORD"));
    }
}
