//! Batch number generation.
//!
//! The sequential scheme is `{phase}-{yyww}-{seq}`: phase digit 1–3,
//! two-digit ISO week-year and week (Monday start, week 1 contains the
//! first Thursday), and a five-digit counter scoped to
//! (org, phase, week). The counter lives in the caller's write
//! transaction — an aborted mutation rolls the counter back with
//! everything else, so issued numbers stay contiguous.
//!
//! A legacy scheme `B-{yyyy}-{5 base36 chars}` survives from before the
//! sequential rollout. The two schemes are independently namespaced and
//! never mixed: the generator only issues sequential numbers, and the
//! legacy constructor exists for callers that still need the fallback.

use chrono::{DateTime, Datelike, Utc};
use potline_core::ServiceError;
use potline_kv::WriteTxn;

use super::store_err;
use crate::model::Phase;

/// Highest sequence a five-digit counter can hold.
const MAX_SEQ: u64 = 99_999;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Which numbering scheme a batch number belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberScheme {
    /// `1-2527-00001` — phase, ISO week-year+week, per-week sequence.
    PhaseWeekSeq,
    /// `B-2025-x3k9p` — random fallback, non-sequential.
    LegacyRandom,
}

impl NumberScheme {
    /// Classify a batch number, or None if it matches neither scheme.
    pub fn classify(number: &str) -> Option<Self> {
        if is_sequential(number) {
            return Some(NumberScheme::PhaseWeekSeq);
        }
        if is_legacy(number) {
            return Some(NumberScheme::LegacyRandom);
        }
        None
    }
}

/// Allocate the next sequential batch number for (org, phase, week of
/// `at`). Must run inside the mutation's write transaction: the
/// increment is atomic because the store serializes writers, and a
/// failed mutation returns the number to the pool on rollback.
pub(crate) fn generate(
    txn: &mut dyn WriteTxn,
    org: &str,
    phase: Phase,
    at: DateTime<Utc>,
) -> Result<String, ServiceError> {
    let iso = at.iso_week();
    let yy = (iso.year().rem_euclid(100)) as u32;
    let ww = iso.week();

    let counter_key = format!("seq:{}:{}:{:02}{:02}", org, phase.digit(), yy, ww);
    let seq = match txn.get(&counter_key).map_err(store_err)? {
        Some(raw) => {
            let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                ServiceError::Internal(format!("corrupt sequence counter {}", counter_key))
            })?;
            u64::from_be_bytes(bytes) + 1
        }
        None => 1,
    };
    if seq > MAX_SEQ {
        return Err(ServiceError::Conflict(format!(
            "batch number sequence exhausted for {}",
            counter_key
        )));
    }
    txn.set(&counter_key, &seq.to_be_bytes()).map_err(store_err)?;

    let number = format!("{}-{:02}{:02}-{:05}", phase.digit(), yy, ww, seq);
    if !is_sequential(&number) {
        return Err(ServiceError::Internal(format!(
            "generated invalid batch number {}",
            number
        )));
    }
    Ok(number)
}

/// Build a legacy fallback number for `at`'s calendar year. Random,
/// non-sequential, and deliberately not drawn from any counter.
pub fn legacy_number(at: DateTime<Utc>) -> String {
    let entropy = uuid::Uuid::new_v4();
    let suffix: String = entropy.as_bytes()[..5]
        .iter()
        .map(|b| BASE36[(*b as usize) % 36] as char)
        .collect();
    format!("B-{:04}-{}", at.year(), suffix)
}

/// Check a number against the sequential scheme `^[1-3]-\d{4}-\d{5}$`,
/// with the week component in [01, 53] and the sequence ≥ 1.
pub fn is_sequential(number: &str) -> bool {
    let parts: Vec<&str> = number.split('-').collect();
    if parts.len() != 3 {
        return false;
    }
    let (phase, week, seq) = (parts[0], parts[1], parts[2]);
    if phase.len() != 1 || !matches!(phase.as_bytes()[0], b'1'..=b'3') {
        return false;
    }
    if week.len() != 4 || !week.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let ww: u32 = week[2..].parse().unwrap_or(0);
    if !(1..=53).contains(&ww) {
        return false;
    }
    if seq.len() != 5 || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    seq.parse::<u64>().unwrap_or(0) >= 1
}

fn is_legacy(number: &str) -> bool {
    let parts: Vec<&str> = number.split('-').collect();
    if parts.len() != 3 || parts[0] != "B" {
        return false;
    }
    if parts[1].len() != 4 || !parts[1].bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    parts[2].len() == 5 && parts[2].bytes().all(|b| b.is_ascii_alphanumeric())
}
