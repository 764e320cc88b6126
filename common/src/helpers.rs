use chrono::{DateTime, FixedOffset, Utc};
use fancy_regex::Regex;
use once_cell::sync::Lazy;
use rand::Rng;

use crate::error::PaymentError;

/// Normalizes a Kenyan mobile number to the `2547XXXXXXXX` / `2541XXXXXXXX` form
/// the provider expects. Accepts `07..`, `01..`, `7..`, `+254..` and `254..`.
pub fn normalize_phone(phone: &str) -> Result<String, PaymentError> {
    let digits: String = phone
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let digits = digits.strip_prefix('+').unwrap_or(&digits);

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("254{rest}")
    } else if digits.len() == 9 {
        format!("254{digits}")
    } else {
        digits.to_string()
    };

    static RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^254[17]\d{8}$").ok());
    let valid = match &*RE {
        Some(re) => re
            .is_match(&normalized)
            .map_err(|e| PaymentError::Validation(format!("Regex error for phone: {e}")))?,
        None => {
            return Err(PaymentError::Validation(
                "Phone regex failed to compile. Rejecting all phone numbers.".to_string(),
            ));
        }
    };
    if !valid {
        return Err(PaymentError::Validation(format!(
            "'{phone}' is not a valid Safaricom number. Use the 2547XXXXXXXX format."
        )));
    }
    Ok(normalized)
}

/// Trims and upper-cases an M-Pesa receipt code, then checks its shape.
pub fn validate_receipt_number(receipt: &str) -> Result<String, PaymentError> {
    let receipt = receipt.trim().to_ascii_uppercase();

    static RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"^[A-Z0-9]{6,12}$").ok());
    let valid = match &*RE {
        Some(re) => re
            .is_match(&receipt)
            .map_err(|e| PaymentError::Validation(format!("Regex error for receipt: {e}")))?,
        None => {
            return Err(PaymentError::Validation(
                "Receipt regex failed to compile. Rejecting all receipts.".to_string(),
            ));
        }
    };
    if !valid {
        return Err(PaymentError::Validation(
            "Receipt number must be 6 to 12 letters or digits.".to_string(),
        ));
    }
    Ok(receipt)
}

/// Provider timestamps are `YYYYMMDDHHMMSS` in East Africa Time (UTC+3).
pub fn mpesa_timestamp(now: DateTime<Utc>) -> String {
    const FORMAT: &str = "%Y%m%d%H%M%S";
    match FixedOffset::east_opt(3 * 3600) {
        Some(eat) => now.with_timezone(&eat).format(FORMAT).to_string(),
        None => now.format(FORMAT).to_string(),
    }
}

/// Random upper-case reference, e.g. `QR7K2M9XQA`.
pub fn generate_reference(prefix: &str, len: usize) -> String {
    let suffix: String = rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(len)
        .map(|b| (b as char).to_ascii_uppercase())
        .collect();
    format!("{prefix}{suffix}")
}
