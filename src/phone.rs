//! Phone number normalization.
//!
//! Booking data arrives in every French format hosts can type (`06 12 34 56 78`,
//! `+33 6 12...`, `0033...`). Conversations are keyed by the normalized form, so both the
//! creation workflow and the webhook must agree on it.

/// Normalize a French number to `+33` followed by the national significant digits.
///
/// Non-digits are dropped, a `0033` or `33` country prefix is removed, then a single
/// trunk `0` even when it follows the country code (`+33 06...`). The result always starts with `+33` and contains only digits after it.
#[must_use]
pub fn normalize_french(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    let national = if let Some(rest) = digits.strip_prefix("0033") {
        rest
    } else if digits.starts_with("33") && (digits.len() == 11 || (digits.len() == 12 && digits[2..].starts_with('0'))) {
        // `+33 6...` or `+33 06...`, the latter with a stray trunk zero
        &digits[2..]
    } else {
        digits.as_str()
    };
    let national = national.strip_prefix('0').unwrap_or(national);

    format!("+33{national}")
}

/// Normalize a WhatsApp `wa_id` (already in international form, no `+`) to E.164 style.
#[must_use]
pub fn normalize_international(raw: &str) -> String {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    let digits = digits.strip_prefix("00").unwrap_or(&digits);
    format!("+{digits}")
}

/// Digits of a normalized number without the leading `+`, as the Graph API expects in `to`
#[must_use]
pub fn to_whatsapp_recipient(normalized: &str) -> String {
    normalized.trim_start_matches('+').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_common_french_formats() {
        assert_eq!(normalize_french("06 12 34 56 78"), "+33612345678");
        assert_eq!(normalize_french("+33 6 12 34 56 78"), "+33612345678");
        assert_eq!(normalize_french("0033612345678"), "+33612345678");
        assert_eq!(normalize_french("33612345678"), "+33612345678");
        assert_eq!(normalize_french("06.12.34.56.78"), "+33612345678");
        assert_eq!(normalize_french("612345678"), "+33612345678");
    }

    #[test]
    fn test_country_code_with_trunk_zero() {
        assert_eq!(normalize_french("+33 06 12 34 56 78"), "+33612345678");
        assert_eq!(normalize_french("+33 (0)6 12 34 56 78"), "+33612345678");
        assert_eq!(normalize_french("0033 06 12 34 56 78"), "+33612345678");
        assert_eq!(normalize_french("330612345678"), "+33612345678");
    }

    #[test]
    fn test_international_wa_id() {
        assert_eq!(normalize_international("33612345678"), "+33612345678");
        assert_eq!(normalize_international("+1 (555) 010-9999"), "+15550109999");
        assert_eq!(normalize_international("0044791112345"), "+44791112345");
        assert_eq!(to_whatsapp_recipient("+33612345678"), "33612345678");
    }

    proptest! {
        #[test]
        fn french_output_is_plus33_then_digits(raw in "\\PC*") {
            let normalized = normalize_french(&raw);
            prop_assert!(normalized.starts_with("+33"));
            prop_assert!(normalized[3..].chars().all(|c| c.is_ascii_digit()));
        }

        #[test]
        fn french_formats_agree(national in "[1-9][0-9]{8}") {
            let expected = format!("+33{national}");
            prop_assert_eq!(normalize_french(&format!("0{national}")), expected.clone());
            prop_assert_eq!(normalize_french(&format!("+33 {national}")), expected.clone());
            prop_assert_eq!(normalize_french(&format!("0033{national}")), expected.clone());
            prop_assert_eq!(normalize_french(&format!("+33 0{national}")), expected.clone());
            prop_assert_eq!(normalize_french(&format!("00330{national}")), expected.clone());
            prop_assert_eq!(normalize_french(&expected), expected);
        }

        #[test]
        fn international_output_is_plus_then_digits(raw in "\\PC*") {
            let normalized = normalize_international(&raw);
            prop_assert!(normalized.starts_with('+'));
            prop_assert!(normalized[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }
}
