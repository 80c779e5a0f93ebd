//! Release size parsing.
//!
//! Indexers publish sizes as loose human strings ("1.5 GB", "1,024 KB").
//! Unit names follow tracker convention but the multipliers are binary, so
//! "1.5 GB" parses to 1.5 * 2^30 bytes.

const KIB: f64 = 1_024.0;

/// Parse a human size string into bytes. Unparseable input maps to 0.
#[must_use]
pub fn parse_size(input: &str) -> u64 {
    let cleaned = input.trim().replace(',', "");
    if cleaned.is_empty() {
        return 0;
    }

    let split = cleaned
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(cleaned.len());
    let (number, unit) = cleaned.split_at(split);
    let Ok(value) = number.trim().parse::<f64>() else {
        return 0;
    };
    if !value.is_finite() || value < 0.0 {
        return 0;
    }

    let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bytes" => 1.0,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => KIB * KIB,
        "g" | "gb" | "gib" => KIB * KIB * KIB,
        "t" | "tb" | "tib" => KIB * KIB * KIB * KIB,
        _ => return 0,
    };

    let bytes = value * multiplier;
    if bytes >= u64::MAX as f64 {
        u64::MAX
    } else {
        bytes as u64
    }
}
