use anyhow::{bail, Context, Result};

/// Width of the weight field at the start of every payload.
pub const WEIGHT_FIELD_LEN: usize = 7;
/// Weight field plus the decimal position indicator.
pub const MIN_PAYLOAD_LEN: usize = WEIGHT_FIELD_LEN + 1;

const MAX_INDICATOR: u8 = 7;

/// Decodes a frame payload into a weight.
///
/// The first seven bytes carry the weight digits, the eighth says how many of
/// them sit after the decimal point (`'0'` means an integer weight). Anything
/// past the eighth byte is ignored.
pub fn decode_payload(payload: &[u8]) -> Result<f64> {
    if payload.len() < MIN_PAYLOAD_LEN {
        bail!(
            "payload too short ({} bytes, need {MIN_PAYLOAD_LEN}): {:?}",
            payload.len(),
            String::from_utf8_lossy(payload)
        );
    }

    let field = &payload[..WEIGHT_FIELD_LEN];
    let indicator_byte = payload[WEIGHT_FIELD_LEN];

    let indicator = match indicator_byte.checked_sub(b'0') {
        Some(value) if value <= MAX_INDICATOR => value,
        _ => bail!(
            "invalid decimal position indicator {:?} in payload {:?}",
            char::from(indicator_byte),
            String::from_utf8_lossy(payload)
        ),
    };

    if !field
        .iter()
        .all(|b| b.is_ascii_digit() || matches!(b, b' ' | b'+' | b'-'))
    {
        bail!(
            "non-numeric weight field {:?}",
            String::from_utf8_lossy(field)
        );
    }

    // Every byte is ASCII at this point.
    let mut text: String = field.iter().map(|&b| char::from(b)).collect();
    let decimal_index = WEIGHT_FIELD_LEN - usize::from(indicator);
    if decimal_index < WEIGHT_FIELD_LEN {
        text.insert(decimal_index, '.');
    }

    let trimmed = text.trim();
    trimmed
        .parse::<f64>()
        .with_context(|| format!("failed to parse weight {trimmed:?}"))
}
