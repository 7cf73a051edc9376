use crate::value::Value;

/// Scans a complete token as a numeric literal. Returns `None` when the token
/// is not entirely a number, in which case the reader falls back to symbol
/// interpretation.
///
/// Accepted forms: optional sign, then either a hex integer (`0x1F`), a
/// decimal integer, or a decimal real with a fraction and/or exponent
/// (`1.5`, `2.`, `1e-3`). Integers that do not fit in 32 bits scan as reals.
pub fn scan_number(token: &[u8]) -> Option<Value> {
    let text = std::str::from_utf8(token).ok()?;
    let unsigned = match text.as_bytes().first() {
        Some(b'+') | Some(b'-') => &text[1..],
        _ => text,
    };

    if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let magnitude = i64::from_str_radix(hex, 16).ok()?;
        let n = if text.starts_with('-') {
            -magnitude
        } else {
            magnitude
        };
        return Some(narrow(n));
    }

    let (int_digits, frac, exponent) = split_decimal(unsigned)?;
    if int_digits == 0 && frac.map(|d| d == 0).unwrap_or(true) {
        return None;
    }

    if frac.is_none() && exponent.is_none() {
        return match text.parse::<i64>() {
            Ok(n) => Some(narrow(n)),
            // Out of i64 range; still a valid number.
            Err(_) => text.parse::<f64>().ok().map(Value::Real),
        };
    }

    text.parse::<f64>().ok().map(Value::Real)
}

fn narrow(n: i64) -> Value {
    if let Ok(small) = i32::try_from(n) {
        Value::Integer(small)
    } else {
        Value::Real(n as f64)
    }
}

/// Validates the shape of a decimal literal and returns the digit counts of
/// the integer part, the fraction (if a '.' is present) and the exponent (if
/// an 'e'/'E' is present).
fn split_decimal(text: &str) -> Option<(usize, Option<usize>, Option<usize>)> {
    let mut bytes = text.bytes().peekable();

    let mut int_digits = 0;
    while let Some(b) = bytes.peek().copied() {
        if !b.is_ascii_digit() {
            break;
        }
        int_digits += 1;
        bytes.next();
    }

    let mut frac = None;
    if bytes.peek() == Some(&b'.') {
        bytes.next();
        let mut n = 0;
        while let Some(b) = bytes.peek().copied() {
            if !b.is_ascii_digit() {
                break;
            }
            n += 1;
            bytes.next();
        }
        frac = Some(n);
    }

    let mut exponent = None;
    if matches!(bytes.peek(), Some(b'e') | Some(b'E')) {
        bytes.next();
        if matches!(bytes.peek(), Some(b'+') | Some(b'-')) {
            bytes.next();
        }
        let mut n = 0;
        while let Some(b) = bytes.peek().copied() {
            if !b.is_ascii_digit() {
                break;
            }
            n += 1;
            bytes.next();
        }
        if n == 0 {
            return None;
        }
        exponent = Some(n);
    }

    if bytes.next().is_some() {
        return None;
    }
    Some((int_digits, frac, exponent))
}
