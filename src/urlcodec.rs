use thiserror::Error;

/// Capacity of the scratch buffer used by one conversion.
pub const TRANSCODE_BUF_SIZE: usize = 4096;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranscodeError {
    #[error("buffer overflow on URL conversion")]
    Overflow,
    #[error("malformed string on URL conversion")]
    Malformed,
}

/// Signature shared by [`urlencode`] and [`urldecode`]: write the converted form of
/// `input` into `out` and return the number of bytes used.
pub type Transform = fn(&mut [u8], &[u8]) -> Result<usize, TranscodeError>;

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~')
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

// Intent: percent-escape every byte outside the unreserved set into a fixed buffer.
// Result: callers get the encoded length, or Overflow instead of a truncated string.
pub fn urlencode(out: &mut [u8], input: &[u8]) -> Result<usize, TranscodeError> {
    let mut len = 0;
    for &byte in input {
        if is_unreserved(byte) {
            if len >= out.len() {
                return Err(TranscodeError::Overflow);
            }
            out[len] = byte;
            len += 1;
        } else {
            if len + 3 > out.len() {
                return Err(TranscodeError::Overflow);
            }
            out[len] = b'%';
            out[len + 1] = HEX_DIGITS[usize::from(byte >> 4)];
            out[len + 2] = HEX_DIGITS[usize::from(byte & 0x0f)];
            len += 3;
        }
    }
    Ok(len)
}

// Intent: undo percent-escapes into a fixed buffer; '+' is left alone.
// Result: a '%' without two hex digits after it fails as Malformed.
pub fn urldecode(out: &mut [u8], input: &[u8]) -> Result<usize, TranscodeError> {
    let mut len = 0;
    let mut i = 0;
    while i < input.len() {
        if len >= out.len() {
            return Err(TranscodeError::Overflow);
        }
        if input[i] != b'%' {
            out[len] = input[i];
            len += 1;
            i += 1;
            continue;
        }
        let high = input.get(i + 1).copied().and_then(hex_value);
        let low = input.get(i + 2).copied().and_then(hex_value);
        match (high, low) {
            (Some(high), Some(low)) => {
                out[len] = (high << 4) | low;
                len += 1;
                i += 3;
            }
            _ => return Err(TranscodeError::Malformed),
        }
    }
    Ok(len)
}

/// Runs `transform` against a fresh [`TRANSCODE_BUF_SIZE`] buffer and copies the
/// result out.
pub fn convert(transform: Transform, input: &[u8]) -> Result<Vec<u8>, TranscodeError> {
    let mut buf = [0_u8; TRANSCODE_BUF_SIZE];
    let len = transform(&mut buf, input)?;
    Ok(buf[..len].to_vec())
}
