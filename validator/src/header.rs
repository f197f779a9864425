//! Candidate header reconstruction (spec §4.4 step 2).

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("nonce hex is malformed: {0}")]
    MalformedNonce(String),

    #[error("nonce does not fit the canonical offset: header is {header_len} bytes, need {need} at offset {offset}")]
    NonceOutOfBounds { header_len: usize, offset: usize, need: usize },

    #[error("extranonce2 length {got} does not match session width {want}")]
    ExtranonceLengthMismatch { got: usize, want: usize },
}

/// Parses a big-endian, fixed-width nonce from wire hex. Rejects a `0x`
/// prefix and any length that doesn't produce exactly `width` bytes.
pub fn parse_nonce(nonce_hex: &str, width: usize) -> Result<Vec<u8>, HeaderError> {
    if nonce_hex.starts_with("0x") || nonce_hex.starts_with("0X") {
        return Err(HeaderError::MalformedNonce("0x-prefixed hex is not valid on the wire".into()));
    }
    let bytes = hex::decode(nonce_hex).map_err(|e| HeaderError::MalformedNonce(e.to_string()))?;
    if bytes.len() != width {
        return Err(HeaderError::MalformedNonce(format!(
            "expected {} bytes, got {}",
            width,
            bytes.len()
        )));
    }
    Ok(bytes)
}

/// Rebuilds the candidate header: the job's header prefix with the nonce
/// written in big-endian at its canonical, protocol-defined offset, and (if
/// given) the extranonce2 bytes embedded at their own fixed offset.
///
/// Both offsets are opaque protocol constants (spec §9 open question (a)) —
/// callers supply them from configuration, this function only performs the
/// splice and bounds checking.
pub fn reconstruct_header(
    header_prefix: &[u8],
    nonce: &[u8],
    nonce_offset: usize,
    extranonce2: Option<(&[u8], usize)>,
) -> Result<Vec<u8>, HeaderError> {
    let mut header = header_prefix.to_vec();

    if nonce_offset + nonce.len() > header.len() {
        return Err(HeaderError::NonceOutOfBounds {
            header_len: header.len(),
            offset: nonce_offset,
            need: nonce.len(),
        });
    }
    header[nonce_offset..nonce_offset + nonce.len()].copy_from_slice(nonce);

    if let Some((extranonce2, extranonce2_offset)) = extranonce2 {
        if extranonce2_offset + extranonce2.len() > header.len() {
            return Err(HeaderError::NonceOutOfBounds {
                header_len: header.len(),
                offset: extranonce2_offset,
                need: extranonce2.len(),
            });
        }
        header[extranonce2_offset..extranonce2_offset + extranonce2.len()].copy_from_slice(extranonce2);
    }

    Ok(header)
}

/// Checks an extranonce2 submission against the session's assigned width
/// (spec §4.4 edge case).
pub fn check_extranonce2_width(extranonce2: &[u8], session_width: usize) -> Result<(), HeaderError> {
    if extranonce2.len() != session_width {
        return Err(HeaderError::ExtranonceLengthMismatch {
            got: extranonce2.len(),
            want: session_width,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_nonce() {
        assert_eq!(parse_nonce("deadbeef", 4).unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn rejects_0x_prefix() {
        assert!(parse_nonce("0xdeadbeef", 4).is_err());
    }

    #[test]
    fn rejects_wrong_width() {
        assert!(parse_nonce("dead", 4).is_err());
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!(parse_nonce("zzzz", 2).is_err());
    }

    #[test]
    fn splices_nonce_at_offset() {
        let prefix = vec![0u8; 16];
        let nonce = vec![0xaa, 0xbb, 0xcc, 0xdd];
        let header = reconstruct_header(&prefix, &nonce, 8, None).unwrap();
        assert_eq!(&header[8..12], &nonce[..]);
        assert_eq!(&header[0..8], &[0u8; 8][..]);
    }

    #[test]
    fn rejects_nonce_past_header_bounds() {
        let prefix = vec![0u8; 8];
        let nonce = vec![0u8; 4];
        assert!(reconstruct_header(&prefix, &nonce, 6, None).is_err());
    }

    #[test]
    fn embeds_extranonce2() {
        let prefix = vec![0u8; 16];
        let nonce = vec![0u8; 4];
        let extranonce2 = vec![0x11, 0x22];
        let header = reconstruct_header(&prefix, &nonce, 0, Some((&extranonce2, 4))).unwrap();
        assert_eq!(&header[4..6], &extranonce2[..]);
    }
}
