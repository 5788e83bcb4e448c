//! Request decoding and response encoding.
//!
//! There is no framing: the bytes returned by one read are one request.
//! A request split across two reads is answered as two requests.
//!
//! ```text
//! Request:  hello world
//! Response: hello world: 5 5\n
//! ```

use bytes::{BufMut, BytesMut};
use std::str::Utf8Error;

/// Decode one read's worth of bytes into a request.
///
/// Returns `Ok(None)` when the payload is only whitespace.
pub fn decode_request(input: &[u8]) -> Result<Option<&str>, Utf8Error> {
    let text = std::str::from_utf8(input)?.trim();
    if text.is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Format `<request>: <lengths joined by spaces>\n`.
pub fn encode_response(request: &str, lengths: &[usize]) -> BytesMut {
    let mut out = BytesMut::with_capacity(request.len() + 3 + lengths.len() * 4);
    out.put_slice(request.as_bytes());
    out.put_slice(b": ");
    for (i, len) in lengths.iter().enumerate() {
        if i > 0 {
            out.put_u8(b' ');
        }
        out.put_slice(len.to_string().as_bytes());
    }
    out.put_u8(b'\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_trims() {
        assert_eq!(decode_request(b"  hello world\r\n").unwrap(), Some("hello world"));
        assert_eq!(decode_request("南京 \n".as_bytes()).unwrap(), Some("南京"));
    }

    #[test]
    fn test_decode_blank() {
        assert_eq!(decode_request(b" \r\n\t").unwrap(), None);
    }

    #[test]
    fn test_decode_invalid_utf8() {
        assert!(decode_request(&[b'a', 0xff, 0xfe]).is_err());
        // Truncated multi-byte sequence, as when a read splits a char.
        assert!(decode_request(&"南".as_bytes()[..2]).is_err());
    }

    #[test]
    fn test_encode_response() {
        assert_eq!(&encode_response("abc", &[3, 2, 5])[..], b"abc: 3 2 5\n");
        assert_eq!(&encode_response("hello world", &[5, 5])[..], b"hello world: 5 5\n");
    }

    #[test]
    fn test_encode_no_units() {
        assert_eq!(&encode_response("x", &[])[..], b"x: \n");
    }
}
