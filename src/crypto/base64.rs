//! Base64 encoding (RFC 4648, standard alphabet with `=` padding)
//!
//! Decoding is lenient: bytes outside the alphabet decode as zero bits and
//! missing padding is tolerated. Conformant input always round-trips.

const ENCODE_TABLE: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

const fn build_decode_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 64 {
        table[ENCODE_TABLE[i] as usize] = i as u8;
        i += 1;
    }
    table
}

const DECODE_TABLE: [u8; 256] = build_decode_table();

/// Length of the encoded form of `len` input bytes
pub fn encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}

/// Encode bytes to a padded Base64 string
pub fn encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(encoded_len(data.len()));

    for chunk in data.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied().unwrap_or(0);
        let b2 = chunk.get(2).copied().unwrap_or(0);

        out.push(ENCODE_TABLE[(b0 >> 2) as usize] as char);
        out.push(ENCODE_TABLE[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        if chunk.len() > 1 {
            out.push(ENCODE_TABLE[(((b1 & 0x0f) << 2) | (b2 >> 6)) as usize] as char);
        } else {
            out.push('=');
        }
        if chunk.len() > 2 {
            out.push(ENCODE_TABLE[(b2 & 0x3f) as usize] as char);
        } else {
            out.push('=');
        }
    }

    out
}

/// Decode a Base64 string
pub fn decode(data: impl AsRef<[u8]>) -> Vec<u8> {
    let data = data.as_ref();
    let mut out = Vec::with_capacity(data.len() / 4 * 3 + 2);

    for group in data.chunks(4) {
        let c = |i: usize| group.get(i).map(|&b| DECODE_TABLE[b as usize]).unwrap_or(0);
        let (c0, c1, c2, c3) = (c(0), c(1), c(2), c(3));

        out.push((c0 << 2) | (c1 >> 4));
        if group.len() > 2 && group[2] != b'=' {
            out.push((c1 << 4) | (c2 >> 2));
        }
        if group.len() > 3 && group[3] != b'=' {
            out.push((c2 << 6) | c3);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_vectors() {
        assert_eq!(encode(b""), "");
        assert_eq!(encode(b"f"), "Zg==");
        assert_eq!(encode(b"fo"), "Zm8=");
        assert_eq!(encode(b"foo"), "Zm9v");
        assert_eq!(encode(b"foob"), "Zm9vYg==");
        assert_eq!(encode(b"fooba"), "Zm9vYmE=");
        assert_eq!(encode(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_decode_vectors() {
        assert_eq!(decode(""), b"");
        assert_eq!(decode("Zg=="), b"f");
        assert_eq!(decode("Zm8="), b"fo");
        assert_eq!(decode("Zm9vYmFy"), b"foobar");
    }

    #[test]
    fn test_round_trip_all_bytes() {
        let data: Vec<u8> = (0..=255u8).collect();
        for len in 0..data.len() {
            assert_eq!(decode(encode(&data[..len])), &data[..len]);
        }
    }

    #[test]
    fn test_decode_lenient() {
        // Missing padding still yields the leading byte
        assert_eq!(decode("Zg"), b"f");
        // Out-of-alphabet characters decode as zero bits rather than failing
        assert_eq!(decode("!!!!").len(), 3);
    }

    #[test]
    fn test_encoded_len() {
        assert_eq!(encoded_len(0), 0);
        assert_eq!(encoded_len(1), 4);
        assert_eq!(encoded_len(16), 24);
    }
}
