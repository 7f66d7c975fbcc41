/// Takes a byte slice and applies Percent-Encoding, returning an encoded string.
///
/// Every byte is encoded as `%XX`, which is always valid and is what trackers
/// expect for binary query values such as the info-hash and the peer id.
pub fn encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for byte in bytes {
        encoded.push('%');
        encoded.push_str(&format!("{:02x}", byte));
    }
    encoded
}

/// Takes a percent-encoded string and decodes it back into bytes.
///
/// Characters outside `%XX` sequences are taken literally.
pub fn decode(encoded: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = encoded.chars();

    while let Some(c) = iter.next() {
        match c {
            '%' => {
                let c1 = iter.next();
                let c2 = iter.next();
                if let (Some(c1), Some(c2)) = (c1, c2) {
                    let pair: String = [c1, c2].iter().collect();
                    if let Ok(byte) = u8::from_str_radix(&pair, 16) {
                        out.push(byte);
                    }
                }
            }
            _ => out.push(c as u8),
        }
    }

    out
}
