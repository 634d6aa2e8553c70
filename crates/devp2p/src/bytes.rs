/// Minimal big-endian encoding of an unsigned integer (zero is the empty string).
pub fn encode_u64(value: u64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Inverse of [`encode_u64`]. Inputs longer than 8 bytes keep only the low 64 bits.
pub fn decode_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_empty() {
        assert!(encode_u64(0).is_empty());
        assert_eq!(decode_u64(&[]), 0);
    }

    #[test]
    fn leading_zeros_stripped() {
        assert_eq!(encode_u64(0x0102), vec![0x01, 0x02]);
        assert_eq!(encode_u64(u64::MAX).len(), 8);
        assert_eq!(decode_u64(&[0x00, 0x01, 0x02]), 0x0102);
    }
}
