use half::bf16;

/// Copy `data` into a buffer of exactly `len` elements: zero-padded when
/// short, truncated when long.
pub fn pad_to(data: &[bf16], len: usize) -> Vec<bf16> {
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(&data[..data.len().min(len)]);
    out.resize(len, bf16::ZERO);
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pad_to() {
        let one = bf16::ONE;
        assert_eq!(pad_to(&[], 0), vec![]);
        assert_eq!(pad_to(&[one], 3), vec![one, bf16::ZERO, bf16::ZERO]);
        assert_eq!(pad_to(&[one, one, one], 2), vec![one, one]);
        assert_eq!(pad_to(&[one, one], 2), vec![one, one]);
    }
}
