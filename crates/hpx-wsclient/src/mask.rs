// XOR masking of frame payloads (RFC 6455 §5.3).

/// Mask or unmask `buf` in place with the 4-byte `mask`.
///
/// Byte `i` is XORed with `mask[i % 4]`; applying the same mask twice restores the input.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    if buf.len() > 128 {
        apply_mask_fast64(buf, mask);
    } else {
        apply_mask_fast32(buf, mask);
    }
}

/// A safe unoptimized mask application.
#[inline(always)]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Operates on 4-byte blocks.
#[doc(hidden)]
#[inline(always)]
pub fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let mut words = buf.chunks_exact_mut(4);
    for word in &mut words {
        let value = u32::from_ne_bytes([word[0], word[1], word[2], word[3]]) ^ mask_u32;
        word.copy_from_slice(&value.to_ne_bytes());
    }

    // the remainder starts at a multiple of 4, so the mask phase is unchanged
    apply_mask_fallback(words.into_remainder(), mask);
}

/// Operates on 8-byte blocks for larger buffers.
#[doc(hidden)]
#[inline(always)]
pub fn apply_mask_fast64(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u64 = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut words = buf.chunks_exact_mut(8);
    for word in &mut words {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(word);
        word.copy_from_slice(&(u64::from_ne_bytes(bytes) ^ mask_u64).to_ne_bytes());
    }

    apply_mask_fast32(words.into_remainder(), mask);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(buf: &mut [u8], mask: [u8; 4]) {
        for i in 0..buf.len() {
            buf[i] ^= mask[i % 4];
        }
    }

    #[test]
    fn test_apply_mask_matches_reference() {
        let mask = [0x6d, 0xb6, 0xb2, 0x80];
        for len in [0, 1, 3, 4, 5, 7, 8, 9, 127, 128, 129, 1000, 4099] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();

            let mut expected = data.clone();
            reference(&mut expected, mask);

            let mut actual = data.clone();
            apply_mask(&mut actual, mask);
            assert_eq!(actual, expected, "length {len}");

            let mut fast32 = data.clone();
            apply_mask_fast32(&mut fast32, mask);
            assert_eq!(fast32, expected, "fast32 length {len}");

            let mut fast64 = data.clone();
            apply_mask_fast64(&mut fast64, mask);
            assert_eq!(fast64, expected, "fast64 length {len}");
        }
    }

    #[test]
    fn test_apply_mask_twice_is_identity() {
        let mask = [1, 2, 3, 4];
        let original = b"Hello, masked world!".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn test_rfc_example() {
        // RFC 6455 §5.7, masked "Hello"
        let mut data = *b"Hello";
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }
}
