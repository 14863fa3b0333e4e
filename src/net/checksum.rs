/// Internet checksum (RFC 1071) over `data`.
///
/// The input is only read. Callers computing a header checksum pass bytes
/// whose checksum field is already zero; summing a header that still holds
/// a valid checksum yields 0, which is how verification works.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for w in &mut words {
        sum += u16::from_be_bytes([w[0], w[1]]) as u32;
    }
    // odd trailing byte is padded with zero on the right
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Checksum of `data` with the two bytes at `field` treated as zero.
pub fn checksum_without(data: &[u8], field: usize) -> u16 {
    let mut copy = data.to_vec();
    if let Some(slot) = copy.get_mut(field..field + 2) {
        slot.fill(0);
    }
    checksum(&copy)
}
