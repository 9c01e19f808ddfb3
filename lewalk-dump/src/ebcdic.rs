//! Conversion between EBCDIC (code page 1047) and ASCII.
//!
//! Only the printable subset is mapped; everything else decodes to the ASCII
//! SUB character (0x1A), which conveniently never passes a printable-name
//! check further up the stack.

/// The ASCII SUB character, used for all unmapped code points.
const SUB: u8 = 0x1A;

/// Code page 1047 to ASCII, printable subset only.
#[rustfmt::skip]
static TO_ASCII: [u8; 256] = [
    // 0x00
    SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0x10
    SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0x20
    SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0x30
    SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0x40
    0x20, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, 0x2E, 0x3C, 0x28, 0x2B, 0x7C,
    // 0x50
    0x26, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, 0x21, 0x24, 0x2A, 0x29, 0x3B, 0x5E,
    // 0x60
    0x2D, 0x2F, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, 0x2C, 0x25, 0x5F, 0x3E, 0x3F,
    // 0x70
    SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, 0x60, 0x3A, 0x23, 0x40, 0x27, 0x3D, 0x22,
    // 0x80
    SUB, 0x61, 0x62, 0x63, 0x64, 0x65, 0x66, 0x67, 0x68, 0x69, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0x90
    SUB, 0x6A, 0x6B, 0x6C, 0x6D, 0x6E, 0x6F, 0x70, 0x71, 0x72, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0xA0
    SUB, 0x7E, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7A, SUB, SUB, SUB, 0x5B, SUB, SUB,
    // 0xB0
    SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, SUB, 0x5D, SUB, SUB,
    // 0xC0
    0x7B, 0x41, 0x42, 0x43, 0x44, 0x45, 0x46, 0x47, 0x48, 0x49, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0xD0
    0x7D, 0x4A, 0x4B, 0x4C, 0x4D, 0x4E, 0x4F, 0x50, 0x51, 0x52, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0xE0
    0x5C, SUB, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5A, SUB, SUB, SUB, SUB, SUB, SUB,
    // 0xF0
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, SUB, SUB, SUB, SUB, SUB, SUB,
];

/// Decodes a slice of EBCDIC bytes into an ASCII string.
///
/// Unmapped code points decode to SUB (0x1A) rather than being dropped, so
/// the output always has the same length as the input.
pub fn decode(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| char::from(TO_ASCII[b as usize]))
        .collect()
}

/// Encodes an ASCII string into EBCDIC bytes.
///
/// Characters without an EBCDIC equivalent encode to the EBCDIC question
/// mark. This is mostly useful for constructing synthetic dumps in tests.
pub fn encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            u8::try_from(c)
                .ok()
                .and_then(|a| {
                    if a == SUB {
                        return None;
                    }
                    TO_ASCII.iter().position(|&m| m == a)
                })
                .map_or(0x6F, |i| i as u8)
        })
        .collect()
}
