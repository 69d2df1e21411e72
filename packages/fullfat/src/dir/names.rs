//! 8.3 names, long-name fragments and wildcard matching.

use heapless::String;

use super::{RawEntry, ATTR_LFN, CASE_LOWER_BASE, CASE_LOWER_EXT, DELETED, DIRENT_SIZE, E5_ESCAPE, LFN_LAST};
use crate::config::NAME_UNITS_MAX;

pub(crate) const LFN_UNITS_PER_ENTRY: usize = 13;
pub(crate) const LFN_UNIT_OFFSETS: [usize; LFN_UNITS_PER_ENTRY] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];
pub(crate) const LFN_ENTRIES_MAX: usize = 20;

const SHORT_SPECIALS: &[u8] = b"$%-_@~`!(){}^#&";
const LONG_FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
const SHORT_FORBIDDEN: &[u8] = b"\"*/:<>?\\|";

pub fn short_name_checksum(short: &[u8; 11]) -> u8 {
    short
        .iter()
        .fold(0u8, |sum, byte| ((sum & 1) << 7).wrapping_add(sum >> 1).wrapping_add(*byte))
}

fn is_short_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || SHORT_SPECIALS.contains(&byte)
}

pub fn is_valid_long_name(name: &str) -> bool {
    let trimmed = name.trim_end_matches([' ', '.']);
    !trimmed.is_empty()
        && name != "."
        && name != ".."
        && !name.chars().any(|c| (c as u32) < 0x20 || LONG_FORBIDDEN.contains(&c))
        && name.encode_utf16().count() <= NAME_UNITS_MAX
}

fn part_case(part: &[u8], flag: u8) -> Option<u8> {
    let lower = part.iter().any(|b| b.is_ascii_lowercase());
    let upper = part.iter().any(|b| b.is_ascii_uppercase());
    match (lower, upper) {
        (true, true) => None,
        (true, false) => Some(flag),
        _ => Some(0),
    }
}

/// Encodes a name that is already a legal 8.3 name, with the case byte that
/// preserves an all-lowercase base or extension. Mixed case needs a long name.
pub(crate) fn fits_short_name(name: &str) -> Option<([u8; 11], u8)> {
    let bytes = name.as_bytes();
    let (base, ext) = match name.find('.') {
        Some(dot) => (&bytes[..dot], &bytes[dot + 1..]),
        None => (bytes, &[][..]),
    };
    if base.is_empty()
        || base.len() > 8
        || ext.len() > 3
        || (name.contains('.') && ext.is_empty())
        || !base.iter().chain(ext).all(|b| is_short_char(*b))
    {
        return None;
    }
    let case = part_case(base, CASE_LOWER_BASE)? | part_case(ext, CASE_LOWER_EXT)?;
    let mut raw = [b' '; 11];
    for (slot, byte) in raw.iter_mut().zip(base) {
        *slot = byte.to_ascii_uppercase();
    }
    for (slot, byte) in raw[8..].iter_mut().zip(ext) {
        *slot = byte.to_ascii_uppercase();
    }
    if raw[0] == DELETED {
        raw[0] = E5_ESCAPE;
    }
    Some((raw, case))
}

/// Uppercased, filtered base and extension a numbered alias is cut from.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ShortBasis {
    base: [u8; 8],
    base_len: usize,
    ext: [u8; 3],
    ext_len: usize,
}

fn basis_byte(c: char) -> Option<u8> {
    match c {
        ' ' | '.' => None,
        c if c.is_ascii() && is_short_char(c as u8) => Some((c as u8).to_ascii_uppercase()),
        _ => Some(b'_'),
    }
}

impl ShortBasis {
    pub(crate) fn from_long(name: &str) -> Self {
        let stem = name.trim_start_matches('.');
        let (base_text, ext_text) = match stem.rfind('.') {
            Some(dot) => (&stem[..dot], &stem[dot + 1..]),
            None => (stem, ""),
        };
        let mut basis = Self {
            base: [b' '; 8],
            base_len: 0,
            ext: [b' '; 3],
            ext_len: 0,
        };
        for byte in base_text.chars().filter_map(basis_byte).take(8) {
            basis.base[basis.base_len] = byte;
            basis.base_len += 1;
        }
        for byte in ext_text.chars().filter_map(basis_byte).take(3) {
            basis.ext[basis.ext_len] = byte;
            basis.ext_len += 1;
        }
        if basis.base_len == 0 {
            basis.base[0] = b'_';
            basis.base_len = 1;
        }
        basis
    }

    /// `BASE~N.EXT`, cutting the base short enough to fit the suffix.
    pub(crate) fn numbered(&self, n: u32) -> [u8; 11] {
        let mut digits = [0u8; 10];
        let mut count = 0usize;
        let mut rest = n.max(1);
        while rest > 0 {
            digits[count] = b'0' + (rest % 10) as u8;
            count += 1;
            rest /= 10;
        }
        let keep = self.base_len.min(8 - 1 - count);
        let mut raw = [b' '; 11];
        raw[..keep].copy_from_slice(&self.base[..keep]);
        raw[keep] = b'~';
        for i in 0..count {
            raw[keep + 1 + i] = digits[count - 1 - i];
        }
        raw[8..8 + self.ext_len].copy_from_slice(&self.ext[..self.ext_len]);
        make_name_compliant(&mut raw);
        raw
    }
}

pub(crate) fn make_name_compliant(raw: &mut [u8; 11]) {
    if raw[0] == DELETED {
        raw[0] = E5_ESCAPE;
    }
    for byte in raw.iter_mut() {
        if SHORT_FORBIDDEN.contains(byte) || *byte == 0x7F {
            *byte = b'_';
        }
    }
}

/// Lowercased `base.ext` text of a raw short name.
pub(crate) fn short_name_text<const N: usize>(raw: &[u8; 11], out: &mut String<N>) {
    let push = |out: &mut String<N>, byte: u8| {
        let byte = if byte == E5_ESCAPE { DELETED } else { byte };
        let _ = out.push(char::from(byte).to_ascii_lowercase());
    };
    for (i, byte) in raw[..8].iter().enumerate() {
        if *byte == b' ' && raw[i..8].iter().all(|b| *b == b' ') {
            break;
        }
        push(out, *byte);
    }
    let ext_len = raw[8..].iter().rposition(|b| *b != b' ').map_or(0, |at| at + 1);
    if ext_len > 0 {
        let _ = out.push('.');
        for byte in &raw[8..8 + ext_len] {
            push(out, *byte);
        }
    }
}

/// Long-name slot `ordinal` (1-based) for `units`, zero-terminated then
/// padded with 0xFFFF.
pub(crate) fn lfn_entry(units: &[u16], ordinal: u8, last: bool, checksum: u8) -> RawEntry {
    let mut raw = [0u8; DIRENT_SIZE];
    raw[0] = ordinal | if last { LFN_LAST } else { 0 };
    raw[11] = ATTR_LFN;
    raw[13] = checksum;
    let start = (ordinal as usize - 1) * LFN_UNITS_PER_ENTRY;
    for (k, offset) in LFN_UNIT_OFFSETS.iter().enumerate() {
        let at = start + k;
        let unit = match at.cmp(&units.len()) {
            core::cmp::Ordering::Less => units[at],
            core::cmp::Ordering::Equal => 0x0000,
            core::cmp::Ordering::Greater => 0xFFFF,
        };
        raw[*offset..*offset + 2].copy_from_slice(&unit.to_le_bytes());
    }
    raw
}

/// Case-insensitive match with `*` for any run and `?` for one character.
/// Positions are byte offsets that always sit on character boundaries.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while let Some(c) = name[n..].chars().next() {
        let want = pattern[p..].chars().next();
        match want {
            Some(w) if w == '?' || chars_match(w, c) => {
                p += w.len_utf8();
                n += c.len_utf8();
            }
            Some('*') => {
                star = Some((p, n));
                p += 1;
            }
            _ => match star {
                Some((star_p, star_n)) => {
                    let skipped = name[star_n..].chars().next().map_or(1, char::len_utf8);
                    p = star_p + 1;
                    n = star_n + skipped;
                    star = Some((star_p, n));
                }
                None => return false,
            },
        }
    }
    pattern[p..].chars().all(|c| c == '*')
}

fn chars_match(a: char, b: char) -> bool {
    a == b || a.to_lowercase().eq(b.to_lowercase())
}
