//! Text transcoding between host UTF-16 strings and engine byte strings.
//!
//! The engine stores whatever bytes it is given, so the codec decides per
//! call how host text becomes bytes: untouched (`Array`, `Buffer`), CESU-8
//! (each UTF-16 unit encoded on its own, the host's native byte form), or
//! strict UTF-8 produced either by the codec itself (`StringCutf8`) or by the
//! standard library's charset routines (`StringJutf8`).

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Text representation selector accompanying every text argument and return.
///
/// Discriminants are part of the host contract and never renegotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TextMode {
    /// Raw byte array; no conversion.
    Array = 1,
    /// Direct view over engine or host memory; no conversion, no copy.
    Buffer = 2,
    /// Host string encoded as strict UTF-8 by the codec.
    StringCutf8 = 3,
    /// Host string encoded as strict UTF-8 through the charset routines.
    StringJutf8 = 4,
    /// Host string encoded as CESU-8.
    StringCesu8 = 5,
}

impl TextMode {
    pub fn from_code(code: i32) -> Result<TextMode> {
        match code {
            1 => Ok(TextMode::Array),
            2 => Ok(TextMode::Buffer),
            3 => Ok(TextMode::StringCutf8),
            4 => Ok(TextMode::StringJutf8),
            5 => Ok(TextMode::StringCesu8),
            other => Err(Error::misuse(format!("unknown text mode {}", other))),
        }
    }

    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Parse a configuration name (`array`, `buffer`, `cutf8`, `jutf8`, `cesu8`).
    pub fn from_name(name: &str) -> Option<TextMode> {
        match name.trim().to_ascii_lowercase().as_str() {
            "array" => Some(TextMode::Array),
            "buffer" => Some(TextMode::Buffer),
            "cutf8" | "utf8" | "string_cutf8" => Some(TextMode::StringCutf8),
            "jutf8" | "charset" | "string_jutf8" => Some(TextMode::StringJutf8),
            "cesu8" | "string_cesu8" => Some(TextMode::StringCesu8),
            _ => None,
        }
    }

    /// Whether this mode expects host strings rather than bytes.
    pub const fn is_string(self) -> bool {
        matches!(
            self,
            TextMode::StringCutf8 | TextMode::StringJutf8 | TextMode::StringCesu8
        )
    }
}

/// Host-side text argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostText<'a> {
    /// Bytes for `Array`/`Buffer` modes.
    Bytes(&'a [u8]),
    /// UTF-16 code units for the string modes.
    Utf16(&'a [u16]),
}

impl<'a> From<&'a [u16]> for HostText<'a> {
    fn from(units: &'a [u16]) -> Self {
        HostText::Utf16(units)
    }
}

impl<'a> From<&'a Vec<u16>> for HostText<'a> {
    fn from(units: &'a Vec<u16>) -> Self {
        HostText::Utf16(units.as_slice())
    }
}

impl<'a> From<&'a [u8]> for HostText<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        HostText::Bytes(bytes)
    }
}

/// Host-side text result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TextValue<'a> {
    Array(Vec<u8>),
    /// View into engine memory, valid until the owning statement or call moves on.
    Buffer(&'a [u8]),
    String(Vec<u16>),
}

impl TextValue<'_> {
    pub fn as_utf16(&self) -> Option<&[u16]> {
        match self {
            TextValue::String(units) => Some(units),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            TextValue::Array(bytes) => Some(bytes),
            TextValue::Buffer(bytes) => Some(bytes),
            TextValue::String(_) => None,
        }
    }

    /// Render for diagnostics and tests.
    pub fn to_string_lossy(&self) -> String {
        match self {
            TextValue::Array(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            TextValue::Buffer(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            TextValue::String(units) => String::from_utf16_lossy(units),
        }
    }

    /// Detach from engine memory.
    pub fn into_owned(self) -> TextValue<'static> {
        match self {
            TextValue::Array(bytes) => TextValue::Array(bytes),
            TextValue::Buffer(bytes) => TextValue::Array(bytes.to_vec()),
            TextValue::String(units) => TextValue::String(units),
        }
    }
}

/// Treatment of unpaired or out-of-order surrogates in host strings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SurrogatePolicy {
    /// Fail with a bad-encoding error.
    #[default]
    Strict,
    /// Legacy behavior: stop at the offending unit and keep what was encoded.
    Truncate,
}

/// Mode-driven encoder/decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextCodec {
    policy: SurrogatePolicy,
}

impl TextCodec {
    pub const fn new(policy: SurrogatePolicy) -> Self {
        Self { policy }
    }

    pub const fn policy(&self) -> SurrogatePolicy {
        self.policy
    }

    /// Turn a host argument into engine bytes.
    pub fn encode<'a>(&self, text: HostText<'a>, mode: TextMode) -> Result<Cow<'a, [u8]>> {
        match (mode, text) {
            (TextMode::Array | TextMode::Buffer, HostText::Bytes(bytes)) => {
                Ok(Cow::Borrowed(bytes))
            }
            (TextMode::StringCutf8, HostText::Utf16(units)) => {
                utf16_to_utf8(units, self.policy).map(Cow::Owned)
            }
            (TextMode::StringJutf8, HostText::Utf16(units)) => {
                let text = String::from_utf16(units).map_err(|_| {
                    Error::bad_encoding(first_unpaired_surrogate(units), "unpaired surrogate")
                })?;
                Ok(Cow::Owned(text.into_bytes()))
            }
            (TextMode::StringCesu8, HostText::Utf16(units)) => {
                utf16_to_cesu8(units, self.policy).map(Cow::Owned)
            }
            (mode, _) => Err(mode_mismatch(mode)),
        }
    }

    /// Turn engine bytes into a host result.
    pub fn decode<'a>(&self, bytes: &'a [u8], mode: TextMode) -> Result<TextValue<'a>> {
        match mode {
            TextMode::Array => Ok(TextValue::Array(bytes.to_vec())),
            TextMode::Buffer => Ok(TextValue::Buffer(bytes)),
            TextMode::StringCutf8 => utf8_to_utf16(bytes).map(TextValue::String),
            TextMode::StringJutf8 => {
                let text = core::str::from_utf8(bytes)
                    .map_err(|err| Error::bad_encoding(err.valid_up_to(), "invalid utf-8"))?;
                Ok(TextValue::String(text.encode_utf16().collect()))
            }
            TextMode::StringCesu8 => cesu8_to_utf16(bytes).map(TextValue::String),
        }
    }
}

fn mode_mismatch(mode: TextMode) -> Error {
    if mode.is_string() {
        Error::misuse(format!("text mode {:?} expects a host string", mode))
    } else {
        Error::misuse(format!("text mode {:?} expects a byte buffer", mode))
    }
}

fn first_unpaired_surrogate(units: &[u16]) -> usize {
    char::decode_utf16(units.iter().copied())
        .scan(0usize, |offset, item| {
            let at = *offset;
            match item {
                Ok(ch) => {
                    *offset += ch.len_utf16();
                    Some(None)
                }
                Err(_) => Some(Some(at)),
            }
        })
        .flatten()
        .next()
        .unwrap_or(0)
}

const fn is_high_surrogate(unit: u16) -> bool {
    unit & 0xFC00 == 0xD800
}

const fn is_low_surrogate(unit: u16) -> bool {
    unit & 0xFC00 == 0xDC00
}

fn push_utf8(out: &mut Vec<u8>, cp: u32) {
    match cp {
        0..=0x7F => out.push(cp as u8),
        0x80..=0x7FF => {
            out.push(0xC0 | (cp >> 6) as u8);
            out.push(0x80 | (cp & 0x3F) as u8);
        }
        0x800..=0xFFFF => {
            out.push(0xE0 | (cp >> 12) as u8);
            out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
            out.push(0x80 | (cp & 0x3F) as u8);
        }
        _ => {
            out.push(0xF0 | (cp >> 18) as u8);
            out.push(0x80 | ((cp >> 12) & 0x3F) as u8);
            out.push(0x80 | ((cp >> 6) & 0x3F) as u8);
            out.push(0x80 | (cp & 0x3F) as u8);
        }
    }
}

fn push_utf16(out: &mut Vec<u16>, cp: u32) {
    if cp >= 0x10000 {
        let v = cp - 0x10000;
        out.push(0xD800 | (v >> 10) as u16);
        out.push(0xDC00 | (v & 0x3FF) as u16);
    } else {
        out.push(cp as u16);
    }
}

/// Walk UTF-16 units, handing each code point and the number of units it
/// consumed to `emit`. Stops at the first unpaired surrogate.
fn scan_utf16(
    units: &[u16],
    policy: SurrogatePolicy,
    mut emit: impl FnMut(u32, usize),
) -> Result<()> {
    let mut i = 0;
    while i < units.len() {
        let unit = units[i];
        if is_high_surrogate(unit) {
            match units.get(i + 1) {
                Some(&low) if is_low_surrogate(low) => {
                    let cp = (((unit as u32) & 0x3FF) << 10 | ((low as u32) & 0x3FF)) + 0x10000;
                    emit(cp, 2);
                    i += 2;
                    continue;
                }
                _ => return unpaired(i, policy),
            }
        }
        if is_low_surrogate(unit) {
            return unpaired(i, policy);
        }
        emit(unit as u32, 1);
        i += 1;
    }
    Ok(())
}

fn unpaired(offset: usize, policy: SurrogatePolicy) -> Result<()> {
    match policy {
        SurrogatePolicy::Strict => Err(Error::bad_encoding(offset, "unpaired surrogate")),
        SurrogatePolicy::Truncate => Ok(()),
    }
}

/// Encode UTF-16 as UTF-8, combining surrogate pairs.
pub fn utf16_to_utf8(units: &[u16], policy: SurrogatePolicy) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(units.len() * 3);
    scan_utf16(units, policy, |cp, _| push_utf8(&mut out, cp))?;
    Ok(out)
}

/// Encode UTF-16 as CESU-8: every unit, including each surrogate half, is
/// written as its own 1 to 3 byte sequence.
pub fn utf16_to_cesu8(units: &[u16], policy: SurrogatePolicy) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(units.len() * 3);
    scan_utf16(units, policy, |cp, consumed| {
        if consumed == 2 {
            let mut pair = Vec::with_capacity(2);
            push_utf16(&mut pair, cp);
            for unit in pair {
                push_utf8(&mut out, unit as u32);
            }
        } else {
            push_utf8(&mut out, cp);
        }
    })?;
    Ok(out)
}

struct Sequence {
    cp: u32,
    len: usize,
}

fn continuation(bytes: &[u8], at: usize) -> Result<u32> {
    match bytes.get(at) {
        Some(&b) if b & 0xC0 == 0x80 => Ok((b & 0x3F) as u32),
        Some(_) => Err(Error::bad_encoding(at, "invalid continuation byte")),
        None => Err(Error::bad_encoding(at, "truncated sequence")),
    }
}

/// Read one multi-byte sequence starting at `at`; no range checks.
fn read_sequence(bytes: &[u8], at: usize) -> Result<Sequence> {
    let lead = bytes[at];
    let (len, init) = match lead {
        0x00..=0x7F => return Ok(Sequence { cp: lead as u32, len: 1 }),
        0xC0..=0xDF => (2, (lead & 0x1F) as u32),
        0xE0..=0xEF => (3, (lead & 0x0F) as u32),
        0xF0..=0xF7 => (4, (lead & 0x07) as u32),
        _ => return Err(Error::bad_encoding(at, "invalid lead byte")),
    };
    let mut cp = init;
    for k in 1..len {
        cp = (cp << 6) | continuation(bytes, at + k)?;
    }
    Ok(Sequence { cp, len })
}

const fn min_for_len(len: usize) -> u32 {
    match len {
        2 => 0x80,
        3 => 0x800,
        _ => 0x10000,
    }
}

/// Decode strict UTF-8 into UTF-16.
///
/// Rejects bad continuation bytes, truncated and overlong sequences, encoded
/// surrogates and code points above U+10FFFF.
pub fn utf8_to_utf16(bytes: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let seq = read_sequence(bytes, i)?;
        if seq.len > 1 && seq.cp < min_for_len(seq.len) {
            return Err(Error::bad_encoding(i, "overlong sequence"));
        }
        if (0xD800..=0xDFFF).contains(&seq.cp) {
            return Err(Error::bad_encoding(i, "encoded surrogate"));
        }
        if seq.cp > 0x10FFFF {
            return Err(Error::bad_encoding(i, "code point out of range"));
        }
        push_utf16(&mut out, seq.cp);
        i += seq.len;
    }
    Ok(out)
}

/// Decode CESU-8 into UTF-16.
///
/// Surrogate halves arrive as separate 3-byte sequences and must pair up.
/// `C0 80` is accepted for U+0000 and 4-byte UTF-8 sequences are split into
/// surrogate pairs.
pub fn cesu8_to_utf16(bytes: &[u8]) -> Result<Vec<u16>> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut pending_high: Option<usize> = None;
    let mut i = 0;
    while i < bytes.len() {
        let seq = read_sequence(bytes, i)?;
        let overlong = match seq.len {
            2 => seq.cp < 0x80 && !(bytes[i] == 0xC0 && bytes[i + 1] == 0x80),
            3 | 4 => seq.cp < min_for_len(seq.len),
            _ => false,
        };
        if overlong {
            return Err(Error::bad_encoding(i, "overlong sequence"));
        }
        if seq.cp > 0x10FFFF {
            return Err(Error::bad_encoding(i, "code point out of range"));
        }
        let unit_is_low = seq.cp <= 0xFFFF && is_low_surrogate(seq.cp as u16);
        if let Some(at) = pending_high {
            if !unit_is_low {
                return Err(Error::bad_encoding(at, "unpaired surrogate"));
            }
            pending_high = None;
        } else if unit_is_low {
            return Err(Error::bad_encoding(i, "unpaired surrogate"));
        }
        if seq.cp <= 0xFFFF && is_high_surrogate(seq.cp as u16) {
            pending_high = Some(i);
        }
        push_utf16(&mut out, seq.cp);
        i += seq.len;
    }
    match pending_high {
        Some(at) => Err(Error::bad_encoding(at, "unpaired surrogate")),
        None => Ok(out),
    }
}
