use anyhow::{anyhow, Result};
use ropey::Rope;
use serde::{Deserialize, Serialize};
use std::cmp;

pub const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
pub const UTF16_LE_BOM: &[u8] = &[0xFF, 0xFE];
pub const UTF16_BE_BOM: &[u8] = &[0xFE, 0xFF];

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CharacterEncoding {
    #[default]
    Utf8,
    Utf8WithBom,
    Utf16Le,
    Utf16Be,
}

impl CharacterEncoding {
    /// Sniffs a byte-order mark. Returns `None` for content with no BOM,
    /// which callers should treat as plain UTF-8 or whatever encoding they
    /// were configured with.
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(UTF8_BOM) {
            Some(Self::Utf8WithBom)
        } else if bytes.starts_with(UTF16_LE_BOM) {
            Some(Self::Utf16Le)
        } else if bytes.starts_with(UTF16_BE_BOM) {
            Some(Self::Utf16Be)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Utf8WithBom => "utf-8 with bom",
            Self::Utf16Le => "utf-16 le",
            Self::Utf16Be => "utf-16 be",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineEnding {
    Unix,
    Windows,
}

impl Default for LineEnding {
    fn default() -> Self {
        #[cfg(unix)]
        return Self::Unix;
        #[cfg(not(unix))]
        return Self::Windows;
    }
}

impl LineEnding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unix => "\n",
            Self::Windows => "\r\n",
        }
    }

    /// Guesses the dominant line ending from the first kilobyte of text.
    pub fn detect(text: &str) -> Self {
        let mut max_ix = cmp::min(text.len(), 1000);
        while !text.is_char_boundary(max_ix) {
            max_ix -= 1;
        }
        if let Some(ix) = text[..max_ix].find('\n') {
            if ix > 0 && text.as_bytes()[ix - 1] == b'\r' {
                Self::Windows
            } else {
                Self::Unix
            }
        } else {
            Self::default()
        }
    }

    pub fn normalize(text: &mut String) {
        if text.contains('\r') {
            *text = text.replace("\r\n", "\n").replace('\r', "\n");
        }
    }
}

pub fn decode(bytes: &[u8], encoding: CharacterEncoding) -> Result<String> {
    match encoding {
        CharacterEncoding::Utf8 | CharacterEncoding::Utf8WithBom => {
            let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
            Ok(std::str::from_utf8(bytes)?.to_string())
        }
        CharacterEncoding::Utf16Le => decode_utf16(bytes, UTF16_LE_BOM, u16::from_le_bytes),
        CharacterEncoding::Utf16Be => decode_utf16(bytes, UTF16_BE_BOM, u16::from_be_bytes),
    }
}

fn decode_utf16(bytes: &[u8], bom: &[u8], to_unit: fn([u8; 2]) -> u16) -> Result<String> {
    let bytes = bytes.strip_prefix(bom).unwrap_or(bytes);
    if bytes.len() % 2 != 0 {
        return Err(anyhow!("utf-16 content has an odd number of bytes"));
    }
    let units = bytes
        .chunks_exact(2)
        .map(|pair| to_unit([pair[0], pair[1]]))
        .collect::<Vec<_>>();
    Ok(String::from_utf16(&units)?)
}

pub fn encode(text: &Rope, encoding: CharacterEncoding, line_ending: LineEnding) -> Vec<u8> {
    match encoding {
        CharacterEncoding::Utf8 | CharacterEncoding::Utf8WithBom => {
            let mut bytes = Vec::with_capacity(text.len_bytes() + UTF8_BOM.len());
            if encoding == CharacterEncoding::Utf8WithBom {
                bytes.extend_from_slice(UTF8_BOM);
            }
            for chunk in chunks(text, line_ending) {
                bytes.extend_from_slice(chunk.as_bytes());
            }
            bytes
        }
        CharacterEncoding::Utf16Le => encode_utf16(text, line_ending, u16::to_le_bytes),
        CharacterEncoding::Utf16Be => encode_utf16(text, line_ending, u16::to_be_bytes),
    }
}

fn encode_utf16(text: &Rope, line_ending: LineEnding, unit_bytes: fn(u16) -> [u8; 2]) -> Vec<u8> {
    // UTF-16 output always leads with a BOM; without one, readers can't
    // tell the endianness apart.
    let mut bytes = Vec::with_capacity(2 * text.len_chars() + 2);
    bytes.extend_from_slice(&unit_bytes(0xFEFF));
    for chunk in chunks(text, line_ending) {
        for unit in chunk.encode_utf16() {
            bytes.extend_from_slice(&unit_bytes(unit));
        }
    }
    bytes
}

fn chunks(rope: &Rope, line_ending: LineEnding) -> impl Iterator<Item = &str> {
    rope.chunks().flat_map(move |chunk| {
        let mut newline = false;
        chunk.split('\n').flat_map(move |line| {
            let ending = if newline {
                Some(line_ending.as_str())
            } else {
                None
            };
            newline = true;
            ending.into_iter().chain([line])
        })
    })
}
