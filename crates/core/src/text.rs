use std::borrow::Cow;

use chardetng::EncodingDetector;
use encoding_rs::{Encoding, BIG5, GBK, SHIFT_JIS, WINDOWS_1252};

/// 腳本檔在磁碟上的編碼。 / On-disk encoding of a script file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TextEncoding {
    Utf8 { bom: bool },
    /// Always written with its byte order mark.
    Utf16 { big_endian: bool },
    Legacy(&'static Encoding),
}

impl TextEncoding {
    pub(crate) fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8 { .. } => "utf-8",
            TextEncoding::Utf16 { big_endian: false } => "utf-16le",
            TextEncoding::Utf16 { big_endian: true } => "utf-16be",
            TextEncoding::Legacy(encoding) => encoding.name(),
        }
    }
}

impl Default for TextEncoding {
    fn default() -> Self {
        TextEncoding::Utf8 { bom: false }
    }
}

/// 將腳本檔的位元組解碼為文字。 / Decodes the raw bytes of a script file.
///
/// UTF-8 (with or without BOM) and BOM-marked UTF-16 are accepted first;
/// anything else goes through charset detection restricted to the legacy
/// encodings scripts are realistically saved in. Returns `None` when no
/// candidate decodes cleanly.
pub(crate) fn decode_text(bytes: &[u8]) -> Option<String> {
    decode_with_encoding(bytes).map(|(text, _)| text)
}

/// Like [`decode_text`], also reporting which encoding matched.
pub(crate) fn decode_with_encoding(bytes: &[u8]) -> Option<(String, TextEncoding)> {
    if let Some(rest) = bytes.strip_prefix(b"\xEF\xBB\xBF") {
        let text = String::from_utf8(rest.to_vec()).ok()?;
        return Some((text, TextEncoding::Utf8 { bom: true }));
    }
    for (bom, big_endian) in [(b"\xFF\xFE", false), (b"\xFE\xFF", true)] {
        if let Some(rest) = bytes.strip_prefix(bom) {
            let text = decode_utf16(rest, big_endian)?;
            return Some((text, TextEncoding::Utf16 { big_endian }));
        }
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some((text.to_owned(), TextEncoding::Utf8 { bom: false }));
    }
    let legacy = detect_legacy(bytes)?;
    let (cow, had_errors) = legacy.decode_without_bom_handling(bytes);
    if had_errors {
        return None;
    }
    Some((cow.into_owned(), TextEncoding::Legacy(legacy)))
}

/// 依原編碼寫回；無法表示的字元回傳 `None`。 / Encodes `text` back into `encoding`, `None` when a character has no mapping.
pub(crate) fn encode_text(text: &str, encoding: TextEncoding) -> Option<Vec<u8>> {
    match encoding {
        TextEncoding::Utf8 { bom } => {
            let mut out = Vec::with_capacity(text.len() + 3);
            if bom {
                out.extend_from_slice(b"\xEF\xBB\xBF");
            }
            out.extend_from_slice(text.as_bytes());
            Some(out)
        }
        TextEncoding::Utf16 { big_endian } => {
            let mut out = Vec::with_capacity(text.len() * 2 + 2);
            out.extend_from_slice(if big_endian { b"\xFE\xFF" } else { b"\xFF\xFE" });
            for unit in text.encode_utf16() {
                let pair = if big_endian {
                    unit.to_be_bytes()
                } else {
                    unit.to_le_bytes()
                };
                out.extend_from_slice(&pair);
            }
            Some(out)
        }
        TextEncoding::Legacy(legacy) => {
            let (cow, _, had_errors) = legacy.encode(text);
            if had_errors {
                return None;
            }
            Some(match cow {
                Cow::Borrowed(slice) => slice.to_vec(),
                Cow::Owned(bytes) => bytes,
            })
        }
    }
}

fn decode_utf16(bytes: &[u8], big_endian: bool) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if big_endian {
                u16::from_be_bytes([pair[0], pair[1]])
            } else {
                u16::from_le_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

fn detect_legacy(bytes: &[u8]) -> Option<&'static Encoding> {
    if bytes.is_empty() {
        return None;
    }
    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    let guess = detector.guess(None, true);
    [WINDOWS_1252, SHIFT_JIS, GBK, BIG5]
        .into_iter()
        .find(|candidate| *candidate == guess)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_utf8_passes_through() {
        assert_eq!(decode_text(b"print(1)\n").as_deref(), Some("print(1)\n"));
        assert_eq!(decode_text(b"").as_deref(), Some(""));
    }

    #[test]
    fn utf8_bom_is_stripped_and_remembered() {
        let (text, encoding) = decode_with_encoding(b"\xEF\xBB\xBFx = 1").unwrap();
        assert_eq!(text, "x = 1");
        assert_eq!(encoding, TextEncoding::Utf8 { bom: true });
        assert_eq!(encode_text("y", encoding).unwrap(), b"\xEF\xBB\xBFy");
    }

    #[test]
    fn utf16_le_bom_is_decoded_and_written_back() {
        // BOM 加上 "hi"。 / BOM plus the literal "hi".
        let payload: &[u8] = b"\xFF\xFEh\x00i\x00";
        let (text, encoding) = decode_with_encoding(payload).unwrap();
        assert_eq!(text, "hi");
        assert_eq!(encoding.name(), "utf-16le");
        assert_eq!(encode_text("hi", encoding).unwrap(), payload);
    }

    #[test]
    fn gbk_text_is_detected() {
        let (encoded, _, _) = GBK.encode("中文測試");
        let (text, encoding) = decode_with_encoding(encoded.as_ref()).unwrap();
        assert_eq!(text, "中文測試");
        assert_eq!(encoding, TextEncoding::Legacy(GBK));
    }

    #[test]
    fn legacy_encoding_refuses_unmappable_text() {
        assert!(encode_text("naïve", TextEncoding::Legacy(WINDOWS_1252)).is_some());
        assert!(encode_text("中文", TextEncoding::Legacy(WINDOWS_1252)).is_none());
    }

    #[test]
    fn odd_utf16_payload_is_rejected() {
        assert!(decode_text(b"\xFF\xFEh").is_none());
    }
}
