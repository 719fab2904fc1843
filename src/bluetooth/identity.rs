// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-width identity record carried in the advertised local name.
//!
//! Layout: `short_tag`[4] `object_ref`[6] `owner_ref`[6] `display_name`[..].
//! Field widths are the only framing; there are no delimiters and no
//! terminator. Widths count characters, not bytes.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ble_constants::fields::{
    HEADER_WIDTH, OBJECT_REF_WIDTH, OWNER_REF_WIDTH, SHORT_TAG_WIDTH,
};

/// Identity announced by a discoverable device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub short_tag: String,
    pub object_ref: String,
    pub owner_ref: String,
    pub display_name: String,
}

impl IdentityRecord {
    pub fn new(
        short_tag: impl Into<String>,
        object_ref: impl Into<String>,
        owner_ref: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            short_tag: short_tag.into(),
            object_ref: object_ref.into(),
            owner_ref: owner_ref.into(),
            display_name: display_name.into(),
        }
    }

    /// True when every fixed field has exactly its wire width, so the record
    /// survives an encode/decode round trip unchanged.
    pub fn is_well_formed(&self) -> bool {
        self.short_tag.chars().count() == SHORT_TAG_WIDTH
            && self.object_ref.chars().count() == OBJECT_REF_WIDTH
            && self.owner_ref.chars().count() == OWNER_REF_WIDTH
    }

    /// Pack into an announcement string.
    pub fn encode(&self) -> String {
        encode(self)
    }
}

/// Pack a record into an announcement string.
///
/// Fixed fields are space-padded or truncated to their width.
pub fn encode(record: &IdentityRecord) -> String {
    let mut out = String::with_capacity(HEADER_WIDTH + record.display_name.len());
    push_fixed(&mut out, &record.short_tag, SHORT_TAG_WIDTH);
    push_fixed(&mut out, &record.object_ref, OBJECT_REF_WIDTH);
    push_fixed(&mut out, &record.owner_ref, OWNER_REF_WIDTH);
    out.push_str(&record.display_name);
    out
}

/// Unpack an announcement string.
///
/// Returns `None` for anything shorter than the fixed header. Content is not
/// validated: any string long enough decodes, whatever its characters.
pub fn decode(announcement: &str) -> Option<IdentityRecord> {
    let Some((short_tag, rest)) = split_chars(announcement, SHORT_TAG_WIDTH) else {
        debug!("Announcement too short: {:?}", announcement);
        return None;
    };
    let (object_ref, rest) = split_chars(rest, OBJECT_REF_WIDTH)?;
    let Some((owner_ref, display_name)) = split_chars(rest, OWNER_REF_WIDTH) else {
        debug!("Announcement too short: {:?}", announcement);
        return None;
    };

    Some(IdentityRecord {
        short_tag: short_tag.to_string(),
        object_ref: object_ref.to_string(),
        owner_ref: owner_ref.to_string(),
        display_name: display_name.to_string(),
    })
}

fn push_fixed(out: &mut String, value: &str, width: usize) {
    let mut written = 0;
    for c in value.chars().take(width) {
        out.push(c);
        written += 1;
    }
    for _ in written..width {
        out.push(' ');
    }
}

/// Split after `n` characters, or `None` if `s` is shorter.
fn split_chars(s: &str, n: usize) -> Option<(&str, &str)> {
    let idx = s
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(s.len()))
        .nth(n)?;
    Some(s.split_at(idx))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_reference_announcement() {
        let record = decode("1234dscd34hskad7Alice").unwrap();
        assert_eq!(record.short_tag, "1234");
        assert_eq!(record.object_ref, "dscd34");
        assert_eq!(record.owner_ref, "hskad7");
        assert_eq!(record.display_name, "Alice");
    }

    #[test]
    fn test_roundtrip() {
        let record = IdentityRecord::new("1234", "dscd34", "hskad7", "UserA1B2C3");
        assert!(record.is_well_formed());
        assert_eq!(decode(&record.encode()), Some(record));
    }

    #[test]
    fn test_roundtrip_empty_display_name() {
        let record = IdentityRecord::new("abcd", "efghij", "klmnop", "");
        let encoded = record.encode();
        assert_eq!(encoded.len(), 16);
        assert_eq!(decode(&encoded), Some(record));
    }

    #[test]
    fn test_short_input_rejected() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("1234"), None);
        assert_eq!(decode("1234dscd34hskad"), None);
        for len in 0..16 {
            let s: String = "x".repeat(len);
            assert!(decode(&s).is_none(), "length {} should not decode", len);
        }
    }

    #[test]
    fn test_exact_header_decodes() {
        let record = decode("1234dscd34hskad7").unwrap();
        assert_eq!(record.owner_ref, "hskad7");
        assert_eq!(record.display_name, "");
    }

    #[test]
    fn test_garbage_content_still_decodes() {
        let record = decode("\u{1}\u{2}\u{3}\u{4}!!!!!!??????~").unwrap();
        assert_eq!(record.short_tag, "\u{1}\u{2}\u{3}\u{4}");
        assert_eq!(record.display_name, "~");
    }

    #[test]
    fn test_widths_count_characters() {
        let record = decode("ÄÖÜß123456abcdefJosé").unwrap();
        assert_eq!(record.short_tag, "ÄÖÜß");
        assert_eq!(record.object_ref, "123456");
        assert_eq!(record.owner_ref, "abcdef");
        assert_eq!(record.display_name, "José");
    }

    #[test]
    fn test_encode_pads_and_truncates() {
        let record = IdentityRecord::new("12", "toolongvalue", "owner1", "Bob");
        assert!(!record.is_well_formed());
        assert_eq!(record.encode(), "12  toolonowner1Bob");
    }
}
