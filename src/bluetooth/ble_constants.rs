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

//! BLE service and characteristic UUIDs and wire constants.

use uuid::Uuid;

/// Data sharing GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_1234_56789abcdef0);

/// Transfer characteristic UUID.
/// Properties: Notify, Write, Write Without Response
pub const TRANSFER_CHAR_UUID: Uuid = Uuid::from_u128(0xa1b2c3d4_e5f6_7890_1234_56789abcdef1);

/// End-of-message marker sent after the last data chunk.
pub const EOM_MARKER: &[u8; 3] = b"EOM";

/// Announcement field widths, in characters.
pub mod fields {
    pub const SHORT_TAG_WIDTH: usize = 4;
    pub const OBJECT_REF_WIDTH: usize = 6;
    pub const OWNER_REF_WIDTH: usize = 6;

    /// Fixed header length preceding the display name.
    pub const HEADER_WIDTH: usize = SHORT_TAG_WIDTH + OBJECT_REF_WIDTH + OWNER_REF_WIDTH;
}

/// BLE configuration constants.
pub mod config {
    /// Chunk size that fits inside one notification on the links we target.
    pub const DEFAULT_CHUNK_SIZE: usize = 182;

    /// Notifications queued towards the radio before a push is rejected.
    pub const NOTIFY_QUEUE_DEPTH: usize = 16;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string().to_lowercase(),
            "a1b2c3d4-e5f6-7890-1234-56789abcdef0"
        );
        assert_eq!(
            TRANSFER_CHAR_UUID.to_string().to_lowercase(),
            "a1b2c3d4-e5f6-7890-1234-56789abcdef1"
        );
    }

    #[test]
    fn test_header_width() {
        assert_eq!(fields::HEADER_WIDTH, 16);
        assert_eq!(EOM_MARKER.len(), 3);
    }
}
