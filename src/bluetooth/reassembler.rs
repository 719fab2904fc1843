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

//! BLE packet reassembly logic.
//!
//! Packets carry raw payload bytes with no header. A packet equal to the EOM
//! marker ends the message. Payload bytes are never scanned for the marker,
//! so a data chunk that is exactly `EOM` ends the message early; producers
//! must not emit such a chunk.

use tracing::{debug, warn};

use super::ble_constants::EOM_MARKER;

/// Accumulates packets until an end-of-message marker arrives.
pub struct MessageReassembler {
    buffer: Vec<u8>,
}

impl MessageReassembler {
    /// Create a new message reassembler.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
        }
    }

    /// Process an incoming BLE packet.
    ///
    /// Returns `Some(complete_message)` when an EOM marker closes a non-empty
    /// message, otherwise returns `None`.
    pub fn process_packet(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet == EOM_MARKER.as_slice() {
            if self.buffer.is_empty() {
                warn!("EOM received with nothing accumulated, ignoring");
                return None;
            }
            debug!("Message reassembly complete: {} bytes", self.buffer.len());
            return Some(std::mem::take(&mut self.buffer));
        }

        self.buffer.extend_from_slice(packet);
        None
    }

    /// Drop any partial message.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Check if reassembly is in progress.
    pub fn is_in_progress(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Get current buffer size.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for MessageReassembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_chunks_then_eom() {
        let mut reassembler = MessageReassembler::new();

        assert!(reassembler.process_packet(b"AB").is_none());
        assert!(reassembler.is_in_progress());
        assert!(reassembler.process_packet(b"CD").is_none());
        assert_eq!(reassembler.buffer_size(), 4);

        let result = reassembler.process_packet(b"EOM");
        assert_eq!(result, Some(b"ABCD".to_vec()));
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_stray_eom_is_ignored() {
        let mut reassembler = MessageReassembler::new();
        assert!(reassembler.process_packet(b"EOM").is_none());
        assert!(!reassembler.is_in_progress());
    }

    #[test]
    fn test_duplicate_eom_delivers_once() {
        let mut reassembler = MessageReassembler::new();
        reassembler.process_packet(b"hello");
        assert_eq!(reassembler.process_packet(b"EOM"), Some(b"hello".to_vec()));
        assert!(reassembler.process_packet(b"EOM").is_none());
    }

    #[test]
    fn test_marker_inside_chunk_is_data() {
        let mut reassembler = MessageReassembler::new();
        assert!(reassembler.process_packet(b"xEOMx").is_none());
        assert!(reassembler.process_packet(b"EO").is_none());
        assert_eq!(
            reassembler.process_packet(b"EOM"),
            Some(b"xEOMxEO".to_vec())
        );
    }

    #[test]
    fn test_back_to_back_messages() {
        let mut reassembler = MessageReassembler::new();
        reassembler.process_packet(b"one");
        assert_eq!(reassembler.process_packet(b"EOM"), Some(b"one".to_vec()));
        reassembler.process_packet(b"two");
        assert_eq!(reassembler.process_packet(b"EOM"), Some(b"two".to_vec()));
    }

    #[test]
    fn test_reset_drops_partial() {
        let mut reassembler = MessageReassembler::new();
        reassembler.process_packet(b"partial");
        reassembler.reset();
        assert!(reassembler.process_packet(b"EOM").is_none());
    }
}
