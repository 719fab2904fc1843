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

//! Errors surfaced to callers of the link layer.
//!
//! Undecodable announcements, advertising on a radio that is not ready and
//! rejected chunk pushes are handled locally and never show up here.

use super::registry::PeerId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    /// The radio reported that the connection attempt failed.
    #[error("connection rejected: {cause}")]
    ConnectRejected { cause: String },

    /// The caller's deadline expired before the radio answered.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("a connect is already pending for this peer")]
    AlreadyConnecting,

    #[error("a disconnect is already pending for this peer")]
    AlreadyDisconnecting,

    #[error("unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("peer is not connected: {0}")]
    NotConnected(PeerId),

    #[error("not advertising")]
    NotAdvertising,

    /// The manager task has stopped.
    #[error("link manager closed")]
    Closed,
}
