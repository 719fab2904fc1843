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

//! Configuration management.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluetooth::ble_constants::{config as ble_config, fields};
use crate::bluetooth::IdentityRecord;

/// `User` plus six hex characters of a fresh UUID.
fn generated_display_name() -> String {
    let raw = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("User{}", &raw[..6])
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity we advertise.
    pub identity: IdentityConfig,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Four-character tag.
    pub short_tag: String,

    /// Six-character object reference.
    pub object_ref: String,

    /// Six-character owner reference. Peers are deduplicated on this.
    pub owner_ref: String,

    /// Free-form name shown to other devices.
    pub display_name: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            short_tag: "1234".to_string(),
            object_ref: "dscd34".to_string(),
            owner_ref: "hskad7".to_string(),
            display_name: generated_display_name(),
        }
    }
}

impl IdentityConfig {
    pub fn to_record(&self) -> IdentityRecord {
        IdentityRecord::new(
            self.short_tag.clone(),
            self.object_ref.clone(),
            self.owner_ref.clone(),
            self.display_name.clone(),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Bytes per chunk on the transfer characteristic.
    pub chunk_size: usize,

    /// Start scanning as soon as the daemon is up.
    pub scan_on_start: bool,

    /// Start advertising as soon as the daemon is up.
    pub advertise_on_start: bool,

    /// Subscribe to a peer's notifications right after connecting.
    pub auto_subscribe: bool,

    /// Report repeated advertisements from the same device.
    pub allow_duplicates: bool,

    /// Capacity of the broadcast channel for node events.
    pub event_capacity: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            chunk_size: ble_config::DEFAULT_CHUNK_SIZE,
            scan_on_start: true,
            advertise_on_start: true,
            auto_subscribe: true,
            allow_duplicates: false,
            event_capacity: 64,
        }
    }
}

impl Config {
    /// Default location: `<config dir>/infoshare/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("infoshare")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, writing the defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save_to(path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bluetooth.chunk_size == 0 {
            bail!("bluetooth.chunk_size must be positive");
        }
        if self.bluetooth.event_capacity == 0 {
            bail!("bluetooth.event_capacity must be positive");
        }
        let identity = &self.identity;
        for (name, value, width) in [
            ("short_tag", &identity.short_tag, fields::SHORT_TAG_WIDTH),
            ("object_ref", &identity.object_ref, fields::OBJECT_REF_WIDTH),
            ("owner_ref", &identity.owner_ref, fields::OWNER_REF_WIDTH),
        ] {
            if value.chars().count() != width {
                bail!("identity.{} must be {} characters, got {:?}", name, width, value);
            }
        }
        Ok(())
    }
}
