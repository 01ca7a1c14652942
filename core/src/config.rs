/*
 * This file is a part of jio
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! Ambient session configuration.
//!
//! Grounded on `engine/config.rs`'s `Configuration` struct in the teacher
//! codebase, at a fraction of the size: there is no cluster/auth/endpoint
//! surface here, only the handful of constants a file session needs and
//! that the original C library hardcoded (journal directory suffix,
//! per-transaction size ceiling, autosync defaults).

use serde::{Deserialize, Serialize};

/// Maximum bytes of write-operation payload a single transaction may carry.
/// The original library bounds this by `SSIZE_MAX`; we pick a concrete,
/// documented ceiling instead of relying on `isize::MAX` as a magic number.
pub const DEFAULT_MAX_TRANS_SIZE: u64 = 2 * 1024 * 1024 * 1024 - 1;

/// Default autosync period, in seconds, used when a caller starts autosync
/// without specifying one.
pub const DEFAULT_AUTOSYNC_MAX_SECS: u64 = 5;

/// Default autosync byte budget used when a caller starts autosync without
/// specifying one.
pub const DEFAULT_AUTOSYNC_MAX_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `{name}` is substituted with the target file's base name; the journal
    /// directory is created as a sibling of the target file.
    pub journal_dir_pattern: String,
    /// Per-transaction write-size ceiling, in bytes.
    pub max_trans_size: u64,
    /// Autosync defaults applied when a caller doesn't specify its own.
    pub autosync_max_secs: u64,
    pub autosync_max_bytes: u64,
    /// When true, a directory that doesn't support `fsync` is a hard error
    /// instead of falling back to a process-wide `sync()` with a one-time
    /// warning. Intended for test harnesses that want to catch the fallback
    /// path rather than silently take it.
    pub strict_directory_fsync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_dir_pattern: ".{name}.jio".to_string(),
            max_trans_size: DEFAULT_MAX_TRANS_SIZE,
            autosync_max_secs: DEFAULT_AUTOSYNC_MAX_SECS,
            autosync_max_bytes: DEFAULT_AUTOSYNC_MAX_BYTES,
            strict_directory_fsync: false,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, falling back to defaults for
    /// any field the file doesn't set. Missing file is not an error: the
    /// caller gets `Config::default()`.
    pub fn load_or_default(path: &std::path::Path) -> crate::error::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw).map_err(|e| {
                crate::error::Error::with_context(
                    crate::error::ErrorKind::Resource,
                    format!("failed to parse config at {}: {e}", path.display()),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolves the journal directory path for a given target file path.
    pub fn journal_dir_for(&self, target: &std::path::Path) -> std::path::PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dirname = self.journal_dir_pattern.replace("{name}", &name);
        match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(dirname),
            _ => std::path::PathBuf::from(dirname),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_journal_dir_matches_sibling_convention() {
        let cfg = Config::default();
        let dir = cfg.journal_dir_for(std::path::Path::new("/tmp/data.db"));
        assert_eq!(dir, std::path::PathBuf::from("/tmp/.data.db.jio"));
    }

    #[test]
    fn missing_config_file_yields_defaults() {
        let cfg = Config::load_or_default(std::path::Path::new(
            "/nonexistent/path/to/jio-config.yaml",
        ))
        .unwrap();
        assert_eq!(cfg.max_trans_size, DEFAULT_MAX_TRANS_SIZE);
    }
}
