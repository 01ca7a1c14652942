/*
 * Created on Mon Jul 20 2020
 *
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2020, Sayan Nandan <ohsayan@outlook.com>
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

//! The core library for jio
//!
//! This contains modules which are shared by the `jiofsck` CLI and the `jiocore` engine crate

use std::collections::HashMap;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version_msg(bin_name: &str) -> String {
    format!("{bin_name} version {VERSION}")
}

#[derive(Debug)]
pub enum ArgParseError {
    Duplicate(String),
    MissingValue(String),
}

/// Parses `key=value` and bare positional tokens out of the process argv, rejecting
/// any `key` supplied more than once.
///
/// Recognized as a `key=value` pair whenever the token contains `=`; anything else
/// is collected as a positional argument under the empty-string key.
pub fn parse_args_disallow_duplicate(
    args: impl Iterator<Item = String>,
) -> Result<HashMap<String, Vec<String>>, ArgParseError> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for arg in args {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (String::new(), arg),
        };
        if key.is_empty() {
            map.entry(key).or_default().push(value);
            continue;
        }
        if map.contains_key(&key) {
            return Err(ArgParseError::Duplicate(key));
        }
        map.insert(key, vec![value]);
    }
    Ok(map)
}
