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

use std::fmt;

use libsky::ArgParseError;

#[derive(Debug)]
pub enum CliError {
    Args(String),
    Jio(jiocore::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Args(msg) => write!(f, "{msg}"),
            CliError::Jio(e) => write!(f, "{e}"),
        }
    }
}

impl From<ArgParseError> for CliError {
    fn from(e: ArgParseError) -> Self {
        match e {
            ArgParseError::Duplicate(key) => CliError::Args(format!("argument `{key}` given more than once")),
            ArgParseError::MissingValue(key) => CliError::Args(format!("argument `{key}` is missing a value")),
        }
    }
}

impl From<jiocore::Error> for CliError {
    fn from(e: jiocore::Error) -> Self {
        CliError::Jio(e)
    }
}

pub type CliResult<T> = Result<T, CliError>;
