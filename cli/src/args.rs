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

use std::env;
use std::path::PathBuf;

use libsky::parse_args_disallow_duplicate;

use crate::error::{CliError, CliResult};

const HELP: &str = "\
jiofsck: check and repair a jio journal directory after an unclean shutdown

USAGE:
    jiofsck [clean=1] [dir=DIR] FILE

ARGS:
    FILE           path to the main file whose journal should be checked

OPTIONS:
    clean=1        remove the journal directory once every record has been classified
    dir=DIR        use DIR as the journal directory instead of the default sibling location
    -h, --help     print this message
    -v, --version  print version information
";

pub enum Task {
    Message(String),
    Check(CheckArgs),
}

pub struct CheckArgs {
    pub file: PathBuf,
    pub dir: Option<PathBuf>,
    pub cleanup: bool,
}

pub fn parse() -> CliResult<Task> {
    let raw: Vec<String> = env::args().skip(1).collect();
    if raw.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(Task::Message(HELP.to_string()));
    }
    if raw.iter().any(|a| a == "-v" || a == "--version") {
        return Ok(Task::Message(libsky::version_msg("jiofsck")));
    }

    let mut args = parse_args_disallow_duplicate(raw.into_iter())?;

    let positional = args.remove("").unwrap_or_default();
    if positional.len() != 1 {
        return Err(CliError::Args(format!(
            "expected exactly one FILE argument, got {}",
            positional.len()
        )));
    }
    let file = PathBuf::from(&positional[0]);

    let cleanup = match args.remove("clean").map(|v| v.into_iter().next().unwrap()) {
        Some(v) => parse_bool_flag("clean", &v)?,
        None => false,
    };
    let dir = args.remove("dir").map(|v| PathBuf::from(v.into_iter().next().unwrap()));

    if let Some(key) = args.into_keys().next() {
        return Err(CliError::Args(format!("unknown argument `{key}`")));
    }

    Ok(Task::Check(CheckArgs { file, dir, cleanup }))
}

fn parse_bool_flag(name: &str, value: &str) -> CliResult<bool> {
    match value {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        other => Err(CliError::Args(format!("invalid value `{other}` for {name}"))),
    }
}
