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

//! `jiofsck`: the command-line recovery tool for a `jio`-managed file.

macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!($($arg)*);
        std::process::exit(0x01);
    }}
}

mod args;
mod error;

use std::env;

use args::Task;
use jiocore::fsck::{self, FsckOptions};

fn main() {
    env_logger::Builder::new().parse_filters(&env::var("JIO_LOG").unwrap_or_else(|_| "warn".to_owned())).init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => fatal!("jiofsck: {e}"),
    }
}

fn run() -> error::CliResult<i32> {
    match args::parse()? {
        Task::Message(msg) => {
            println!("{msg}");
            Ok(0)
        }
        Task::Check(check) => {
            let options = FsckOptions { journal_dir: check.dir, cleanup: check.cleanup };
            let result = fsck::fsck(&check.file, &options)?;

            println!("total:       {}", result.total);
            println!("invalid:     {}", result.invalid);
            println!("in_progress: {}", result.in_progress);
            println!("broken:      {}", result.broken);
            println!("corrupt:     {}", result.corrupt);
            println!("apply_error: {}", result.apply_error);
            println!("reapplied:   {}", result.reapplied);

            let clean = result.broken == 0 && result.corrupt == 0 && result.apply_error == 0;
            Ok(if clean { 0 } else { 1 })
        }
    }
}
