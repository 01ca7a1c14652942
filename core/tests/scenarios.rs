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

//! End-to-end scenarios against real temp files, through the public API
//! only. Each test corresponds to one numbered scenario from the design
//! notes: fresh-file commit, commit-then-rollback, concurrent disjoint
//! writers, crash recovery of a stranded record, corruption detection, and
//! lingering-mode drain on sync.

use std::thread;

use rand::{thread_rng, Rng};

use jiocore::codec::{self, Checksum, Header, OpHeader, Trailer};
use jiocore::session::OpenFlags;
use jiocore::{Config, Session, Transaction};

fn open_rw(path: &std::path::Path) -> Session {
    Session::open(path, true, true, 0o600, OpenFlags::default()).unwrap()
}

#[test]
fn fresh_file_commit_is_readable_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let session = open_rw(&path);

    let mut txn = Transaction::new(&session, 0);
    txn.add_w(b"first chunk", 0).unwrap();
    txn.add_w(b"second", 32).unwrap();
    txn.commit().unwrap();
    session.close().unwrap();

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(&contents[..11], b"first chunk");
    assert_eq!(&contents[32..38], b"second");
}

#[test]
fn committed_transaction_can_be_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let session = open_rw(&path);
    std::fs::write(&path, b"0000000000").unwrap();

    let mut txn = Transaction::new(&session, 0);
    txn.add_w(b"AAAA", 0).unwrap();
    txn.commit().unwrap();
    assert_eq!(&std::fs::read(&path).unwrap()[..4], b"AAAA");

    txn.rollback().unwrap();
    assert_eq!(&std::fs::read(&path).unwrap()[..4], b"0000");

    session.close().unwrap();
}

#[test]
fn concurrent_disjoint_range_commits_all_land() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let session = open_rw(&path);
    session.inner().main_file().set_len(4096).unwrap();

    let handles: Vec<_> = (0..8u64)
        .map(|i| {
            let session = session.clone();
            thread::spawn(move || {
                let offset = i * 512;
                let buf = vec![b'A' + i as u8; 512];
                let mut txn = Transaction::new(&session, 0);
                txn.add_w(&buf, offset).unwrap();
                txn.commit().unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let contents = std::fs::read(&path).unwrap();
    for i in 0..8u64 {
        let offset = (i * 512) as usize;
        assert!(contents[offset..offset + 512].iter().all(|&b| b == b'A' + i as u8));
    }

    session.close().unwrap();
}

#[test]
fn fsck_reapplies_a_record_stranded_before_the_main_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    std::fs::write(&path, []).unwrap();

    let config = Config::default();
    let jdir = config.journal_dir_for(&path);
    std::fs::create_dir_all(&jdir).unwrap();
    std::fs::write(jdir.join("lock"), 0u32.to_ne_bytes()).unwrap();
    std::fs::write(jdir.join("1"), build_record(1, b"stranded", 0)).unwrap();

    let result = jiocore::fsck(&path, &jiocore::FsckOptions { journal_dir: None, cleanup: true }).unwrap();
    assert_eq!(result.total, 1);
    assert_eq!(result.reapplied, 1);
    assert_eq!(&std::fs::read(&path).unwrap()[..8], b"stranded");
    assert!(!jdir.exists());
}

#[test]
fn fsck_flags_a_single_flipped_byte_as_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    std::fs::write(&path, []).unwrap();

    let config = Config::default();
    let jdir = config.journal_dir_for(&path);
    std::fs::create_dir_all(&jdir).unwrap();
    std::fs::write(jdir.join("lock"), 0u32.to_ne_bytes()).unwrap();

    let mut record = build_record(1, b"payload!", 0);
    let last = record.len() - 1;
    record[last] ^= 0xFF;
    std::fs::write(jdir.join("1"), &record).unwrap();

    let result = jiocore::fsck(&path, &jiocore::FsckOptions { journal_dir: None, cleanup: false }).unwrap();
    assert_eq!(result.corrupt, 1);
    assert_eq!(result.reapplied, 0);
    assert_eq!(std::fs::read(&path).unwrap().len(), 0);
}

#[test]
fn lingering_transactions_drain_on_sync() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let session = Session::open(&path, true, true, 0o600, OpenFlags { linger: true, ..Default::default() }).unwrap();

    const N: u64 = 1000;
    for i in 0..N {
        let mut txn = Transaction::new(&session, 0);
        txn.add_w(&i.to_be_bytes(), i * 8).unwrap();
        txn.commit().unwrap();
    }

    let jdir = Config::default().journal_dir_for(&path);
    let lingering_before =
        std::fs::read_dir(&jdir).unwrap().filter(|e| e.as_ref().unwrap().file_name() != "lock").count();
    assert!(lingering_before > 0, "expected lingering records to accumulate before sync");

    session.sync().unwrap();

    let lingering_after =
        std::fs::read_dir(&jdir).unwrap().filter(|e| e.as_ref().unwrap().file_name() != "lock").count();
    assert_eq!(lingering_after, 0);

    for i in 0..N {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&std::fs::read(&path).unwrap()[(i * 8) as usize..(i * 8 + 8) as usize]);
        assert_eq!(u64::from_be_bytes(buf), i);
    }

    session.close().unwrap();
}

#[test]
fn random_offset_length_writes_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data.db");
    let session = open_rw(&path);
    let mut rng = thread_rng();

    let mut expected = Vec::new();
    let mut offset = 0u64;
    for _ in 0..64 {
        let len = rng.gen_range(1..=256usize);
        let buf: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

        let mut txn = Transaction::new(&session, 0);
        txn.add_w(&buf, offset).unwrap();
        txn.commit().unwrap();

        expected.push((offset, buf));
        offset += len as u64;
    }

    let contents = std::fs::read(&path).unwrap();
    for (offset, buf) in &expected {
        let at = *offset as usize;
        assert_eq!(&contents[at..at + buf.len()], buf.as_slice());
    }

    session.close().unwrap();
}

fn build_record(trans_id: u32, payload: &[u8], offset: u64) -> Vec<u8> {
    let mut record = Vec::new();
    record.extend_from_slice(&Header { version: codec::VERSION, flags: 0, trans_id }.encode());

    let mut csum = Checksum::new();
    csum.update(&record);

    let op = OpHeader { len: payload.len() as u32, offset };
    let op_enc = op.encode();
    csum.update(&op_enc);
    csum.update(payload);
    record.extend_from_slice(&op_enc);
    record.extend_from_slice(payload);

    let sentinel = OpHeader::SENTINEL.encode();
    csum.update(&sentinel);
    record.extend_from_slice(&sentinel);

    record.extend_from_slice(&Trailer { numops: 1, checksum: csum.finish() }.encode());
    record
}
