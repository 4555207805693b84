//! On-disk round-trip tests: commit, reopen, and verify.

use tempfile::tempdir;
use terndb_core::{ColumnSpec, Db, DbConfig, TableType, Value, Version};

fn open(path: &std::path::Path) -> Db {
    Db::open(
        path,
        DbConfig {
            sync_to_disk: false,
        },
    )
    .unwrap()
}

#[test]
fn commit_and_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("reopen.terndb");

    let keys = {
        let db = open(&path);
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("T", TableType::TopLevel).unwrap();
        let col = txn.add_column(table.key(), ColumnSpec::int("v")).unwrap();
        let first = txn.create_object(table.key()).unwrap();
        let second = txn.create_object(table.key()).unwrap();
        txn.set_value(table.key(), first.key(), col, Value::Int(1))
            .unwrap();
        txn.set_value(table.key(), second.key(), col, Value::Int(2))
            .unwrap();
        txn.commit().unwrap();
        (first.key(), second.key())
    };

    let db = open(&path);
    assert_eq!(db.latest_version(), Version::new(1));
    let mut read = db.begin_read().unwrap();
    let table = read.table("T").unwrap();
    let col = table.column(&mut read, "v").unwrap();

    assert_eq!(read.object_count(table.key()).unwrap(), 2);
    assert_eq!(read.object_keys(table.key()).unwrap(), vec![keys.0, keys.1]);
    assert_eq!(
        read.get_value(table.key(), keys.0, col).unwrap(),
        Value::Int(1)
    );
    assert_eq!(
        read.get_value(table.key(), keys.1, col).unwrap(),
        Value::Int(2)
    );
}

#[test]
fn reopen_after_many_commits() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("many.terndb");

    {
        let db = open(&path);
        for batch in 0..10 {
            let mut txn = db.begin_write().unwrap();
            let table = txn.get_or_add_table("events", TableType::TopLevel).unwrap();
            if batch == 0 {
                txn.add_column(table.key(), ColumnSpec::string("tag"))
                    .unwrap();
            }
            let col = txn
                .spec(table.key())
                .unwrap()
                .column_by_name("tag")
                .unwrap();
            for i in 0..100 {
                let obj = txn.create_object(table.key()).unwrap();
                txn.set_value(
                    table.key(),
                    obj.key(),
                    col,
                    Value::from(format!("tag-{batch}-{i}").as_str()),
                )
                .unwrap();
            }
            txn.commit().unwrap();
        }
    }

    let db = open(&path);
    assert_eq!(db.latest_version(), Version::new(10));
    let mut read = db.begin_read().unwrap();
    let table = read.table("events").unwrap();
    let col = table.column(&mut read, "tag").unwrap();
    assert_eq!(read.object_count(table.key()).unwrap(), 1000);

    let last = *read.object_keys(table.key()).unwrap().last().unwrap();
    assert_eq!(
        read.get_value(table.key(), last, col).unwrap(),
        Value::from("tag-9-99")
    );
}

#[test]
fn file_magic_is_stable() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("magic.terndb");
    {
        let db = open(&path);
        let txn = db.begin_write().unwrap();
        txn.commit().unwrap();
    }
    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[0..4], b"T-DB");
}

#[test]
fn history_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("hist.terndb");
    {
        let db = open(&path);
        let mut txn = db.begin_write().unwrap();
        let table = txn.add_table("t", TableType::TopLevel).unwrap();
        txn.create_object(table.key()).unwrap();
        txn.commit().unwrap();
    }
    let db = open(&path);
    let entries = db.history_entries(Version::new(0), Version::new(1));
    assert_eq!(entries.len(), 1);
    assert!(entries[0].is_local());
    assert!(!entries[0].changeset.is_empty());
}

#[test]
fn links_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("links.terndb");

    {
        let db = open(&path);
        let mut txn = db.begin_write().unwrap();
        let child = txn.add_table("C", TableType::TopLevel).unwrap();
        let parent = txn.add_table("P", TableType::TopLevel).unwrap();
        let col = txn
            .add_column(parent.key(), ColumnSpec::link("child", child.key()).strong())
            .unwrap();
        let c = txn.create_object(child.key()).unwrap();
        let p = txn.create_object(parent.key()).unwrap();
        txn.set_value(parent.key(), p.key(), col, Value::Link(c.key()))
            .unwrap();
        txn.commit().unwrap();
    }

    let db = open(&path);
    let mut txn = db.begin_write().unwrap();
    let parent = txn.table("P").unwrap();
    let child = txn.table("C").unwrap();
    let keys = txn.object_keys(parent.key()).unwrap();

    // The backlink structure survived: cascade still works.
    txn.erase_object(parent.key(), keys[0]).unwrap();
    assert_eq!(txn.object_count(child.key()).unwrap(), 0);
}
