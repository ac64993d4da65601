//! Transactions driven through the relational layer: the intercepting cache
//! wrapper carries full table access, so aborts must roll whole table
//! mutations back.

mod common;

use std::sync::Arc;

use strata::access::Tables;
use strata::record::{RecordReader, RecordWriter};
use substrate::transaction::TransactionCache;
use substrate::{EvictionPolicy, PageStore, StoreError};

use common::{engine, fill_ints};

fn scan_ints(tables: &Tables, name: &str) -> Vec<i32> {
    tables
        .scan_parsed(name, |bytes| RecordReader::new(bytes).get_i32())
        .unwrap()
        .map(|record| record.unwrap())
        .collect()
}

/// Table access bound to a transaction's cache wrapper.
fn transactional_tables(txc: &Arc<TransactionCache>) -> Tables {
    let cache: Arc<dyn PageStore> = txc.clone();
    Tables::open(cache).unwrap()
}

#[test]
fn aborted_append_is_invisible_to_later_readers() {
    let engine = engine(16, EvictionPolicy::Clock);
    fill_ints(&engine, "ledger", &[1, 2, 3]);

    let result = engine.transactions().execute(|txc| {
        let tables = transactional_tables(txc);
        let mut appender = tables.appender("ledger").expect("ledger exists");
        let mut writer = RecordWriter::new();
        writer.put_i32(99);
        appender.append(&writer.finish()).expect("append succeeds");
        Err::<(), _>(StoreError::Wal("forced failure".to_string()))
    });
    assert!(matches!(result, Err(StoreError::TransactionAborted { .. })));
    assert_eq!(scan_ints(engine.tables(), "ledger"), vec![1, 2, 3]);
}

#[test]
fn committed_table_mutations_are_visible() {
    let engine = engine(16, EvictionPolicy::Clock);
    fill_ints(&engine, "ledger", &[1, 2, 3]);

    let txc = engine.transactions().begin();
    {
        let tables = transactional_tables(&txc);
        let mut appender = tables.appender("ledger").unwrap();
        let mut writer = RecordWriter::new();
        writer.put_i32(4);
        appender.append(&writer.finish()).unwrap();
    }
    engine.transactions().commit(&txc).unwrap();

    assert_eq!(scan_ints(engine.tables(), "ledger"), vec![1, 2, 3, 4]);
}

#[test]
fn aborted_record_overwrite_restores_the_page_bytes() {
    let engine = engine(16, EvictionPolicy::Clock);
    fill_ints(&engine, "cells", &[10, 20, 30]);

    let txc = engine.transactions().begin();
    {
        let tables = transactional_tables(&txc);
        let pages = tables.pages_of("cells").unwrap();
        let mut handle = tables.cache().get_and_pin(pages[0]).unwrap();
        let mut guard = handle.write().unwrap();
        let mut page =
            substrate::SlottedPage::new(&mut guard[..], substrate::page::BASE_HEADER);
        let updated = {
            let mut writer = RecordWriter::new();
            writer.put_i32(42);
            writer.finish()
        };
        assert!(matches!(
            page.put_record(&updated, 0),
            substrate::PutResult::Ok(0)
        ));
    }
    engine.transactions().abort(&txc).unwrap();

    assert_eq!(scan_ints(engine.tables(), "cells"), vec![10, 20, 30]);
}
