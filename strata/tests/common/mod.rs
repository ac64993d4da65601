#![allow(dead_code)]

use std::sync::Arc;

use strata::record::RecordWriter;
use strata::{CacheKind, Engine, EngineConfig};
use substrate::{CacheConfig, EvictionPolicy};

/// An in-memory engine with the given cache geometry.
pub fn engine(capacity: usize, policy: EvictionPolicy) -> Engine {
    Engine::open(EngineConfig {
        cache: CacheKind::Buffered(CacheConfig { capacity, policy }),
        ..EngineConfig::default()
    })
    .expect("engine assembles")
}

/// Fills `table` with one `(i32)` record per value, in the given order.
pub fn fill_ints(engine: &Engine, table: &str, values: &[i32]) {
    engine.tables().create_table(table).unwrap();
    let mut appender = engine.tables().appender(table).unwrap();
    for &value in values {
        let mut writer = RecordWriter::new();
        writer.put_i32(value);
        appender.append(&writer.finish()).unwrap();
    }
}

/// Fills `table` with `(i32, string)` records.
pub fn fill_int_strings(engine: &Engine, table: &str, rows: impl Iterator<Item = (i32, String)>) {
    engine.tables().create_table(table).unwrap();
    let mut appender = engine.tables().appender(table).unwrap();
    for (number, text) in rows {
        let mut writer = RecordWriter::new();
        writer.put_i32(number).put_str(&text);
        appender.append(&writer.finish()).unwrap();
    }
}

/// The deterministic flight/ticket fixture. `scale` controls row counts;
/// ticket numbers deliberately run past the flight range so both matched
/// and unmatched rows exist on each side.
pub struct Fixture {
    pub flights: Vec<(i32, i32, i32)>,
    pub tickets: Vec<(i32, String, f64)>,
}

pub fn fixture(scale: i32) -> Fixture {
    let flight_count = 40 * scale;
    let ticket_count = 100 * scale;
    let flights = (0..flight_count)
        .map(|num| (num, num % 9, (num * 13) % 7))
        .collect();
    let tickets = (0..ticket_count)
        .map(|i| {
            let num = (i * 7) % (flight_count + flight_count / 4);
            (num, format!("pax-{i}"), 10.0 + (i % 90) as f64)
        })
        .collect();
    Fixture { flights, tickets }
}

pub fn load_fixture(engine: &Engine, fixture: &Fixture) {
    engine.tables().create_table("flight").unwrap();
    let mut appender = engine.tables().appender("flight").unwrap();
    for &(num, planet, craft) in &fixture.flights {
        let mut writer = RecordWriter::new();
        writer.put_i32(num).put_i32(planet).put_i32(craft);
        appender.append(&writer.finish()).unwrap();
    }

    engine.tables().create_table("ticket").unwrap();
    let mut appender = engine.tables().appender("ticket").unwrap();
    for (num, pax, price) in &fixture.tickets {
        let mut writer = RecordWriter::new();
        writer.put_i32(*num).put_str(pax).put_f64(*price);
        appender.append(&writer.finish()).unwrap();
    }
}

/// Shared key extractor: the leading i32 of a record.
pub fn leading_int() -> Arc<strata::sort::KeyFn<i32>> {
    Arc::new(|bytes: &[u8]| strata::record::RecordReader::new(bytes).get_i32())
}
