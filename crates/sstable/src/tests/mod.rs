use codec::{Entry, Value};

mod reader_tests;

/// `n` keys `key00000..`, each with versions at `ts = versions..=1`.
fn sample_entries(n: usize, versions: u64) -> Vec<Entry> {
    let mut out = Vec::new();
    for i in 0..n {
        for ts in (1..=versions).rev() {
            out.push(Entry::new(
                format!("key{:05}", i),
                ts,
                Value::Int((i as i64) * 100 + ts as i64),
            ));
        }
    }
    out
}
