use cfstore::store::Store;
use cfstore::{StoreConfig, Value, LATEST};

/// cfstore: a per-column-family LSM storage engine
///
/// Demonstrates the basic write/flush/read/compact lifecycle of a single
/// column family store.
fn main() -> std::io::Result<()> {
    env_logger::init();
    println!("cfstore: a per-column-family LSM storage engine");

    let store = Store::open("./data/example_region", "default", StoreConfig::default())
        .expect("failed to open store");

    store.add(b"row1".to_vec(), b"default:col1".to_vec(), 1, Value::put(b"value1".to_vec()));
    store.add(b"row1".to_vec(), b"default:col1".to_vec(), 2, Value::put(b"value2".to_vec()));
    store.add(b"row1".to_vec(), b"default:col2".to_vec(), 1, Value::put(b"value3".to_vec()));

    let latest = store.get(b"row1", b"default:col1", LATEST, 1);
    println!("latest col1 value: {:?}", latest.first().map(|v| v.as_bytes()));

    store.snapshot_memcache();
    let bytes = store.flush_cache(1).expect("flush failed");
    println!("flushed {bytes} bytes to disk");

    store.add(b"row1".to_vec(), b"default:col1".to_vec(), 3, Value::tombstone());
    println!("after delete: {:?}", store.get(b"row1", b"default:col1", LATEST, 5));

    if store.needs_compaction() {
        store.compact(false).expect("compaction failed");
        println!("compacted store files");
    }

    let row = store.get_full(b"row1", LATEST);
    println!("full row: {row:?}");

    println!("cfstore example completed successfully!");
    Ok(())
}
