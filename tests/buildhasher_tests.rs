use std::hash::{BuildHasher, Hasher};
use std::sync::Arc;
use std::thread;

use weaktable_rs::WeakTable;

// Custom hasher for testing
#[derive(Default, Clone)]
struct TestHasher {
    value: u64,
}

impl Hasher for TestHasher {
    fn finish(&self) -> u64 {
        self.value
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.value = self.value.wrapping_mul(31).wrapping_add(byte as u64);
        }
    }
}

#[derive(Default, Clone)]
struct TestBuildHasher;

impl BuildHasher for TestBuildHasher {
    type Hasher = TestHasher;

    fn build_hasher(&self) -> Self::Hasher {
        TestHasher::default()
    }
}

// Sends every key to the same bucket
#[derive(Default, Clone)]
struct CollidingHasher;

impl Hasher for CollidingHasher {
    fn finish(&self) -> u64 {
        7
    }

    fn write(&mut self, _bytes: &[u8]) {}
}

#[derive(Default, Clone)]
struct CollidingBuildHasher;

impl BuildHasher for CollidingBuildHasher {
    type Hasher = CollidingHasher;

    fn build_hasher(&self) -> Self::Hasher {
        CollidingHasher
    }
}

#[test]
fn test_with_hasher() {
    let t: WeakTable<String, i32, TestBuildHasher> = WeakTable::with_hasher(TestBuildHasher);
    let k1 = Arc::new("key1".to_string());
    let k2 = Arc::new("key2".to_string());

    t.try_add(&k1, 100).unwrap();
    t.try_add(&k2, 200).unwrap();

    assert_eq!(t.get(&k1), Some(100));
    assert_eq!(t.get(&k2), Some(200));
    assert_eq!(t.len(), 2);
}

#[test]
fn test_with_capacity_and_hasher() {
    let t: WeakTable<String, i32, TestBuildHasher> =
        WeakTable::with_capacity_and_hasher(100, TestBuildHasher);
    assert_eq!(t.capacity(), 128);

    let k = Arc::new("test".to_string());
    t.try_add(&k, 42).unwrap();
    assert_eq!(t.get(&k), Some(42));
}

#[test]
fn test_default_trait() {
    let t1: WeakTable<String, i32> = WeakTable::default();
    let k = Arc::new("test".to_string());
    t1.try_add(&k, 42).unwrap();
    assert_eq!(t1.get(&k), Some(42));

    let t2: WeakTable<String, i32, TestBuildHasher> = WeakTable::default();
    t2.try_add(&k, 43).unwrap();
    assert_eq!(t2.get(&k), Some(43));
}

#[test]
fn test_colliding_keys_share_one_chain() {
    let t: WeakTable<u32, u32, CollidingBuildHasher> = WeakTable::with_hasher(CollidingBuildHasher);
    let keys: Vec<Arc<u32>> = (0..50).map(Arc::new).collect();
    for k in &keys {
        assert_eq!(t.try_add(k, **k + 1), Ok(true));
    }

    for k in keys.iter().step_by(2) {
        assert_eq!(t.remove(k), Ok(true));
    }

    for (i, k) in keys.iter().enumerate() {
        let expected = if i % 2 == 0 { None } else { Some(**k + 1) };
        assert_eq!(t.get(k), expected);
    }
    assert_eq!(t.iter().count(), 25);
}

#[test]
fn test_extend_with_custom_hasher() {
    let mut t: WeakTable<String, i32, TestBuildHasher> = WeakTable::with_hasher(TestBuildHasher);
    let initial = Arc::new("initial".to_string());
    t.try_add(&initial, 0).unwrap();

    let k1 = Arc::new("key1".to_string());
    let k2 = Arc::new("key2".to_string());
    t.extend(vec![(k1.clone(), 1), (k2.clone(), 2), (initial.clone(), 9)]);

    assert_eq!(t.len(), 3);
    assert_eq!(t.get(&initial), Some(0));
    assert_eq!(t.get(&k1), Some(1));
    assert_eq!(t.get(&k2), Some(2));
}

#[test]
fn test_concurrent_operations() {
    let t: Arc<WeakTable<i32, String, TestBuildHasher>> =
        Arc::new(WeakTable::with_hasher(TestBuildHasher));

    let mut handles = vec![];
    for i in 0..10 {
        let table = Arc::clone(&t);
        handles.push(thread::spawn(move || {
            let mut keys = Vec::new();
            for j in 0..10 {
                let key = Arc::new(i * 10 + j);
                table.try_add(&key, format!("value_{}", key)).unwrap();
                keys.push(key);
            }
            keys
        }));
    }

    let keys: Vec<Arc<i32>> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(t.len(), 100);
    for k in &keys {
        assert_eq!(t.get(k), Some(format!("value_{}", k)));
    }
}
