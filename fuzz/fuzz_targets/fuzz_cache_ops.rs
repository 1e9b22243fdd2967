#![no_main]
use assetheap::{Cache, CacheConfig, CacheKey, EntryHandle, FnSource, SourceError};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};

#[derive(Debug, Arbitrary)]
enum CacheOp {
    Lock(u8),
    Unlock(u8),
    Flush,
}

// Random lock/unlock/flush traffic must keep the size bound and the heap valid
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<CacheOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let source = FnSource::new(
        |key: CacheKey| -> Result<usize, SourceError> { Ok((key as usize * 37) % 900) },
        |key: CacheKey, buf: &mut [u8]| -> Result<usize, SourceError> {
            buf.fill(key as u8);
            Ok(buf.len())
        },
    );
    let mut cache = match Cache::new(CacheConfig::with_max_size(4096), source) {
        Ok(cache) => cache,
        Err(_) => return,
    };
    let mut pins: Vec<EntryHandle> = Vec::new();

    for op in ops.iter().take(256) {
        match *op {
            CacheOp::Lock(key) => {
                if let Ok(handle) = cache.lock(key as CacheKey % 32) {
                    pins.push(handle);
                }
            }
            CacheOp::Unlock(i) if !pins.is_empty() => {
                let handle = pins.swap_remove(i as usize % pins.len());
                assert!(cache.unlock(handle).is_ok());
            }
            CacheOp::Flush => {
                cache.flush();
            }
            _ => {}
        }

        assert!(cache.total_size() <= 4096);
        assert!(cache.heap().validate().is_ok());
    }
});
