#![no_main]
use assetheap::{Heap, HeapHandle};
use libfuzzer_sys::{arbitrary::{Arbitrary, Unstructured}, fuzz_target};

#[derive(Debug, Arbitrary)]
enum HeapOp {
    Allocate { size: u16, fallback: bool },
    Lock(u8),
    Unlock(u8),
    Deallocate(u8),
    Write(u8, u8),
}

// Arbitrary operation sequences must never panic or leave the heap inconsistent
fuzz_target!(|input: &[u8]| {
    let mut u = Unstructured::new(input);

    let ops: Vec<HeapOp> = match u.arbitrary() {
        Ok(ops) => ops,
        Err(_) => return,
    };

    let mut heap = match Heap::new(16 * 1024) {
        Ok(heap) => heap,
        Err(_) => return,
    };
    let mut handles: Vec<HeapHandle> = Vec::new();

    for op in ops.iter().take(256) {
        match *op {
            HeapOp::Allocate { size, fallback } => {
                if let Ok(handle) = heap.allocate(size as usize, fallback) {
                    handles.push(handle);
                }
            }
            HeapOp::Lock(i) if !handles.is_empty() => {
                let _ = heap.lock(handles[i as usize % handles.len()]);
            }
            HeapOp::Unlock(i) if !handles.is_empty() => {
                let _ = heap.unlock(handles[i as usize % handles.len()]);
            }
            HeapOp::Deallocate(i) if !handles.is_empty() => {
                let index = i as usize % handles.len();
                if heap.deallocate(handles[index]).is_ok() {
                    handles.swap_remove(index);
                }
            }
            HeapOp::Write(i, byte) if !handles.is_empty() => {
                if let Ok(data) = heap.data_mut(handles[i as usize % handles.len()]) {
                    data.fill(byte);
                }
            }
            _ => {}
        }

        assert!(heap.validate().is_ok());
    }
});
