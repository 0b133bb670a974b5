//! Drives a [`Heap`] through a fixed menu of allocation patterns.
//!
//! ```text
//! cargo run --example scenarios            # every scenario
//! cargo run --example scenarios -- -t 4    # only "small malloc"
//! ```
//!
//! Set `RUST_LOG=blockheap=debug` to watch splits and merges.

use std::{env, process::ExitCode, ptr::NonNull, slice};

use blockheap::{Heap, HeapError};
use rand::Rng;

type Scenario = fn(&mut Heap) -> Result<(), String>;

static SCENARIOS: [(&str, Scenario); 9] = [
    ("basic malloc", simple_allocation),
    ("basic realloc", realloc),
    ("rerun malloc", multiple_allocations),
    ("small malloc", small_allocations),
    ("large malloc", large_allocations),
    ("same size malloc", same_size_allocations),
    ("malloc interleaved & freed", interleaved),
    ("memory pattern", memory_pattern),
    ("random malloc & free", random_allocations),
];

fn allocate(heap: &mut Heap, size: usize) -> Result<NonNull<u8>, String> {
    match heap.allocate(size) {
        Ok(Some(ptr)) => Ok(ptr),
        Ok(None) => Err(format!("allocate({size}) gave no pointer")),
        Err(err) => Err(err.to_string()),
    }
}

/// # Safety
///
/// `ptr` must be a live allocation of at least `len` bytes, not aliased for
/// as long as the slice is used.
unsafe fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a mut [u8] {
    unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), len) }
}

fn release_all(heap: &mut Heap, pointers: &[NonNull<u8>]) -> Result<(), HeapError> {
    pointers.iter().try_for_each(|ptr| heap.release(Some(*ptr)))
}

fn simple_allocation(heap: &mut Heap) -> Result<(), String> {
    let ptr = allocate(heap, 15)?;
    let text = unsafe { bytes(ptr, 15) };
    text.copy_from_slice(b"test my string\0");
    println!("{}", String::from_utf8_lossy(&text[..14]));

    heap.release(Some(ptr)).map_err(|err| err.to_string())
}

fn realloc(heap: &mut Heap) -> Result<(), String> {
    let ptr = allocate(heap, 10)?;
    let text = unsafe { bytes(ptr, 7) };
    text.copy_from_slice(b"testing");
    println!("{}", String::from_utf8_lossy(text));

    let ptr = match heap.resize(Some(ptr), 20) {
        Ok(Some(ptr)) => ptr,
        Ok(None) => return Err("resize gave no pointer".to_string()),
        Err(err) => {
            let _ = heap.release(Some(ptr));
            return Err(err.to_string());
        }
    };
    let text = unsafe { bytes(ptr, 14) };
    text[7..].copy_from_slice(b" string");
    println!("{}", String::from_utf8_lossy(text));

    if text != b"testing string" {
        return Err("content lost while resizing".to_string());
    }
    heap.release(Some(ptr)).map_err(|err| err.to_string())
}

fn multiple_allocations(heap: &mut Heap) -> Result<(), String> {
    let ptr = allocate(heap, 5 * size_of::<i32>())?;
    let numbers = unsafe { slice::from_raw_parts_mut(ptr.as_ptr().cast::<i32>(), 5) };

    for (i, number) in numbers.iter_mut().enumerate() {
        *number = (i * i) as i32;
    }
    let line: Vec<_> = numbers.iter().map(i32::to_string).collect();
    println!("{}", line.join(" "));

    heap.release(Some(ptr)).map_err(|err| err.to_string())
}

fn repeated(heap: &mut Heap, count: usize, size: usize, fill: impl Fn(usize) -> u8) -> Result<(), String> {
    let mut pointers = Vec::with_capacity(count);

    for i in 0..count {
        match allocate(heap, size) {
            Ok(ptr) => {
                unsafe { bytes(ptr, size).fill(fill(i)) };
                pointers.push(ptr);
            }
            Err(err) => {
                let _ = release_all(heap, &pointers);
                return Err(err);
            }
        }
    }

    release_all(heap, &pointers).map_err(|err| err.to_string())
}

fn small_allocations(heap: &mut Heap) -> Result<(), String> {
    repeated(heap, 64, 16, |i| b'A' + (i % 26) as u8)
}

fn large_allocations(heap: &mut Heap) -> Result<(), String> {
    let len = 512 * 1024 / size_of::<i32>();
    let ptr = allocate(heap, 512 * 1024)?;
    let numbers = unsafe { slice::from_raw_parts_mut(ptr.as_ptr().cast::<i32>(), len) };

    for (i, number) in numbers.iter_mut().enumerate() {
        *number = i as i32;
    }

    heap.release(Some(ptr)).map_err(|err| err.to_string())
}

fn same_size_allocations(heap: &mut Heap) -> Result<(), String> {
    repeated(heap, 50, 128, |i| i as u8)
}

fn interleaved(heap: &mut Heap) -> Result<(), String> {
    let mut pointers = Vec::with_capacity(10);
    for i in 0..10 {
        let ptr = allocate(heap, 64)?;
        unsafe { bytes(ptr, 64).fill(i) };
        pointers.push(ptr);
    }

    for ptr in pointers.iter().step_by(2) {
        heap.release(Some(*ptr)).map_err(|err| err.to_string())?;
    }
    for i in 0..5 {
        let ptr = allocate(heap, 64)?;
        unsafe { bytes(ptr, 64).fill(i as u8 + 10) };
        pointers[2 * i] = ptr;
    }

    release_all(heap, &pointers).map_err(|err| err.to_string())
}

fn memory_pattern(heap: &mut Heap) -> Result<(), String> {
    let ptr = allocate(heap, 1024)?;
    let data = unsafe { bytes(ptr, 1024) };

    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (i % 256) as u8;
    }
    let mismatch = (0..data.len()).find(|&i| data[i] != (i % 256) as u8);

    heap.release(Some(ptr)).map_err(|err| err.to_string())?;

    match mismatch {
        Some(i) => Err(format!("mismatch at index {i}")),
        None => Ok(()),
    }
}

fn random_allocations(heap: &mut Heap) -> Result<(), String> {
    let mut rng = rand::rng();
    let mut pointers: Vec<NonNull<u8>> = Vec::with_capacity(1000);

    for _ in 0..1000 {
        if rng.random_bool(0.5) {
            let size = rng.random_range(1..=256);
            match heap.allocate(size) {
                Ok(Some(ptr)) => {
                    unsafe { bytes(ptr, size).fill(rng.random()) };
                    pointers.push(ptr);
                }
                _ => println!("failed"),
            }
        } else if !pointers.is_empty() {
            let ptr = pointers.swap_remove(rng.random_range(0..pointers.len()));
            heap.release(Some(ptr)).map_err(|err| err.to_string())?;
        }
    }

    release_all(heap, &pointers).map_err(|err| err.to_string())
}

fn usage(program: &str) {
    println!("Usage: {program} [-t test_number]");
    println!("Test Numbers:");
    for (number, (name, _)) in SCENARIOS.iter().enumerate() {
        println!("  {}: {name}", number + 1);
    }
}

fn run(heap: &mut Heap, (name, scenario): &(&str, Scenario)) -> bool {
    println!("{name}:");
    let outcome = scenario(heap).and_then(|()| heap.check_invariants().map_err(|err| err.to_string()));

    match outcome {
        Ok(()) => {
            println!("passed\n|/|/|/|/|/|/|/|/|/|/|/|/|/|\n");
            true
        }
        Err(err) => {
            println!("failed: {err}\n");
            false
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = args.first().map_or("scenarios", String::as_str);

    let mut heap = match Heap::from_env() {
        Ok(heap) => heap,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let selected: Vec<_> = match args.as_slice() {
        [_] => SCENARIOS.iter().collect(),
        [_, flag, number] if flag == "-t" => {
            match number.parse::<usize>().ok().and_then(|n| n.checked_sub(1)).and_then(|n| SCENARIOS.get(n)) {
                Some(scenario) => vec![scenario],
                None => {
                    println!("Invalid test number");
                    usage(program);
                    return ExitCode::FAILURE;
                }
            }
        }
        _ => {
            usage(program);
            return ExitCode::FAILURE;
        }
    };

    let failures = selected.into_iter().filter(|scenario| !run(&mut heap, scenario)).count();

    if failures == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
