//! Byte channel between host strings and a program's linear memory.
//!
//! Messages travel as `(address, count)` pairs. Host-to-program text always
//! lands at offset 0, the scratch buffer the evaluator reads its input from.

use wasmtime::{AsContext, AsContextMut, Memory};

use crate::RuntimeError;

/// Offset of the scratch buffer used for evaluator input.
pub const SCRATCH_OFFSET: usize = 0;

/// Write `text` as UTF-8 at the scratch offset, returning the byte length.
///
/// Memory is left untouched if the text does not fit.
pub fn write(
    memory: &Memory,
    mut store: impl AsContextMut,
    text: &str,
) -> Result<usize, RuntimeError> {
    let bytes = text.as_bytes();
    check_bounds(memory, &store, SCRATCH_OFFSET as u64, bytes.len() as u64)?;
    memory.data_mut(store.as_context_mut())[SCRATCH_OFFSET..SCRATCH_OFFSET + bytes.len()]
        .copy_from_slice(bytes);
    Ok(bytes.len())
}

/// Decode `count` bytes at `address` as UTF-8.
///
/// Invalid sequences decode to U+FFFD.
pub fn read(
    memory: &Memory,
    store: impl AsContext,
    address: u64,
    count: u64,
) -> Result<String, RuntimeError> {
    let range = check_bounds(memory, &store, address, count)?;
    Ok(String::from_utf8_lossy(&memory.data(store.as_context())[range]).into_owned())
}

/// Copy `count` raw bytes at `address` out of memory.
pub fn read_bytes(
    memory: &Memory,
    store: impl AsContext,
    address: u64,
    count: u64,
) -> Result<Vec<u8>, RuntimeError> {
    let range = check_bounds(memory, &store, address, count)?;
    Ok(memory.data(store.as_context())[range].to_vec())
}

/// Interpret a wasm `(i32, i32)` pair as an unsigned address range.
pub fn wasm_range(address: i32, count: i32) -> (u64, u64) {
    (address as u32 as u64, count as u32 as u64)
}

/// Check if an access is within bounds.
fn check_bounds(
    memory: &Memory,
    store: impl AsContext,
    address: u64,
    count: u64,
) -> Result<core::ops::Range<usize>, RuntimeError> {
    let memory_size = memory.data_size(&store);
    let out_of_bounds = RuntimeError::OutOfBounds {
        address,
        count,
        memory_size,
    };

    let end = address.checked_add(count).ok_or(out_of_bounds.clone())?;
    if end > memory_size as u64 {
        return Err(out_of_bounds);
    }

    Ok(address as usize..end as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, MemoryType, Store};

    fn one_page() -> (Store<()>, Memory) {
        let mut store = Store::new(&Engine::default(), ());
        let memory = Memory::new(&mut store, MemoryType::new(1, None)).unwrap();
        (store, memory)
    }

    #[test]
    fn test_write_then_read() {
        let (mut store, memory) = one_page();
        let len = write(&memory, &mut store, "(conj [] 7)").unwrap();
        assert_eq!(len, 11);
        assert_eq!(read(&memory, &store, 0, len as u64).unwrap(), "(conj [] 7)");
    }

    #[test]
    fn test_write_overwrites_from_zero() {
        let (mut store, memory) = one_page();
        write(&memory, &mut store, "longer message").unwrap();
        let len = write(&memory, &mut store, "short").unwrap();
        assert_eq!(read(&memory, &store, 0, len as u64).unwrap(), "short");
    }

    #[test]
    fn test_write_too_large_leaves_memory_unchanged() {
        let (mut store, memory) = one_page();
        write(&memory, &mut store, "keep").unwrap();
        let huge = "x".repeat(65537);
        let result = write(&memory, &mut store, &huge);
        assert!(matches!(result, Err(RuntimeError::OutOfBounds { .. })));
        assert_eq!(read(&memory, &store, 0, 4).unwrap(), "keep");
    }

    #[test]
    fn test_read_past_end() {
        let (store, memory) = one_page();
        let result = read(&memory, &store, 65530, 7);
        assert_eq!(
            result,
            Err(RuntimeError::OutOfBounds {
                address: 65530,
                count: 7,
                memory_size: 65536,
            })
        );
    }

    #[test]
    fn test_read_at_exact_end_is_empty() {
        let (store, memory) = one_page();
        assert_eq!(read(&memory, &store, 65536, 0).unwrap(), "");
    }

    #[test]
    fn test_address_overflow() {
        let (store, memory) = one_page();
        let result = read_bytes(&memory, &store, u64::MAX, 2);
        assert!(matches!(result, Err(RuntimeError::OutOfBounds { .. })));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let (mut store, memory) = one_page();
        memory.data_mut(&mut store)[..2].copy_from_slice(&[0x61, 0xFF]);
        assert_eq!(read(&memory, &store, 0, 2).unwrap(), "a\u{FFFD}");
    }

    #[test]
    fn test_wasm_range_is_unsigned() {
        assert_eq!(wasm_range(-1, 4), (u32::MAX as u64, 4));
    }
}
