use thiserror::Error;

/// Capacity reserved by the first append.
pub const DEFAULT_CAPACITY: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("failed to grow response buffer to {requested} bytes")]
pub struct BufferError {
    pub requested: usize,
}

/// Append-only byte window with geometric growth and explicit front trimming.
///
/// The buffer never shrinks on its own: `drop_front` shifts the retained tail down to index 0
/// and keeps the allocation, `clear` releases it.
#[derive(Debug, Default)]
pub struct GrowableBuffer {
    data: Vec<u8>,
}

impl GrowableBuffer {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends `bytes`, doubling the capacity (starting at [`DEFAULT_CAPACITY`]) until the new
    /// length fits. Allocation failure is reported instead of aborting.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let needed = self
            .data
            .len()
            .checked_add(bytes.len())
            .ok_or(BufferError {
                requested: usize::MAX,
            })?;
        if needed > self.data.capacity() {
            let mut target = self.data.capacity().max(DEFAULT_CAPACITY);
            while target < needed {
                target = target.checked_mul(2).ok_or(BufferError { requested: needed })?;
            }
            self.data
                .try_reserve_exact(target - self.data.len())
                .map_err(|_| BufferError { requested: target })?;
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Discards the first `n` bytes (clamped to the current length) and returns how many were
    /// removed.
    pub fn drop_front(&mut self, n: usize) -> usize {
        let n = n.min(self.data.len());
        if n > 0 {
            self.data.drain(..n);
        }
        n
    }

    /// Releases all memory and returns the number of bytes that were held.
    pub fn clear(&mut self) -> usize {
        let held = self.data.len();
        self.data = Vec::new();
        held
    }

    pub fn slice(&self, start: usize, len: usize) -> Option<&[u8]> {
        let end = start.checked_add(len)?;
        self.data.get(start..end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_append_reserves_default_capacity() {
        let mut buffer = GrowableBuffer::new();
        assert_eq!(buffer.capacity(), 0);
        buffer.append(b"x").unwrap();
        assert!(buffer.capacity() >= DEFAULT_CAPACITY);
        assert_eq!(buffer.as_slice(), b"x");
    }

    #[test]
    fn growth_doubles_until_append_fits() {
        let mut buffer = GrowableBuffer::new();
        buffer.append(&[1u8; 100]).unwrap();
        buffer.append(&vec![2u8; 9000]).unwrap();
        assert_eq!(buffer.len(), 9100);
        assert!(buffer.capacity() >= 16 * 1024);
        assert_eq!(buffer.as_slice()[99], 1);
        assert_eq!(buffer.as_slice()[100], 2);
    }

    #[test]
    fn drop_front_shifts_tail() {
        let mut buffer = GrowableBuffer::new();
        buffer.append(b"hello world").unwrap();
        let capacity = buffer.capacity();
        assert_eq!(buffer.drop_front(6), 6);
        assert_eq!(buffer.as_slice(), b"world");
        assert_eq!(buffer.capacity(), capacity);
        assert_eq!(buffer.drop_front(0), 0);
        assert_eq!(buffer.drop_front(99), 5);
        assert!(buffer.is_empty());
    }

    #[test]
    fn clear_releases_allocation() {
        let mut buffer = GrowableBuffer::new();
        buffer.append(b"abc").unwrap();
        assert_eq!(buffer.clear(), 3);
        assert_eq!(buffer.capacity(), 0);
        buffer.append(b"de").unwrap();
        assert_eq!(buffer.as_slice(), b"de");
    }

    #[test]
    fn slice_rejects_out_of_range() {
        let mut buffer = GrowableBuffer::new();
        buffer.append(b"abcdef").unwrap();
        assert_eq!(buffer.slice(2, 3), Some(&b"cde"[..]));
        assert_eq!(buffer.slice(4, 3), None);
        assert_eq!(buffer.slice(usize::MAX, 2), None);
    }
}
