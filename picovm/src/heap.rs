//! Bucket-chain heap.
//!
//! The heap is a list of host-allocated buckets. Allocation bumps in the
//! tail bucket; when it is full a new bucket is appended. Heap offsets are
//! dense: a bucket starts at the previous bucket's start plus its *used*
//! bytes, so concatenating the used parts of all buckets yields exactly the
//! heap section of a snapshot and a short pointer is resolved by a binary
//! search over bucket starts.
//!
//! The heap itself knows nothing about roots. Collection is driven by the
//! VM (see `gc.rs`), which builds a fresh `Heap` and drops the old one.
use crate::header::{Header, footprint};
use crate::value::{HeapPtr, TypeCode, Value};

/// Short pointers are 16-bit, so the heap can never grow past this.
pub const MAX_HEAP_LIMIT: usize = 0xFFFE;

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Capacity of a newly requested bucket, unless the allocation that
    /// triggered it needs more.
    pub bucket_size: usize,
    /// Hard limit on the dense heap size in bytes. Reaching it triggers a
    /// collection, failing after the collection is out-of-memory.
    pub max_heap_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            bucket_size: 256,
            max_heap_size: 0x8000, // 32 KB
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.bucket_size == 0 || self.max_heap_size == 0 {
            return Err("sizes must be > 0");
        }
        if self.bucket_size % 2 != 0 {
            return Err("bucket_size must be even");
        }
        if self.max_heap_size > MAX_HEAP_LIMIT {
            return Err("max_heap_size exceeds the 16-bit pointer range");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Bucket {
    /// Heap offset of `data[0]`.
    offset_start: usize,
    data: Vec<u8>,
    used: usize,
}

impl Bucket {
    fn with_capacity(offset_start: usize, capacity: usize) -> Self {
        Self {
            offset_start,
            data: vec![0; capacity],
            used: 0,
        }
    }

    #[inline]
    fn free(&self) -> usize {
        self.data.len() - self.used
    }
}

#[derive(Debug)]
pub struct Heap {
    buckets: Vec<Bucket>,
    settings: HeapSettings,
    high_water_mark: usize,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            buckets: Vec::new(),
            settings,
            high_water_mark: 0,
        }
    }

    /// A heap whose first bucket has exactly `capacity` bytes. Used by the
    /// squeezing collector once it knows the live size.
    pub fn with_first_bucket(settings: HeapSettings, capacity: usize) -> Self {
        let mut heap = Self::new(settings);
        if capacity > 0 {
            heap.buckets.push(Bucket::with_capacity(0, capacity));
        }
        heap
    }

    /// A heap holding a copy of an image heap section, which is laid out
    /// exactly like the dense runtime heap.
    pub fn from_image_section(bytes: &[u8], settings: HeapSettings) -> Self {
        let mut heap = Self::new(settings);
        if !bytes.is_empty() {
            let capacity = bytes.len().max(heap.settings.bucket_size);
            let mut bucket = Bucket::with_capacity(0, capacity);
            bucket.data[..bytes.len()].copy_from_slice(bytes);
            bucket.used = bytes.len();
            heap.buckets.push(bucket);
        }
        heap.high_water_mark = bytes.len();
        heap
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// Dense size of the heap: all used bytes of all buckets.
    #[inline]
    pub fn used(&self) -> usize {
        self.buckets
            .last()
            .map_or(0, |bucket| bucket.offset_start + bucket.used)
    }

    /// Bytes requested from the host, including unused bucket tails.
    pub fn capacity(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.data.len()).sum()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Bump-allocate a zeroed body of `size` bytes. Returns `None` when the
    /// heap limit would be exceeded; the caller decides whether to collect.
    pub fn allocate(&mut self, size: usize, type_code: TypeCode) -> Option<HeapPtr> {
        debug_assert!(size <= crate::header::MAX_ALLOCATION_SIZE);
        let need = footprint(size);

        let fits = self.buckets.last().is_some_and(|bucket| bucket.free() >= need);
        if !fits {
            // An empty tail bucket would share its start with the new one.
            if self.buckets.last().is_some_and(|bucket| bucket.used == 0) {
                self.buckets.pop();
            }
            let start = self.used();
            let remaining = self.settings.max_heap_size.saturating_sub(start);
            if need > remaining {
                return None;
            }
            let capacity = self.settings.bucket_size.max(need).min(remaining);
            log::trace!("heap: new bucket at {start:#06x}, {capacity} bytes");
            self.buckets.push(Bucket::with_capacity(start, capacity));
        }

        let bucket = self.buckets.last_mut()?;
        let local = bucket.used;
        let header = Header::new(type_code, size);
        bucket.data[local..local + 2].copy_from_slice(&header.0.to_le_bytes());
        bucket.used += need;
        let ptr = bucket.offset_start + local + 2;

        let used = bucket.offset_start + bucket.used;
        self.high_water_mark = self.high_water_mark.max(used);
        Some(HeapPtr(ptr as u16))
    }

    #[inline]
    fn locate(&self, offset: usize) -> (usize, usize) {
        let index = self
            .buckets
            .partition_point(|bucket| bucket.offset_start <= offset)
            .saturating_sub(1);
        (index, offset - self.buckets[index].offset_start)
    }

    #[inline]
    fn read_u16_at(&self, offset: usize) -> u16 {
        let (index, local) = self.locate(offset);
        let data = &self.buckets[index].data;
        u16::from_le_bytes([data[local], data[local + 1]])
    }

    #[inline]
    fn write_u16_at(&mut self, offset: usize, value: u16) {
        let (index, local) = self.locate(offset);
        self.buckets[index].data[local..local + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Whether `ptr` lies inside the used part of the heap. Does not check
    /// that it names an allocation body.
    pub fn in_bounds(&self, ptr: HeapPtr) -> bool {
        let offset = ptr.0 as usize;
        offset >= 2 && offset % 2 == 0 && offset < self.used()
    }

    #[inline]
    pub fn header(&self, ptr: HeapPtr) -> Header {
        Header(self.read_u16_at(ptr.0 as usize - 2))
    }

    #[inline]
    pub fn set_header(&mut self, ptr: HeapPtr, header: Header) {
        self.write_u16_at(ptr.0 as usize - 2, header.0);
    }

    /// Body bytes of an allocation. An allocation never spans buckets.
    pub fn body(&self, ptr: HeapPtr) -> &[u8] {
        let size = self.header(ptr).size();
        let (index, local) = self.locate(ptr.0 as usize);
        &self.buckets[index].data[local..local + size]
    }

    pub fn body_mut(&mut self, ptr: HeapPtr) -> &mut [u8] {
        let size = self.header(ptr).size();
        let (index, local) = self.locate(ptr.0 as usize);
        &mut self.buckets[index].data[local..local + size]
    }

    #[inline]
    pub fn slot_count(&self, ptr: HeapPtr) -> usize {
        self.header(ptr).size() / 2
    }

    #[inline]
    pub fn slot(&self, ptr: HeapPtr, index: usize) -> Value {
        Value::decode(self.read_u16_at(ptr.0 as usize + index * 2))
    }

    #[inline]
    pub fn set_slot(&mut self, ptr: HeapPtr, index: usize, value: Value) {
        self.write_u16_at(ptr.0 as usize + index * 2, value.encode());
    }

    /// Allocation starting at dense offset `cursor` (its header), if any.
    /// Returns the allocation and the cursor of the next one.
    pub fn allocation_at(&self, cursor: usize) -> Option<(HeapPtr, Header, usize)> {
        if cursor + 2 > self.used() {
            return None;
        }
        let header = Header(self.read_u16_at(cursor));
        Some((HeapPtr((cursor + 2) as u16), header, cursor + header.footprint()))
    }

    /// Iterate all allocations in address order.
    pub fn walk(&self) -> HeapWalk<'_> {
        HeapWalk {
            heap: self,
            cursor: 0,
        }
    }

    /// The dense heap as it appears in an image heap section.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.used());
        for bucket in &self.buckets {
            out.extend_from_slice(&bucket.data[..bucket.used]);
        }
        out
    }
}

pub struct HeapWalk<'h> {
    heap: &'h Heap,
    cursor: usize,
}

impl Iterator for HeapWalk<'_> {
    type Item = (HeapPtr, Header);

    fn next(&mut self) -> Option<Self::Item> {
        let (ptr, header, next) = self.heap.allocation_at(self.cursor)?;
        self.cursor = next;
        Some((ptr, header))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> HeapSettings {
        HeapSettings {
            bucket_size: 16,
            max_heap_size: 64,
        }
    }

    #[test]
    fn first_allocation_body_at_offset_two() {
        let mut heap = Heap::new(HeapSettings::default());
        let p = heap.allocate(4, TypeCode::Int32).unwrap();
        assert_eq!(p, HeapPtr(2));
        assert_eq!(heap.header(p).type_code(), TypeCode::Int32);
        assert_eq!(heap.header(p).size(), 4);
        assert_eq!(heap.used(), 6);
    }

    #[test]
    fn offsets_stay_dense_across_buckets() {
        let mut heap = Heap::new(small_settings());
        let a = heap.allocate(10, TypeCode::String).unwrap(); // 12 bytes
        let b = heap.allocate(10, TypeCode::String).unwrap(); // new bucket
        assert_eq!(heap.bucket_count(), 2);
        assert_eq!(a, HeapPtr(2));
        assert_eq!(b, HeapPtr(14));
        assert_eq!(heap.used(), 24);
        assert!(heap.capacity() >= 24);
    }

    #[test]
    fn slots_survive_bucket_boundaries() {
        let mut heap = Heap::new(small_settings());
        let a = heap.allocate(6, TypeCode::FixedLengthArray).unwrap();
        let b = heap.allocate(8, TypeCode::FixedLengthArray).unwrap();
        for i in 0..3 {
            heap.set_slot(a, i, Value::Int(i as i16));
        }
        for i in 0..4 {
            heap.set_slot(b, i, Value::Int(10 + i as i16));
        }
        assert_eq!(heap.slot(a, 2), Value::Int(2));
        assert_eq!(heap.slot(b, 3), Value::Int(13));
    }

    #[test]
    fn limit_is_enforced() {
        let mut heap = Heap::new(small_settings());
        let mut count = 0;
        while heap.allocate(6, TypeCode::FixedLengthArray).is_some() {
            count += 1;
        }
        assert_eq!(count, 8);
        assert!(heap.used() <= 64);
    }

    #[test]
    fn oversized_allocation_gets_own_bucket() {
        let mut heap = Heap::new(small_settings());
        let p = heap.allocate(40, TypeCode::Uint8Array).unwrap();
        assert_eq!(heap.body(p).len(), 40);
        assert!(heap.body(p).iter().all(|&b| b == 0));
    }

    #[test]
    fn walk_visits_in_address_order() {
        let mut heap = Heap::new(small_settings());
        let a = heap.allocate(2, TypeCode::HostFunc).unwrap();
        let b = heap.allocate(8, TypeCode::Float64).unwrap();
        let c = heap.allocate(3, TypeCode::String).unwrap();
        let seen: Vec<_> = heap.walk().map(|(p, h)| (p, h.type_code())).collect();
        assert_eq!(
            seen,
            vec![
                (a, TypeCode::HostFunc),
                (b, TypeCode::Float64),
                (c, TypeCode::String)
            ]
        );
    }

    #[test]
    fn image_section_roundtrip() {
        let mut heap = Heap::new(HeapSettings::default());
        let p = heap.allocate(3, TypeCode::String).unwrap();
        heap.body_mut(p).copy_from_slice(b"abc");
        let bytes = heap.to_bytes();
        let restored = Heap::from_image_section(&bytes, HeapSettings::default());
        assert_eq!(restored.body(p), b"abc");
        assert_eq!(restored.used(), bytes.len());
    }

    #[test]
    fn settings_validation() {
        assert!(HeapSettings::default().validate().is_ok());
        let bad = HeapSettings {
            bucket_size: 16,
            max_heap_size: 0x1_0000,
        };
        assert!(bad.validate().is_err());
    }
}
