use super::format::{Section, seal, write_u16};
use crate::error::Error;
use crate::vm::Vm;

impl Vm<'_> {
    /// Serialize the current VM state as a new image.
    ///
    /// Everything up to the globals section is carried over from the image
    /// the VM was restored from. Globals and the heap are replaced with their
    /// live contents after a compacting collection. The result restores like
    /// any other image against the same imports.
    pub fn create_snapshot(&mut self) -> Result<Vec<u8>, Error> {
        self.ensure_alive()?;
        if !self.frames.is_empty() || self.host_depth > 0 {
            return Err(Error::VmBusy);
        }
        if self.has_pending_jobs() {
            log::warn!("snapshot drops the pending job queue");
        }

        self.collect_garbage(true);
        self.ensure_alive()?;

        let globals_start = self.header.section_range(Section::Globals).start;
        let heap = self.heap.to_bytes();
        let heap_start = globals_start + self.globals.len() * 2;
        let size = heap_start + heap.len();
        if size > u16::MAX as usize {
            return Err(Error::ImageTooLarge(size));
        }

        let mut image = Vec::with_capacity(size);
        image.extend_from_slice(&self.image[..globals_start]);
        for global in &self.globals {
            image.extend_from_slice(&global.encode().to_le_bytes());
        }
        image.extend_from_slice(&heap);
        write_u16(&mut image, 12 + 2 * Section::Heap as usize, heap_start as u16);
        seal(&mut image);

        log::debug!(
            "snapshot: {size} bytes ({} globals, {} heap bytes)",
            self.globals.len(),
            heap.len()
        );
        Ok(image)
    }
}
