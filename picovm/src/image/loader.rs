use super::format::{ImageHeader, RomItems, Section, read_u16};
use crate::error::{Error, HostFunctionId};
use crate::heap::Heap;
use crate::value::{TypeCode, Value};
use crate::vm::{HostFunction, Vm, VmCreateInfo};

impl<'a> Vm<'a> {
    /// Restore a VM from `image`.
    ///
    /// The image is borrowed for the lifetime of the VM: functions, strings
    /// and other read-only data are used in place. Globals and the initial
    /// heap are copied out. Every import is resolved through
    /// `resolve_import`; a `None` answer fails the restore.
    pub fn restore_with(
        image: &'a [u8],
        info: VmCreateInfo,
        mut resolve_import: impl FnMut(HostFunctionId) -> Option<HostFunction>,
    ) -> Result<Self, Error> {
        info.heap.validate().map_err(Error::InvalidSettings)?;
        if info.stack_size == 0 {
            return Err(Error::InvalidSettings("stack_size must be > 0"));
        }
        let header = ImageHeader::parse(image)?;

        let imports = header
            .section_range(Section::Import)
            .step_by(2)
            .map(|at| {
                let id = read_u16(image, at);
                resolve_import(id)
                    .map(|function| (id, function))
                    .ok_or(Error::UnresolvedImport(id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let globals: Vec<Value> = header
            .section_range(Section::Globals)
            .step_by(2)
            .map(|at| Value::decode(read_u16(image, at)))
            .collect();

        let heap_section = &image[header.section_range(Section::Heap)];
        if heap_section.len() > info.heap.max_heap_size {
            return Err(Error::InvalidBytecode("heap section exceeds the heap limit"));
        }
        let heap = Heap::from_image_section(heap_section, info.heap.clone());

        let vm = Vm::from_parts(image, header, imports, globals, heap, &info);
        vm.validate_image()?;
        log::debug!(
            "restored image: {} bytes, {} imports, {} globals, {} heap bytes",
            image.len(),
            vm.imports.len(),
            vm.globals.len(),
            vm.heap.used()
        );
        Ok(vm)
    }

    /// Structural checks that the header CRC cannot catch.
    fn validate_image(&self) -> Result<(), Error> {
        // Image and runtime share one value encoding, so a heap that passes
        // the checker is usable as-is.
        self.check_heap().map_err(|err| match err {
            Error::Corrupt(msg) => Error::InvalidBytecode(msg),
            other => other,
        })?;
        for (body, header) in RomItems::new(self.image, &self.header) {
            let end = (body + header.size()).min(self.image.len());
            self.check_leaf(header.type_code(), &self.image[body.min(end)..end])
                .map_err(|_| Error::InvalidBytecode("malformed boxed value in the image"))?;
        }
        if self.intern_list_global().is_none() {
            return Err(Error::InvalidBytecode("intern list builtin is not a handle"));
        }

        let exports = self.header.section_range(Section::Export);
        for at in exports.step_by(4) {
            if let Value::Rom(ptr) = Value::decode(read_u16(self.image, at + 2))
                && ptr.0 as usize >= self.image.len()
            {
                return Err(Error::InvalidBytecode("export points outside the image"));
            }
        }

        let short_calls = self.header.section_range(Section::ShortCallTable);
        for at in short_calls.step_by(4) {
            let target = read_u16(self.image, at) as usize;
            if target & 1 == 1 {
                if target >> 1 >= self.imports.len() {
                    return Err(Error::InvalidBytecode("short call to a missing import"));
                }
            } else if self.rom_header(target).type_code() != TypeCode::Function {
                return Err(Error::InvalidBytecode("short call target is not a function"));
            }
        }
        Ok(())
    }
}
