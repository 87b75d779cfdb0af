//! Goblin-based multi-format image loader.
//!
//! Only the segment map is recovered here. Locating method bodies and
//! IL2CPP metadata tables is the job of the metadata parser that feeds us.

use std::fmt;

use goblin::mach::{constants::cputype, Mach, MachO};
use goblin::{elf, pe, Object};

use crate::{Address, Architecture, BinaryImage, BinaryParser, ReclaimError, Segment};

/// A parser that handles ELF, PE, and Mach-O via Goblin.
#[derive(Debug, Default)]
pub struct GoblinParser;

impl GoblinParser {
    /// Construct a new GoblinParser.
    pub fn new() -> Self {
        GoblinParser
    }

    fn parse_elf(&self, elf: elf::Elf, img: &[u8]) -> Result<BinaryImage, ReclaimError> {
        let arch = match elf.header.e_machine {
            elf::header::EM_386 => Architecture::X86_32,
            elf::header::EM_X86_64 => Architecture::X86_64,
            elf::header::EM_ARM => Architecture::Arm,
            elf::header::EM_AARCH64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let segments = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == elf::program_header::PT_LOAD)
            .map(|ph| {
                Segment::new(
                    format!("LOAD@0x{:x}", ph.p_vaddr),
                    ph.p_vaddr,
                    ph.p_offset as usize,
                    ph.p_filesz as usize,
                    ph.is_executable(),
                )
            })
            .collect();

        let exports = elf
            .dynsyms
            .iter()
            .filter(|sym| sym.is_function() && sym.st_value != 0)
            .filter_map(|sym| {
                let name = elf.dynstrtab.get_at(sym.st_name)?;
                Some((name.to_string(), sym.st_value))
            })
            .collect();

        Ok(BinaryImage::new(arch, img.to_vec(), segments).with_exports(exports))
    }

    fn parse_pe(&self, pe: pe::PE<'_>, img: &[u8]) -> Result<BinaryImage, ReclaimError> {
        let arch = match pe.header.coff_header.machine {
            pe::header::COFF_MACHINE_X86 => Architecture::X86_32,
            pe::header::COFF_MACHINE_X86_64 => Architecture::X86_64,
            pe::header::COFF_MACHINE_ARM => Architecture::Arm,
            pe::header::COFF_MACHINE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        let image_base = pe.image_base as Address;
        let segments = pe
            .sections
            .iter()
            .map(|sect| {
                let name = sect.name().unwrap_or("").to_string();
                let executable =
                    (sect.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE) != 0;
                let size = match sect.virtual_size {
                    0 => sect.size_of_raw_data,
                    virtual_size => sect.size_of_raw_data.min(virtual_size),
                };
                Segment::new(
                    name,
                    image_base + sect.virtual_address as Address,
                    sect.pointer_to_raw_data as usize,
                    size as usize,
                    executable,
                )
            })
            .collect();

        let exports = pe
            .exports
            .iter()
            .filter_map(|export| {
                Some((export.name?.to_string(), image_base + export.rva as Address))
            })
            .collect();

        Ok(BinaryImage::new(arch, img.to_vec(), segments).with_exports(exports))
    }

    fn parse_macho(&self, macho: &MachO, img: &[u8]) -> Result<BinaryImage, ReclaimError> {
        let arch = match macho.header.cputype {
            cputype::CPU_TYPE_I386 => Architecture::X86_32,
            cputype::CPU_TYPE_X86_64 => Architecture::X86_64,
            cputype::CPU_TYPE_ARM => Architecture::Arm,
            cputype::CPU_TYPE_ARM64 => Architecture::AArch64,
            _ => Architecture::Unknown,
        };

        // VM_PROT_EXECUTE
        let segments = macho
            .segments
            .iter()
            .map(|segment| {
                Segment::new(
                    segment.name().unwrap_or("").to_string(),
                    segment.vmaddr,
                    segment.fileoff as usize,
                    segment.filesize as usize,
                    (segment.maxprot & 0x4) != 0,
                )
            })
            .collect::<Vec<_>>();

        // Export offsets are relative to the __TEXT segment.
        let text_base = macho
            .segments
            .iter()
            .find(|s| s.name().is_ok_and(|n| n == "__TEXT"))
            .map_or(0, |s| s.vmaddr);
        let exports = match macho.exports() {
            Ok(exports) => exports
                .into_iter()
                .map(|export| (export.name, text_base + export.offset))
                .collect(),
            Err(e) => {
                log::warn!("Could not read Mach-O export trie: {}", e);
                Vec::new()
            }
        };

        Ok(BinaryImage::new(arch, img.to_vec(), segments).with_exports(exports))
    }
}

impl fmt::Display for GoblinParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GoblinParser")
    }
}

impl BinaryParser for GoblinParser {
    fn parse(&self, data: &[u8]) -> Result<BinaryImage, ReclaimError> {
        let image = match Object::parse(data) {
            Ok(Object::Elf(elf)) => self.parse_elf(elf, data),
            Ok(Object::PE(pe)) => self.parse_pe(pe, data),
            Ok(Object::Mach(Mach::Binary(macho))) => self.parse_macho(&macho, data),
            Ok(Object::Mach(Mach::Fat(_))) => Err(ReclaimError::Parsing(
                "Fat Mach-O images must be thinned first".into(),
            )),
            Ok(_) => Err(ReclaimError::Parsing("Unsupported file format".into())),
            Err(e) => Err(ReclaimError::Parsing(e.to_string())),
        }?;

        log::debug!(
            "Loaded {} image with {} segments and {} exports",
            image.architecture,
            image.segments.len(),
            image.exports().len()
        );
        if image.architecture == Architecture::Unknown {
            log::warn!("Image architecture was not recognised");
        }

        Ok(image)
    }
}
