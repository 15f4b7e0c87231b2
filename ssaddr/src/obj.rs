//! Inspection of the objects loaded into the current address space.

#[cfg(target_pointer_width = "64")]
use libc::{Elf64_Addr as Elf_Addr, Elf64_Word as Elf_Word};
use phdrs;
use std::{ffi::CStr, ffi::CString, io, path::PathBuf, sync::LazyLock};

/// A thread-safe (containing no raw pointers) version of `phdrs::ProgramHeader`, trimmed to the
/// fields the runtime consults.
pub struct SegmentHeader {
    type_: Elf_Word,
    flags: Elf_Word,
    vaddr: Elf_Addr,
}

impl From<&phdrs::ProgramHeader> for SegmentHeader {
    fn from(phdr: &phdrs::ProgramHeader) -> Self {
        Self {
            type_: phdr.type_(),
            flags: phdr.flags(),
            vaddr: phdr.vaddr(),
        }
    }
}

impl SegmentHeader {
    pub fn type_(&self) -> Elf_Word {
        self.type_
    }

    pub fn flags(&self) -> Elf_Word {
        self.flags
    }

    pub fn vaddr(&self) -> Elf_Addr {
        self.vaddr
    }
}

/// A thread-safe (containing no raw pointers) version of `phdrs::Object`.
pub struct LoadedObject {
    /// The relocation offset of the object.
    addr: Elf_Addr,
    /// The name of the object, as it appears in the program header table. On Linux this is the
    /// empty string for the main executable.
    name: CString,
    /// The object's program headers.
    phdrs: Vec<SegmentHeader>,
}

impl From<&phdrs::Object> for LoadedObject {
    fn from(pobj: &phdrs::Object) -> Self {
        Self {
            addr: pobj.addr(),
            name: pobj.name().to_owned(),
            phdrs: pobj.iter_phdrs().map(|ref p| p.into()).collect::<Vec<_>>(),
        }
    }
}

impl LoadedObject {
    pub fn addr(&self) -> Elf_Addr {
        self.addr
    }

    pub fn name(&self) -> &CStr {
        &self.name
    }

    pub fn phdrs(&self) -> &[SegmentHeader] {
        &self.phdrs
    }

    /// The runtime load base of the object: its relocation offset plus the virtual address of
    /// its first segment. `None` for an object with no segments.
    pub fn load_base(&self) -> Option<u64> {
        self.phdrs.first().map(|p| self.addr + p.vaddr())
    }
}

/// A program header cache.
///
/// This stashes the result of `dl_iterate_phdr(3)` (via the `phdrs` crate), thus avoiding a
/// (slow) chain of C callbacks each time the loaded objects are enumerated.
///
/// Since we assume that there is no dlopen/dlclose churn between runtime initialisation and the
/// points the cache is consulted, the cache is immutable.
pub static OBJECT_CACHE: LazyLock<Vec<LoadedObject>> = LazyLock::new(|| {
    phdrs::objects()
        .iter()
        .map(|p| p.into())
        .collect::<Vec<LoadedObject>>()
});

/// The absolute path of the currently running executable.
///
/// procfs maintains a directory for each process and a symlink therein (`exe`) that names the
/// process image.
pub fn self_exe_path() -> io::Result<PathBuf> {
    std::fs::read_link("/proc/self/exe")
}

#[cfg(test)]
mod tests {
    use super::{self_exe_path, OBJECT_CACHE};

    #[test]
    fn cache_non_empty() {
        // At minimum the main object, the vdso and libc are mapped.
        assert!(!OBJECT_CACHE.is_empty());
    }

    #[test]
    fn main_object_is_unnamed() {
        assert!(OBJECT_CACHE.iter().any(|o| o.name().to_bytes().is_empty()));
    }

    #[test]
    fn dsos_have_bases() {
        for obj in OBJECT_CACHE.iter() {
            if !obj.phdrs().is_empty() {
                assert!(obj.load_base().is_some());
            }
        }
    }

    #[test]
    fn exe_path_is_absolute() {
        let path = self_exe_path().unwrap();
        assert!(path.is_absolute());
        assert!(path.exists());
    }
}
