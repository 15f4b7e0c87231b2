//! Function symbol tables loaded from object files.

use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol, SectionKind, SymbolKind};
use rustc_demangle::demangle;
use std::{
    fmt, fs,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// Raised when an object file's symbol table cannot be registered. Fatal to the registration
/// attempt, never to the runtime: the module is skipped and a diagnostic is emitted.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The file could not be opened or mapped.
    #[error("failed to open object file '{path}': {err}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        err: std::io::Error,
    },
    /// The file is not in a recognised object format.
    #[error("failed to verify '{path}' as objective code: {err}")]
    NotObject {
        path: PathBuf,
        #[source]
        err: object::Error,
    },
    /// The file carries no symbol table usable for function resolution.
    #[error("object file '{0}' is stripped")]
    Stripped(PathBuf),
}

/// A function symbol: a runtime code address and, if resolution has succeeded, a demangled name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sym {
    addr: u64,
    name: Option<String>,
}

impl Sym {
    pub fn new(addr: u64, name: Option<String>) -> Self {
        Self { addr, name }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }
}

/// The function symbols of one loaded module (the executable or a DSO).
///
/// A table is built once, when the module is registered, and is immutable afterwards. Entries
/// are sorted by address so that address lookups can binary-search; within one table addresses
/// are unique (aliases at the same address collapse to the first one seen).
pub struct SymTab {
    path: PathBuf,
    base: u64,
    syms: Vec<Sym>,
}

impl SymTab {
    /// Build a table from pre-resolved symbols (sorted and de-aliased here).
    pub fn new(path: impl Into<PathBuf>, base: u64, mut syms: Vec<Sym>) -> Self {
        syms.sort_by_key(Sym::addr);
        syms.dedup_by_key(|s| s.addr());
        Self {
            path: path.into(),
            base,
            syms,
        }
    }

    /// Load the function symbols of the object file at `path`, loaded at `base`.
    ///
    /// Symbols that are not functions, or whose defining section is not executable code, are
    /// discarded. A symbol's runtime address is the load base plus its file virtual address
    /// (the `object` crate has already folded in the section address and the offset within the
    /// section). Names are demangled; where demangling fails the decorated name is kept.
    pub fn load(path: &Path, base: u64) -> Result<Self, LoadError> {
        let file = fs::File::open(path).map_err(|err| LoadError::OpenFailed {
            path: path.to_owned(),
            err,
        })?;
        let data = unsafe { Mmap::map(&file) }.map_err(|err| LoadError::OpenFailed {
            path: path.to_owned(),
            err,
        })?;
        let obj = object::File::parse(&*data).map_err(|err| LoadError::NotObject {
            path: path.to_owned(),
            err,
        })?;

        let mut seen_any = false;
        let mut syms = Vec::new();
        for sym in obj.symbols() {
            seen_any = true;
            if sym.kind() != SymbolKind::Text {
                continue;
            }
            // Only symbols defined in an executable code section resolve to callable code.
            let Some(idx) = sym.section_index() else {
                continue;
            };
            let Ok(section) = obj.section_by_index(idx) else {
                continue;
            };
            if section.kind() != SectionKind::Text {
                continue;
            }
            let Ok(name) = sym.name() else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let addr = base.wrapping_add(sym.address());
            syms.push(Sym::new(addr, Some(format!("{:#}", demangle(name)))));
        }

        if !seen_any {
            return Err(LoadError::Stripped(path.to_owned()));
        }
        Ok(Self::new(path, base, syms))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    pub fn syms(&self) -> &[Sym] {
        &self.syms
    }

    /// Exact-match symbol lookup by runtime address.
    pub fn lookup_addr(&self, addr: u64) -> Option<&Sym> {
        self.syms
            .binary_search_by_key(&addr, Sym::addr)
            .ok()
            .map(|i| &self.syms[i])
    }

    /// Exact-match symbol lookup by demangled name.
    pub fn lookup_name(&self, name: &str) -> Option<&Sym> {
        self.syms.iter().find(|s| s.name() == Some(name))
    }

    /// Resolve an address to a symbol name.
    pub fn addr_to_name(&self, addr: u64) -> Option<&str> {
        self.lookup_addr(addr).and_then(Sym::name)
    }

    /// Resolve a name to a symbol address.
    pub fn name_to_addr(&self, name: &str) -> Option<u64> {
        self.lookup_name(name).map(Sym::addr)
    }

    /// Probe whether the table defines a symbol at `addr`.
    pub fn contains(&self, addr: u64) -> bool {
        self.lookup_addr(addr).is_some()
    }
}

impl fmt::Display for SymTab {
    /// Symbol enumeration, in the table's address order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "symbol enumeration of '{}' ({} symbols @ 0x{:x})",
            self.path.display(),
            self.syms.len(),
            self.base
        )?;
        for sym in &self.syms {
            writeln!(
                f,
                "  {} @ 0x{:x}",
                sym.name().unwrap_or("<unresolved>"),
                sym.addr()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{LoadError, Sym, SymTab};
    use rustc_demangle::demangle;
    use std::path::Path;

    // The probe needs a predictable (i.e. unmangled) name in the test binary's symbol table.
    #[no_mangle]
    #[inline(never)]
    fn ssaddr_symtab_probe() -> u8 {
        1
    }

    #[test]
    fn load_self() {
        let path = crate::obj::self_exe_path().unwrap();
        let tab = SymTab::load(&path, 0).unwrap();
        assert!(tab.len() > 0);
        assert_eq!(ssaddr_symtab_probe(), 1);

        let sym = tab.lookup_name("ssaddr_symtab_probe").unwrap();
        assert!(tab.contains(sym.addr()));
        assert_eq!(tab.addr_to_name(sym.addr()), Some("ssaddr_symtab_probe"));
        assert_eq!(
            tab.name_to_addr("ssaddr_symtab_probe"),
            Some(sym.addr())
        );
    }

    #[test]
    fn load_missing_file() {
        let err = SymTab::load(Path::new("/nonexistent/object"), 0).unwrap_err();
        assert!(matches!(err, LoadError::OpenFailed { .. }));
    }

    #[test]
    fn load_non_object() {
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
        let err = SymTab::load(&manifest, 0).unwrap_err();
        assert!(matches!(err, LoadError::NotObject { .. }));
    }

    #[test]
    fn sorted_and_dealiased() {
        let tab = SymTab::new(
            "/nowhere/libx.so",
            0x1000,
            vec![
                Sym::new(0x30, Some("c".into())),
                Sym::new(0x10, Some("a".into())),
                Sym::new(0x20, Some("b".into())),
                Sym::new(0x10, Some("a_alias".into())),
            ],
        );
        assert_eq!(tab.len(), 3);
        assert_eq!(tab.addr_to_name(0x20), Some("b"));
        assert!(tab.lookup_addr(0x15).is_none());
        assert_eq!(tab.name_to_addr("a"), Some(0x10));
        assert!(tab.lookup_name("a_alias").is_none());
    }

    #[test]
    fn demangle_fallback() {
        // Mangled names resolve to their source form, unmangled ones pass through.
        assert_eq!(
            format!(
                "{:#}",
                demangle("_ZN3std2io5stdio6_print17h0000000000000000E")
            ),
            "std::io::stdio::_print"
        );
        assert_eq!(format!("{:#}", demangle("getuid")), "getuid");
    }

    #[test]
    fn enumeration_lists_every_symbol() {
        let tab = SymTab::new(
            "/nowhere/libx.so",
            0,
            vec![
                Sym::new(0x10, Some("alpha".into())),
                Sym::new(0x20, Some("beta".into())),
            ],
        );
        let listing = tab.to_string();
        assert!(listing.contains("alpha @ 0x10"));
        assert!(listing.contains("beta @ 0x20"));
    }
}
