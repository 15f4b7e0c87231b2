//! User plugins dispatched around every intercepted call.
//!
//! A plugin is a pair of callbacks invoked at each function entry and exit, registered either
//! in-process or resolved from an external module. Module plugins export C-linkage `mod_enter`
//! and `mod_exit`, or scoped equivalents whose mangled names are synthesised here.

use crate::log;
use libc::{c_char, c_void, dlclose, dlerror, dlopen, dlsym, RTLD_LAZY, RTLD_LOCAL, RTLD_NOLOAD};
use std::{
    ffi::{CStr, CString},
    os::unix::ffi::OsStrExt,
    panic,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// The signature every plugin callback conforms to: the called function's address and the call
/// site, as raw code addresses. The "C-unwind" ABI lets a misbehaving callback's panic reach the
/// containment in [invoke] instead of aborting.
pub type HookFn = unsafe extern "C-unwind" fn(*mut c_void, *mut c_void);

/// A plugin module or one of its callbacks could not be resolved.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to load plugin '{path}' ({msg})")]
    ModuleNotFound { path: PathBuf, msg: String },
    #[error("failed to resolve symbol {symbol} in object '{path}' ({msg})")]
    SymbolNotFound {
        symbol: String,
        path: PathBuf,
        msg: String,
    },
}

/// Which plugins a bulk removal targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PluginKind {
    All,
    Module,
    Inline,
}

/// A pair of user callbacks invoked around every intercepted call.
///
/// Exactly one of two shapes: externally loaded (a module path plus a `dlopen` handle that is
/// closed on drop) or inline (callback pointers only). Plugins are move-only; the module handle
/// is never duplicated.
pub struct Plugin {
    begin: HookFn,
    end: HookFn,
    path: Option<PathBuf>,
    handle: *mut c_void,
}

// The dlopen handle is a process-global token: sending it between threads is sound, and all
// mutation of the plugin list happens under the plugin-list lock.
unsafe impl Send for Plugin {}
unsafe impl Sync for Plugin {}

impl Plugin {
    /// An in-process plugin from two callback pointers.
    pub fn new_inline(begin: HookFn, end: HookFn) -> Self {
        Self {
            begin,
            end,
            path: None,
            handle: std::ptr::null_mut(),
        }
    }

    /// Load a plugin module (or link against it, when the process already has it loaded) and
    /// resolve its two callbacks.
    ///
    /// With no `scope` the module must export C-linkage `mod_enter` and `mod_exit`; with a
    /// scope such as `"my::plugin"` the mangled nested names are resolved instead.
    pub fn from_module(path: &Path, scope: Option<&str>) -> Result<Self, LinkError> {
        let cpath =
            CString::new(path.as_os_str().as_bytes()).map_err(|_| LinkError::ModuleNotFound {
                path: path.to_owned(),
                msg: "path contains a NUL byte".to_owned(),
            })?;

        let flags = RTLD_LOCAL | RTLD_LAZY;
        let mut handle = unsafe { dlopen(cpath.as_ptr(), flags | RTLD_NOLOAD) };
        if handle.is_null() {
            unsafe { dlerror() };
            handle = unsafe { dlopen(cpath.as_ptr(), flags) };
            if handle.is_null() {
                return Err(LinkError::ModuleNotFound {
                    path: path.to_owned(),
                    msg: last_dl_error(),
                });
            }
            log::info(&format!("plugin '{}' loaded/linked", path.display()));
        } else {
            log::info(&format!("plugin '{}' linked", path.display()));
        }

        let begin = match Self::resolve(handle, path, "mod_enter", scope) {
            Ok(f) => f,
            Err(e) => {
                unsafe { dlclose(handle) };
                return Err(e);
            }
        };
        let end = match Self::resolve(handle, path, "mod_exit", scope) {
            Ok(f) => f,
            Err(e) => {
                unsafe { dlclose(handle) };
                return Err(e);
            }
        };

        Ok(Self {
            begin,
            end,
            path: Some(path.to_owned()),
            handle,
        })
    }

    /// The module path, or `None` for an inline plugin.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_inline(&self) -> bool {
        self.path.is_none()
    }

    /// Invoke the begin callback, containing any fault it raises.
    pub fn begin(&self, this_fn: u64, call_site: u64) {
        invoke(self.begin, this_fn, call_site, "begin");
    }

    /// Invoke the end callback, containing any fault it raises.
    pub fn end(&self, this_fn: u64, call_site: u64) {
        invoke(self.end, this_fn, call_site, "end");
    }

    pub(crate) fn begin_fn(&self) -> HookFn {
        self.begin
    }

    pub(crate) fn end_fn(&self) -> HookFn {
        self.end
    }

    fn resolve(
        handle: *mut c_void,
        path: &Path,
        name: &str,
        scope: Option<&str>,
    ) -> Result<HookFn, LinkError> {
        let symbol = match scope {
            None => name.to_owned(),
            Some(scope) => mangle(scope, name),
        };
        let csym = CString::new(symbol.as_str()).map_err(|_| LinkError::SymbolNotFound {
            symbol: symbol.clone(),
            path: path.to_owned(),
            msg: "symbol contains a NUL byte".to_owned(),
        })?;

        unsafe { dlerror() }; // clear any stale error
        let sym = unsafe { dlsym(handle, csym.as_ptr()) };
        let err = unsafe { dlerror() };
        if !err.is_null() || sym.is_null() {
            return Err(LinkError::SymbolNotFound {
                symbol,
                path: path.to_owned(),
                msg: dl_error_string(err),
            });
        }
        Ok(unsafe { std::mem::transmute::<*mut c_void, HookFn>(sym) })
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            unsafe { dlclose(self.handle) };
            if let Some(path) = &self.path {
                log::info(&format!("plugin '{}' unlinked", path.display()));
            }
        }
    }
}

/// Invoke a plugin callback, containing anything it throws: plugin faults are logged and must
/// never reach the instrumented program.
pub(crate) fn invoke(cb: HookFn, this_fn: u64, call_site: u64, what: &str) {
    let outcome = panic::catch_unwind(|| unsafe {
        cb(this_fn as *mut c_void, call_site as *mut c_void)
    });
    if outcome.is_err() {
        log::error(&format!("panic in plugin {what} callback"));
    }
}

/// Synthesise the mangled name of `scope::name(void*, void*)` using the length-prefixed
/// nested-name encoding, so scoped plugin entry points resolve without C-linkage exports.
fn mangle(scope: &str, name: &str) -> String {
    let parts: Vec<&str> = scope.split("::").collect();
    let mut mangled = String::from("_ZN");
    for part in &parts {
        mangled.push_str(&format!("{}{}", part.len(), part));
    }
    mangled.push_str(&format!("{}{}", name.len(), name));
    mangled.push_str(&format!("EPvS{}_", parts.len() - 1));
    mangled
}

fn last_dl_error() -> String {
    dl_error_string(unsafe { dlerror() })
}

fn dl_error_string(err: *mut c_char) -> String {
    if err.is_null() {
        "unknown dlerror".to_owned()
    } else {
        unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned()
    }
}
