//! The process registry: loaded symbol tables and live thread records.

use crate::log;
use crate::thread::{Thread, ThreadId, ThreadStatus};
use ssaddr::sym::{LoadError, SymTab};
use std::path::Path;
use thiserror::Error;

/// Errors raised by thread registration and management.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A record for this OS thread already exists.
    #[error("thread 0x{0:x} is already registered")]
    DuplicateThread(ThreadId),
    /// `pthread_create` failed.
    #[error("failed to spawn thread '{name}' (errno {errno})")]
    SpawnFailed { name: String, errno: i32 },
    /// `pthread_join` failed.
    #[error("failed to join thread 0x{id:x} (errno {errno})")]
    JoinFailed { id: ThreadId, errno: i32 },
}

/// The set of loaded modules and live threads of the instrumented process.
pub struct Process {
    pid: u32,
    modules: Vec<SymTab>,
    threads: Vec<Thread>,
}

impl Process {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            modules: Vec::new(),
            threads: Vec::new(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Load and register the symbol table of the module at `path`, loaded at `base`.
    ///
    /// Tables that turn out to contain no function symbols are skipped with a diagnostic rather
    /// than treated as errors; loader failures are returned so the caller can log and carry on.
    pub fn add_module(&mut self, path: &Path, base: u64) -> Result<(), LoadError> {
        if self.modules.iter().any(|m| m.path() == path) {
            log::warn(&format!(
                "module '{}' is already registered",
                path.display()
            ));
            return Ok(());
        }
        let tab = SymTab::load(path, base)?;
        self.register_table(tab);
        Ok(())
    }

    /// Register a pre-built symbol table. Tables with an already-registered path or no function
    /// symbols are dropped with a diagnostic.
    pub fn register_table(&mut self, tab: SymTab) {
        if self.modules.iter().any(|m| m.path() == tab.path()) {
            log::warn(&format!(
                "module '{}' is already registered",
                tab.path().display()
            ));
            return;
        }
        if tab.is_empty() {
            log::warn(&format!(
                "no function symbols in '{}'",
                tab.path().display()
            ));
            return;
        }
        log::info(&format!(
            "loaded the symbol table of '{}' ({} function symbols @ 0x{:x})",
            tab.path().display(),
            tab.len(),
            tab.base()
        ));
        self.modules.push(tab);
    }

    /// Resolve an address to a demangled name. Modules are probed in registration order, so the
    /// executable (registered first) wins ties against DSOs.
    pub fn lookup(&self, addr: u64) -> Option<&str> {
        lookup_in(&self.modules, addr)
    }

    /// Find the module that defines a symbol at `addr` and return its path and load base.
    pub fn inverse_lookup(&self, addr: u64) -> Option<(&Path, u64)> {
        inverse_lookup_in(&self.modules, addr)
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn symbol_count(&self) -> usize {
        self.modules.iter().map(SymTab::len).sum()
    }

    pub fn modules(&self) -> &[SymTab] {
        &self.modules
    }

    /// The record tracking the calling OS thread, created on first use.
    pub fn current_thread(&mut self) -> &mut Thread {
        if let Some(i) = self.threads.iter().position(Thread::is_current) {
            return &mut self.threads[i];
        }
        self.threads.push(Thread::for_current(None));
        self.threads.last_mut().unwrap()
    }

    pub fn thread_by_id(&self, id: ThreadId) -> Option<&Thread> {
        self.threads.iter().find(|t| t.is(id))
    }

    pub fn thread_by_id_mut(&mut self, id: ThreadId) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.is(id))
    }

    pub fn thread_by_name(&self, name: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.is_named(name))
    }

    pub fn thread_by_index(&self, i: usize) -> Option<&Thread> {
        self.threads.get(i)
    }

    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Attach an externally-created record (used by the spawn helper).
    pub fn register_thread(&mut self, thread: Thread) -> Result<(), RegistryError> {
        if self.threads.iter().any(|t| t.is(thread.handle())) {
            return Err(RegistryError::DuplicateThread(thread.handle()));
        }
        self.threads.push(thread);
        Ok(())
    }

    /// Remove the record for `id`, if any. Idempotent.
    pub fn cleanup_thread(&mut self, id: ThreadId) {
        self.threads.retain(|t| !t.is(id));
    }

    /// Remove every record whose stack is empty and whose thread has started or exited.
    ///
    /// The predicate can hold transiently for a live thread between an outermost return and its
    /// next call; such a record is recreated (unnamed) by the thread's next intercepted call.
    /// Callers hold the runtime lock for the whole sweep.
    pub fn cleanup_zombies(&mut self) {
        self.threads
            .retain(|t| t.depth() != 0 || t.status() == ThreadStatus::Init);
    }

    /// Split borrow for the formatter: the (immutable) module list alongside one mutable thread.
    pub(crate) fn modules_and_thread_mut(
        &mut self,
        id: ThreadId,
    ) -> (&[SymTab], Option<&mut Thread>) {
        let Self {
            modules, threads, ..
        } = self;
        (modules.as_slice(), threads.iter_mut().find(|t| t.is(id)))
    }
}

impl Default for Process {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn lookup_in(modules: &[SymTab], addr: u64) -> Option<&str> {
    modules.iter().find_map(|m| m.addr_to_name(addr))
}

pub(crate) fn inverse_lookup_in(modules: &[SymTab], addr: u64) -> Option<(&Path, u64)> {
    modules
        .iter()
        .find(|m| m.contains(addr))
        .map(|m| (m.path(), m.base()))
}
