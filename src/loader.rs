//! Loading program images into memory.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::Path;
use std::rc::Rc;
use thiserror::Error;

use crate::arch::Architecture;
use crate::concrete::ConcreteMemory;
use crate::config::parse_int;


/// Everything needed to start a recovery run.
#[derive(Debug, Clone)]
pub struct Image {
    /// The initial memory, shared by all states as their base.
    pub memory: Rc<ConcreteMemory>,
    pub entrypoint: u64,
    pub arch: Architecture,
    pub symbols: SymbolTable,
}

/// Produces program images from raw file contents.
pub trait Loader {
    /// Build the image from the file's bytes.
    fn load(&self, bytes: &[u8]) -> Result<Image, LoadError>;

    /// Read a file and build the image from it.
    fn load_file(&self, path: &Path) -> Result<Image, LoadError> {
        let bytes = fs::read(path)?;
        self.load(&bytes)
    }
}

/// Maps a flat binary at a fixed base address.
#[derive(Debug, Clone)]
pub struct RawLoader {
    pub base: u64,
    /// The entrypoint, defaulting to the base address.
    pub entry: Option<u64>,
    pub arch: Architecture,
    pub symbols: SymbolTable,
}

impl RawLoader {
    /// Create a loader mapping at `base` for an architecture.
    pub fn new(base: u64, arch: Architecture) -> RawLoader {
        RawLoader { base, entry: None, arch, symbols: SymbolTable::new() }
    }
}

impl Loader for RawLoader {
    fn load(&self, bytes: &[u8]) -> Result<Image, LoadError> {
        if bytes.is_empty() {
            return Err(LoadError::Empty);
        }

        let mut memory = ConcreteMemory::new();
        memory.put_bytes(self.base, bytes);

        let entrypoint = self.entry.unwrap_or(self.base);
        if !memory.is_defined(entrypoint) {
            return Err(LoadError::EntryOutsideImage(entrypoint));
        }

        Ok(Image {
            memory: Rc::new(memory),
            entrypoint,
            arch: self.arch.clone(),
            symbols: self.symbols.clone(),
        })
    }
}

/// Names of addresses in the image.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SymbolTable {
    by_addr: BTreeMap<u64, String>,
    by_name: HashMap<String, u64>,
}

impl SymbolTable {
    /// Create an empty table.
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    /// Parse lines of the form `address name`. Blank lines and lines starting
    /// with `#` are skipped.
    pub fn parse(text: &str) -> Result<SymbolTable, LoadError> {
        let mut table = SymbolTable::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut parts = line.split_whitespace();
            let (addr, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(addr), Some(name), None) => (addr, name),
                _ => return Err(LoadError::Symbol(index + 1)),
            };
            let addr = parse_int("symbol", addr).map_err(|_| LoadError::Symbol(index + 1))?;
            table.insert(addr, name);
        }
        Ok(table)
    }

    /// Add a symbol, replacing earlier entries with the same address or name.
    pub fn insert(&mut self, addr: u64, name: &str) {
        if let Some(old) = self.by_name.insert(name.to_string(), addr) {
            self.by_addr.remove(&old);
        }
        if let Some(old) = self.by_addr.insert(addr, name.to_string()) {
            if old != name {
                self.by_name.remove(&old);
            }
        }
    }

    /// The symbol exactly at the address.
    pub fn name(&self, addr: u64) -> Option<&str> {
        self.by_addr.get(&addr).map(String::as_str)
    }

    /// The address of a symbol.
    pub fn address(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// The closest symbol at or below the address.
    pub fn containing(&self, addr: u64) -> Option<(u64, &str)> {
        self.by_addr.range(..= addr)
            .next_back()
            .map(|(&start, name)| (start, name.as_str()))
    }

    /// All symbols ordered by address.
    pub fn iter(&self) -> impl Iterator<Item=(u64, &str)> {
        self.by_addr.iter().map(|(&addr, name)| (addr, name.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }
}

/// The error type for loading images.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("the input is empty")]
    Empty,
    #[error("entrypoint {0:#x} lies outside of the image")]
    EntryOutsideImage(u64),
    #[error("line {0} of the symbol table is not of the form `address name`")]
    Symbol(usize),
}
