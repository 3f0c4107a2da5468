use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::symbols::{ResolvedSymbol, SymbolResolver, UNKNOWN_MODULE};

/// How an address is looked up. Return addresses point past the call
/// instruction and are resolved one byte earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    ProgramCounter,
    ReturnAddress,
}

impl AddressKind {
    fn lookup_address(self, address: u64) -> u64 {
        match self {
            AddressKind::ProgramCounter => address,
            AddressKind::ReturnAddress => address.saturating_sub(1),
        }
    }
}

#[derive(Debug)]
pub struct CallSite {
    pub address: u64,
    pub symbol: Option<ResolvedSymbol>,
    pub module: String,
    display: OnceLock<String>,
}

impl CallSite {
    pub fn is_resolved(&self) -> bool {
        self.symbol.is_some()
    }

    /// `func [{file} {line}]` when resolved, otherwise an `UNRESOLVED`
    /// bucket for the containing module, optionally with the address.
    pub fn display(&self, keep_unresolved_addr: bool) -> &str {
        self.display.get_or_init(|| match &self.symbol {
            Some(symbol) => format!("{} [{{{}}} {{{}}}]", symbol.function, symbol.file, symbol.line),
            None if keep_unresolved_addr => {
                format!("UNRESOLVED {} ADDR {:#x}", self.module, self.address)
            }
            None => format!("UNRESOLVED {}", self.module),
        })
    }

    /// Function name without its argument list, for callee annotations.
    pub fn short_name(&self) -> &str {
        match &self.symbol {
            Some(symbol) => symbol
                .function
                .split('(')
                .next()
                .unwrap_or(&symbol.function),
            None => "UNRESOLVED",
        }
    }
}

/// Write-once cache keyed by address. Concurrent misses on the same address
/// may both resolve, but only the first insert is kept and returned to
/// everyone.
pub struct CallSiteCache {
    resolver: Arc<dyn SymbolResolver>,
    keep_unresolved_addr: bool,
    entries: RwLock<HashMap<(u64, AddressKind), Arc<CallSite>>>,
}

impl CallSiteCache {
    pub fn new(resolver: Arc<dyn SymbolResolver>, keep_unresolved_addr: bool) -> Self {
        CallSiteCache {
            resolver,
            keep_unresolved_addr,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn keep_unresolved_addr(&self) -> bool {
        self.keep_unresolved_addr
    }

    fn build(&self, address: u64, kind: AddressKind, symbol: Option<ResolvedSymbol>) -> CallSite {
        let module = match symbol {
            Some(_) => String::new(),
            None => self
                .resolver
                .module_name(kind.lookup_address(address))
                .unwrap_or_else(|| UNKNOWN_MODULE.to_string()),
        };
        CallSite {
            address,
            symbol,
            module,
            display: OnceLock::new(),
        }
    }

    fn insert(&self, address: u64, kind: AddressKind, site: CallSite) -> Arc<CallSite> {
        self.entries
            .write()
            .expect("lock")
            .entry((address, kind))
            .or_insert_with(|| Arc::new(site))
            .clone()
    }

    pub fn get(&self, address: u64, kind: AddressKind) -> Option<Arc<CallSite>> {
        self.entries
            .read()
            .expect("lock")
            .get(&(address, kind))
            .cloned()
    }

    pub fn resolve(&self, address: u64, kind: AddressKind) -> Arc<CallSite> {
        if let Some(site) = self.get(address, kind) {
            return site;
        }
        let symbol = self.resolver.resolve(kind.lookup_address(address));
        let site = self.build(address, kind, symbol);
        self.insert(address, kind, site)
    }

    /// Resolves every address not cached yet in one resolver batch.
    pub fn prefetch(&self, addresses: &[(u64, AddressKind)]) {
        let missing: Vec<(u64, AddressKind)> = {
            let entries = self.entries.read().expect("lock");
            let mut missing: Vec<_> = addresses
                .iter()
                .filter(|key| !entries.contains_key(key))
                .copied()
                .collect();
            missing.sort_unstable_by_key(|(address, kind)| (*address, *kind as u8));
            missing.dedup();
            missing
        };
        if missing.is_empty() {
            return;
        }

        let lookups: Vec<u64> = missing
            .iter()
            .map(|(address, kind)| kind.lookup_address(*address))
            .collect();
        let symbols = self.resolver.resolve_many(&lookups);
        for ((address, kind), symbol) in missing.into_iter().zip(symbols) {
            let site = self.build(address, kind, symbol);
            self.insert(address, kind, site);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
