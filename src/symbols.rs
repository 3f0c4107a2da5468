use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use blazesym::symbolize::source::Process;
use blazesym::symbolize::source::Source;
use blazesym::symbolize::Input;
use blazesym::symbolize::Sym;
use blazesym::symbolize::Symbolized;
use blazesym::symbolize::Symbolizer;
use blazesym::Pid;
use tracing::{debug, error};

pub const UNKNOWN_MODULE: &str = "UNKNOWN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl ResolvedSymbol {
    pub fn new(function: &str, file: &str, line: u32) -> Self {
        ResolvedSymbol {
            function: function.to_string(),
            file: file.to_string(),
            line,
        }
    }
}

/// Maps code addresses of the current process to symbols.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, address: u64) -> Option<ResolvedSymbol>;

    fn resolve_many(&self, addresses: &[u64]) -> Vec<Option<ResolvedSymbol>> {
        addresses.iter().map(|a| self.resolve(*a)).collect()
    }

    /// Short name of the object containing `address`.
    fn module_name(&self, address: u64) -> Option<String>;
}

#[derive(Debug, Clone)]
struct Module {
    start: u64,
    end: u64,
    name: String,
}

fn find_module(modules: &[Module], address: u64) -> Option<String> {
    modules
        .iter()
        .find(|m| (m.start..m.end).contains(&address))
        .map(|m| m.name.clone())
}

fn read_process_modules() -> Vec<Module> {
    let maps = match procfs::process::Process::myself().and_then(|p| p.maps()) {
        Ok(maps) => maps,
        Err(e) => {
            debug!("could not read /proc/self/maps: {}", e);
            return Vec::new();
        }
    };

    maps.iter()
        .filter_map(|map| match &map.pathname {
            procfs::process::MMapPath::Path(path) => Some(Module {
                start: map.address.0,
                end: map.address.1,
                name: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.to_string_lossy().into_owned()),
            }),
            procfs::process::MMapPath::Vdso => Some(Module {
                start: map.address.0,
                end: map.address.1,
                name: "[vdso]".to_string(),
            }),
            _ => None,
        })
        .collect()
}

/// Resolves addresses of the running process with blazesym.
#[derive(Default)]
pub struct BlazeResolver {
    modules: OnceLock<Vec<Module>>,
}

impl BlazeResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SymbolResolver for BlazeResolver {
    fn resolve(&self, address: u64) -> Option<ResolvedSymbol> {
        self.resolve_many(&[address]).pop().flatten()
    }

    fn resolve_many(&self, addresses: &[u64]) -> Vec<Option<ResolvedSymbol>> {
        let src = Source::Process(Process::new(Pid::Slf));
        let symbolizer = Symbolizer::new();
        let syms = match symbolizer.symbolize(&src, Input::AbsAddr(addresses)) {
            Ok(symbolized) => symbolized,
            Err(e) => {
                error!("blazesym failed to symbolize {} addresses: {}", addresses.len(), e);
                return vec![None; addresses.len()];
            }
        };

        if syms.len() != addresses.len() {
            error!("symbols.len() != addresses.len() this should not happen");
        }

        let mut resolved: Vec<Option<ResolvedSymbol>> = syms
            .iter()
            .map(|symbol| match symbol {
                Symbolized::Sym(Sym {
                    name, code_info, ..
                }) => {
                    let (file, line) = match code_info.as_ref() {
                        Some(info) => {
                            let file = match &info.dir {
                                Some(dir) => dir.join(Path::new(&*info.file)).display().to_string(),
                                None => info.file.to_string_lossy().into_owned(),
                            };
                            (file, info.line.unwrap_or(0))
                        }
                        None => (UNKNOWN_MODULE.to_string(), 0),
                    };
                    Some(ResolvedSymbol {
                        function: name.to_string(),
                        file,
                        line,
                    })
                }
                Symbolized::Unknown(reason) => {
                    debug!("unknown symbol: {}", reason);
                    None
                }
            })
            .collect();
        resolved.resize(addresses.len(), None);
        resolved
    }

    fn module_name(&self, address: u64) -> Option<String> {
        find_module(self.modules.get_or_init(read_process_modules), address)
    }
}

/// Table-driven resolver: address ranges mapped to fixed symbols.
#[derive(Debug, Default)]
pub struct StaticResolver {
    symbols: BTreeMap<u64, (u64, ResolvedSymbol)>,
    modules: Vec<Module>,
    calls: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `[start, end)` to `symbol`.
    pub fn with_symbol(mut self, start: u64, end: u64, symbol: ResolvedSymbol) -> Self {
        self.symbols.insert(start, (end, symbol));
        self
    }

    pub fn with_module(mut self, start: u64, end: u64, name: &str) -> Self {
        self.modules.push(Module {
            start,
            end,
            name: name.to_string(),
        });
        self
    }

    /// How many addresses were looked up so far.
    pub fn resolve_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl SymbolResolver for StaticResolver {
    fn resolve(&self, address: u64) -> Option<ResolvedSymbol> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let (_, (end, symbol)) = self.symbols.range(..=address).next_back()?;
        (address < *end).then(|| symbol.clone())
    }

    fn module_name(&self, address: u64) -> Option<String> {
        find_module(&self.modules, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn known_function() -> u64 {
        known_function as usize as u64
    }

    #[test]
    fn static_ranges() {
        let resolver = StaticResolver::new()
            .with_symbol(0x1000, 0x1100, ResolvedSymbol::new("compute", "lib.c", 10))
            .with_module(0x1000, 0x2000, "libwork.so");

        assert_eq!(
            resolver.resolve(0x1050),
            Some(ResolvedSymbol::new("compute", "lib.c", 10))
        );
        assert_eq!(resolver.resolve(0x1100), None);
        assert_eq!(resolver.resolve(0x0fff), None);
        assert_eq!(resolver.module_name(0x1fff).as_deref(), Some("libwork.so"));
        assert_eq!(resolver.module_name(0x2000), None);
        assert_eq!(resolver.resolve_calls(), 3);
    }

    #[test]
    fn blazesym_resolves_own_functions() {
        let resolver = BlazeResolver::new();
        let address = known_function();

        let symbol = resolver.resolve(address).expect("symbol for a local function");
        assert!(symbol.function.contains("known_function"), "{symbol:?}");
        assert!(resolver.module_name(address).is_some());
    }

    #[test]
    fn blazesym_unknown_address() {
        let resolver = BlazeResolver::new();
        assert_eq!(resolver.resolve_many(&[0x10]), vec![None]);
        assert_eq!(resolver.module_name(0x10), None);
    }
}
