//! Symbol resolution for patch-by-name.
//!
//! The fast path is the dynamic loader (`dlsym`). When that misses, the
//! slow path walks symbol tables, including the on-disk `.symtab`, which
//! carries local (non-exported) symbols such as most Rust functions. A
//! failed lookup reports up to three fuzzy candidates.

mod suggest;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::{
    enumerate_modules, enumerate_symbols, find_export_by_name, find_global_export_by_name,
    find_module_by_name, resolve_address_module,
};

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "macos")]
pub use darwin::{
    enumerate_modules, enumerate_symbols, find_export_by_name, find_global_export_by_name,
    find_module_by_name, resolve_address_module,
};

use crate::code::ptrauth::strip_code_ptr;
use crate::types::{MockError, Result};
use suggest::Suggester;

/// Where a symbol lookup searches.
#[derive(Debug, Clone, Default)]
pub enum ResolveScope {
    /// All loaded modules.
    #[default]
    Global,
    /// A single module, by name or path suffix.
    Module(String),
}

/// Resolve a symbol name to a callable address.
///
/// Tries the dynamic loader first, then scans full symbol tables for an
/// exact match, then for a unique containment match (useful for mangled
/// or crate-qualified Rust names). On failure the error carries fuzzy
/// candidates.
pub fn resolve_symbol(name: &str, scope: &ResolveScope) -> Result<usize> {
    let quick = match scope {
        ResolveScope::Global => find_global_export_by_name(name),
        ResolveScope::Module(module) => find_export_by_name(module, name),
    };
    if let Ok(addr) = quick {
        return Ok(addr);
    }

    let modules: Vec<String> = match scope {
        ResolveScope::Global => enumerate_modules().into_iter().map(|m| m.name).collect(),
        ResolveScope::Module(module) => vec![module.clone()],
    };

    let mut suggester = Suggester::new(name);
    let mut containment: Option<usize> = None;

    for module in &modules {
        let Ok(symbols) = enumerate_symbols(module) else {
            continue;
        };
        for sym in &symbols {
            if sym.name == name {
                return Ok(sym.address);
            }
            if containment.is_none() && sym.name.contains(name) {
                containment = Some(sym.address);
            }
            suggester.add_item(&sym.name);
        }
    }

    if let Some(addr) = containment {
        log::debug!("symbol {name:?} resolved by containment scan to {addr:#x}");
        return Ok(addr);
    }

    Err(MockError::SymbolNotFound {
        name: name.to_string(),
        suggestions: suggester.suggestions(),
    })
}

/// Normalize a code address for patching.
///
/// Strips pointer-authentication bits where the ABI signs code pointers
/// and rejects null.
pub fn resolve_fn_addr(addr: usize) -> Result<usize> {
    let stripped = strip_code_ptr(addr);
    if stripped == 0 {
        return Err(MockError::InvalidTarget);
    }
    Ok(stripped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_symbol_finds_malloc_globally() {
        let addr = resolve_symbol("malloc", &ResolveScope::Global).expect("malloc");
        assert_ne!(addr, 0);
    }

    #[test]
    fn resolve_symbol_reports_not_found_with_variant() {
        let err = resolve_symbol("no_such_symbol_qqq_314159", &ResolveScope::Global).unwrap_err();
        assert!(matches!(err, MockError::SymbolNotFound { .. }), "{err}");
    }

    #[test]
    fn resolve_symbol_scoped_to_missing_module_fails() {
        let scope = ResolveScope::Module("libdoesnotexist.so.99".to_string());
        assert!(resolve_symbol("malloc", &scope).is_err());
    }

    #[test]
    fn resolve_fn_addr_rejects_null() {
        assert_eq!(resolve_fn_addr(0), Err(MockError::InvalidTarget));
    }

    #[test]
    fn resolve_fn_addr_passes_plain_addresses() {
        let addr = resolve_symbol("malloc", &ResolveScope::Global).expect("malloc");
        let norm = resolve_fn_addr(addr).expect("normalize");
        assert_ne!(norm, 0);
    }
}
