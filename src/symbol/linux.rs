use crate::types::{ExportInfo, MockError, ModuleInfo, Result};
use core::ffi::{c_char, c_void};
use std::collections::{HashMap, HashSet};
use std::ffi::CStr;
use std::sync::{Arc, Mutex};

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn not_found(name: &str) -> MockError {
    MockError::SymbolNotFound {
        name: name.to_string(),
        suggestions: Vec::new(),
    }
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    struct Ctx {
        modules: Vec<ModuleInfo>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        let info = &*info;

        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            // Empty name means the main executable. Read from /proc/self/exe.
            match std::fs::read_link("/proc/self/exe") {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => String::new(),
            }
        } else {
            CStr::from_ptr(info.dlpi_name)
                .to_string_lossy()
                .into_owned()
        };

        // Compute module extent from PT_LOAD segments.
        let mut min_addr: Option<u64> = None;
        let mut max_addr: u64 = 0;
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        for phdr in phdrs {
            if phdr.p_type == libc::PT_LOAD && phdr.p_memsz > 0 {
                let start = phdr.p_vaddr;
                let end = start + phdr.p_memsz;
                min_addr = Some(min_addr.map(|m: u64| m.min(start)).unwrap_or(start));
                max_addr = max_addr.max(end);
            }
        }

        let base = info.dlpi_addr as usize + min_addr.unwrap_or(0) as usize;
        let size = if let Some(min) = min_addr {
            (max_addr - min) as usize
        } else {
            0
        };

        let name = if path.is_empty() {
            String::from("[unknown]")
        } else {
            basename(&path).to_string()
        };

        ctx.modules.push(ModuleInfo {
            name,
            path,
            base_address: base,
            size,
        });

        0 // continue iteration
    }

    let mut ctx = Ctx {
        modules: Vec::new(),
    };

    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }

    ctx.modules
}

pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules()
        .into_iter()
        .find(|m| m.name == name || m.path.ends_with(name))
}

/// Resolve a symbol globally (across all loaded modules) using `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize> {
    let cstr = std::ffi::CString::new(symbol).map_err(|_| not_found(symbol))?;
    unsafe {
        let p = libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr());
        if p.is_null() {
            Err(not_found(symbol))
        } else {
            Ok(p as usize)
        }
    }
}

/// Resolve a symbol within a specific module using `dlopen(RTLD_NOLOAD) + dlsym`.
pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize> {
    let module = find_module_by_name(module_name).ok_or_else(|| not_found(symbol))?;

    let sym_cstr = std::ffi::CString::new(symbol).map_err(|_| not_found(symbol))?;

    // Try the full path first, then the basename.
    for path in &[&module.path, &module.name] {
        if path.is_empty() {
            continue;
        }
        let Ok(path_cstr) = std::ffi::CString::new(path.as_str()) else {
            continue;
        };
        unsafe {
            let handle = libc::dlopen(path_cstr.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_NOW);
            if handle.is_null() {
                continue;
            }
            let p = libc::dlsym(handle, sym_cstr.as_ptr());
            libc::dlclose(handle);
            if !p.is_null() {
                return Ok(p as usize);
            }
        }
    }

    // Fall back to global lookup.
    find_global_export_by_name(symbol)
}

// ELF type definitions for parsing dynamic symbol tables from memory.
mod elf {
    pub const DT_NULL: i64 = 0;
    pub const DT_STRTAB: i64 = 5;
    pub const DT_SYMTAB: i64 = 6;
    pub const DT_HASH: i64 = 4;
    pub const DT_GNU_HASH: i64 = 0x6ffffef5;

    pub const SHN_UNDEF: u16 = 0;
    pub const SHN_ABS: u16 = 0xfff1;

    pub const STT_OBJECT: u8 = 1;
    pub const STT_FUNC: u8 = 2;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct Elf64Dyn {
        pub d_tag: i64,
        pub d_val: u64, // d_un union, d_val / d_ptr
    }

    #[repr(C)]
    pub struct ElfHash {
        pub nbucket: u32,
        pub nchain: u32,
        // followed by: bucket[nbucket], chain[nchain]
    }
}

/// Enumerate all symbols visible in a module: the in-memory dynamic table
/// plus the on-disk `.symtab` (which carries local symbols the dynamic
/// table omits).
pub fn enumerate_symbols(module_name: &str) -> Result<Vec<ExportInfo>> {
    let mut syms = enumerate_dynamic_symbols(module_name)?;

    if let Some(module) = find_module_by_name(module_name) {
        if !module.path.is_empty() {
            if let Ok(table) = cached_disk_symtab(&module.path) {
                let existing: HashSet<usize> = syms.iter().map(|s| s.address).collect();
                for (name, value) in table.syms.iter() {
                    let Some(address) = rebase_disk_value(&table, module.base_address, *value)
                    else {
                        continue;
                    };
                    if !existing.contains(&address) {
                        syms.push(ExportInfo {
                            name: name.clone(),
                            address,
                        });
                    }
                }
            }
        }
    }

    Ok(syms)
}

fn enumerate_dynamic_symbols(module_name: &str) -> Result<Vec<ExportInfo>> {
    struct Ctx {
        module_name: String,
        result: Option<Vec<ExportInfo>>,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx);
        if ctx.result.is_some() {
            return 1; // already found
        }

        let info = &*info;
        let path = if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
            match std::fs::read_link("/proc/self/exe") {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(_) => String::new(),
            }
        } else {
            CStr::from_ptr(info.dlpi_name)
                .to_string_lossy()
                .into_owned()
        };

        let name = if path.is_empty() {
            "[unknown]".to_string()
        } else {
            basename(&path).to_string()
        };

        if name != ctx.module_name && !path.ends_with(&ctx.module_name) {
            return 0; // continue
        }

        // Find PT_DYNAMIC segment.
        let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let mut dynamic_ptr: *const elf::Elf64Dyn = core::ptr::null();
        for phdr in phdrs {
            if phdr.p_type == libc::PT_DYNAMIC {
                dynamic_ptr = (info.dlpi_addr + phdr.p_vaddr) as *const elf::Elf64Dyn;
                break;
            }
        }
        if dynamic_ptr.is_null() {
            return 0;
        }

        // Walk DT entries to find SYMTAB, STRTAB, HASH/GNU_HASH.
        // DT entries contain virtual addresses. For most shared libraries loaded
        // by ld.so these are already relocated to absolute runtime addresses,
        // but for kernel-injected modules like linux-vdso.so.1 they may be
        // pristine file virtual addresses that need the base added.
        let mut symtab_val: u64 = 0;
        let mut strtab_val: u64 = 0;
        let mut hash_val: u64 = 0;
        let mut gnu_hash_val: u64 = 0;

        let mut dyn_entry = dynamic_ptr;
        loop {
            let entry = &*dyn_entry;
            if entry.d_tag == elf::DT_NULL {
                break;
            }
            match entry.d_tag {
                elf::DT_SYMTAB => symtab_val = entry.d_val,
                elf::DT_STRTAB => strtab_val = entry.d_val,
                elf::DT_HASH => hash_val = entry.d_val,
                elf::DT_GNU_HASH => gnu_hash_val = entry.d_val,
                _ => {}
            }
            dyn_entry = dyn_entry.add(1);
        }

        if symtab_val == 0 || strtab_val == 0 {
            return 0;
        }

        let base = info.dlpi_addr;
        let adjusted = symtab_val > base || strtab_val > base;
        let resolve = |val: u64| -> usize {
            if adjusted {
                val as usize
            } else {
                (base + val) as usize
            }
        };

        let symtab = resolve(symtab_val) as *const elf::Elf64Sym;
        let strtab = resolve(strtab_val) as *const u8;
        let hash: *const elf::ElfHash = if hash_val != 0 {
            resolve(hash_val) as *const elf::ElfHash
        } else {
            core::ptr::null()
        };
        let gnu_hash_ptr: *const u8 = if gnu_hash_val != 0 {
            resolve(gnu_hash_val) as *const u8
        } else {
            core::ptr::null()
        };

        // Determine number of symbols from the hash table.
        let nsyms = if !hash.is_null() {
            (*hash).nchain as usize
        } else if !gnu_hash_ptr.is_null() {
            gnu_hash_nsyms(gnu_hash_ptr)
        } else {
            return 0;
        };

        let base_usize = base as usize;
        let mut out = Vec::new();

        for i in 0..nsyms {
            let sym = &*symtab.add(i);
            if sym.st_shndx == elf::SHN_UNDEF || sym.st_value == 0 || sym.st_name == 0 {
                continue;
            }

            let name_ptr = strtab.add(sym.st_name as usize) as *const c_char;
            let name = CStr::from_ptr(name_ptr).to_string_lossy().into_owned();

            out.push(ExportInfo {
                name,
                address: base_usize + sym.st_value as usize,
            });
        }

        ctx.result = Some(out);
        1 // stop iteration
    }

    let mut ctx = Ctx {
        module_name: module_name.to_string(),
        result: None,
    };

    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut ctx as *mut Ctx as *mut c_void);
    }

    ctx.result.ok_or_else(|| not_found(module_name))
}

/// Compute the number of symbols from a GNU hash table.
///
/// GNU hash tables don't store nchain directly. We have to scan the
/// chain array to find the highest symbol index.
unsafe fn gnu_hash_nsyms(gnu_hash: *const u8) -> usize {
    // GNU hash layout:
    //   u32 nbuckets
    //   u32 symoffset  (index of first symbol in hash)
    //   u32 bloom_size
    //   u32 bloom_shift
    //   u64[bloom_size] bloom filter
    //   u32[nbuckets] buckets
    //   u32[] chains (one per symbol starting from symoffset)
    let nbuckets = *(gnu_hash as *const u32);
    let symoffset = *((gnu_hash as *const u32).add(1));
    let bloom_size = *((gnu_hash as *const u32).add(2));

    let bloom = (gnu_hash as *const u32).add(4) as *const u64;
    let buckets = bloom.add(bloom_size as usize) as *const u32;
    let chains = buckets.add(nbuckets as usize);

    let mut max_sym: u32 = 0;
    for i in 0..nbuckets {
        let b = *buckets.add(i as usize);
        if b > max_sym {
            max_sym = b;
        }
    }

    if max_sym < symoffset {
        return symoffset as usize;
    }

    // Walk the chain from max_sym until the terminating entry (bit 0 set).
    let mut idx = max_sym;
    loop {
        let chain_entry = *chains.add((idx - symoffset) as usize);
        if chain_entry & 1 != 0 {
            break;
        }
        idx += 1;
    }

    (idx + 1) as usize
}

/// Parsed on-disk `.symtab` for one file. Symbol values are file virtual
/// addresses; callers rebase against the module's runtime base when is_dyn.
struct DiskSymtab {
    is_dyn: bool,
    file_base_vma: u64,
    syms: Vec<(String, u64)>,
}

/// Runtime address of an on-disk symbol value, or `None` for values outside
/// the image (absolute symbols can sit below the minimum `p_vaddr`).
fn rebase_disk_value(table: &DiskSymtab, base_address: usize, value: u64) -> Option<usize> {
    if table.is_dyn {
        let offset = value.checked_sub(table.file_base_vma)?;
        Some(base_address + offset as usize)
    } else {
        Some(value as usize)
    }
}

static SYMTAB_CACHE: Mutex<Option<HashMap<String, Option<Arc<DiskSymtab>>>>> = Mutex::new(None);

fn cached_disk_symtab(path: &str) -> Result<Arc<DiskSymtab>> {
    let mut cache = SYMTAB_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    let map = cache.get_or_insert_with(HashMap::new);

    if !map.contains_key(path) {
        let entry = parse_disk_symtab(path).ok().map(Arc::new);
        map.insert(path.to_string(), entry);
    }

    map.get(path)
        .and_then(|e| e.clone())
        .ok_or_else(|| not_found(path))
}

/// Read the full `.symtab` section from an ELF file on disk.
fn parse_disk_symtab(path: &str) -> Result<DiskSymtab> {
    let bytes = std::fs::read(path).map_err(|_| not_found(path))?;
    let size = bytes.len();
    if size < 64 || &bytes[0..4] != b"\x7fELF" {
        return Err(not_found(path));
    }

    let e_shoff = u64::from_le_bytes(bytes[40..48].try_into().unwrap()) as usize;
    let e_shentsize = u16::from_le_bytes(bytes[58..60].try_into().unwrap()) as usize;
    let e_shnum = u16::from_le_bytes(bytes[60..62].try_into().unwrap()) as usize;

    if e_shoff == 0 || e_shnum == 0 || e_shentsize < 64 {
        return Err(not_found(path));
    }

    // Find SHT_SYMTAB and its linked string table.
    const SHT_SYMTAB: u32 = 2;
    let mut symtab_off: usize = 0;
    let mut symtab_size: usize = 0;
    let mut symtab_entsize: usize = 0;
    let mut symtab_link: usize = 0;

    for i in 0..e_shnum {
        let sh = e_shoff + i * e_shentsize;
        if sh + e_shentsize > size {
            break;
        }
        let sh_type = u32::from_le_bytes(bytes[sh + 4..sh + 8].try_into().unwrap());
        if sh_type == SHT_SYMTAB {
            symtab_off = u64::from_le_bytes(bytes[sh + 24..sh + 32].try_into().unwrap()) as usize;
            symtab_size = u64::from_le_bytes(bytes[sh + 32..sh + 40].try_into().unwrap()) as usize;
            symtab_link = u32::from_le_bytes(bytes[sh + 40..sh + 44].try_into().unwrap()) as usize;
            symtab_entsize =
                u64::from_le_bytes(bytes[sh + 56..sh + 64].try_into().unwrap()) as usize;
            break;
        }
    }

    if symtab_off == 0 || symtab_entsize == 0 {
        return Err(not_found(path));
    }

    let strtab_sh = e_shoff + symtab_link * e_shentsize;
    if strtab_sh + e_shentsize > size {
        return Err(not_found(path));
    }
    let strtab_off =
        u64::from_le_bytes(bytes[strtab_sh + 24..strtab_sh + 32].try_into().unwrap()) as usize;
    let strtab_size =
        u64::from_le_bytes(bytes[strtab_sh + 32..strtab_sh + 40].try_into().unwrap()) as usize;

    if strtab_off + strtab_size > size || symtab_off + symtab_size > size {
        return Err(not_found(path));
    }

    // ET_DYN images need their symbol values rebased at lookup time.
    let e_type = u16::from_le_bytes(bytes[16..18].try_into().unwrap());
    let is_dyn = e_type == 3;

    let mut file_base_vma: u64 = 0;
    if is_dyn {
        let e_phoff = u64::from_le_bytes(bytes[32..40].try_into().unwrap()) as usize;
        let e_phnum = u16::from_le_bytes(bytes[56..58].try_into().unwrap()) as usize;
        let e_phentsize = u16::from_le_bytes(bytes[54..56].try_into().unwrap()) as usize;

        let mut min_vaddr: Option<u64> = None;
        for i in 0..e_phnum {
            let ph = e_phoff + i * e_phentsize;
            if ph + e_phentsize > size {
                break;
            }
            let p_type = u32::from_le_bytes(bytes[ph..ph + 4].try_into().unwrap());
            if p_type == 1 {
                let p_vaddr = u64::from_le_bytes(bytes[ph + 16..ph + 24].try_into().unwrap());
                min_vaddr = Some(min_vaddr.map(|m: u64| m.min(p_vaddr)).unwrap_or(p_vaddr));
            }
        }
        file_base_vma = min_vaddr.unwrap_or(0);
    }

    let nsyms = symtab_size / symtab_entsize;
    let mut syms = Vec::new();

    for i in 0..nsyms {
        let off = symtab_off + i * symtab_entsize;
        if off + 24 > size {
            break;
        }

        let st_name = u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap()) as usize;
        let st_info = bytes[off + 4];
        let st_shndx = u16::from_le_bytes(bytes[off + 6..off + 8].try_into().unwrap());
        let st_value = u64::from_le_bytes(bytes[off + 8..off + 16].try_into().unwrap());

        // SHN_ABS values are not image-relative and must not be rebased.
        if st_value == 0 || st_shndx == elf::SHN_UNDEF || st_shndx == elf::SHN_ABS || st_name == 0 {
            continue;
        }

        let st_type = st_info & 0xf;
        if st_type != elf::STT_FUNC && st_type != elf::STT_OBJECT {
            continue;
        }

        if st_name >= strtab_size {
            continue;
        }

        let name_start = strtab_off + st_name;
        let name_end = bytes[name_start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| name_start + p)
            .unwrap_or(name_start);
        let name = String::from_utf8_lossy(&bytes[name_start..name_end]).into_owned();

        syms.push((name, st_value));
    }

    Ok(DiskSymtab {
        is_dyn,
        file_base_vma,
        syms,
    })
}

/// Resolve which module an address belongs to via `dladdr`.
pub fn resolve_address_module(address: usize) -> Option<String> {
    unsafe {
        let mut info: libc::Dl_info = core::mem::zeroed();
        if libc::dladdr(address as *const c_void, &mut info) == 0 {
            return None;
        }
        if info.dli_fname.is_null() {
            return None;
        }
        let path = CStr::from_ptr(info.dli_fname).to_string_lossy();
        Some(basename(&path).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enumerate_modules_finds_libc() {
        let modules = enumerate_modules();
        assert!(!modules.is_empty());
        let has_libc = modules
            .iter()
            .any(|m| m.name.contains("libc") || m.name.contains("ld-linux"));
        assert!(
            has_libc,
            "modules: {:?}",
            modules.iter().map(|m| &m.name).collect::<Vec<_>>()
        );
    }

    #[test]
    fn find_export_resolves_malloc() {
        let addr = find_global_export_by_name("malloc").expect("malloc should resolve");
        assert_ne!(addr, 0);
    }

    #[test]
    fn find_export_in_module_resolves_malloc() {
        let malloc_addr = find_global_export_by_name("malloc").expect("malloc should resolve");
        let module_name = resolve_address_module(malloc_addr).expect("dladdr should find module");
        let addr =
            find_export_by_name(&module_name, "malloc").expect("malloc in its defining module");
        assert_ne!(addr, 0);
    }

    #[test]
    fn find_export_returns_error_for_missing() {
        assert!(
            find_global_export_by_name("this_symbol_definitely_does_not_exist_xyz123").is_err()
        );
    }

    #[test]
    fn enumerate_symbols_finds_malloc() {
        let malloc_addr = find_global_export_by_name("malloc").expect("malloc should resolve");
        let module_name = resolve_address_module(malloc_addr).expect("dladdr should find module");
        let symbols = enumerate_symbols(&module_name).expect("enumerate symbols");
        assert!(
            symbols.iter().any(|s| s.name == "malloc"),
            "missing malloc in symbols; module_name={module_name}, symbols_len={}",
            symbols.len()
        );
    }

    #[test]
    fn enumerate_symbols_finds_local_symbols_from_disk() {
        let exe_path = std::fs::read_link("/proc/self/exe").expect("read /proc/self/exe");
        let exe_name = exe_path.file_name().unwrap().to_string_lossy().to_string();

        let module = find_module_by_name(&exe_name).expect("find test binary module");

        // The test binary is not stripped, so the disk .symtab has to parse.
        let table = cached_disk_symtab(&module.path).expect("parse disk .symtab");
        assert!(table.is_dyn, "PIE test binary should be ET_DYN");
        assert!(table.syms.len() > 10, "got {} symbols", table.syms.len());
        assert!(table.syms.iter().all(|(n, _)| !n.is_empty()));

        let all_syms = enumerate_symbols(&exe_name).expect("enumerate_symbols");
        assert!(
            all_syms.len() >= table.syms.len(),
            "enumerate_symbols should include disk symbols"
        );
    }

    #[test]
    fn rebase_skips_values_below_the_image_base() {
        let table = DiskSymtab {
            is_dyn: true,
            file_base_vma: 0x1000,
            syms: Vec::new(),
        };
        // An absolute value below the minimum load vaddr has no runtime
        // address in this image; it must be dropped, not wrapped.
        assert_eq!(rebase_disk_value(&table, 0x5000_0000, 0x800), None);
        assert_eq!(
            rebase_disk_value(&table, 0x5000_0000, 0x1010),
            Some(0x5000_0010)
        );

        let exec_table = DiskSymtab {
            is_dyn: false,
            file_base_vma: 0,
            syms: Vec::new(),
        };
        assert_eq!(
            rebase_disk_value(&exec_table, 0x5000_0000, 0x40_1000),
            Some(0x40_1000)
        );
    }

    #[test]
    fn disk_symtab_rejects_non_elf_and_missing_files() {
        assert!(parse_disk_symtab("/tmp/this_path_does_not_exist_xyz").is_err());
        // /etc/hosts is reliably present and not an ELF file.
        assert!(parse_disk_symtab("/etc/hosts").is_err());
    }

    #[test]
    fn disk_symtab_cache_returns_same_parse() {
        let exe_path = std::fs::read_link("/proc/self/exe").expect("read /proc/self/exe");
        let path = exe_path.to_string_lossy().to_string();
        let a = cached_disk_symtab(&path).expect("first call");
        let b = cached_disk_symtab(&path).expect("second call");
        assert!(Arc::ptr_eq(&a, &b), "cache should hand out the same parse");
    }

    #[test]
    fn enumerate_symbols_concurrent_access() {
        let malloc_addr = find_global_export_by_name("malloc").expect("malloc");
        let module_name = resolve_address_module(malloc_addr).expect("module");
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let name = module_name.clone();
                std::thread::spawn(move || {
                    let syms = enumerate_symbols(&name).expect("enumerate_symbols");
                    assert!(syms.iter().any(|s| s.name == "malloc"), "should find malloc");
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
    }
}
