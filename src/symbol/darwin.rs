use crate::types::{ExportInfo, MockError, ModuleInfo, Result};
use core::ffi::{c_char, c_void};
use libc::{dladdr, dlsym, Dl_info, RTLD_DEFAULT};

mod macho {
    // Minimal Mach-O definitions to support in-memory symbol enumeration.

    pub const MH_MAGIC_64: u32 = 0xfeedfacf;
    pub const LC_SEGMENT_64: u32 = 0x19;
    pub const LC_SYMTAB: u32 = 0x2;

    pub const N_EXT: u8 = 0x01;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct mach_header_64 {
        pub magic: u32,
        pub cputype: i32,
        pub cpusubtype: i32,
        pub filetype: u32,
        pub ncmds: u32,
        pub sizeofcmds: u32,
        pub flags: u32,
        pub reserved: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct load_command {
        pub cmd: u32,
        pub cmdsize: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct segment_command_64 {
        pub cmd: u32,
        pub cmdsize: u32,
        pub segname: [u8; 16],
        pub vmaddr: u64,
        pub vmsize: u64,
        pub fileoff: u64,
        pub filesize: u64,
        pub maxprot: i32,
        pub initprot: i32,
        pub nsects: u32,
        pub flags: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct symtab_command {
        pub cmd: u32,
        pub cmdsize: u32,
        pub symoff: u32,
        pub nsyms: u32,
        pub stroff: u32,
        pub strsize: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub union n_un {
        pub n_strx: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct nlist_64 {
        pub n_un: n_un,
        pub n_type: u8,
        pub n_sect: u8,
        pub n_desc: u16,
        pub n_value: u64,
    }
}

use macho::{
    load_command, mach_header_64, nlist_64, segment_command_64, symtab_command, LC_SEGMENT_64,
    LC_SYMTAB, MH_MAGIC_64, N_EXT,
};

extern "C" {
    fn _dyld_image_count() -> u32;
    fn _dyld_get_image_header(index: u32) -> *const mach_header_64;
    fn _dyld_get_image_name(index: u32) -> *const c_char;
    fn _dyld_get_image_vmaddr_slide(index: u32) -> isize;
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn not_found(name: &str) -> MockError {
    MockError::SymbolNotFound {
        name: name.to_string(),
        suggestions: Vec::new(),
    }
}

unsafe fn load_commands(header: *const mach_header_64) -> (*const load_command, u32) {
    let cmds =
        (header as *const u8).add(core::mem::size_of::<mach_header_64>()) as *const load_command;
    (cmds, (*header).ncmds)
}

unsafe fn for_each_segment_64(
    header: *const mach_header_64,
    mut f: impl FnMut(&segment_command_64),
) {
    let (mut cmd, ncmds) = load_commands(header);
    for _ in 0..ncmds {
        if (*cmd).cmd == LC_SEGMENT_64 {
            let seg = &*(cmd as *const segment_command_64);
            f(seg);
        }
        cmd = (cmd as *const u8).add((*cmd).cmdsize as usize) as *const load_command;
    }
}

unsafe fn find_symtab(header: *const mach_header_64) -> Option<&'static symtab_command> {
    let (mut cmd, ncmds) = load_commands(header);
    for _ in 0..ncmds {
        if (*cmd).cmd == LC_SYMTAB {
            return Some(&*(cmd as *const symtab_command));
        }
        cmd = (cmd as *const u8).add((*cmd).cmdsize as usize) as *const load_command;
    }
    None
}

unsafe fn fileoff_to_ptr(
    header: *const mach_header_64,
    slide: isize,
    fileoff: u64,
) -> Option<*const u8> {
    let mut out: Option<*const u8> = None;
    for_each_segment_64(header, |seg| {
        if out.is_some() {
            return;
        }
        let start = seg.fileoff;
        let end = seg.fileoff.saturating_add(seg.filesize);
        if fileoff >= start && fileoff < end {
            let delta = fileoff - start;
            let vmaddr = (seg.vmaddr as i128) + (slide as i128) + (delta as i128);
            out = Some(vmaddr as u64 as *const u8);
        }
    });
    out
}

unsafe fn module_range(header: *const mach_header_64, slide: isize) -> Option<(usize, usize)> {
    let mut min: Option<u64> = None;
    let mut max: u64 = 0;
    for_each_segment_64(header, |seg| {
        if seg.vmsize == 0 {
            return;
        }
        let start = (seg.vmaddr as i128 + slide as i128) as u64;
        let end = start.saturating_add(seg.vmsize);
        min = Some(min.map(|m| m.min(start)).unwrap_or(start));
        max = max.max(end);
    });
    min.map(|m| (m as usize, (max - m) as usize))
}

pub fn enumerate_modules() -> Vec<ModuleInfo> {
    let count = unsafe { _dyld_image_count() };
    let mut out = Vec::with_capacity(count as usize);

    for i in 0..count {
        unsafe {
            let header = _dyld_get_image_header(i);
            if header.is_null() {
                continue;
            }
            if (*header).magic != MH_MAGIC_64 {
                continue;
            }

            let slide = _dyld_get_image_vmaddr_slide(i);
            let name_ptr = _dyld_get_image_name(i);
            let path = if name_ptr.is_null() {
                String::new()
            } else {
                // Safety: dyld returns NUL-terminated path string.
                let cstr = core::ffi::CStr::from_ptr(name_ptr);
                cstr.to_string_lossy().into_owned()
            };

            let (base, size) = module_range(header, slide).unwrap_or((header as usize, 0));
            let name = if path.is_empty() {
                format!("image_{i}")
            } else {
                basename(&path).to_string()
            };

            out.push(ModuleInfo {
                name,
                path,
                base_address: base,
                size,
            });
        }
    }

    out
}

pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    enumerate_modules().into_iter().find(|m| m.name == name)
}

pub fn find_global_export_by_name(symbol: &str) -> Result<usize> {
    let cstr = std::ffi::CString::new(symbol).map_err(|_| not_found(symbol))?;
    unsafe {
        let mut p = dlsym(RTLD_DEFAULT, cstr.as_ptr());
        if !p.is_null() {
            return Ok(p as usize);
        }

        // Compatibility with callers that pass Mach-O `nlist`-style names
        // (leading underscore).
        if let Some(stripped) = symbol.strip_prefix('_') {
            if let Ok(alt) = std::ffi::CString::new(stripped) {
                p = dlsym(RTLD_DEFAULT, alt.as_ptr());
            }
        } else {
            let mut buf = String::with_capacity(symbol.len() + 1);
            buf.push('_');
            buf.push_str(symbol);
            if let Ok(alt) = std::ffi::CString::new(buf) {
                p = dlsym(RTLD_DEFAULT, alt.as_ptr());
            }
        }

        if p.is_null() {
            Err(not_found(symbol))
        } else {
            Ok(p as usize)
        }
    }
}

pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize> {
    let exports = enumerate_symbols_internal(module_name, true)?;
    for e in exports {
        if e.name == symbol {
            return Ok(e.address);
        }
    }
    find_global_export_by_name(symbol)
}

/// Enumerate all symbols from a module's in-memory Mach-O image.
///
/// One leading underscore (the Mach-O prefix) is stripped, which also
/// normalizes C++ mangled names like `__ZN...` to `_ZN...`.
pub fn enumerate_symbols(module_name: &str) -> Result<Vec<ExportInfo>> {
    enumerate_symbols_internal(module_name, false)
}

fn enumerate_symbols_internal(module_name: &str, only_external: bool) -> Result<Vec<ExportInfo>> {
    let module = find_module_by_name(module_name).ok_or_else(|| not_found(module_name))?;
    let count = unsafe { _dyld_image_count() };

    // Re-find by name to get the dyld header/slide; module.path may not be unique.
    for i in 0..count {
        unsafe {
            let header = _dyld_get_image_header(i);
            if header.is_null() || (*header).magic != MH_MAGIC_64 {
                continue;
            }
            let name_ptr = _dyld_get_image_name(i);
            let path = if name_ptr.is_null() {
                String::new()
            } else {
                core::ffi::CStr::from_ptr(name_ptr)
                    .to_string_lossy()
                    .into_owned()
            };
            if basename(&path) != module.name {
                continue;
            }

            let slide = _dyld_get_image_vmaddr_slide(i);
            let symtab = find_symtab(header).ok_or_else(|| not_found(module_name))?;

            let sym_ptr = fileoff_to_ptr(header, slide, symtab.symoff as u64)
                .ok_or_else(|| not_found(module_name))? as *const nlist_64;
            let str_ptr = fileoff_to_ptr(header, slide, symtab.stroff as u64)
                .ok_or_else(|| not_found(module_name))?;

            let mut out = Vec::new();
            for idx in 0..symtab.nsyms {
                let sym = &*sym_ptr.add(idx as usize);
                if sym.n_value == 0 {
                    continue;
                }
                if sym.n_un.n_strx == 0 {
                    continue;
                }
                let is_ext = (sym.n_type & N_EXT) != 0;
                if only_external && !is_ext {
                    continue;
                }

                let name_p = str_ptr.add(sym.n_un.n_strx as usize) as *const c_char;
                if name_p.is_null() {
                    continue;
                }
                let raw = core::ffi::CStr::from_ptr(name_p).to_string_lossy();
                let name = raw.strip_prefix('_').unwrap_or(&raw).to_string();
                out.push(ExportInfo {
                    name,
                    address: (sym.n_value as i128 + slide as i128) as usize,
                });
            }
            return Ok(out);
        }
    }

    Err(not_found(module_name))
}

/// Resolve which module an address belongs to via `dladdr`.
pub fn resolve_address_module(address: usize) -> Option<String> {
    unsafe {
        let mut info: Dl_info = core::mem::zeroed();
        if dladdr(address as *const c_void, &mut info) == 0 {
            return None;
        }
        if info.dli_fname.is_null() {
            return None;
        }
        let path = core::ffi::CStr::from_ptr(info.dli_fname).to_string_lossy();
        Some(basename(&path).to_string())
    }
}
