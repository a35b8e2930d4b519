use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, MockError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MockError {
    /// The patch target resolved to a null or otherwise unusable address.
    #[error("invalid patch target")]
    InvalidTarget,

    /// A parameter had the wrong shape (e.g. a thin reference where a
    /// trait-object reference is required).
    #[error("illegal param {name}: got {got}, want {want}")]
    IllegalParamType {
        name: &'static str,
        got: &'static str,
        want: &'static str,
    },

    /// Replacement arity does not line up with the mocked method.
    #[error("replacement takes {got} arguments, want {want} (or {want} plus a leading context)")]
    ArgsNotMatch { got: usize, want: usize },

    /// Target and replacement signatures differ.
    #[error("target and replacement signatures do not match")]
    SignatureMismatch,

    /// Textual symbol lookup failed. Carries up to three fuzzy candidates.
    #[error("symbol {name:?} not found{}", format_suggestions(.suggestions))]
    SymbolNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    /// The code arena cannot satisfy the reservation.
    #[error("code arena overflow: requested {requested} bytes, {remaining} remaining")]
    SpaceOverflow { requested: usize, remaining: usize },

    /// The named method is not part of the interface description.
    #[error("method {method:?} not found on interface")]
    MethodNotFound { method: String },

    /// A code page could not be made writable or executable.
    #[error("memory protection change failed")]
    MemoryProtect,

    /// Unsupported platform or architecture.
    #[error("unsupported platform")]
    Unsupported,
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(", did you mean one of {:?}", suggestions)
    }
}

/// A module loaded into the process image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base_address: usize,
    pub size: usize,
}

/// A named address inside a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportInfo {
    pub name: String,
    pub address: usize,
}

mod sealed {
    pub trait Sealed {}
}

/// Function-pointer types that can serve as patch targets or replacements.
///
/// Implemented for plain, `extern "C"`, and `unsafe extern "C"` function
/// pointers of arity 0 through 6. Because [`crate::patch::patch`] requires
/// target and replacement to be the *same* `FnPtr` type, signature equality
/// is enforced at compile time.
pub trait FnPtr: sealed::Sealed + Copy {
    /// Number of arguments the function takes.
    const ARITY: usize;

    /// Entry address of the function.
    fn addr(self) -> usize;
}

macro_rules! count_args {
    () => { 0usize };
    ($head:ident $(, $tail:ident)*) => { 1usize + count_args!($($tail),*) };
}

macro_rules! impl_fn_ptr {
    ($($arg:ident),*) => {
        impl<R, $($arg),*> sealed::Sealed for fn($($arg),*) -> R {}
        impl<R, $($arg),*> FnPtr for fn($($arg),*) -> R {
            const ARITY: usize = count_args!($($arg),*);
            fn addr(self) -> usize {
                self as usize
            }
        }

        impl<R, $($arg),*> sealed::Sealed for extern "C" fn($($arg),*) -> R {}
        impl<R, $($arg),*> FnPtr for extern "C" fn($($arg),*) -> R {
            const ARITY: usize = count_args!($($arg),*);
            fn addr(self) -> usize {
                self as usize
            }
        }

        impl<R, $($arg),*> sealed::Sealed for unsafe extern "C" fn($($arg),*) -> R {}
        impl<R, $($arg),*> FnPtr for unsafe extern "C" fn($($arg),*) -> R {
            const ARITY: usize = count_args!($($arg),*);
            fn addr(self) -> usize {
                self as usize
            }
        }
    };
}

impl_fn_ptr!();
impl_fn_ptr!(A1);
impl_fn_ptr!(A1, A2);
impl_fn_ptr!(A1, A2, A3);
impl_fn_ptr!(A1, A2, A3, A4);
impl_fn_ptr!(A1, A2, A3, A4, A5);
impl_fn_ptr!(A1, A2, A3, A4, A5, A6);

#[cfg(test)]
mod tests {
    use super::*;

    fn nullary() -> u32 {
        7
    }

    extern "C" fn ternary(a: i64, _b: i64, _c: i64) -> i64 {
        a
    }

    #[test]
    fn fn_ptr_reports_arity_and_address() {
        let f: fn() -> u32 = nullary;
        assert_eq!(<fn() -> u32 as FnPtr>::ARITY, 0);
        assert_ne!(f.addr(), 0);

        let g: extern "C" fn(i64, i64, i64) -> i64 = ternary;
        assert_eq!(<extern "C" fn(i64, i64, i64) -> i64 as FnPtr>::ARITY, 3);
        assert_ne!(g.addr(), 0);
    }

    #[test]
    fn symbol_not_found_message_lists_suggestions() {
        let err = MockError::SymbolNotFound {
            name: "tim::now".into(),
            suggestions: vec!["time::now".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("tim::now"), "{msg}");
        assert!(msg.contains("time::now"), "{msg}");

        let bare = MockError::SymbolNotFound {
            name: "nope".into(),
            suggestions: vec![],
        };
        assert!(!bare.to_string().contains("did you mean"));
    }
}
