use std::{fmt, fmt::Display};

use libloading::Library;
use libloading::os::unix::{Library as UnixLibrary, RTLD_LAZY, RTLD_LOCAL};
use tracing::debug;

use crate::contract::RunnerError;

/// Which build of a backend library to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimization {
    Opt,
    NonOpt,
}

impl Optimization {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "opt" => Some(Self::Opt),
            "nonopt" => Some(Self::NonOpt),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Opt => "opt",
            Self::NonOpt => "nonopt",
        }
    }

    /// `lib{base}.so` or `lib{base}-nonopt.so`.
    #[must_use]
    pub fn module_name(self, base: &str) -> String {
        match self {
            Self::Opt => format!("lib{base}.so"),
            Self::NonOpt => format!("lib{base}-nonopt.so"),
        }
    }
}

impl Display for Optimization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens `module` with lazy binding in a private symbol namespace, so an
/// optimized and a scalar build of the same library can coexist.
pub(crate) fn open_module(module: &str) -> Result<Library, RunnerError> {
    // SAFETY: loading runs the module's initializers; backend modules are
    // plain codec libraries without load-time side effects we rely on.
    let library = unsafe { UnixLibrary::open(Some(module), RTLD_LAZY | RTLD_LOCAL) }.map_err(
        |source| RunnerError::LoadLibrary {
            module: module.to_string(),
            source,
        },
    )?;
    debug!(module, "loaded backend module");
    Ok(library.into())
}

/// Resolves `symbol` and copies the function pointer out of the library.
/// The caller keeps `library` alive for as long as the pointer is used.
pub(crate) fn resolve<T: Copy>(
    library: &Library,
    module: &str,
    symbol: &'static str,
) -> Result<T, RunnerError> {
    // SAFETY: `T` is the declared signature of `symbol`; the pointer is
    // stored next to the library that owns it.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .map(|resolved| *resolved)
        .map_err(|source| RunnerError::MissingSymbol {
            module: module.to_string(),
            symbol,
            source,
        })
}

/// Like [`resolve`] for entry points that older builds do not export.
pub(crate) fn resolve_optional<T: Copy>(library: &Library, symbol: &'static str) -> Option<T> {
    // SAFETY: see `resolve`.
    unsafe { library.get::<T>(symbol.as_bytes()) }
        .ok()
        .map(|resolved| *resolved)
}

/// Declares a table of entry points loaded from one backend module. Loading
/// fails, closing the module, as soon as one symbol is missing.
macro_rules! backend_api {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($field:ident: $ty:ty = $symbol:literal,)*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $($field: $ty,)*
            module: String,
            _library: libloading::Library,
        }

        impl $name {
            pub(crate) fn load(module: &str) -> Result<Self, $crate::contract::RunnerError> {
                let library = $crate::loader::open_module(module)?;
                $(let $field = $crate::loader::resolve::<$ty>(&library, module, $symbol)?;)*
                Ok(Self {
                    $($field,)*
                    module: module.to_string(),
                    _library: library,
                })
            }

            #[allow(dead_code)]
            pub(crate) fn module(&self) -> &str {
                &self.module
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("module", &self.module)
                    .finish_non_exhaustive()
            }
        }
    };
}

pub(crate) use backend_api;
