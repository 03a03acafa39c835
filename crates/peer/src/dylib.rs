//! Loading evaluator artifacts into the peer process.
//!
//! A proxy holds at most one artifact. `load` reports a missing file or
//! symbol by logging it and returning `Ok(false)`: the caller treats the
//! evaluator as unavailable. Loading over a loaded artifact is an error.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    AlreadyLoaded(PathBuf),
    NotLoaded,
    Invoke(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyError::AlreadyLoaded(path) => {
                write!(f, "An evaluator is already loaded from {}", path.display())
            }
            ProxyError::NotLoaded => write!(f, "No evaluator is loaded"),
            ProxyError::Invoke(msg) => write!(f, "Evaluation failed: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

/// How an artifact is loaded, by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Shared library (`.so`, `.dylib`, ...).
    Native,
    /// Lua chunk.
    Lua,
}

impl ArtifactKind {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("lua") => ArtifactKind::Lua,
            _ => ArtifactKind::Native,
        }
    }
}

pub trait LibraryProxy {
    /// Open `path` and resolve `symbol`. `Ok(false)` when either fails; the
    /// reason is logged and kept in [`last_error`](Self::last_error).
    fn load(&mut self, path: &Path, symbol: &str) -> Result<bool, ProxyError>;

    /// Run the loaded evaluator.
    fn evaluate(&mut self, variables: &BTreeMap<String, i64>) -> Result<String, ProxyError>;

    /// Release the artifact. No-op when nothing is loaded.
    fn unload(&mut self);

    fn is_loaded(&self) -> bool;

    /// Why the last `load` returned `false`.
    fn last_error(&self) -> Option<&str>;
}

// ---------------------------------------------------------------------------
// Lua
// ---------------------------------------------------------------------------

/// Runs a Lua chunk that defines the evaluator as a global function.
#[derive(Default)]
pub struct LuaChunkProxy {
    loaded: Option<LoadedChunk>,
    last_error: Option<String>,
}

struct LoadedChunk {
    path: PathBuf,
    symbol: String,
    lua: mlua::Lua,
}

impl LuaChunkProxy {
    pub fn new() -> Self {
        Self::default()
    }

    fn failed(&mut self, message: String) -> Result<bool, ProxyError> {
        log::warn!("{}", message);
        self.last_error = Some(message);
        Ok(false)
    }
}

impl LibraryProxy for LuaChunkProxy {
    fn load(&mut self, path: &Path, symbol: &str) -> Result<bool, ProxyError> {
        if let Some(loaded) = &self.loaded {
            return Err(ProxyError::AlreadyLoaded(loaded.path.clone()));
        }
        self.last_error = None;

        let code = match fs::read_to_string(path) {
            Ok(code) => code,
            Err(e) => return self.failed(format!("Cannot read {}: {}", path.display(), e)),
        };

        let lua = mlua::Lua::new();
        if let Err(e) = lua.load(code.as_str()).set_name(format!("@{}", path.display())).exec() {
            return self.failed(format!("Cannot load {}: {}", path.display(), e));
        }
        if let Err(e) = lua.globals().get::<mlua::Function>(symbol) {
            return self.failed(format!("No function {} in {}: {}", symbol, path.display(), e));
        }

        log::debug!("Loaded Lua evaluator {}", path.display());
        self.loaded = Some(LoadedChunk {
            path: path.to_path_buf(),
            symbol: symbol.to_string(),
            lua,
        });
        Ok(true)
    }

    fn evaluate(&mut self, variables: &BTreeMap<String, i64>) -> Result<String, ProxyError> {
        let loaded = self.loaded.as_ref().ok_or(ProxyError::NotLoaded)?;
        let invoke = |e: mlua::Error| ProxyError::Invoke(e.to_string());

        let function = loaded.lua.globals().get::<mlua::Function>(loaded.symbol.as_str()).map_err(invoke)?;
        let vars = loaded.lua.create_table().map_err(invoke)?;
        for (name, value) in variables {
            vars.set(name.as_str(), *value).map_err(invoke)?;
        }
        function.call::<String>(vars).map_err(invoke)
    }

    fn unload(&mut self) {
        if let Some(loaded) = self.loaded.take() {
            log::debug!("Unloaded Lua evaluator {}", loaded.path.display());
        }
    }

    fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

// ---------------------------------------------------------------------------
// Native
// ---------------------------------------------------------------------------

#[cfg(unix)]
pub use native::NativeLibraryProxy;

#[cfg(unix)]
mod native {
    use std::collections::BTreeMap;
    use std::ffi::{c_char, c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    use super::{LibraryProxy, ProxyError};

    /// `char const *<prefix>_evaluate(void *petriPtr)`
    type EvaluateFn = unsafe extern "C" fn(*mut c_void) -> *const c_char;

    struct Loaded {
        path: PathBuf,
        handle: *mut c_void,
        entry: EvaluateFn,
    }

    /// Shared library opened with `dlopen`.
    ///
    /// The evaluator receives a null net pointer: the peer process hands
    /// variables to Lua evaluators only.
    #[derive(Default)]
    pub struct NativeLibraryProxy {
        loaded: Option<Loaded>,
        last_error: Option<String>,
    }

    fn dl_error() -> String {
        // SAFETY: dlerror returns null or a thread-local NUL-terminated string.
        unsafe {
            let err = libc::dlerror();
            if err.is_null() {
                "unknown dynamic loader error".to_string()
            } else {
                CStr::from_ptr(err).to_string_lossy().into_owned()
            }
        }
    }

    impl NativeLibraryProxy {
        pub fn new() -> Self {
            Self::default()
        }

        fn failed(&mut self, message: String) -> Result<bool, ProxyError> {
            log::warn!("{}", message);
            self.last_error = Some(message);
            Ok(false)
        }
    }

    impl LibraryProxy for NativeLibraryProxy {
        fn load(&mut self, path: &Path, symbol: &str) -> Result<bool, ProxyError> {
            if let Some(loaded) = &self.loaded {
                return Err(ProxyError::AlreadyLoaded(loaded.path.clone()));
            }
            self.last_error = None;

            let c_path = match CString::new(path.as_os_str().as_bytes()) {
                Ok(p) => p,
                Err(_) => return self.failed(format!("Invalid library path {}", path.display())),
            };
            let c_symbol = match CString::new(symbol) {
                Ok(s) => s,
                Err(_) => return self.failed(format!("Invalid symbol name {:?}", symbol)),
            };

            // SAFETY: c_path is NUL-terminated and outlives the call.
            let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            if handle.is_null() {
                return self.failed(format!("Cannot load {}: {}", path.display(), dl_error()));
            }

            // SAFETY: handle is a live dlopen handle.
            let sym = unsafe { libc::dlsym(handle, c_symbol.as_ptr()) };
            if sym.is_null() {
                let message = format!("No symbol {} in {}: {}", symbol, path.display(), dl_error());
                // SAFETY: handle came from dlopen and is closed once.
                unsafe { libc::dlclose(handle) };
                return self.failed(message);
            }

            // SAFETY: the generated evaluator has this exact signature.
            let entry = unsafe { std::mem::transmute::<*mut c_void, EvaluateFn>(sym) };
            log::debug!("Loaded native evaluator {}", path.display());
            self.loaded = Some(Loaded { path: path.to_path_buf(), handle, entry });
            Ok(true)
        }

        fn evaluate(&mut self, _variables: &BTreeMap<String, i64>) -> Result<String, ProxyError> {
            let loaded = self.loaded.as_ref().ok_or(ProxyError::NotLoaded)?;
            // SAFETY: entry points into the library kept open by `handle`.
            let result = unsafe { (loaded.entry)(std::ptr::null_mut()) };
            if result.is_null() {
                return Err(ProxyError::Invoke("the evaluator returned no text".to_string()));
            }
            // SAFETY: the evaluator returns a NUL-terminated static buffer.
            Ok(unsafe { CStr::from_ptr(result) }.to_string_lossy().into_owned())
        }

        fn unload(&mut self) {
            if let Some(loaded) = self.loaded.take() {
                // SAFETY: handle came from dlopen and is closed once.
                if unsafe { libc::dlclose(loaded.handle) } != 0 {
                    log::warn!("dlclose({}) failed: {}", loaded.path.display(), dl_error());
                } else {
                    log::debug!("Unloaded native evaluator {}", loaded.path.display());
                }
            }
        }

        fn is_loaded(&self) -> bool {
            self.loaded.is_some()
        }

        fn last_error(&self) -> Option<&str> {
            self.last_error.as_deref()
        }
    }

    impl Drop for NativeLibraryProxy {
        fn drop(&mut self) {
            self.unload();
        }
    }
}

impl Drop for LuaChunkProxy {
    fn drop(&mut self) {
        self.unload();
    }
}

/// A fresh proxy for the artifact at `path`, or the reason there is none.
pub fn proxy_for(path: &Path) -> Result<Box<dyn LibraryProxy>, String> {
    match ArtifactKind::from_path(path) {
        ArtifactKind::Lua => Ok(Box::new(LuaChunkProxy::new())),
        #[cfg(unix)]
        ArtifactKind::Native => Ok(Box::new(NativeLibraryProxy::new())),
        #[cfg(not(unix))]
        ArtifactKind::Native => {
            Err("Native evaluators are not supported on this platform".to_string())
        }
    }
}
