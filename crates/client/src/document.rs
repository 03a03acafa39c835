//! The net being debugged, as seen by the client.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::compiler::CompilerInvoker;

/// Editor-side view of the net.
pub trait NetDocument: Send + Sync {
    /// SHA-1 hex digest of the generated source, sent with `start`.
    fn hash(&self) -> Result<String, String>;

    /// Regenerate and recompile the net. `Err` carries the diagnostics.
    fn rebuild(&self) -> Result<(), String>;

    /// Whether `id` names an entity of this net.
    fn contains_entity(&self, id: u64) -> bool;
}

/// Lowercase hex SHA-1 of `bytes`.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let digest = Sha1::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A generated source file on disk and the library built from it.
pub struct SourceDocument {
    source: PathBuf,
    library: PathBuf,
    compiler: Arc<dyn CompilerInvoker>,
    /// Known entity ids; `None` accepts every id.
    entities: Option<BTreeSet<u64>>,
}

impl SourceDocument {
    pub fn new(source: &Path, library: &Path, compiler: Arc<dyn CompilerInvoker>) -> Self {
        Self {
            source: source.to_path_buf(),
            library: library.to_path_buf(),
            compiler,
            entities: None,
        }
    }

    pub fn with_entities(mut self, entities: impl IntoIterator<Item = u64>) -> Self {
        self.entities = Some(entities.into_iter().collect());
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn library(&self) -> &Path {
        &self.library
    }
}

impl NetDocument for SourceDocument {
    fn hash(&self) -> Result<String, String> {
        fs::read(&self.source)
            .map(|bytes| sha1_hex(&bytes))
            .map_err(|e| format!("Cannot read {}: {}", self.source.display(), e))
    }

    fn rebuild(&self) -> Result<(), String> {
        let diagnostics = self.compiler.compile(&self.source, &self.library);
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(diagnostics)
        }
    }

    fn contains_entity(&self, id: u64) -> bool {
        self.entities.as_ref().map_or(true, |known| known.contains(&id))
    }
}
