//! Specifier resolution.
//!
//! Rust has no runtime module loader, so "modules" are plugin factories
//! registered under a path. A specifier resolves the way a file lookup
//! would: each module directory is tried with the package prefix and then
//! without, and only then is the specifier taken relative to each base
//! directory. Paths are compared after lexical normalisation, so
//! `./plugins/../cors` and `cors` name the same module.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use super::Plugin;
use crate::error::{Error, Result};

type Factory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// One entry of a plugin stack.
pub enum StackEntry {
    /// A ready-made plugin instance.
    Plugin(Box<dyn Plugin>),
    /// A module specifier, resolved through a [`Registry`].
    Specifier(String),
}

impl fmt::Debug for StackEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin(p) => f.debug_tuple("Plugin").field(&p.name()).finish(),
            Self::Specifier(s) => f.debug_tuple("Specifier").field(s).finish(),
        }
    }
}

impl From<&str> for StackEntry {
    fn from(s: &str) -> Self { Self::Specifier(s.to_owned()) }
}

impl From<String> for StackEntry {
    fn from(s: String) -> Self { Self::Specifier(s) }
}

impl<P: Plugin + 'static> From<Box<P>> for StackEntry {
    fn from(p: Box<P>) -> Self { Self::Plugin(p) }
}

/// Plugin factories keyed by module path.
#[derive(Clone)]
pub struct Registry {
    modules: BTreeMap<PathBuf, Factory>,
    prefix: String,
}

impl Registry {
    pub const DEFAULT_PREFIX: &'static str = "wharf-";

    pub fn new() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }

    /// A registry that tries `<prefix><specifier>` before the bare
    /// specifier inside module directories.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self { modules: BTreeMap::new(), prefix: prefix.into() }
    }

    /// Registers `factory` as the module at `path`.
    pub fn register<F, P>(&mut self, path: impl AsRef<Path>, factory: F) -> &mut Self
    where
        F: Fn() -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        let factory: Factory = Arc::new(move || Box::new(factory()) as Box<dyn Plugin>);
        self.modules.insert(normalize(path.as_ref()), factory);
        self
    }

    pub fn contains(&self, path: impl AsRef<Path>) -> bool {
        self.modules.contains_key(&normalize(path.as_ref()))
    }

    /// Instantiates the module `specifier` names.
    ///
    /// Fails with [`Error::ModuleNotFound`] listing every location tried.
    pub fn resolve(
        &self,
        specifier: &str,
        module_dirs: &[PathBuf],
        base_dirs: &[PathBuf],
    ) -> Result<Box<dyn Plugin>> {
        let prefixed = format!("{}{specifier}", self.prefix);
        let mut searched = Vec::new();

        let candidates = module_dirs
            .iter()
            .flat_map(|dir| {
                let with_prefix = (!self.prefix.is_empty()).then(|| dir.join(&prefixed));
                with_prefix.into_iter().chain(Some(dir.join(specifier)))
            })
            .chain(base_dirs.iter().map(|dir| dir.join(specifier)));

        for candidate in candidates {
            let key = normalize(&candidate);
            if let Some(factory) = self.modules.get(&key) {
                tracing::debug!(specifier, module = %key.display(), "resolved plugin");
                return Ok(factory());
            }
            searched.push(key.display().to_string());
        }

        searched.dedup();
        Err(Error::ModuleNotFound { specifier: specifier.to_owned(), searched })
    }

    pub(crate) fn entry(
        &self,
        entry: StackEntry,
        module_dirs: &[PathBuf],
        base_dirs: &[PathBuf],
    ) -> Result<Box<dyn Plugin>> {
        match entry {
            StackEntry::Plugin(p) => Ok(p),
            StackEntry::Specifier(s) => self.resolve(&s, module_dirs, base_dirs),
        }
    }
}

impl Default for Registry {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("prefix", &self.prefix)
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
