//! Loading a plugin stack.
//!
//! A [`Stack`] turns stack entries into plugins through the [`Registry`]
//! and checks that every plugin is named and that option names are unique
//! across the whole stack. Only then does each plugin get its
//! `stack.<name>` diagnostic sink. Middleware comes out in stack order.

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;

use serde_json::json;

use super::{OptionDefinition, Plugin, Registry, StackEntry};
use crate::compose::Pipeline;
use crate::config::Config;
use crate::diagnostics::Verbose;
use crate::error::{Error, Result};
use crate::server::ServerHandle;

/// An ordered, validated set of plugins.
pub struct Stack {
    plugins: Vec<Box<dyn Plugin>>,
    verbose: Verbose,
}

impl Stack {
    /// Resolves and validates every entry, then attaches diagnostics.
    ///
    /// All-or-nothing: when any entry fails to resolve or validate, no
    /// plugin has been attached and the error is returned.
    pub fn load<I>(
        entries: I,
        registry: &Registry,
        module_dirs: &[PathBuf],
        base_dirs: &[PathBuf],
        verbose: &Verbose,
    ) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<StackEntry>,
    {
        let mut plugins = entries
            .into_iter()
            .map(|entry| registry.entry(entry.into(), module_dirs, base_dirs))
            .collect::<Result<Vec<_>>>()?;

        validate(&plugins)?;

        let verbose = verbose.namespaced("stack");
        for plugin in &mut plugins {
            let sink = verbose.namespaced(plugin.name());
            plugin.attach_verbose(sink);
        }
        verbose.emit(
            "stack.loaded",
            json!(plugins.iter().map(|p| p.name()).collect::<Vec<_>>()),
        );

        Ok(Self { plugins, verbose })
    }

    /// Loads `config.stack`, searching `config.module_dir` and then the
    /// working directory.
    pub fn from_config(config: &Config, registry: &Registry, verbose: &Verbose) -> Result<Self> {
        Self::load(
            config.stack.iter().map(String::as_str),
            registry,
            &config.module_dir,
            &[PathBuf::from(".")],
            verbose,
        )
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name())
    }

    pub fn verbose(&self) -> &Verbose {
        &self.verbose
    }

    /// Every plugin's middleware in stack order, absent entries dropped.
    pub fn middleware(&self, config: &Config, server: &ServerHandle) -> Pipeline {
        self.plugins
            .iter()
            .flat_map(|p| p.middleware(config, server).flatten())
            .collect()
    }

    pub fn option_definitions(&self) -> Vec<OptionDefinition> {
        self.plugins.iter().flat_map(|p| p.option_definitions()).collect()
    }
}

impl fmt::Debug for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn validate(plugins: &[Box<dyn Plugin>]) -> Result<()> {
    let mut seen = HashSet::new();
    for plugin in plugins {
        let name = plugin.name();
        if name.trim().is_empty() {
            return Err(Error::InvalidPlugin {
                name: name.to_owned(),
                reason: "name must not be empty".into(),
            });
        }
        for def in plugin.option_definitions() {
            if def.name.trim().is_empty() {
                return Err(Error::InvalidPlugin {
                    name: name.to_owned(),
                    reason: "option definition without a name".into(),
                });
            }
            if !seen.insert(def.name.clone()) {
                return Err(Error::InvalidPlugin {
                    name: name.to_owned(),
                    reason: format!("duplicate option `{}`", def.name),
                });
            }
        }
    }
    Ok(())
}
