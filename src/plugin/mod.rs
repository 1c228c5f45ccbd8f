//! Plugins and the stack loader.
//!
//! A plugin is a factory of middleware. The loader turns an ordered list of
//! stack entries (ready-made plugins or string specifiers) into one
//! [`Pipeline`](crate::Pipeline):
//!
//! ```text
//!   Config.stack ──► StackEntry* ──► Registry::resolve ──► Box<dyn Plugin>*
//!                                                              │
//!                        Pipeline ◄── Stack::middleware ◄── Stack::load
//! ```

mod registry;
mod stack;

pub use registry::{Registry, StackEntry};
pub use stack::Stack;

use serde::Serialize;

use crate::config::Config;
use crate::diagnostics::Verbose;
use crate::handler::BoxedMiddleware;
use crate::server::ServerHandle;

/// A middleware factory.
///
/// ```rust
/// use wharf::{from_fn, Config, Plugin, Produced, ServerHandle};
///
/// struct PoweredBy;
///
/// impl Plugin for PoweredBy {
///     fn name(&self) -> &str { "powered-by" }
///
///     fn middleware(&self, _: &Config, _: &ServerHandle) -> Produced {
///         from_fn(|ctx, next| Box::pin(async move {
///             next.run(ctx).await?;
///             ctx.set_header("x-powered-by", "wharf")
///         }))
///         .into()
///     }
/// }
/// ```
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per stack build with the active configuration.
    fn middleware(&self, config: &Config, server: &ServerHandle) -> Produced;

    /// Options this plugin reads from [`Config::option`].
    fn option_definitions(&self) -> Vec<OptionDefinition> {
        Vec::new()
    }

    /// Hands the plugin a sink namespaced under the stack. Plugins that emit
    /// diagnostics keep it; the default drops it.
    fn attach_verbose(&mut self, _verbose: Verbose) {}
}

/// Whatever a plugin produced: nothing, one middleware, or several, some of
/// which may be absent.
#[derive(Default)]
pub struct Produced(Vec<Option<BoxedMiddleware>>);

impl Produced {
    pub fn none() -> Self {
        Self::default()
    }

    pub(crate) fn flatten(self) -> impl Iterator<Item = BoxedMiddleware> {
        self.0.into_iter().flatten()
    }
}

impl From<()> for Produced {
    fn from((): ()) -> Self { Self::none() }
}

impl From<BoxedMiddleware> for Produced {
    fn from(mw: BoxedMiddleware) -> Self { Self(vec![Some(mw)]) }
}

impl From<Option<BoxedMiddleware>> for Produced {
    fn from(mw: Option<BoxedMiddleware>) -> Self { Self(vec![mw]) }
}

impl From<Vec<BoxedMiddleware>> for Produced {
    fn from(mws: Vec<BoxedMiddleware>) -> Self { Self(mws.into_iter().map(Some).collect()) }
}

impl From<Vec<Option<BoxedMiddleware>>> for Produced {
    fn from(mws: Vec<Option<BoxedMiddleware>>) -> Self { Self(mws) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Boolean,
    String,
    Number,
}

/// Describes one plugin option, for help output and validation.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptionDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: OptionKind,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<char>,
    pub multiple: bool,
}

impl OptionDefinition {
    pub fn new(name: impl Into<String>, kind: OptionKind) -> Self {
        Self {
            name: name.into(),
            kind,
            description: String::new(),
            alias: None,
            multiple: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn alias(mut self, alias: char) -> Self {
        self.alias = Some(alias);
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::from_fn;

    fn noop() -> BoxedMiddleware {
        from_fn(|ctx, next| Box::pin(async move { next.run(ctx).await }))
    }

    #[test]
    fn produced_drops_absent_entries() {
        assert_eq!(Produced::from(()).flatten().count(), 0);
        assert_eq!(Produced::from(noop()).flatten().count(), 1);
        assert_eq!(Produced::from(None::<BoxedMiddleware>).flatten().count(), 0);
        assert_eq!(Produced::from(vec![Some(noop()), None, Some(noop())]).flatten().count(), 2);
    }

    #[test]
    fn option_definition_serializes_like_a_cli_flag() {
        let def = OptionDefinition::new("corsOrigin", OptionKind::String)
            .description("Access-Control-Allow-Origin value")
            .alias('o');
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["type"], "string");
        assert_eq!(json["alias"], "o");
        assert_eq!(json["multiple"], false);
    }
}
