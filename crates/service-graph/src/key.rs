//! Identifiers for services registered in a graph.

use std::borrow::Cow;
use std::fmt;

/// Opaque, comparable identifier of a registered service.
///
/// A key is either a plain name or a Rust type, optionally qualified so the
/// same type can be registered more than once.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    kind: KeyKind,
    name: Cow<'static, str>,
    qualifier: Option<Cow<'static, str>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
enum KeyKind {
    Named,
    Type,
}

impl ServiceKey {
    /// Key identified by `name`.
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind: KeyKind::Named,
            name: name.into(),
            qualifier: None,
        }
    }

    /// Key identified by the type `T`.
    #[must_use]
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            kind: KeyKind::Type,
            name: Cow::Borrowed(std::any::type_name::<T>()),
            qualifier: None,
        }
    }

    /// Same key, distinguished by `qualifier`.
    #[must_use]
    pub fn qualified(mut self, qualifier: impl Into<Cow<'static, str>>) -> Self {
        self.qualifier = Some(qualifier.into());
        self
    }

    /// Name or full type path of the key.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Qualifier, if any.
    #[must_use]
    pub fn qualifier(&self) -> Option<&str> {
        self.qualifier.as_deref()
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(qualifier) = &self.qualifier {
            write!(f, "@{qualifier} ")?;
        }

        match self.kind {
            KeyKind::Named => f.write_str(&self.name),
            KeyKind::Type => f.write_str(&short_type_name(&self.name)),
        }
    }
}

impl From<&'static str> for ServiceKey {
    fn from(name: &'static str) -> Self {
        Self::named(name)
    }
}

impl From<String> for ServiceKey {
    fn from(name: String) -> Self {
        Self::named(name)
    }
}

/// `alloc::vec::Vec<my_crate::db::Pool>` -> `Vec<Pool>`.
fn short_type_name(full: &str) -> String {
    let mut short = String::with_capacity(full.len());
    let mut segment = String::new();

    for c in full.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
        } else {
            short.push_str(segment.rsplit("::").next().unwrap_or_default());
            segment.clear();
            short.push(c);
        }
    }
    short.push_str(segment.rsplit("::").next().unwrap_or_default());

    short
}
