// Group attribute stack: shared attributes for nested route registration

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Attributes shared by every route registered inside a group.
#[derive(Debug, Clone, Default)]
pub struct GroupAttributes {
    /// URI prefix, joined to nested prefixes with `/`.
    pub prefix: Option<String>,
    /// Controller namespace, joined to nested namespaces with `::`.
    /// A leading `::` marks a fully-qualified namespace that ignores parents.
    pub namespace: Option<String>,
    /// Route name prefix, concatenated with nested names.
    pub name: Option<String>,
    /// Domain restriction; the innermost group wins.
    pub domain: Option<String>,
    /// Middleware names, appended outer-to-inner.
    pub middleware: Vec<String>,
    /// Parameter constraints; inner groups override per key.
    pub wheres: HashMap<String, String>,
}

impl GroupAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn middleware<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.middleware.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn where_param(mut self, name: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.wheres.insert(name.into(), pattern.into());
        self
    }

    /// Combine a nested group's attributes with its parent's.
    pub fn merge(new: GroupAttributes, old: &GroupAttributes) -> GroupAttributes {
        let namespace = match &new.namespace {
            Some(ns) if ns.starts_with("::") => Some(ns.trim_matches(':').to_string()),
            Some(ns) => match &old.namespace {
                Some(parent) => Some(format!(
                    "{}::{}",
                    parent.trim_matches(':'),
                    ns.trim_matches(':')
                )),
                None => Some(ns.trim_matches(':').to_string()),
            },
            None => old.namespace.clone(),
        };

        let prefix = match &new.prefix {
            Some(prefix) => Some(join_prefix(old.prefix.as_deref(), prefix)),
            None => old.prefix.clone(),
        };

        let name = match &old.name {
            Some(parent) => Some(format!(
                "{parent}{}",
                new.name.as_deref().unwrap_or_default()
            )),
            None => new.name,
        };

        let mut wheres = old.wheres.clone();
        wheres.extend(new.wheres);

        let mut middleware = old.middleware.clone();
        middleware.extend(new.middleware);

        GroupAttributes {
            prefix,
            namespace,
            name,
            domain: new.domain.or_else(|| old.domain.clone()),
            middleware,
            wheres,
        }
    }
}

/// Join two prefix segments with a single slash, dropping empty parts.
pub fn join_prefix(old: Option<&str>, new: &str) -> String {
    let old = old.unwrap_or("").trim_matches('/');
    let new = new.trim_matches('/');
    match (old.is_empty(), new.is_empty()) {
        (true, _) => new.to_string(),
        (_, true) => old.to_string(),
        _ => format!("{old}/{new}"),
    }
}

/// The active group stack. Pushing returns a guard; the entry pops when the
/// guard drops, so the stack stays balanced even if the group closure panics.
#[derive(Clone, Default)]
pub struct GroupStack {
    stack: Arc<Mutex<Vec<GroupAttributes>>>,
}

/// Pops one group stack entry on drop.
pub struct GroupGuard {
    stack: Arc<Mutex<Vec<GroupAttributes>>>,
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        self.stack.lock().pop();
    }
}

impl GroupStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the attributes with the current innermost group and push.
    pub fn enter(&self, attributes: GroupAttributes) -> GroupGuard {
        let mut stack = self.stack.lock();
        let merged = match stack.last() {
            Some(parent) => GroupAttributes::merge(attributes, parent),
            None => attributes,
        };
        stack.push(merged);
        GroupGuard {
            stack: self.stack.clone(),
        }
    }

    /// A snapshot of the innermost group's merged attributes.
    pub fn last(&self) -> Option<GroupAttributes> {
        self.stack.lock().last().cloned()
    }

    pub fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.lock().is_empty()
    }
}
