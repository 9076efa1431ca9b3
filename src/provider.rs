//! Provider tokens, the unit of dependency between generator tasks.
//!
//! A [`Provider<T>`] is a lightweight token describing a capability of type
//! `T`. Tasks declare which providers they read ([`ProviderDependency`]) and
//! which they supply ([`ProviderExport`]), and the scheduler wires producers to
//! consumers without either side naming the other.
//!
//! ## Identity
//!
//! Every token receives a process-unique [`ProviderId`] when it is created.
//! Resolution is keyed by that id, never by name, so two providers that happen
//! to share a name can not be cross-wired. The name only shows up in
//! diagnostics.
//!
//! ## Phantom types
//!
//! Just like task handles in a typed graph, `Provider<T>` carries no data but
//! holds `T` in `PhantomData`. Values travel through the engine type-erased as
//! `Arc<dyn Any + Send + Sync>` and are downcast back when a task asks for them
//! through the typed token.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

/// A type-erased, thread-safe value produced by a task.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a provider token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProviderId(u64);

impl ProviderId {
    fn next() -> Self {
        ProviderId(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// An untyped provider token.
///
/// Equality and hashing only consider the id.
#[derive(Clone)]
pub struct ProviderType {
    id: ProviderId,
    name: Arc<str>,
}

impl ProviderType {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            id: ProviderId::next(),
            name: name.into(),
        }
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl PartialEq for ProviderType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProviderType {}

impl Hash for ProviderType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Provider({}#{})", self.name, self.id.0)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A typed provider token for values of type `T`.
pub struct Provider<T> {
    ty: ProviderType,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Provider<T>
where
    T: Send + Sync + 'static,
{
    /// Creates a fresh provider. Two calls with the same name yield two
    /// distinct providers.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            ty: ProviderType::new(name),
            _phantom: PhantomData,
        }
    }

    pub fn ty(&self) -> &ProviderType {
        &self.ty
    }

    pub fn id(&self) -> ProviderId {
        self.ty.id
    }

    pub fn name(&self) -> &str {
        self.ty.name()
    }

    /// Depend on this provider as an init-time export.
    pub fn dependency(&self) -> ProviderDependency {
        ProviderDependency::new(self.ty.clone())
    }

    /// Export this provider to the exporting generator and its descendants.
    pub fn export(&self) -> ProviderExport {
        ProviderExport {
            provider: self.ty.clone(),
            scope: None,
        }
    }

    /// Export this provider to the subtree of the nearest generator that opens
    /// `scope`.
    pub fn export_to(&self, scope: &ProviderExportScope) -> ProviderExport {
        ProviderExport {
            provider: self.ty.clone(),
            scope: Some(scope.clone()),
        }
    }
}

impl<T> Clone for Provider<T> {
    fn clone(&self) -> Self {
        Self {
            ty: self.ty.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Provider<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.ty, f)
    }
}

/// A named visibility boundary for exports, such as `project` or `package`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderExportScope {
    name: Arc<str>,
}

impl ProviderExportScope {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for ProviderExportScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Whether a provider becomes available after the producer's `init` step or
/// only after its `build` step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Export,
    Output,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Export => f.write_str("export"),
            ProviderKind::Output => f.write_str("output"),
        }
    }
}

/// A task's declared need for a provider.
#[derive(Clone, Debug)]
pub struct ProviderDependency {
    provider: ProviderType,
    is_output: bool,
    is_read_only: bool,
    is_optional: bool,
}

impl ProviderDependency {
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            is_output: false,
            is_read_only: false,
            is_optional: false,
        }
    }

    /// Target the producer's output provider, available only once the producer
    /// has built.
    pub fn output(mut self) -> Self {
        self.is_output = true;
        self
    }

    /// The consumer only reads the exported value, so its build does not need
    /// to happen before the producer's build.
    pub fn read_only(mut self) -> Self {
        self.is_read_only = true;
        self
    }

    /// Resolve to nothing instead of failing when no exporter is in scope.
    pub fn optional(mut self) -> Self {
        self.is_optional = true;
        self
    }

    pub fn provider(&self) -> &ProviderType {
        &self.provider
    }

    pub fn is_output(&self) -> bool {
        self.is_output
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn is_optional(&self) -> bool {
        self.is_optional
    }

    pub fn kind(&self) -> ProviderKind {
        if self.is_output {
            ProviderKind::Output
        } else {
            ProviderKind::Export
        }
    }
}

/// A task's declaration that it supplies a provider.
#[derive(Clone, Debug)]
pub struct ProviderExport {
    provider: ProviderType,
    scope: Option<ProviderExportScope>,
}

impl ProviderExport {
    pub fn provider(&self) -> &ProviderType {
        &self.provider
    }

    pub fn scope(&self) -> Option<&ProviderExportScope> {
        self.scope.as_ref()
    }
}

/// A mutable collection owned by exactly one task.
///
/// The owner exports an [`Appender`] so that consumers can push entries during
/// their own steps, and drains the collected entries with [`take`](Self::take)
/// in its build step. Consumers never see the accumulated list.
pub struct Accumulator<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Accumulator<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn appender(&self) -> Appender<T> {
        Appender {
            items: self.items.clone(),
        }
    }

    /// Removes and returns everything appended so far, in append order.
    pub fn take(&self) -> Vec<T> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *items)
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Accumulator<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Append-only handle to an [`Accumulator`].
pub struct Appender<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> Appender<T> {
    pub fn push(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(item);
    }

    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(items);
    }
}

impl<T> Clone for Appender<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

impl<T> fmt::Debug for Appender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Appender(*)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn providers_compare_by_identity() {
        let a = Provider::<String>::new("config");
        let b = Provider::<String>::new("config");

        assert_ne!(a.id(), b.id());
        assert_ne!(a.ty(), b.ty());
        assert_eq!(a.ty(), a.clone().ty());
    }

    #[test]
    fn dependency_flags() {
        let p = Provider::<u32>::new("p");
        let dep = p.dependency().output().read_only();

        assert!(dep.is_output());
        assert!(dep.is_read_only());
        assert!(!dep.is_optional());
        assert_eq!(dep.kind(), ProviderKind::Output);
        assert_eq!(p.dependency().kind(), ProviderKind::Export);
    }

    #[test]
    fn export_scope() {
        let scope = ProviderExportScope::new("project");
        let p = Provider::<u32>::new("p");

        assert!(p.export().scope().is_none());
        assert_eq!(p.export_to(&scope).scope(), Some(&scope));
    }

    #[test]
    fn accumulator_collects_from_appenders() {
        let acc = Accumulator::new();
        let first = acc.appender();
        let second = first.clone();

        first.push("a");
        second.extend(["b", "c"]);

        assert_eq!(acc.len(), 3);
        assert_eq!(acc.take(), vec!["a", "b", "c"]);
        assert!(acc.is_empty());
    }
}
