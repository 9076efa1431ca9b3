//! Scoped provider resolution.
//!
//! Every export is *registered* at one generator of the flattened tree:
//!
//! * an unscoped export at the exporting task's own generator,
//! * a scoped export at the nearest ancestor-or-self generator that opens the
//!   scope.
//!
//! A registration is visible to the generator it is registered at and to all
//! of its descendants. When a provider is registered at several generators on
//! the way to the root, the nearest one wins. Two registrations of the same
//! provider at the same generator are ambiguous and rejected up front.
//!
//! Exports and outputs live in separate tables, so one task may export a
//! provider during init and also publish it as its output after build.

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::provider::{ProviderDependency, ProviderExport, ProviderId, ProviderKind};
use crate::task::FlatTree;

/// A dependency of one task after resolution.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedDependency {
    pub key: String,
    pub dependency: ProviderDependency,
    /// Index of the producing task, or `None` for an unresolved optional
    /// dependency.
    pub producer: Option<usize>,
}

#[derive(Debug, Clone, Default)]
struct Registry {
    exports: HashMap<ProviderId, usize>,
    outputs: HashMap<ProviderId, usize>,
}

impl Registry {
    fn table(&self, kind: ProviderKind) -> &HashMap<ProviderId, usize> {
        match kind {
            ProviderKind::Export => &self.exports,
            ProviderKind::Output => &self.outputs,
        }
    }

    fn table_mut(&mut self, kind: ProviderKind) -> &mut HashMap<ProviderId, usize> {
        match kind {
            ProviderKind::Export => &mut self.exports,
            ProviderKind::Output => &mut self.outputs,
        }
    }

    fn overlay(&mut self, other: &Registry) {
        self.exports.extend(other.exports.iter().map(|(k, v)| (*k, *v)));
        self.outputs.extend(other.outputs.iter().map(|(k, v)| (*k, *v)));
    }
}

/// Resolves every dependency of every task in `tree`, returning one list per
/// task in entry order.
pub(crate) fn resolve_dependencies(
    tree: &FlatTree,
) -> Result<Vec<Vec<ResolvedDependency>>, ConfigError> {
    let registered = register_exports(tree)?;

    let mut visible: Vec<Registry> = Vec::with_capacity(tree.generators.len());
    for (index, generator) in tree.generators.iter().enumerate() {
        let mut registry = match generator.parent {
            Some(parent) => visible[parent].clone(),
            None => Registry::default(),
        };
        registry.overlay(&registered[index]);
        visible.push(registry);
    }

    let mut resolved = Vec::with_capacity(tree.entries.len());

    for (index, entry) in tree.entries.iter().enumerate() {
        let registry = &visible[entry.generator];
        let mut dependencies = Vec::with_capacity(entry.dependencies.len());

        for (key, dependency) in &entry.dependencies {
            let provider = dependency.provider();
            let expected = dependency.kind();
            let other = match expected {
                ProviderKind::Export => ProviderKind::Output,
                ProviderKind::Output => ProviderKind::Export,
            };

            let producer = match registry.table(expected).get(&provider.id()) {
                Some(&producer) if producer == index => {
                    return Err(ConfigError::SelfDependency {
                        task: entry.id.clone(),
                        provider: provider.name().to_string(),
                    });
                }
                Some(&producer) => Some(producer),
                None => match registry.table(other).get(&provider.id()) {
                    Some(&producer) if producer != index => {
                        return Err(ConfigError::ProviderKindMismatch {
                            task: entry.id.clone(),
                            provider: provider.name().to_string(),
                            producer: tree.entries[producer].id.clone(),
                            expected,
                            found: other,
                        });
                    }
                    _ if dependency.is_optional() => None,
                    _ => {
                        return Err(ConfigError::MissingProvider {
                            task: entry.id.clone(),
                            provider: provider.name().to_string(),
                        });
                    }
                },
            };

            if let Some(producer) = producer {
                tracing::debug!(
                    consumer = %entry.id,
                    producer = %tree.entries[producer].id,
                    provider = provider.name(),
                    kind = %expected,
                    "resolved provider"
                );
            }

            dependencies.push(ResolvedDependency {
                key: key.clone(),
                dependency: dependency.clone(),
                producer,
            });
        }

        resolved.push(dependencies);
    }

    Ok(resolved)
}

fn register_exports(tree: &FlatTree) -> Result<Vec<Registry>, ConfigError> {
    let mut registered = vec![Registry::default(); tree.generators.len()];

    for (index, entry) in tree.entries.iter().enumerate() {
        let exports = entry
            .exports
            .values()
            .map(|export| (export, ProviderKind::Export))
            .chain(entry.output.iter().map(|export| (export, ProviderKind::Output)));

        for (export, kind) in exports {
            let target = registration_target(tree, entry.generator, export).ok_or_else(|| {
                ConfigError::UnknownScope {
                    task: entry.id.clone(),
                    provider: export.provider().name().to_string(),
                    scope: export.scope().map(|s| s.name().to_string()).unwrap_or_default(),
                }
            })?;

            let table = registered[target].table_mut(kind);
            match table.insert(export.provider().id(), index) {
                Some(previous) if previous != index => {
                    return Err(ConfigError::AmbiguousProvider {
                        provider: export.provider().name().to_string(),
                        generator: tree.generators[target].id.clone(),
                        first: tree.entries[previous].id.clone(),
                        second: entry.id.clone(),
                    });
                }
                _ => {}
            }
        }
    }

    Ok(registered)
}

fn registration_target(tree: &FlatTree, generator: usize, export: &ProviderExport) -> Option<usize> {
    let Some(scope) = export.scope() else {
        return Some(generator);
    };

    let mut current = Some(generator);
    while let Some(index) = current {
        let node = &tree.generators[index];
        if node.scopes.contains(scope) {
            return Some(index);
        }
        current = node.parent;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Provider, ProviderExportScope};
    use crate::task::{GeneratorBundle, GeneratorTask, TaskDef, TaskInit};

    fn task(def: TaskDef) -> GeneratorTask {
        def.run(|_| Ok(TaskInit::new()))
    }

    fn resolve(root: &GeneratorBundle) -> Result<(FlatTree, Vec<Vec<ResolvedDependency>>), ConfigError> {
        let tree = FlatTree::flatten(root)?;
        let resolved = resolve_dependencies(&tree)?;
        Ok((tree, resolved))
    }

    fn producer_of(tree: &FlatTree, resolved: &[Vec<ResolvedDependency>], task: &str) -> Option<String> {
        let index = tree.entries.iter().position(|e| e.id.as_str() == task).unwrap();
        resolved[index][0]
            .producer
            .map(|p| tree.entries[p].id.to_string())
    }

    #[test]
    fn unscoped_exports_reach_siblings_and_descendants() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .task(task(GeneratorTask::named("producer").exports("p", p.export())))
            .task(task(GeneratorTask::named("sibling").depends_on("p", p.dependency())))
            .child(
                "child",
                GeneratorBundle::new("child")
                    .task(task(GeneratorTask::named("nested").depends_on("p", p.dependency()))),
            );

        let (tree, resolved) = resolve(&root).unwrap();
        assert_eq!(producer_of(&tree, &resolved, "app#sibling").as_deref(), Some("app#producer"));
        assert_eq!(
            producer_of(&tree, &resolved, "app.child#nested").as_deref(),
            Some("app#producer")
        );
    }

    #[test]
    fn unscoped_exports_do_not_reach_parents() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .task(task(GeneratorTask::named("consumer").depends_on("p", p.dependency())))
            .child(
                "child",
                GeneratorBundle::new("child").task(task(GeneratorTask::named("producer").exports("p", p.export()))),
            );

        let err = resolve(&root).unwrap_err();
        assert!(matches!(err, ConfigError::MissingProvider { ref task, .. } if task.as_str() == "app#consumer"));
        assert!(err.to_string().contains("'p'"));
    }

    #[test]
    fn scoped_exports_reach_the_scope_subtree() {
        let project = ProviderExportScope::new("project");
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .scope(&project)
            .child(
                "a",
                GeneratorBundle::new("a")
                    .task(task(GeneratorTask::named("producer").exports("p", p.export_to(&project)))),
            )
            .child(
                "b",
                GeneratorBundle::new("b").task(task(GeneratorTask::named("consumer").depends_on("p", p.dependency()))),
            );

        let (tree, resolved) = resolve(&root).unwrap();
        assert_eq!(producer_of(&tree, &resolved, "app.b#consumer").as_deref(), Some("app.a#producer"));
    }

    #[test]
    fn nearest_exporter_wins() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .task(task(GeneratorTask::named("outer").exports("p", p.export())))
            .child(
                "child",
                GeneratorBundle::new("child")
                    .task(task(GeneratorTask::named("inner").exports("p", p.export())))
                    .task(task(GeneratorTask::named("consumer").depends_on("p", p.dependency()))),
            );

        let (tree, resolved) = resolve(&root).unwrap();
        assert_eq!(producer_of(&tree, &resolved, "app.child#consumer").as_deref(), Some("app.child#inner"));
    }

    #[test]
    fn two_exporters_at_one_level_are_ambiguous() {
        let project = ProviderExportScope::new("project");
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .scope(&project)
            .child(
                "a",
                GeneratorBundle::new("a").task(task(GeneratorTask::named("one").exports("p", p.export_to(&project)))),
            )
            .child(
                "b",
                GeneratorBundle::new("b").task(task(GeneratorTask::named("two").exports("p", p.export_to(&project)))),
            );

        let err = resolve(&root).unwrap_err();
        assert_eq!(
            err,
            ConfigError::AmbiguousProvider {
                provider: "p".into(),
                generator: "app".into(),
                first: crate::task::TaskId::new("app.a#one"),
                second: crate::task::TaskId::new("app.b#two"),
            }
        );
    }

    #[test]
    fn unknown_scope() {
        let package = ProviderExportScope::new("package");
        let p = Provider::<u32>::new("p");
        let root =
            GeneratorBundle::new("app").task(task(GeneratorTask::named("producer").exports("p", p.export_to(&package))));

        let err = resolve(&root).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownScope { ref scope, .. } if scope == "package"));
    }

    #[test]
    fn output_dependency_on_plain_export_is_rejected() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .task(task(GeneratorTask::named("producer").exports("p", p.export())))
            .task(task(GeneratorTask::named("consumer").depends_on("p", p.dependency().output())));

        let err = resolve(&root).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::ProviderKindMismatch {
                expected: ProviderKind::Output,
                found: ProviderKind::Export,
                ..
            }
        ));
    }

    #[test]
    fn export_and_output_of_same_provider_resolve_separately() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .task(task(GeneratorTask::named("producer").exports("p", p.export()).output(p.export())))
            .task(task(GeneratorTask::named("reader").depends_on("p", p.dependency().output())))
            .task(task(GeneratorTask::named("writer").depends_on("p", p.dependency())));

        let (tree, resolved) = resolve(&root).unwrap();
        assert_eq!(producer_of(&tree, &resolved, "app#reader").as_deref(), Some("app#producer"));
        assert_eq!(producer_of(&tree, &resolved, "app#writer").as_deref(), Some("app#producer"));
    }

    #[test]
    fn optional_dependency_may_stay_unresolved() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app")
            .task(task(GeneratorTask::named("consumer").depends_on("p", p.dependency().optional())));

        let (tree, resolved) = resolve(&root).unwrap();
        assert_eq!(producer_of(&tree, &resolved, "app#consumer"), None);
    }

    #[test]
    fn self_dependency_is_rejected() {
        let p = Provider::<u32>::new("p");
        let root = GeneratorBundle::new("app").task(task(
            GeneratorTask::named("loop").exports("p", p.export()).depends_on("p", p.dependency()),
        ));

        let err = resolve(&root).unwrap_err();
        assert!(matches!(err, ConfigError::SelfDependency { .. }));
    }
}
