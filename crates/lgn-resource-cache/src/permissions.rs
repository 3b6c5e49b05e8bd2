use std::collections::{HashMap, HashSet};

use log::warn;

use crate::{resource_type::TypeTable, ResourceType};

/// Declares which types a content update may synchronously acquire.
///
/// The transitive closure for a type is computed on its first query and kept
/// for the lifetime of the cache, so every edge must be declared before the
/// types involved are queried.
#[derive(Default)]
pub(crate) struct PermissionGraph {
    declared: HashMap<ResourceType, Vec<ResourceType>>,
    closures: HashMap<ResourceType, HashSet<ResourceType>>,
}

impl PermissionGraph {
    pub(crate) fn allow(&mut self, updating: ResourceType, may_acquire: ResourceType) {
        let frozen =
            self.closures.contains_key(&updating) || self.closures.contains_key(&may_acquire);
        debug_assert!(
            !frozen,
            "permission edge {} -> {} declared after its types were queried",
            updating, may_acquire
        );
        if frozen {
            warn!(
                "Permission edge {} -> {} declared after its types were queried, resetting",
                updating, may_acquire
            );
            self.closures.clear();
        }

        let edges = self.declared.entry(updating).or_default();
        if !edges.contains(&may_acquire) {
            edges.push(may_acquire);
        }
    }

    pub(crate) fn is_allowed(
        &mut self,
        types: &TypeTable,
        updating: ResourceType,
        wanted: ResourceType,
    ) -> bool {
        if !self.closures.contains_key(&updating) {
            let closure = self.compute_closure(types, updating);
            self.closures.insert(updating, closure);
        }
        self.closures[&updating].contains(&wanted)
    }

    /// Every type reachable through declared edges, where an edge to a type
    /// also reaches all of its derived types.
    fn compute_closure(&self, types: &TypeTable, updating: ResourceType) -> HashSet<ResourceType> {
        let mut reached = HashSet::new();
        let mut pending = vec![updating];
        while let Some(ty) = pending.pop() {
            let edges = match self.declared.get(&ty) {
                Some(edges) => edges,
                None => continue,
            };
            for &target in edges {
                let derived = types.descendants(target).iter().copied();
                for candidate in std::iter::once(target).chain(derived) {
                    if reached.insert(candidate) {
                        pending.push(candidate);
                    }
                }
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_resource::TestResource, ResourceTypeDescriptor};

    #[test]
    fn transitive_and_derived() {
        let mut types = TypeTable::default();
        let material = types
            .add(ResourceTypeDescriptor::new::<TestResource>("material"))
            .unwrap();
        let texture = types
            .add(ResourceTypeDescriptor::new::<TestResource>("texture"))
            .unwrap();
        let render_target = types
            .add(
                ResourceTypeDescriptor::new::<TestResource>("render_target").with_parent(texture),
            )
            .unwrap();
        let image = types
            .add(ResourceTypeDescriptor::new::<TestResource>("image"))
            .unwrap();
        let mesh = types
            .add(ResourceTypeDescriptor::new::<TestResource>("mesh"))
            .unwrap();

        let mut graph = PermissionGraph::default();
        graph.allow(material, texture);
        graph.allow(render_target, image);

        assert!(graph.is_allowed(&types, material, texture));
        assert!(graph.is_allowed(&types, material, render_target));
        assert!(graph.is_allowed(&types, material, image));
        assert!(!graph.is_allowed(&types, material, mesh));
        assert!(!graph.is_allowed(&types, material, material));

        assert!(!graph.is_allowed(&types, texture, image));
        assert!(graph.is_allowed(&types, render_target, image));
        assert!(!graph.is_allowed(&types, mesh, texture));
    }

    #[test]
    fn cycles_terminate() {
        let mut types = TypeTable::default();
        let a = types
            .add(ResourceTypeDescriptor::new::<TestResource>("a"))
            .unwrap();
        let b = types
            .add(ResourceTypeDescriptor::new::<TestResource>("b"))
            .unwrap();

        let mut graph = PermissionGraph::default();
        graph.allow(a, b);
        graph.allow(b, a);

        assert!(graph.is_allowed(&types, a, a));
        assert!(graph.is_allowed(&types, a, b));
        assert!(graph.is_allowed(&types, b, a));
    }

    fn two_types() -> (TypeTable, ResourceType, ResourceType) {
        let mut types = TypeTable::default();
        let a = types
            .add(ResourceTypeDescriptor::new::<TestResource>("a"))
            .unwrap();
        let b = types
            .add(ResourceTypeDescriptor::new::<TestResource>("b"))
            .unwrap();
        (types, a, b)
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "declared after its types were queried")]
    fn allow_after_query() {
        let (types, a, b) = two_types();
        let mut graph = PermissionGraph::default();
        assert!(!graph.is_allowed(&types, a, b));
        graph.allow(a, b);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn allow_after_query_resets_closures() {
        let (types, a, b) = two_types();
        let mut graph = PermissionGraph::default();
        assert!(!graph.is_allowed(&types, a, b));
        graph.allow(a, b);
        assert!(graph.is_allowed(&types, a, b));
    }
}
