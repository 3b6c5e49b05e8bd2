use std::{collections::HashMap, sync::Arc};

use log::warn;

use crate::{resource_type::TypeTable, Error, ResourceId, ResourceType, Result};

/// Decides whether an override applies to a (redirect-resolved) id.
pub type OverridePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
struct OverrideRule {
    derived: ResourceType,
    predicate: OverridePredicate,
}

/// Override rules and named redirects.
///
/// Decides which type actually serves a request before the registry is
/// consulted.
#[derive(Default)]
pub(crate) struct TypeResolution {
    /// Rules keyed by every ancestor of their derived type, in registration order.
    rules: HashMap<ResourceType, Vec<OverrideRule>>,
    /// Alias hash to canonical id. One level only.
    redirects: HashMap<u64, ResourceId>,
}

impl TypeResolution {
    pub(crate) fn register_override(
        &mut self,
        types: &TypeTable,
        base: ResourceType,
        derived: ResourceType,
        predicate: OverridePredicate,
    ) -> Result<()> {
        if derived == base || !types.is_derived_from(derived, base) {
            return Err(Error::InvalidOverride {
                base: types.name(base).to_owned(),
                derived: types.name(derived).to_owned(),
            });
        }

        let ancestors = types.ancestors(derived);
        let duplicate = ancestors.iter().any(|ancestor| {
            self.rules
                .get(ancestor)
                .map_or(false, |rules| rules.iter().any(|rule| rule.derived == derived))
        });
        if duplicate {
            return Err(Error::DuplicateOverride {
                base: types.name(base).to_owned(),
                derived: types.name(derived).to_owned(),
            });
        }

        let rule = OverrideRule { derived, predicate };
        for ancestor in ancestors {
            self.rules.entry(*ancestor).or_default().push(rule.clone());
        }
        Ok(())
    }

    /// Removes `derived` from the rules of all its ancestors.
    pub(crate) fn unregister_override(&mut self, types: &TypeTable, derived: ResourceType) -> bool {
        let mut removed = false;
        for ancestor in types.ancestors(derived) {
            if let Some(rules) = self.rules.get_mut(ancestor) {
                let before = rules.len();
                rules.retain(|rule| rule.derived != derived);
                removed |= rules.len() != before;
                if rules.is_empty() {
                    self.rules.remove(ancestor);
                }
            }
        }
        removed
    }

    pub(crate) fn register_redirect(&mut self, alias: &ResourceId, canonical: ResourceId) {
        self.redirects.insert(alias.hash_value(), canonical);
    }

    pub(crate) fn unregister_redirect(&mut self, alias: &ResourceId) -> bool {
        self.redirects.remove(&alias.hash_value()).is_some()
    }

    /// Applies named redirection. Unknown aliases pass through unchanged.
    pub(crate) fn resolve_id(&self, id: ResourceId) -> ResourceId {
        match self.redirects.get(&id.hash_value()) {
            Some(canonical) => canonical.clone(),
            None => id,
        }
    }

    /// Walks the override rules starting at `requested` until none matches.
    ///
    /// Rules are visited nearest type first, then in registration order; the
    /// first match replaces the working type and the walk restarts from it.
    pub(crate) fn resolve_type(
        &self,
        types: &TypeTable,
        requested: ResourceType,
        id: &str,
        max_steps: u32,
    ) -> ResourceType {
        let mut current = requested;
        for _ in 0..max_steps {
            let next = types
                .lineage(current)
                .filter_map(|ty| self.rules.get(&ty))
                .flatten()
                .filter(|rule| !types.is_derived_from(current, rule.derived))
                .find(|rule| (rule.predicate)(id));

            match next {
                Some(rule) => current = rule.derived,
                None => return current,
            }
        }
        warn!(
            "Type override resolution of '{}' from '{}' did not settle after {} steps, using '{}'",
            id,
            types.name(requested),
            max_steps,
            types.name(current)
        );
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{test_resource::TestResource, ResourceTypeDescriptor};

    struct Types {
        table: TypeTable,
        texture: ResourceType,
        render_target: ResourceType,
        depth_target: ResourceType,
        mesh: ResourceType,
    }

    fn types() -> Types {
        let mut table = TypeTable::default();
        let texture = table
            .add(ResourceTypeDescriptor::new::<TestResource>("texture"))
            .unwrap();
        let render_target = table
            .add(ResourceTypeDescriptor::new::<TestResource>("render_target").with_parent(texture))
            .unwrap();
        let depth_target = table
            .add(
                ResourceTypeDescriptor::new::<TestResource>("depth_target")
                    .with_parent(render_target),
            )
            .unwrap();
        let mesh = table
            .add(ResourceTypeDescriptor::new::<TestResource>("mesh"))
            .unwrap();
        Types {
            table,
            texture,
            render_target,
            depth_target,
            mesh,
        }
    }

    fn suffix(suffix: &'static str) -> OverridePredicate {
        Arc::new(move |id: &str| id.ends_with(suffix))
    }

    #[test]
    fn override_by_suffix() {
        let t = types();
        let mut resolution = TypeResolution::default();
        resolution
            .register_override(&t.table, t.texture, t.render_target, suffix(".rt"))
            .unwrap();

        assert_eq!(
            resolution.resolve_type(&t.table, t.texture, "sky.rt", 16),
            t.render_target
        );
        assert_eq!(
            resolution.resolve_type(&t.table, t.texture, "sky.png", 16),
            t.texture
        );
        assert_eq!(resolution.resolve_type(&t.table, t.mesh, "sky.rt", 16), t.mesh);
    }

    #[test]
    fn chained_overrides() {
        let t = types();
        let mut resolution = TypeResolution::default();
        resolution
            .register_override(&t.table, t.texture, t.render_target, suffix(".rt"))
            .unwrap();
        resolution
            .register_override(&t.table, t.render_target, t.depth_target, suffix(".depth.rt"))
            .unwrap();

        for _ in 0..3 {
            assert_eq!(
                resolution.resolve_type(&t.table, t.texture, "shadow.depth.rt", 16),
                t.depth_target
            );
        }
        assert_eq!(
            resolution.resolve_type(&t.table, t.texture, "color.rt", 16),
            t.render_target
        );
    }

    #[test]
    fn first_registered_rule_wins() {
        let mut table = TypeTable::default();
        let base = table
            .add(ResourceTypeDescriptor::new::<TestResource>("base"))
            .unwrap();
        let first = table
            .add(ResourceTypeDescriptor::new::<TestResource>("first").with_parent(base))
            .unwrap();
        let second = table
            .add(ResourceTypeDescriptor::new::<TestResource>("second").with_parent(base))
            .unwrap();

        let mut resolution = TypeResolution::default();
        resolution
            .register_override(&table, base, second, Arc::new(|_: &str| true))
            .unwrap();
        resolution
            .register_override(&table, base, first, Arc::new(|id: &str| id == "only_first"))
            .unwrap();

        assert_eq!(resolution.resolve_type(&table, base, "anything", 16), second);
    }

    #[test]
    fn cycle_guard() {
        let mut table = TypeTable::default();
        let base = table
            .add(ResourceTypeDescriptor::new::<TestResource>("base"))
            .unwrap();
        let left = table
            .add(ResourceTypeDescriptor::new::<TestResource>("left").with_parent(base))
            .unwrap();
        let right = table
            .add(ResourceTypeDescriptor::new::<TestResource>("right").with_parent(base))
            .unwrap();

        let mut resolution = TypeResolution::default();
        resolution
            .register_override(&table, base, left, Arc::new(|_: &str| true))
            .unwrap();
        resolution
            .register_override(&table, base, right, Arc::new(|_: &str| true))
            .unwrap();

        // left -> right -> left ... terminates at the step guard.
        let resolved = resolution.resolve_type(&table, base, "x", 4);
        assert!(resolved == left || resolved == right);
        assert_eq!(resolved, resolution.resolve_type(&table, base, "x", 4));
    }

    #[test]
    fn registration_errors() {
        let t = types();
        let mut resolution = TypeResolution::default();
        assert!(matches!(
            resolution.register_override(&t.table, t.texture, t.mesh, suffix(".m")),
            Err(Error::InvalidOverride { .. })
        ));
        resolution
            .register_override(&t.table, t.texture, t.render_target, suffix(".rt"))
            .unwrap();
        assert!(matches!(
            resolution.register_override(&t.table, t.texture, t.render_target, suffix(".x")),
            Err(Error::DuplicateOverride { .. })
        ));
    }

    #[test]
    fn unregister_removes_from_every_ancestor() {
        let t = types();
        let mut resolution = TypeResolution::default();
        resolution
            .register_override(&t.table, t.render_target, t.depth_target, suffix(".depth"))
            .unwrap();
        assert_eq!(
            resolution.resolve_type(&t.table, t.texture, "a.depth", 16),
            t.depth_target
        );

        assert!(resolution.unregister_override(&t.table, t.depth_target));
        assert!(!resolution.unregister_override(&t.table, t.depth_target));
        assert_eq!(
            resolution.resolve_type(&t.table, t.texture, "a.depth", 16),
            t.texture
        );
        assert_eq!(
            resolution.resolve_type(&t.table, t.render_target, "a.depth", 16),
            t.render_target
        );
    }

    #[test]
    fn redirects_are_one_level() {
        let mut resolution = TypeResolution::default();
        resolution.register_redirect(&ResourceId::new("a"), ResourceId::new("b"));
        resolution.register_redirect(&ResourceId::new("b"), ResourceId::new("c"));

        assert_eq!(resolution.resolve_id(ResourceId::new("a")).as_str(), "b");
        assert_eq!(resolution.resolve_id(ResourceId::new("z")).as_str(), "z");

        resolution.register_redirect(&ResourceId::new("a"), ResourceId::new("d"));
        assert_eq!(resolution.resolve_id(ResourceId::new("a")).as_str(), "d");
        assert!(resolution.unregister_redirect(&ResourceId::new("a")));
        assert_eq!(resolution.resolve_id(ResourceId::new("a")).as_str(), "a");
    }
}
