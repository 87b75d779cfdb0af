//! Name-based type lookup.
//!
//! Used when only a textual name is available (explicit overrides, attribute
//! arguments). Every answer, including "not found", is cached under the
//! lowercased name.

use std::sync::Arc;

use super::model::{same_type, PrimitiveKind, TypeHandle, TypeSignature};
use super::resolver::{LookupCell, TypeResolver};

/// Result of a successful name lookup.
#[derive(Debug, Clone)]
pub struct TypeLookup {
    pub definition: TypeHandle,
    /// Generic argument names written in the looked-up name
    pub generic_arguments: Vec<String>,
    /// Number of `[]` suffixes stripped from the name
    pub array_depth: u8,
}

impl TypeLookup {
    fn new(definition: TypeHandle, generic_arguments: Vec<String>) -> Self {
        Self {
            definition,
            generic_arguments,
            array_depth: 0,
        }
    }

    /// The definition wrapped in one single-dimension array per `[]`.
    pub fn signature(&self) -> TypeSignature {
        (0..self.array_depth).fold(TypeSignature::Definition(self.definition.clone()), |sig, _| {
            sig.make_sz_array()
        })
    }
}

impl PartialEq for TypeLookup {
    fn eq(&self, other: &Self) -> bool {
        same_type(&self.definition, &other.definition)
            && self.generic_arguments == other.generic_arguments
            && self.array_depth == other.array_depth
    }
}

/// Split a generic argument list on top-level commas.
pub fn split_generic_arguments(list: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in list.chars() {
        match c {
            '<' | '[' => {
                depth += 1;
                current.push(c);
            }
            '>' | ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

impl TypeResolver {
    /// Look a type up by name, falling back through progressively looser
    /// matches.
    pub fn resolve_by_name(&self, name: &str) -> Option<TypeLookup> {
        // Keywords are case-sensitive, so they cache apart from type names.
        let key = match PrimitiveKind::from_keyword(name) {
            Some(_) => format!("keyword:{}", name),
            None => name.to_lowercase(),
        };
        // Clone the cell out so no shard lock is held during the lookup.
        let cell: LookupCell = self.by_name.entry(key).or_default().clone();
        cell.get_or_init(|| {
            let found = self.lookup_uncached(name);
            if found.is_none() {
                log::debug!("Type name '{}' did not resolve", name);
            }
            found
        })
        .clone()
    }

    /// The definition only, for names known not to be generic.
    pub fn resolve_definition_by_name(&self, name: &str) -> Option<TypeHandle> {
        self.resolve_by_name(name).map(|l| l.definition)
    }

    /// Number of cached name lookups.
    pub fn cached_names(&self) -> usize {
        self.by_name.len()
    }

    fn find_full_name(&self, full_name: &str) -> Option<&TypeHandle> {
        self.table
            .types()
            .iter()
            .find(|t| t.full_name().eq_ignore_ascii_case(full_name))
    }

    fn unique<'a>(mut matches: impl Iterator<Item = &'a TypeHandle>) -> Option<&'a TypeHandle> {
        let first = matches.next()?;
        matches.next().is_none().then_some(first)
    }

    fn lookup_uncached(&self, name: &str) -> Option<TypeLookup> {
        if let Some(primitive) = PrimitiveKind::from_name(name) {
            return Some(TypeLookup::new(self.table.primitive(primitive).clone(), Vec::new()));
        }

        let mut defined = self.find_full_name(name).cloned();

        if defined.is_none() {
            if let Some(element) = name.strip_suffix("[]") {
                return self.resolve_by_name(element).map(|mut l| {
                    l.array_depth += 1;
                    l
                });
            }
        }

        let mut name = name.to_string();
        let mut generic_arguments = Vec::new();
        if defined.is_none() {
            if let Some(open) = name.find('<') {
                let inner = name[open + 1..].strip_suffix('>').unwrap_or(&name[open + 1..]);
                generic_arguments = split_generic_arguments(inner);
                let mut base = name[..open].to_string();
                if !base.contains('`') {
                    base = format!("{}`{}", base, generic_arguments.len());
                }
                name = base;
                defined = self.find_full_name(&name).cloned();
            }
        }

        if let Some(found) = defined {
            return Some(TypeLookup::new(found, generic_arguments));
        }

        // Unqualified System type.
        if let Some(found) = self.find_full_name(&format!("System.{}", name)) {
            return Some(TypeLookup::new(found.clone(), generic_arguments));
        }

        // Unique simple name.
        let types = self.table.types();
        if let Some(found) = Self::unique(types.iter().filter(|t| t.name.eq_ignore_ascii_case(&name))) {
            return Some(TypeLookup::new(found.clone(), generic_arguments));
        }

        if !name.contains('.') {
            return None;
        }

        // Unique dotted suffix, treating nested separators as dots.
        let suffix = name.to_lowercase();
        Self::unique(types.iter().filter(|t| {
            t.full_name().replace('/', ".").to_lowercase().ends_with(&suffix)
        }))
        .map(|found| TypeLookup::new(Arc::clone(found), generic_arguments))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::descriptor::InMemoryMetadata;
    use crate::types::{TypeDefinition, TypeTable};
    use rstest::rstest;

    fn resolver() -> TypeResolver {
        let player = TypeDefinition::new("Game", "Player").into_handle();
        let types = vec![
            player.clone(),
            TypeDefinition::new("", "State").nested_in(player).into_handle(),
            TypeDefinition::new("Game", "Foo").into_handle(),
            TypeDefinition::new("System.Collections.Generic", "List`1")
                .with_generic_parameters(["T"])
                .into_handle(),
            TypeDefinition::new("System.Collections.Generic", "Dictionary`2")
                .with_generic_parameters(["TKey", "TValue"])
                .into_handle(),
            TypeDefinition::new("System", "Exception").into_handle(),
            TypeDefinition::new("UnityEngine", "Object").into_handle(),
            TypeDefinition::new("Game.Ui", "Widget").into_handle(),
            TypeDefinition::new("Game.World", "Widget").into_handle(),
        ];
        TypeResolver::new(
            Arc::new(TypeTable::new(types)),
            Arc::new(InMemoryMetadata::new(24.0)),
        )
    }

    #[rstest]
    #[case("Int32", "System.Int32")]
    #[case("System.Int32", "System.Int32")]
    #[case("game.player", "Game.Player")]
    #[case("Exception", "System.Exception")]
    #[case("Foo", "Game.Foo")]
    #[case("Player.State", "Game.Player/State")]
    #[case("Ui.Widget", "Game.Ui.Widget")]
    fn test_lookup(#[case] name: &str, #[case] expected: &str) {
        let resolver = resolver();
        let found = resolver.resolve_by_name(name).unwrap();
        assert_eq!(found.definition.full_name(), expected);
    }

    #[test]
    fn test_primitive_aliases_share_handle() {
        let resolver = resolver();
        let a = resolver.resolve_by_name("Int32").unwrap();
        let b = resolver.resolve_by_name("System.Int32").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_array_suffix() {
        let resolver = resolver();
        let element = resolver.resolve_by_name("Foo").unwrap();
        let array = resolver.resolve_by_name("Foo[]").unwrap();

        assert!(same_type(&array.definition, &element.definition));
        assert_eq!(array.array_depth, 1);
        assert_eq!(array.signature().to_string(), "Game.Foo[]");
    }

    #[test]
    fn test_generic_names() {
        let resolver = resolver();
        let list = resolver.resolve_by_name("List<Int32>").unwrap();
        assert_eq!(list.definition.name, "List`1");
        assert_eq!(list.generic_arguments, vec!["Int32"]);

        let dict = resolver.resolve_by_name("Dictionary<String, List<Int32>>").unwrap();
        assert_eq!(dict.definition.name, "Dictionary`2");
        assert_eq!(dict.generic_arguments, vec!["String", "List<Int32>"]);
    }

    #[test]
    fn test_ambiguous_simple_name_fails() {
        let resolver = resolver();
        assert!(resolver.resolve_by_name("Widget").is_none());
        assert!(resolver.resolve_by_name("Nope").is_none());
    }

    #[test]
    fn test_cache_is_case_insensitive() {
        let resolver = resolver();
        let a = resolver.resolve_by_name("GAME.PLAYER");
        let b = resolver.resolve_by_name("game.player");
        assert_eq!(a, b);

        let missing = resolver.resolve_by_name("Missing.Thing");
        assert!(missing.is_none());
        let cached = resolver.cached_names();
        assert!(resolver.resolve_by_name("missing.thing").is_none());
        assert_eq!(resolver.cached_names(), cached);
    }

    #[test]
    fn test_keywords_match_exactly() {
        let resolver = resolver();
        let keyword = resolver.resolve_by_name("int").unwrap();
        assert_eq!(keyword.definition.full_name(), "System.Int32");
        assert!(resolver.resolve_by_name("Int").is_none());
        assert!(resolver.resolve_by_name("int").is_some());
    }

    #[test]
    fn test_split_arguments() {
        assert_eq!(
            split_generic_arguments("A, B<C, D>, E[]"),
            vec!["A", "B<C, D>", "E[]"]
        );
        assert!(split_generic_arguments("").is_empty());
    }
}
