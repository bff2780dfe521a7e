//! External identifier resolvers
//!
//! A resolver maps a batch of identifiers to candidate identifiers in another
//! namespace (a web service, a mapping file, a database). The engine only
//! sees this trait.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Batch identifier lookup
///
/// Identifiers without any result are left out of the returned map. Values are
/// ordered by preference; the first one is the primary mapping.
#[async_trait]
pub trait IdentifierResolver: Send + Sync {
    fn name(&self) -> &str;

    async fn resolve(&self, ids: &[String]) -> Result<BTreeMap<String, Vec<String>>>;
}

/// Resolver backed by a fixed lookup table
#[derive(Debug, Clone, Default)]
pub struct MappingTableResolver {
    name: String,
    table: HashMap<String, Vec<String>>,
}

impl MappingTableResolver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: HashMap::new(),
        }
    }

    pub fn with_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.table.entry(from.into()).or_default().push(to.into());
        self
    }

    pub fn from_pairs<I, A, B>(name: impl Into<String>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        pairs
            .into_iter()
            .fold(Self::new(name), |r, (a, b)| r.with_mapping(a, b))
    }

    /// Reverse direction of this table, preserving value order per key
    pub fn inverted(&self, name: impl Into<String>) -> Self {
        let mut keys: Vec<&String> = self.table.keys().collect();
        keys.sort();
        let mut reverse = Self::new(name);
        for key in keys {
            for value in &self.table[key] {
                reverse = reverse.with_mapping(value.clone(), key.clone());
            }
        }
        reverse
    }
}

#[async_trait]
impl IdentifierResolver for MappingTableResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, ids: &[String]) -> Result<BTreeMap<String, Vec<String>>> {
        Ok(ids
            .iter()
            .filter_map(|id| {
                self.table
                    .get(id)
                    .filter(|values| !values.is_empty())
                    .map(|values| (id.clone(), values.clone()))
            })
            .collect())
    }
}

/// Process-wide resolver lookup by name
///
/// Read-mostly; registration takes the write lock.
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: RwLock<HashMap<String, Arc<dyn IdentifierResolver>>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the resolver's own name, replacing any previous one
    pub fn register(&self, resolver: Arc<dyn IdentifierResolver>) {
        let name = resolver.name().to_string();
        self.resolvers.write().insert(name, resolver);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn IdentifierResolver>> {
        self.resolvers.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.resolvers.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &self.names())
            .finish()
    }
}
