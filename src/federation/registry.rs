//! Capability registry — one collision-free namespace over every backend and
//! wrapped API.
//!
//! Provides:
//! - Atomic add/remove of an owner's descriptors
//! - Deterministic qualification (`owner:raw`) of names shared across owners
//! - Lookup by `(kind, qualified_name)` and stable, insertion-ordered listing
//! - Snapshot reads: readers clone an `Arc` to an immutable [`Namespace`]
//!
//! Qualified names are recomputed from scratch on every mutation, so removing
//! an owner can turn `a:search` back into plain `search`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use super::errors::GatewayError;
use super::translator::EndpointAdapter;
use super::types::{CapabilityDescriptor, CapabilityKind, Origin};

// ─── Entries ─────────────────────────────────────────────────────────────────

/// Where an invocation for an entry is executed.
#[derive(Debug, Clone)]
pub enum ResolverTarget {
    /// A backend session, looked up by id at call time.
    Backend { session_id: String },
    /// A translated REST endpoint.
    WrappedApi(Arc<EndpointAdapter>),
}

impl ResolverTarget {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Backend { .. } => Origin::Backend,
            Self::WrappedApi(_) => Origin::WrappedApi,
        }
    }
}

/// One resolved capability.
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub descriptor: CapabilityDescriptor,
    pub target: ResolverTarget,
}

#[derive(Debug, Clone)]
struct OwnerBatch {
    owner_id: String,
    items: Vec<(CapabilityDescriptor, ResolverTarget)>,
}

// ─── Namespace ───────────────────────────────────────────────────────────────

/// An immutable view of the registry at one version.
#[derive(Debug, Default)]
pub struct Namespace {
    version: u64,
    owners: Vec<OwnerBatch>,
    entries: Vec<Arc<RegistryEntry>>,
    index: HashMap<(CapabilityKind, String), usize>,
}

/// Raw names containing `:` are taken as already qualified. Resource URIs
/// carry a scheme, so they are always eligible for prefixing.
fn is_prequalified(kind: CapabilityKind, raw_name: &str) -> bool {
    kind != CapabilityKind::Resource && raw_name.contains(':')
}

impl Namespace {
    /// Compute qualified names for `owners` and index them.
    fn build(owners: Vec<OwnerBatch>, version: u64) -> Result<Self, GatewayError> {
        // Distinct owners per (kind, bare raw name).
        let mut sharers: HashMap<(CapabilityKind, &str), HashSet<&str>> = HashMap::new();
        for batch in &owners {
            let mut own = HashSet::new();
            for (descriptor, _) in &batch.items {
                let key = (descriptor.kind, descriptor.raw_name.as_str());
                if !own.insert(key) {
                    return Err(GatewayError::Conflict {
                        name: descriptor.raw_name.clone(),
                        existing_owner: batch.owner_id.clone(),
                        incoming_owner: batch.owner_id.clone(),
                    });
                }
                if !is_prequalified(descriptor.kind, &descriptor.raw_name) {
                    sharers.entry(key).or_default().insert(batch.owner_id.as_str());
                }
            }
        }

        let mut entries: Vec<Arc<RegistryEntry>> = Vec::new();
        let mut index = HashMap::new();

        for batch in &owners {
            for (descriptor, target) in &batch.items {
                let shared = sharers
                    .get(&(descriptor.kind, descriptor.raw_name.as_str()))
                    .is_some_and(|set| set.len() > 1);
                let qualified = if shared {
                    format!("{}:{}", batch.owner_id, descriptor.raw_name)
                } else {
                    descriptor.raw_name.clone()
                };

                let key = (descriptor.kind, qualified.clone());
                if let Some(&existing) = index.get(&key) {
                    let existing: &Arc<RegistryEntry> = &entries[existing];
                    return Err(GatewayError::Conflict {
                        name: qualified,
                        existing_owner: existing.descriptor.owner_id.clone(),
                        incoming_owner: batch.owner_id.clone(),
                    });
                }

                let mut descriptor = descriptor.clone();
                descriptor.qualified_name = qualified;
                index.insert(key, entries.len());
                entries.push(Arc::new(RegistryEntry {
                    descriptor,
                    target: target.clone(),
                }));
            }
        }

        Ok(Self {
            version,
            owners,
            entries,
            index,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Look up an entry by kind and qualified name.
    pub fn lookup(&self, kind: CapabilityKind, qualified_name: &str) -> Option<Arc<RegistryEntry>> {
        self.index
            .get(&(kind, qualified_name.to_string()))
            .map(|&i| self.entries[i].clone())
    }

    /// Entries in insertion order, optionally filtered by kind.
    pub fn list(&self, kind: Option<CapabilityKind>) -> Vec<Arc<RegistryEntry>> {
        self.entries
            .iter()
            .filter(|e| kind.map_or(true, |k| e.descriptor.kind == k))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Owner ids in registration order.
    pub fn owner_ids(&self) -> Vec<&str> {
        self.owners.iter().map(|b| b.owner_id.as_str()).collect()
    }

    pub fn contains_owner(&self, owner_id: &str) -> bool {
        self.owners.iter().any(|b| b.owner_id == owner_id)
    }

    /// Count entries belonging to an owner.
    pub fn count_for_owner(&self, owner_id: &str) -> usize {
        self.entries
            .iter()
            .filter(|e| e.descriptor.owner_id == owner_id)
            .count()
    }

    /// Up to `max_results` names of `kind` similar to `name`, best first.
    ///
    /// Compares against the unqualified suffix when `name` carries an owner
    /// prefix, so `notes:serch` still finds `search`.
    pub fn find_similar(&self, kind: CapabilityKind, name: &str, max_results: usize) -> Vec<String> {
        let query = name.rsplit(':').next().unwrap_or(name);

        let mut scored: Vec<(String, f64)> = self
            .entries
            .iter()
            .filter(|e| e.descriptor.kind == kind)
            .map(|e| {
                let candidate = e.descriptor.raw_name.rsplit(':').next().unwrap_or(&e.descriptor.raw_name);
                (e.descriptor.qualified_name.clone(), similarity(query, candidate))
            })
            .filter(|(_, score)| *score > 0.3)
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name).collect()
    }
}

// ─── Registry ────────────────────────────────────────────────────────────────

/// The single owner of the namespace.
///
/// Mutations are serialized by a writer lock and publish a fresh
/// [`Namespace`]; readers never block writers for longer than an `Arc` clone.
#[derive(Debug, Default)]
pub struct Registry {
    current: RwLock<Arc<Namespace>>,
    writer: Mutex<()>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current immutable namespace.
    pub fn snapshot(&self) -> Arc<Namespace> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Monotonic mutation version.
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<OwnerBatch>) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snapshot();

        let mut owners = current.owners.clone();
        let out = f(&mut owners)?;
        let next = Namespace::build(owners, current.version + 1)?;

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        Ok(out)
    }

    /// Add one descriptor, appending to its owner's batch.
    pub fn add(
        &self,
        descriptor: CapabilityDescriptor,
        target: ResolverTarget,
    ) -> Result<(), GatewayError> {
        self.mutate(|owners| {
            let owner_id = descriptor.owner_id.clone();
            match owners.iter_mut().find(|b| b.owner_id == owner_id) {
                Some(batch) => batch.items.push((descriptor, target)),
                None => owners.push(OwnerBatch {
                    owner_id,
                    items: vec![(descriptor, target)],
                }),
            }
            Ok(())
        })
    }

    /// Add an owner's whole batch. All or nothing: on conflict the namespace
    /// is left untouched.
    ///
    /// Fails with `Conflict` if the owner already has entries.
    pub fn add_all(
        &self,
        owner_id: &str,
        items: Vec<(CapabilityDescriptor, ResolverTarget)>,
    ) -> Result<usize, GatewayError> {
        let count = items.len();
        self.mutate(|owners| {
            if owners.iter().any(|b| b.owner_id == owner_id) {
                return Err(GatewayError::Conflict {
                    name: owner_id.to_string(),
                    existing_owner: owner_id.to_string(),
                    incoming_owner: owner_id.to_string(),
                });
            }
            let items = items
                .into_iter()
                .map(|(mut descriptor, target)| {
                    descriptor.owner_id = owner_id.to_string();
                    (descriptor, target)
                })
                .collect();
            owners.push(OwnerBatch {
                owner_id: owner_id.to_string(),
                items,
            });
            Ok(())
        })?;

        tracing::debug!(owner = owner_id, count, "registered capabilities");
        Ok(count)
    }

    /// Remove every entry of an owner. Returns how many were removed.
    pub fn remove(&self, owner_id: &str) -> Result<usize, GatewayError> {
        if !self.snapshot().contains_owner(owner_id) {
            return Ok(0);
        }
        let removed = self.mutate(|owners| {
            let before: usize = owners.iter().map(|b| b.items.len()).sum();
            owners.retain(|b| b.owner_id != owner_id);
            let after: usize = owners.iter().map(|b| b.items.len()).sum();
            Ok(before - after)
        })?;

        tracing::debug!(owner = owner_id, removed, "removed capabilities");
        Ok(removed)
    }

    pub fn lookup(&self, kind: CapabilityKind, qualified_name: &str) -> Option<Arc<RegistryEntry>> {
        self.snapshot().lookup(kind, qualified_name)
    }

    pub fn list(&self, kind: Option<CapabilityKind>) -> Vec<Arc<RegistryEntry>> {
        self.snapshot().list(kind)
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance over bytes.
fn levenshtein(a: &str, b: &str) -> usize {
    let a = a.as_bytes();
    let b = b.as_bytes();

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=b.len() {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}

/// Normalized similarity in `0.0..=1.0`.
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.len().max(b.len());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

// ─── Tests ───────────────────────────────────────────────────────────────────
