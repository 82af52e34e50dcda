//! Query input, per-query accumulator and its read-only result view.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use crate::criteria::Criteria;
use crate::entity::Entity;
use crate::error::{HuntError, Result};
use crate::path::parent_of;

/// Item path to the entities found at it.
pub type Items<E> = BTreeMap<String, Vec<E>>;

#[derive(Debug, Clone)]
pub struct Query<E: Entity> {
    roots: Vec<String>,
    criteria: Criteria<E>,
    cacheable: bool,
}

impl<E: Entity> Query<E> {
    pub fn new(criteria: Criteria<E>) -> Self {
        Self {
            roots: Vec::new(),
            criteria,
            cacheable: true,
        }
    }

    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.roots.push(root.into());
        self
    }

    pub fn roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roots.extend(roots.into_iter().map(Into::into));
        self
    }

    pub fn collect_members(mut self, collect: bool) -> Self {
        self.criteria = self.criteria.collect_members(collect);
        self
    }

    /// Scan every root afresh and leave the scan cache untouched.
    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn root_paths(&self) -> &[String] {
        &self.roots
    }

    pub fn criteria(&self) -> &Criteria<E> {
        &self.criteria
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }
}

/// Members in the order they were first seen.
#[derive(Debug)]
struct MemberSet<M> {
    order: Vec<M>,
    seen: HashSet<M>,
}

impl<M> Default for MemberSet<M> {
    fn default() -> Self {
        Self {
            order: Vec::new(),
            seen: HashSet::new(),
        }
    }
}

impl<M: Clone + Eq + Hash> MemberSet<M> {
    fn insert(&mut self, member: &M) {
        if self.seen.insert(member.clone()) {
            self.order.push(member.clone());
        }
    }
}

#[derive(Debug)]
struct ContextState<E: Entity> {
    items_by_base: BTreeMap<String, Items<E>>,
    items_flat: Items<E>,
    members: BTreeMap<String, BTreeMap<String, Vec<E::Member>>>,
    members_by_criterion: BTreeMap<String, MemberSet<E::Member>>,
    members_flat: MemberSet<E::Member>,
}

impl<E: Entity> ContextState<E> {
    fn new() -> Self {
        Self {
            items_by_base: BTreeMap::new(),
            items_flat: BTreeMap::new(),
            members: BTreeMap::new(),
            members_by_criterion: BTreeMap::new(),
            members_flat: MemberSet::default(),
        }
    }
}

/// Mutable accumulator for one query execution. Recording is safe from many
/// threads; after [`close`](Self::close) further records are dropped.
#[derive(Debug)]
pub struct SearchContext<E: Entity> {
    criteria: Criteria<E>,
    state: Mutex<Option<ContextState<E>>>,
}

impl<E: Entity> SearchContext<E> {
    pub fn new(criteria: Criteria<E>) -> Self {
        Self {
            criteria,
            state: Mutex::new(Some(ContextState::new())),
        }
    }

    pub fn criteria(&self) -> &Criteria<E> {
        &self.criteria
    }

    /// Tests `entities` found at `item` under `base` and keeps the matches.
    /// Returns how many matched.
    pub fn record(&self, base: &str, item: &str, entities: &[E]) -> usize {
        let tested: Vec<_> = entities
            .iter()
            .filter_map(|entity| {
                let result = self.criteria.test(Some(entity));
                result.matched.then_some((entity, result.members_found))
            })
            .collect();
        if tested.is_empty() {
            return 0;
        }

        let mut guard = self.state.lock();
        let Some(state) = guard.as_mut() else {
            return 0;
        };
        for (entity, members_found) in &tested {
            push_unique(
                state
                    .items_by_base
                    .entry(base.to_string())
                    .or_default()
                    .entry(item.to_string())
                    .or_default(),
                *entity,
            );
            push_unique(state.items_flat.entry(item.to_string()).or_default(), *entity);

            if self.criteria.is_collecting_members() {
                let per_entity = state.members.entry(entity.key().to_string()).or_default();
                for (criterion, members) in members_found {
                    let slot = per_entity.entry(criterion.clone()).or_default();
                    let by_criterion = state.members_by_criterion.entry(criterion.clone()).or_default();
                    for member in members {
                        if !slot.contains(member) {
                            slot.push(member.clone());
                        }
                        by_criterion.insert(member);
                        state.members_flat.insert(member);
                    }
                }
            }
        }
        tested.len()
    }

    pub fn close(&self) {
        self.state.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().is_none()
    }

    fn read<T>(&self, view: impl FnOnce(&ContextState<E>) -> T) -> Result<T> {
        match self.state.lock().as_ref() {
            Some(state) => Ok(view(state)),
            None => Err(HuntError::Closed {
                path: "search result".to_string(),
            }),
        }
    }
}

/// `item` with the entity's relative path cut off; the item's parent when
/// the item is not laid out that way.
fn class_path_of<E: Entity>(item: &str, entity: &E) -> String {
    entity
        .relative_path()
        .and_then(|relative| item.strip_suffix(relative.as_str())?.strip_suffix('/').map(str::to_string))
        .filter(|stripped| !stripped.is_empty())
        .or_else(|| parent_of(item).map(str::to_string))
        .unwrap_or_else(|| item.to_string())
}

fn push_unique<E: Entity>(slot: &mut Vec<E>, entity: &E) {
    if !slot.iter().any(|e| e.key() == entity.key()) {
        slot.push(entity.clone());
    }
}

/// Read-only view over a finished search. Every view fails with
/// [`HuntError::Closed`] once the result is closed.
#[derive(Debug)]
pub struct SearchResult<E: Entity> {
    context: Arc<SearchContext<E>>,
}

impl<E: Entity> SearchResult<E> {
    pub fn new(context: SearchContext<E>) -> Self {
        Self::shared(Arc::new(context))
    }

    /// Result over a context that someone else may close, such as the
    /// hunter on a cache clear.
    pub fn shared(context: Arc<SearchContext<E>>) -> Self {
        Self { context }
    }

    /// `basePath -> itemPath -> entities`.
    pub fn items_by_base(&self) -> Result<BTreeMap<String, Items<E>>> {
        self.context.read(|s| s.items_by_base.clone())
    }

    /// `itemPath -> entities`.
    pub fn items_flat(&self) -> Result<Items<E>> {
        self.context.read(|s| s.items_flat.clone())
    }

    pub fn entities(&self) -> Result<Vec<E>> {
        self.context.read(|s| {
            let mut out: Vec<E> = Vec::new();
            for entity in s.items_flat.values().flatten() {
                push_unique(&mut out, entity);
            }
            out
        })
    }

    /// Entity key to criterion name to matched members. Entities sharing a
    /// key, such as one class name found in two archives, share one entry.
    pub fn members(&self) -> Result<BTreeMap<String, BTreeMap<String, Vec<E::Member>>>> {
        self.context.read(|s| s.members.clone())
    }

    /// Union of every collected member, in the order they were found.
    pub fn members_flat(&self) -> Result<Vec<E::Member>> {
        self.context.read(|s| s.members_flat.order.clone())
    }

    /// Members recorded under one criterion name across all entities, in
    /// the order they were found.
    pub fn members_by(&self, criterion: &str) -> Result<Vec<E::Member>> {
        self.context.read(|s| {
            s.members_by_criterion
                .get(criterion)
                .map(|set| set.order.clone())
                .unwrap_or_default()
        })
    }

    /// Re-tests the flattened member union against `predicate`.
    pub fn members_matching<F>(&self, predicate: F) -> Result<Vec<E::Member>>
    where
        F: Fn(&E::Member) -> bool,
    {
        self.context
            .read(|s| s.members_flat.order.iter().filter(|m| predicate(m)).cloned().collect())
    }

    /// Class path elements (directories or archives) holding the matches.
    pub fn class_paths(&self) -> Result<BTreeSet<String>> {
        self.context.read(|s| {
            s.items_flat
                .iter()
                .flat_map(|(item, entities)| entities.iter().map(move |e| class_path_of(item, e)))
                .collect()
        })
    }

    /// Class path elements holding at least one match that also passes
    /// `criteria`.
    pub fn class_paths_matching(&self, criteria: &Criteria<E>) -> Result<BTreeSet<String>> {
        self.context.read(|s| {
            s.items_flat
                .iter()
                .flat_map(|(item, entities)| entities.iter().map(move |e| (item, e)))
                .filter(|(_, entity)| criteria.test(Some(*entity)).matched)
                .map(|(item, entity)| class_path_of(item, entity))
                .collect()
        })
    }

    /// Entity with the given key.
    pub fn get(&self, key: &str) -> Result<E> {
        self.context
            .read(|s| {
                s.items_flat
                    .values()
                    .flatten()
                    .find(|e| e.key() == key)
                    .cloned()
            })?
            .ok_or_else(|| HuntError::not_found("entity", key))
    }

    /// Number of item paths with at least one match; zero once closed.
    pub fn len(&self) -> usize {
        self.context.read(|s| s.items_flat.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        self.context.close();
    }

    pub fn is_closed(&self) -> bool {
        self.context.is_closed()
    }
}
