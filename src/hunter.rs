//! The caching search engine.
//!
//! A root that was scanned before is served from the scan cache: each cached
//! item is checked with the [`ItemValidator`], valid items are re-tested
//! against the current criteria without touching container bytes, and only
//! invalid items are rescanned. Unseen roots are walked in full.

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::archive::ArchiveEnv;
use crate::config::HunterConfig;
use crate::container::{Container, Descend, StreamContainer};
use crate::criteria::Criteria;
use crate::decoder::{ArchiveDecoder, ZipDecoder};
use crate::entity::{Entity, EntityClassifier};
use crate::entry::{DetachedEntry, Entry};
use crate::error::{HuntError, Result};
use crate::filter::{EntityFilter, FileSystemCheck, ItemValidator};
use crate::path::{FsPathResolver, PathResolver};
use crate::scan_cache::ScanCache;
use crate::search::{Items, Query, SearchContext, SearchResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HunterStats {
    pub cached_roots: usize,
    pub cached_items: usize,
    pub content_entries: usize,
    pub live_path_locks: usize,
    pub generation: u64,
}

pub struct Hunter<C: EntityClassifier> {
    config: HunterConfig,
    classifier: C,
    filter: EntityFilter,
    validator: Arc<dyn ItemValidator>,
    resolver: Arc<dyn PathResolver>,
    decoder: Arc<dyn ArchiveDecoder>,
    env: RwLock<Arc<ArchiveEnv>>,
    scan_cache: ScanCache<C::Entity>,
    live: Mutex<Vec<Weak<SearchContext<C::Entity>>>>,
}

pub struct HunterBuilder<C: EntityClassifier> {
    classifier: C,
    config: HunterConfig,
    filter: Option<EntityFilter>,
    validator: Option<Arc<dyn ItemValidator>>,
    resolver: Arc<dyn PathResolver>,
    decoder: Arc<dyn ArchiveDecoder>,
}

impl<C: EntityClassifier> HunterBuilder<C> {
    pub fn config(mut self, config: HunterConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the filter derived from the config's check-file option.
    pub fn filter(mut self, filter: EntityFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn validator(mut self, validator: impl ItemValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn resolver(mut self, resolver: impl PathResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn decoder(mut self, decoder: impl ArchiveDecoder + 'static) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    pub fn build(self) -> Hunter<C> {
        let filter = self
            .filter
            .unwrap_or_else(|| EntityFilter::new(self.config.check_file_option));
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(FileSystemCheck::new(filter.clone())));
        let env = new_env(&self.config, &self.decoder, 0);
        Hunter {
            config: self.config,
            classifier: self.classifier,
            filter,
            validator,
            resolver: self.resolver,
            decoder: self.decoder,
            env: RwLock::new(Arc::new(env)),
            scan_cache: ScanCache::new(),
            live: Mutex::new(Vec::new()),
        }
    }
}

fn new_env(config: &HunterConfig, decoder: &Arc<dyn ArchiveDecoder>, generation: u64) -> ArchiveEnv {
    ArchiveEnv::new(Arc::clone(decoder))
        .with_archive_extensions(&config.archive_extensions)
        .with_max_nesting_depth(config.max_nesting_depth)
        .with_generation(generation)
}

impl<C: EntityClassifier> Hunter<C> {
    pub fn builder(classifier: C) -> HunterBuilder<C> {
        HunterBuilder {
            classifier,
            config: HunterConfig::default(),
            filter: None,
            validator: None,
            resolver: Arc::new(FsPathResolver),
            decoder: Arc::new(ZipDecoder),
        }
    }

    pub fn new(classifier: C) -> Self {
        Self::builder(classifier).build()
    }

    pub fn config(&self) -> &HunterConfig {
        &self.config
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// Archive environment in use; replaced on every cache clear.
    pub fn env(&self) -> Arc<ArchiveEnv> {
        Arc::clone(&self.env.read())
    }

    /// Runs a query. Missing roots are skipped with a warning; the query
    /// fails only when every root is missing.
    pub fn find_by(&self, query: Query<C::Entity>) -> Result<SearchResult<C::Entity>> {
        let env = self.env();
        let mut roots: Vec<String> = Vec::new();
        for raw in query.root_paths() {
            let root = self.resolver.normalize(raw);
            if !roots.contains(&root) {
                roots.push(root);
            }
        }

        let (available, missing): (Vec<String>, Vec<String>) = roots
            .into_iter()
            .partition(|root| root_available(&env, root));
        for root in &missing {
            warn!(root = %root, "search root not found, skipping");
        }
        if available.is_empty() && !missing.is_empty() {
            return Err(HuntError::RootUnavailable { roots: missing });
        }

        let context = Arc::new(SearchContext::new(query.criteria().clone()));
        self.track(&context);
        let cacheable = query.is_cacheable();
        let search = |root: &String| self.search_root(&env, root, cacheable, &context);
        if self.config.parallel {
            available.par_iter().try_for_each(search)?;
        } else {
            available.iter().try_for_each(search)?;
        }

        let result = SearchResult::shared(context);
        debug!(roots = available.len(), matches = result.len(), "search finished");
        Ok(result)
    }

    /// Scans `roots` into the scan cache without keeping a result.
    pub fn load_in_cache<I, S>(&self, roots: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.find_by(Query::new(Criteria::all()).roots(roots))?.close();
        Ok(())
    }

    /// Drops every cached root and all cached content, and swaps in a fresh
    /// archive environment so later scans never see bytes loaded before.
    /// Results handed out so far are closed.
    pub fn clear_cache(&self) {
        let results = self.close_results();
        let roots = self.scan_cache.clear();
        let mut env = self.env.write();
        env.content().clear();
        let generation = env.generation() + 1;
        *env = Arc::new(new_env(&self.config, &self.decoder, generation));
        info!(roots = roots.len(), results, generation, "cleared scan and content caches");
    }

    /// Closes every live result and releases cached state without rotating
    /// the environment.
    pub fn close(&self) {
        self.close_results();
        self.scan_cache.clear();
        self.env.read().content().clear();
    }

    pub fn stats(&self) -> HunterStats {
        let env = self.env();
        HunterStats {
            cached_roots: self.scan_cache.root_count(),
            cached_items: self.scan_cache.item_count(),
            content_entries: env.content().len(),
            live_path_locks: env.locks().len(),
            generation: env.generation(),
        }
    }

    fn track(&self, context: &Arc<SearchContext<C::Entity>>) {
        let mut live = self.live.lock();
        live.retain(|weak| weak.strong_count() > 0);
        live.push(Arc::downgrade(context));
    }

    fn close_results(&self) -> usize {
        let live: Vec<_> = self.live.lock().drain(..).collect();
        let mut closed = 0;
        for context in live.iter().filter_map(Weak::upgrade) {
            context.close();
            closed += 1;
        }
        closed
    }

    fn search_root(
        &self,
        env: &Arc<ArchiveEnv>,
        root: &str,
        cacheable: bool,
        context: &SearchContext<C::Entity>,
    ) -> Result<()> {
        if !cacheable {
            let items = self.scan(env, root)?;
            record_all(context, root, &items);
            return Ok(());
        }

        env.locks().with_lock(&format!("scan:{root}"), || {
            let Some(cached) = self.scan_cache.items_for(root) else {
                let items = self.scan(env, root)?;
                debug!(root, items = items.len(), "scanned root");
                record_all(context, root, &items);
                self.scan_cache.upsert(root, items);
                return Ok(());
            };

            let mut invalid = Vec::new();
            for (item, entities) in &cached {
                if self.validator.is_valid(item) {
                    context.record(root, item, entities);
                } else {
                    invalid.push(item.as_str());
                }
            }
            for item in invalid {
                debug!(root, item, "cached item failed validation, rescanning");
                self.scan_cache.remove_item(root, item);
                env.content().invalidate_prefix(item);
                let rescanned = self.scan(env, item)?;
                record_all(context, root, &rescanned);
                self.scan_cache.upsert(root, rescanned);
            }
            Ok(())
        })
    }

    /// Every entity found under `location`, keyed by item path.
    fn scan(&self, env: &Arc<ArchiveEnv>, location: &str) -> Result<Items<C::Entity>> {
        let mut items = Items::new();
        let path = Path::new(location);
        if path.is_dir() {
            let mut container = Container::open(env, location, self.config.include_hidden)?;
            let entries = container.find_all_matching(|entry| !entry.is_dir())?;
            container.close();
            for entry in &entries {
                self.scan_entry(env, entry, &mut items);
            }
        } else if path.is_file() {
            let entry = Entry::Detached(DetachedEntry::file(env, location));
            self.scan_entry(env, &entry, &mut items);
        } else {
            match env.open_entry(location) {
                Ok(entry) => self.scan_entry(env, &entry, &mut items),
                Err(HuntError::NotFound { .. }) => debug!(location, "nothing left to scan"),
                Err(err) => warn!(location, %err, "could not open location"),
            }
        }
        Ok(items)
    }

    fn scan_entry(&self, env: &Arc<ArchiveEnv>, entry: &Entry, items: &mut Items<C::Entity>) {
        if entry.is_dir() {
            return;
        }
        if self.filter.accepts(entry) {
            match self.classify(entry) {
                Ok(entity) => items
                    .entry(entry.absolute_path().to_string())
                    .or_default()
                    .push(entity),
                Err(err) => warn!(entry = %entry.absolute_path(), %err, "skipping entry"),
            }
            return;
        }

        if !env.may_be_archive(entry.name()) {
            return;
        }
        match entry.is_archive() {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!(entry = %entry.absolute_path(), %err, "could not sniff entry");
                return;
            }
        }
        match entry.open_as_container() {
            Ok(mut container) => {
                self.scan_stream(&mut container, items);
                container.close();
            }
            Err(err) => warn!(entry = %entry.absolute_path(), %err, "could not open archive"),
        }
    }

    fn scan_stream(&self, container: &mut StreamContainer, items: &mut Items<C::Entity>) {
        let found = container.find_all_and_convert(
            Descend::Archives,
            |entry| self.filter.accepts(entry),
            |entry| {
                let bytes = entry.read_uncached()?;
                let entity = self.classifier.classify(&bytes, entry.absolute_path())?;
                Ok(Some((entry.absolute_path().to_string(), entity)))
            },
        );
        match found {
            Ok(found) => {
                for (path, entity) in found {
                    items.entry(path).or_default().push(entity);
                }
            }
            Err(err) => warn!(container = %container.absolute_path(), %err, "skipping unreadable archive"),
        }
    }

    /// Leaf bytes are classified once and not kept in the content cache.
    fn classify(&self, entry: &Entry) -> Result<C::Entity> {
        let bytes = entry.read_uncached()?;
        Ok(self.classifier.classify(&bytes, entry.absolute_path())?)
    }
}

fn root_available(env: &Arc<ArchiveEnv>, root: &str) -> bool {
    Path::new(root).exists() || env.open_entry(root).is_ok()
}

fn record_all<E: Entity>(context: &SearchContext<E>, root: &str, items: &Items<E>) {
    for (item, entities) in items {
        context.record(root, item, entities);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::ClassFileClassifier;

    #[test]
    fn duplicate_roots_are_searched_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let hunter = Hunter::new(ClassFileClassifier);

        let result = hunter.find_by(Query::new(Criteria::all()).roots([root.clone(), format!("{root}/./")]))?;
        assert!(result.is_empty());
        assert_eq!(hunter.stats().cached_roots, 1);
        Ok(())
    }

    #[test]
    fn clear_cache_rotates_environment() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let hunter = Hunter::new(ClassFileClassifier);
        hunter.load_in_cache([dir.path().to_string_lossy().to_string()])?;
        let before = hunter.env();

        hunter.clear_cache();
        let stats = hunter.stats();
        assert_eq!(stats.generation, 1);
        assert_eq!(stats.cached_roots, 0);
        assert!(!Arc::ptr_eq(&before, &hunter.env()));
        assert_eq!(serde_json::to_value(&stats)?["generation"], 1);
        Ok(())
    }

    #[test]
    fn clear_and_close_close_handed_out_results() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().to_string();
        let hunter = Hunter::new(ClassFileClassifier);

        let first = hunter.find_by(Query::new(Criteria::all()).root(&root))?;
        let dropped = hunter.find_by(Query::new(Criteria::all()).root(&root))?;
        drop(dropped);
        hunter.clear_cache();
        assert!(first.is_closed());
        assert!(matches!(first.items_flat(), Err(HuntError::Closed { .. })));

        let second = hunter.find_by(Query::new(Criteria::all()).root(&root))?;
        assert!(!second.is_closed());
        hunter.close();
        assert!(second.is_closed());
        Ok(())
    }

    #[test]
    fn query_without_roots_is_empty() -> anyhow::Result<()> {
        let hunter = Hunter::new(ClassFileClassifier);
        let result = hunter.find_by(Query::new(Criteria::all()))?;
        assert!(result.is_empty());
        Ok(())
    }
}
