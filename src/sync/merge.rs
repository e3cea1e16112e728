//! Merging out-of-band entities into paginated baselines.
//!
//! The paginator owns the cold baseline, [`LiveMergeCollection`] owns the
//! entities that arrived since (pushes, local writes). [`merge_view`] folds
//! them into one deduplicated, ordered list. Live entries win over baseline
//! entries with the same id.

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tracing::debug;

use super::pagination::CursorPaginator;
use super::{FetchStatus, QueryParams, SyncError, SyncResult};

/// A record with a stable identity and an optional parent
pub trait Entity: Clone + PartialEq + Send + Sync + 'static {
    type Id: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static;
    type ParentId: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;

    fn parent_id(&self) -> Option<Self::ParentId> {
        None
    }
}

type Comparator<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Ordering of a merged view
pub enum ViewOrder<T> {
    /// Keep the server's baseline order; live-only entities go first,
    /// highest id first
    Baseline,
    /// Sort by a comparator, ties broken by descending id
    By(Comparator<T>),
}

impl<T> Clone for ViewOrder<T> {
    fn clone(&self) -> Self {
        match self {
            ViewOrder::Baseline => ViewOrder::Baseline,
            ViewOrder::By(cmp) => ViewOrder::By(cmp.clone()),
        }
    }
}

impl<T: Entity> ViewOrder<T> {
    pub fn by(cmp: impl Fn(&T, &T) -> Ordering + Send + Sync + 'static) -> Self {
        ViewOrder::By(Arc::new(cmp))
    }

    pub fn descending_id() -> Self {
        ViewOrder::by(|a: &T, b: &T| b.id().cmp(&a.id()))
    }
}

/// Project `baseline` overwritten by `live` into one ordered list.
///
/// Duplicate ids inside the baseline keep the position of their first
/// occurrence and the value of their last one.
pub fn merge_view<T: Entity>(
    baseline: &[T],
    live: &BTreeMap<T::Id, T>,
    order: &ViewOrder<T>,
) -> Vec<T> {
    let mut positions: HashMap<T::Id, usize> = HashMap::with_capacity(baseline.len());
    let mut merged: Vec<T> = Vec::with_capacity(baseline.len() + live.len());

    for entity in baseline {
        let id = entity.id();
        match positions.get(&id) {
            Some(&at) => merged[at] = entity.clone(),
            None => {
                positions.insert(id, merged.len());
                merged.push(entity.clone());
            }
        }
    }

    let mut live_only = Vec::new();
    for (id, entity) in live.iter().rev() {
        match positions.get(id) {
            Some(&at) => merged[at] = entity.clone(),
            None => live_only.push(entity.clone()),
        }
    }

    match order {
        ViewOrder::Baseline => {
            live_only.extend(merged);
            live_only
        }
        ViewOrder::By(cmp) => {
            merged.extend(live_only);
            merged.sort_by(|a, b| cmp(a, b).then_with(|| b.id().cmp(&a.id())));
            merged
        }
    }
}

/// Entities received out of band, keyed by id
pub struct LiveMergeCollection<T: Entity> {
    scope: Option<T::ParentId>,
    order: ViewOrder<T>,
    live: RwLock<BTreeMap<T::Id, T>>,
    revision: watch::Sender<u64>,
}

impl<T: Entity> LiveMergeCollection<T> {
    pub fn new(order: ViewOrder<T>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            scope: None,
            order,
            live: RwLock::new(BTreeMap::new()),
            revision,
        }
    }

    /// Collection that only accepts entities of `parent`
    pub fn scoped(parent: T::ParentId, order: ViewOrder<T>) -> Self {
        Self {
            scope: Some(parent),
            ..Self::new(order)
        }
    }

    pub fn scope(&self) -> Option<&T::ParentId> {
        self.scope.as_ref()
    }

    /// Insert or overwrite by id.
    ///
    /// Returns whether the collection changed. Re-applying an equal value is
    /// a no-op and does not notify subscribers.
    pub fn apply_live(&self, entity: T) -> SyncResult<bool> {
        if let Some(scope) = &self.scope {
            if entity.parent_id().as_ref() != Some(scope) {
                return Err(SyncError::ContractViolation(format!(
                    "entity {:?} belongs to {:?}, not {:?}",
                    entity.id(),
                    entity.parent_id(),
                    scope
                )));
            }
        }

        {
            let mut live = self.live.write();
            let id = entity.id();
            if live.get(&id) == Some(&entity) {
                return Ok(false);
            }
            live.insert(id, entity);
        }

        self.revision.send_modify(|rev| *rev += 1);
        Ok(true)
    }

    pub fn remove_live(&self, id: &T::Id) -> Option<T> {
        let removed = self.live.write().remove(id);
        if removed.is_some() {
            self.revision.send_modify(|rev| *rev += 1);
        }
        removed
    }

    pub fn get_live(&self, id: &T::Id) -> Option<T> {
        self.live.read().get(id).cloned()
    }

    pub fn live_len(&self) -> usize {
        self.live.read().len()
    }

    pub fn clear_live(&self) {
        let had_entries = {
            let mut live = self.live.write();
            let had_entries = !live.is_empty();
            live.clear();
            had_entries
        };
        if had_entries {
            self.revision.send_modify(|rev| *rev += 1);
        }
    }

    /// Merged view over `baseline`
    pub fn view(&self, baseline: &[T]) -> Vec<T> {
        merge_view(baseline, &self.live.read(), &self.order)
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

/// A paginated baseline paired with its live overlay
pub struct SyncedCollection<T: Entity> {
    paginator: CursorPaginator<T>,
    live: Arc<LiveMergeCollection<T>>,
}

impl<T: Entity> Clone for SyncedCollection<T> {
    fn clone(&self) -> Self {
        Self {
            paginator: self.paginator.clone(),
            live: self.live.clone(),
        }
    }
}

impl<T: Entity> SyncedCollection<T> {
    pub fn new(paginator: CursorPaginator<T>, live: LiveMergeCollection<T>) -> Self {
        Self {
            paginator,
            live: Arc::new(live),
        }
    }

    pub fn view(&self) -> Vec<T> {
        self.live.view(&self.paginator.items())
    }

    /// Current value for `id`, live value first
    pub fn get(&self, id: &T::Id) -> Option<T> {
        self.live.get_live(id).or_else(|| {
            self.paginator
                .items()
                .into_iter()
                .rev()
                .find(|entity| entity.id() == *id)
        })
    }

    pub fn contains(&self, id: &T::Id) -> bool {
        self.get(id).is_some()
    }

    pub async fn load_more(&self) {
        self.paginator.load_more().await;
    }

    pub fn reset(&self, query: QueryParams) {
        debug!("[{}] Reset", self.paginator.label());
        self.paginator.reset(query);
    }

    pub fn refresh(&self) {
        debug!("[{}] Refresh", self.paginator.label());
        self.paginator.refresh();
    }

    /// Drop both the baseline and the live overlay
    pub fn clear(&self) {
        self.live.clear_live();
        self.paginator.refresh();
    }

    pub fn apply_live(&self, entity: T) -> SyncResult<bool> {
        self.live.apply_live(entity)
    }

    pub fn remove_live(&self, id: &T::Id) -> Option<T> {
        self.live.remove_live(id)
    }

    pub fn is_terminal(&self) -> bool {
        self.paginator.is_terminal()
    }

    pub fn is_loading(&self) -> bool {
        self.paginator.is_loading()
    }

    pub fn status(&self) -> FetchStatus {
        self.paginator.status()
    }

    pub fn error(&self) -> Option<SyncError> {
        self.paginator.error()
    }

    pub fn paginator(&self) -> &CursorPaginator<T> {
        &self.paginator
    }

    pub fn live(&self) -> &Arc<LiveMergeCollection<T>> {
        &self.live
    }

    /// Watch both the baseline and the live overlay
    pub fn watch(&self) -> CollectionWatcher {
        CollectionWatcher::new(self.paginator.subscribe(), self.live.subscribe())
    }
}

/// Change notifications of a [`SyncedCollection`]
pub struct CollectionWatcher {
    pages: watch::Receiver<u64>,
    live: watch::Receiver<u64>,
}

impl CollectionWatcher {
    pub(crate) fn new(pages: watch::Receiver<u64>, live: watch::Receiver<u64>) -> Self {
        Self { pages, live }
    }

    /// Wait for the next change; `false` once the collection is gone
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            res = self.pages.changed() => res.is_ok(),
            res = self.live.changed() => res.is_ok(),
        }
    }

    /// One item per change, ending once the collection is gone
    pub fn into_stream(self) -> impl Stream<Item = ()> + Send + Unpin {
        WatchStream::from_changes(self.pages)
            .merge(WatchStream::from_changes(self.live))
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::pagination::tests::{page, ScriptedSource};

    #[derive(Debug, Clone, PartialEq)]
    struct Note {
        id: i64,
        thread: String,
        seen: bool,
    }

    impl Note {
        fn new(id: i64, thread: &str) -> Self {
            Self {
                id,
                thread: thread.to_string(),
                seen: false,
            }
        }
    }

    impl Entity for Note {
        type Id = i64;
        type ParentId = String;

        fn id(&self) -> i64 {
            self.id
        }

        fn parent_id(&self) -> Option<String> {
            Some(self.thread.clone())
        }
    }

    #[test]
    fn test_apply_live_is_idempotent() {
        let live = LiveMergeCollection::new(ViewOrder::descending_id());
        let rx = live.subscribe();
        let baseline = vec![Note::new(3, "a"), Note::new(2, "a"), Note::new(1, "a")];
        let mut seen = Note::new(2, "a");
        seen.seen = true;

        assert!(live.apply_live(seen.clone()).unwrap());
        let once = live.view(&baseline);
        assert!(!live.apply_live(seen.clone()).unwrap());
        let twice = live.view(&baseline);

        assert_eq!(twice, once);
        assert_eq!(twice.len(), 3);
        assert_eq!(twice[1], seen);
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn test_live_value_wins_over_baseline() {
        let live = LiveMergeCollection::new(ViewOrder::descending_id());
        let baseline = vec![Note::new(2, "a"), Note::new(1, "a")];

        let mut seen = Note::new(1, "a");
        seen.seen = true;
        live.apply_live(seen.clone()).unwrap();

        let view = live.view(&baseline);
        assert_eq!(view.len(), 2);
        assert_eq!(view[1], seen);
    }

    #[test]
    fn test_scoped_collection_rejects_other_parent() {
        let live = LiveMergeCollection::scoped("a".to_string(), ViewOrder::descending_id());

        let result = live.apply_live(Note::new(5, "b"));

        assert!(matches!(result, Err(SyncError::ContractViolation(_))));
        assert_eq!(live.live_len(), 0);
        assert!(live.apply_live(Note::new(5, "a")).unwrap());
    }

    #[test]
    fn test_comparator_order_is_deterministic() {
        let live = LiveMergeCollection::new(ViewOrder::descending_id());
        live.apply_live(Note::new(10, "a")).unwrap();
        live.apply_live(Note::new(4, "a")).unwrap();

        let baseline = vec![Note::new(9, "a"), Note::new(3, "a"), Note::new(9, "a")];
        let ids: Vec<i64> = live.view(&baseline).iter().map(|n| n.id).collect();

        assert_eq!(ids, vec![10, 9, 4, 3]);
    }

    #[test]
    fn test_baseline_order_puts_live_only_first() {
        let live = LiveMergeCollection::new(ViewOrder::Baseline);
        live.apply_live(Note::new(7, "a")).unwrap();
        live.apply_live(Note::new(20, "a")).unwrap();
        live.apply_live(Note::new(1, "a")).unwrap();

        let baseline = vec![Note::new(1, "a"), Note::new(5, "a"), Note::new(3, "a")];
        let ids: Vec<i64> = live.view(&baseline).iter().map(|n| n.id).collect();

        assert_eq!(ids, vec![20, 7, 1, 5, 3]);
    }

    #[test]
    fn test_remove_live_restores_baseline() {
        let live = LiveMergeCollection::new(ViewOrder::descending_id());
        let mut edited = Note::new(1, "a");
        edited.seen = true;
        live.apply_live(edited).unwrap();

        assert!(live.remove_live(&1).is_some());
        assert!(live.remove_live(&1).is_none());
        assert!(!live.view(&[Note::new(1, "a")])[0].seen);
    }

    #[tokio::test]
    async fn test_synced_collection_merges_pages_and_live() {
        let source = Arc::new(ScriptedSource::new(vec![
            page(vec![Note::new(5, "a"), Note::new(4, "a")], Some("cid=4")),
            page(vec![Note::new(3, "a")], None),
        ]));
        let collection = SyncedCollection::new(
            CursorPaginator::new("notes", source, QueryParams::new()),
            LiveMergeCollection::scoped("a".to_string(), ViewOrder::descending_id()),
        );
        let mut watcher = collection.watch();

        collection.load_more().await;
        assert!(watcher.changed().await);

        collection.apply_live(Note::new(6, "a")).unwrap();
        collection.load_more().await;

        let ids: Vec<i64> = collection.view().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![6, 5, 4, 3]);
        assert!(collection.is_terminal());
        assert!(collection.contains(&3));
        assert!(collection.get(&6).is_some());

        collection.clear();
        assert!(collection.view().is_empty());
        assert!(!collection.is_terminal());
    }

    #[tokio::test]
    async fn test_watch_stream_wakes_on_live_change() {
        let source = Arc::new(ScriptedSource::<Note>::new(vec![]));
        let collection = SyncedCollection::new(
            CursorPaginator::new("notes", source, QueryParams::new()),
            LiveMergeCollection::new(ViewOrder::descending_id()),
        );
        let mut stream = tokio_test::task::spawn(collection.watch().into_stream());

        tokio_test::assert_pending!(stream.poll_next());

        collection.apply_live(Note::new(1, "a")).unwrap();
        assert!(stream.is_woken());
        assert_eq!(tokio_test::assert_ready!(stream.poll_next()), Some(()));
    }
}
