use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    data::{select_branches, EventSource, EventTable, ReadOptions},
    expression::CompiledExpr,
    histogram::{Hist1D, Hist2D, HistModel, HistModel2D, HistResult, MeanResult},
    Expression, TauFitError, TauFitResult,
};

const MAX_ALIAS_DEPTH: usize = 32;

/// Options for the histogram engine.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineOptions {
    /// Number of worker threads used when the graph is triggered (all cores if unset).
    pub threads: Option<usize>,
    /// Filter applied to every file before any selection.
    pub preselection: Expression,
}

impl EngineOptions {
    /// Create a new [`Default`] set of [`EngineOptions`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Set the common preselection.
    pub fn preselection<E: Into<Expression>>(mut self, preselection: E) -> Self {
        self.preselection = preselection.into();
        self
    }
}

/// Identifies a filtered event stream: one file, one tree and the cuts applied so far.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanKey {
    /// Tree name
    pub tree: String,
    /// File name
    pub file: String,
    /// Joined cuts
    pub cuts: String,
}

/// What a booking accumulates.
#[derive(Clone, Debug)]
pub enum BookingTarget {
    /// A 1D histogram of `x`.
    Hist1D {
        /// Histogram recipe
        model: HistModel,
        /// Filled expression
        x: Expression,
    },
    /// A 2D histogram of `(x, y)`.
    Hist2D {
        /// Histogram recipe
        model: HistModel2D,
        /// Expression on the `x` axis
        x: Expression,
        /// Expression on the `y` axis
        y: Expression,
    },
    /// The weighted mean of `x`.
    Mean {
        /// Averaged expression
        x: Expression,
    },
    /// The sum of weights.
    SumWeights,
}

impl BookingTarget {
    fn expressions(&self) -> Vec<&Expression> {
        match self {
            BookingTarget::Hist1D { x, .. } | BookingTarget::Mean { x } => vec![x],
            BookingTarget::Hist2D { x, y, .. } => vec![x, y],
            BookingTarget::SumWeights => Vec::new(),
        }
    }
}

/// One result requested from one file.
#[derive(Clone, Debug)]
pub struct BookingRequest {
    /// Source the file is read from
    pub source: Arc<dyn EventSource>,
    /// File name
    pub file: String,
    /// Tree, branch selections and aliases
    pub read: ReadOptions,
    /// All cuts applied to this booking
    pub cuts: Expression,
    /// Per-event weight expression
    pub weight: Expression,
    /// Constant factor applied after filling
    pub scale: f64,
    /// What to accumulate
    pub target: BookingTarget,
}

type Slot = Arc<OnceLock<TauFitResult<HistResult>>>;

/// A handle to a booked result, filled when the [`PlanCache`] is triggered.
#[derive(Clone)]
pub struct BookedResult {
    slot: Slot,
    cache: PlanCache,
    key: PlanKey,
}

impl BookedResult {
    /// The plan key of the filtered stream this result is filled from.
    pub fn key(&self) -> &PlanKey {
        &self.key
    }

    /// Returns `true` once the result has been evaluated.
    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    /// The evaluated result, triggering the graph if needed.
    pub fn get(&self) -> TauFitResult<HistResult> {
        if self.slot.get().is_none() {
            // Errors are also stored in the slot, so the trigger result itself can be ignored.
            let _ = self.cache.trigger();
        }
        self.slot.get().cloned().unwrap_or_else(|| {
            Err(TauFitError::Custom(format!(
                "Booking on {}:{} was not evaluated",
                self.key.file, self.key.tree
            )))
        })
    }

    /// The plan cache this result was booked on.
    pub fn cache(&self) -> &PlanCache {
        &self.cache
    }
}

impl Debug for BookedResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookedResult")
            .field("key", &self.key)
            .field("ready", &self.is_ready())
            .finish()
    }
}

struct Booking {
    cuts: Expression,
    weight: Expression,
    scale: f64,
    target: BookingTarget,
    slot: Slot,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct NodeKey {
    source: usize,
    tree: String,
    file: String,
    read: String,
}

struct FileNode {
    source: Arc<dyn EventSource>,
    file: String,
    read: ReadOptions,
    available: Option<Vec<String>>,
    table: Option<EventTable>,
    compiled: HashMap<String, Arc<CompiledExpr>>,
    columns: IndexMap<String, (String, Arc<Vec<f64>>)>,
    masks: IndexMap<String, Arc<Vec<usize>>>,
    preselected: Option<Arc<Vec<bool>>>,
    filters: IndexSet<String>,
    evaluated: IndexSet<String>,
    reads: usize,
}

impl FileNode {
    fn new(request: &BookingRequest) -> Self {
        Self {
            source: request.source.clone(),
            file: request.file.clone(),
            read: request.read.clone(),
            available: None,
            table: None,
            compiled: HashMap::new(),
            columns: IndexMap::new(),
            masks: IndexMap::new(),
            preselected: None,
            filters: IndexSet::new(),
            evaluated: IndexSet::new(),
            reads: 0,
        }
    }

    fn tree(&self) -> &str {
        self.read.tree_name()
    }

    fn available_branches(&mut self) -> TauFitResult<Vec<String>> {
        if let Some(available) = &self.available {
            return Ok(available.clone());
        }
        let branches = self.source.branches(&self.file, self.read.tree_name())?;
        let available = select_branches(&branches, &self.read.branch_selections)?;
        self.available = Some(available.clone());
        Ok(available)
    }

    fn compiled(&mut self, expression: &Expression) -> TauFitResult<Arc<CompiledExpr>> {
        if let Some(compiled) = self.compiled.get(expression.as_str()) {
            return Ok(compiled.clone());
        }
        let compiled = Arc::new(expression.compile()?);
        self.compiled
            .insert(expression.to_string(), compiled.clone());
        Ok(compiled)
    }

    // Collect the raw branches needed by `name`, looking through aliases.
    fn collect_branches(
        &mut self,
        name: &str,
        available: &[String],
        wanted: &mut IndexSet<String>,
        depth: usize,
    ) {
        if depth > MAX_ALIAS_DEPTH || wanted.contains(name) {
            return;
        }
        if let Some(alias) = self.read.aliases.get(name).cloned() {
            if let Ok(compiled) = self.compiled(&alias) {
                for column in compiled.required_columns.clone() {
                    self.collect_branches(&column, available, wanted, depth + 1);
                }
            }
        } else if available.iter().any(|branch| branch == name) {
            wanted.insert(name.to_string());
        }
    }

    // Read every branch the bookings need that is not loaded yet, in a single pass over the file.
    fn load(&mut self, expressions: &[&Expression]) -> TauFitResult<()> {
        let available = self.available_branches()?;
        let mut wanted = IndexSet::new();
        for expression in expressions {
            if let Ok(compiled) = self.compiled(expression) {
                for column in compiled.required_columns.clone() {
                    self.collect_branches(&column, &available, &mut wanted, 0);
                }
            }
        }
        let missing: Vec<String> = wanted
            .into_iter()
            .filter(|name| {
                self.table
                    .as_ref()
                    .map_or(true, |table| !table.has_column(name))
            })
            .collect();
        if self.table.is_some() && missing.is_empty() {
            return Ok(());
        }
        log::debug!(
            "PlanCache: reading {} branches from {}:{}",
            missing.len(),
            self.file,
            self.tree()
        );
        let loaded = self.source.read(&self.file, self.read.tree_name(), &missing)?;
        self.reads += 1;
        match &mut self.table {
            Some(table) => table.extend_from(&loaded)?,
            None => self.table = Some(loaded),
        }
        Ok(())
    }

    fn table(&self) -> TauFitResult<&EventTable> {
        self.table.as_ref().ok_or_else(|| {
            TauFitError::Custom(format!("File '{}' has not been read", self.file))
        })
    }

    fn n_rows(&self) -> usize {
        self.table.as_ref().map_or(0, EventTable::n_rows)
    }

    fn ensure_alias(&mut self, name: &str, depth: usize) -> TauFitResult<()> {
        if self.table()?.has_column(name) {
            return Ok(());
        }
        if let Some(alias) = self.read.aliases.get(name).cloned() {
            if depth > MAX_ALIAS_DEPTH {
                return Err(TauFitError::ExpressionError {
                    expression: alias.to_string(),
                    reason: format!("alias '{name}' is recursive"),
                });
            }
            let values = self.column_at_depth(&alias, depth + 1)?;
            if let Some(table) = self.table.as_mut() {
                table.insert_shared(name, values)?;
            }
        }
        Ok(())
    }

    fn column(&mut self, expression: &Expression) -> TauFitResult<Arc<Vec<f64>>> {
        self.column_at_depth(expression, 0)
    }

    // Every distinct expression is evaluated once per file and stored under a generated name.
    fn column_at_depth(
        &mut self,
        expression: &Expression,
        depth: usize,
    ) -> TauFitResult<Arc<Vec<f64>>> {
        if let Some((_, values)) = self.columns.get(expression.as_str()) {
            return Ok(values.clone());
        }
        let compiled = self.compiled(expression)?;
        for column in &compiled.required_columns {
            self.ensure_alias(column, depth)?;
        }
        let values = Arc::new(compiled.evaluate(self.table()?)?);
        let (index, _) = self.evaluated.insert_full(expression.to_string());
        let name = format!("_col{index}");
        log::debug!("PlanCache: {}:{} '{}' -> {}", self.file, self.tree(), expression, name);
        self.columns
            .insert(expression.to_string(), (name, values.clone()));
        Ok(values)
    }

    fn preselected(&mut self, preselection: &Expression) -> TauFitResult<Arc<Vec<bool>>> {
        if let Some(mask) = &self.preselected {
            return Ok(mask.clone());
        }
        let mask = if preselection.is_empty() {
            vec![true; self.n_rows()]
        } else {
            self.column(preselection)?
                .iter()
                .map(|value| *value != 0.0)
                .collect()
        };
        let mask = Arc::new(mask);
        self.preselected = Some(mask.clone());
        Ok(mask)
    }

    fn rows(&mut self, cuts: &Expression, preselection: &Expression) -> TauFitResult<Arc<Vec<usize>>> {
        if let Some(rows) = self.masks.get(cuts.as_str()) {
            return Ok(rows.clone());
        }
        let pre = self.preselected(preselection)?;
        let values = if cuts.is_empty() {
            None
        } else {
            Some(self.column(cuts)?)
        };
        let rows: Vec<usize> = (0..self.n_rows())
            .filter(|&i| pre[i] && values.as_ref().map_or(true, |values| values[i] != 0.0))
            .collect();
        log::debug!(
            "PlanCache: {}:{} [{}] keeps {}/{} events",
            self.file,
            self.tree(),
            cuts,
            rows.len(),
            self.n_rows()
        );
        let rows = Arc::new(rows);
        self.masks.insert(cuts.to_string(), rows.clone());
        self.filters.insert(cuts.to_string());
        Ok(rows)
    }

    // Number of event-sized buffers currently held.
    fn n_buffers(&self) -> usize {
        self.table.as_ref().map_or(0, |table| table.column_names().count())
            + self.columns.len()
            + self.masks.len()
            + usize::from(self.preselected.is_some())
    }

    // Once every booking on the node is filled, the branches, columns and row selections are no
    // longer needed. Compiled expressions and the branch listing are kept for later bookings.
    fn release(&mut self) {
        log::debug!(
            "PlanCache: releasing {} buffers of {}:{}",
            self.n_buffers(),
            self.file,
            self.tree()
        );
        self.table = None;
        self.columns.clear();
        self.masks.clear();
        self.preselected = None;
    }

    fn fill(&mut self, booking: &Booking, preselection: &Expression) -> TauFitResult<HistResult> {
        let rows = self.rows(&booking.cuts, preselection)?;
        let weights = self.column(&booking.weight)?;
        let mut result = match &booking.target {
            BookingTarget::Hist1D { model, x } => {
                let xs = self.column(x)?;
                let mut hist = Hist1D::from_model(model)?;
                for &i in rows.iter() {
                    hist.fill(xs[i], weights[i]);
                }
                HistResult::Hist1D(hist)
            }
            BookingTarget::Hist2D { model, x, y } => {
                let xs = self.column(x)?;
                let ys = self.column(y)?;
                let mut hist = Hist2D::from_model(model)?;
                for &i in rows.iter() {
                    hist.fill(xs[i], ys[i], weights[i]);
                }
                HistResult::Hist2D(hist)
            }
            BookingTarget::Mean { x } => {
                let xs = self.column(x)?;
                let (mut sumw, mut sumwx) = (0.0, 0.0);
                for &i in rows.iter() {
                    sumw += weights[i];
                    sumwx += weights[i] * xs[i];
                }
                let mean = if sumw != 0.0 { sumwx / sumw } else { 0.0 };
                HistResult::Mean(MeanResult { mean, sumw })
            }
            BookingTarget::SumWeights => {
                HistResult::SumWeights(rows.iter().map(|&i| weights[i]).sum())
            }
        };
        result.scale(booking.scale);
        Ok(result)
    }

    fn process(&mut self, bookings: &[Booking], preselection: &Expression) -> Option<TauFitError> {
        let mut expressions: Vec<&Expression> = vec![preselection];
        for booking in bookings {
            expressions.push(&booking.cuts);
            expressions.push(&booking.weight);
            expressions.extend(booking.target.expressions());
        }
        if let Err(err) = self.load(&expressions) {
            log::error!("PlanCache: failed to read {}:{}: {err}", self.file, self.tree());
            for booking in bookings {
                let _ = booking.slot.set(Err(err.clone()));
            }
            self.release();
            return Some(err);
        }
        let mut first_error = None;
        for booking in bookings {
            let result = self.fill(booking, preselection);
            if let Err(err) = &result {
                log::error!("PlanCache: booking on {}:{} failed: {err}", self.file, self.tree());
                first_error.get_or_insert_with(|| err.clone());
            }
            let _ = booking.slot.set(result);
        }
        self.release();
        first_error
    }
}

#[derive(Default)]
struct PlanState {
    nodes: IndexMap<NodeKey, Arc<Mutex<FileNode>>>,
    pending: Vec<(NodeKey, Booking)>,
}

struct PlanCacheInner {
    options: EngineOptions,
    state: Mutex<PlanState>,
    triggers: AtomicUsize,
}

/// The shared cache of filtered event streams.
///
/// Bookings are registered on the calling thread and evaluated together by [`PlanCache::trigger`].
/// Each `(source, tree, file, aliases)` combination is read once, each distinct cut string is
/// turned into a row selection once, and each distinct expression is evaluated once, no matter
/// how many sample sets, selections or variables book results on it. Cloning a [`PlanCache`]
/// yields another handle to the same cache.
#[derive(Clone)]
pub struct PlanCache {
    inner: Arc<PlanCacheInner>,
}

impl PlanCache {
    /// Create an empty cache.
    pub fn new(options: EngineOptions) -> Self {
        Self {
            inner: Arc::new(PlanCacheInner {
                options,
                state: Mutex::new(PlanState::default()),
                triggers: AtomicUsize::new(0),
            }),
        }
    }

    /// Engine options.
    pub fn options(&self) -> &EngineOptions {
        &self.inner.options
    }

    /// Register a booking; nothing is read until the cache is triggered.
    pub fn book(&self, request: BookingRequest) -> BookedResult {
        let node_key = NodeKey {
            source: Arc::as_ptr(&request.source) as *const () as usize,
            tree: request.read.tree_name().to_string(),
            file: request.file.clone(),
            read: format!("{:?}|{:?}", request.read.aliases, request.read.branch_selections),
        };
        let key = PlanKey {
            tree: node_key.tree.clone(),
            file: node_key.file.clone(),
            cuts: request.cuts.to_string(),
        };
        let slot: Slot = Arc::new(OnceLock::new());
        let mut state = self.inner.state.lock();
        state
            .nodes
            .entry(node_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(FileNode::new(&request))));
        state.pending.push((
            node_key,
            Booking {
                cuts: request.cuts,
                weight: request.weight,
                scale: request.scale,
                target: request.target,
                slot: slot.clone(),
            },
        ));
        BookedResult {
            slot,
            cache: self.clone(),
            key,
        }
    }

    /// Evaluate every pending booking. Files are processed in parallel; the first error is
    /// returned after all files have been processed.
    pub fn trigger(&self) -> TauFitResult<()> {
        let (groups, total) = {
            let mut state = self.inner.state.lock();
            let pending = std::mem::take(&mut state.pending);
            let total = pending.len();
            let mut groups: IndexMap<NodeKey, (Arc<Mutex<FileNode>>, Vec<Booking>)> =
                IndexMap::new();
            for (key, booking) in pending {
                let Some(node) = state.nodes.get(&key).cloned() else {
                    continue;
                };
                groups
                    .entry(key)
                    .or_insert_with(|| (node, Vec::new()))
                    .1
                    .push(booking);
            }
            (groups.into_values().collect::<Vec<_>>(), total)
        };
        if groups.is_empty() {
            return Ok(());
        }
        self.inner.triggers.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "PlanCache: evaluating {total} bookings over {} files",
            groups.len()
        );
        let preselection = &self.inner.options.preselection;
        let process = |(node, bookings): &(Arc<Mutex<FileNode>>, Vec<Booking>)| {
            node.lock().process(bookings, preselection)
        };
        #[cfg(feature = "rayon")]
        let errors: Vec<Option<TauFitError>> = {
            let threads = self.inner.options.threads.unwrap_or_else(num_cpus::get);
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()?
                .install(|| groups.par_iter().map(process).collect())
        };
        #[cfg(not(feature = "rayon"))]
        let errors: Vec<Option<TauFitError>> = groups.iter().map(process).collect();
        match errors.into_iter().flatten().next() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Returns `true` if both handles point to the same cache.
    pub fn same_as(&self, other: &PlanCache) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of bookings waiting for a trigger.
    pub fn n_pending(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Number of times the graph has been evaluated.
    pub fn n_triggers(&self) -> usize {
        self.inner.triggers.load(Ordering::Relaxed)
    }

    /// Number of distinct file nodes.
    pub fn n_files(&self) -> usize {
        self.inner.state.lock().nodes.len()
    }

    /// Total number of read passes over input files.
    pub fn n_reads(&self) -> usize {
        self.nodes().iter().map(|node| node.lock().reads).sum()
    }

    /// Total number of distinct filtered streams.
    pub fn n_filters(&self) -> usize {
        self.nodes().iter().map(|node| node.lock().filters.len()).sum()
    }

    /// Total number of materialised expression columns.
    pub fn n_columns(&self) -> usize {
        self.nodes().iter().map(|node| node.lock().evaluated.len()).sum()
    }

    /// Number of event-sized buffers (branches, columns and row selections) still held. Buffers
    /// are released as soon as every booking on their file is filled.
    pub fn n_buffers(&self) -> usize {
        self.nodes().iter().map(|node| node.lock().n_buffers()).sum()
    }

    /// Keys of every filtered stream built so far.
    pub fn plan_keys(&self) -> Vec<PlanKey> {
        let mut keys = Vec::new();
        for node in self.nodes() {
            let node = node.lock();
            for cuts in node.filters.iter() {
                keys.push(PlanKey {
                    tree: node.tree().to_string(),
                    file: node.file.clone(),
                    cuts: cuts.clone(),
                });
            }
        }
        keys
    }

    /// Drop every cached node (pending bookings are kept).
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let pending: IndexSet<NodeKey> = state.pending.iter().map(|(key, _)| key.clone()).collect();
        state.nodes.retain(|key, _| pending.contains(key));
    }

    fn nodes(&self) -> Vec<Arc<Mutex<FileNode>>> {
        self.inner.state.lock().nodes.values().cloned().collect()
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(EngineOptions::default())
    }
}

impl Debug for PlanCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanCache")
            .field("options", &self.inner.options)
            .field("files", &self.n_files())
            .field("pending", &self.n_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MemorySource;
    use approx::assert_relative_eq;

    fn source() -> Arc<dyn EventSource> {
        let table = EventTable::from_columns([
            ("x", vec![0.5, 1.5, 2.5, 3.5]),
            ("w", vec![1.0, 2.0, 3.0, 4.0]),
            ("q", vec![1.0, -1.0, 1.0, -1.0]),
        ])
        .unwrap();
        MemorySource::new().with_tree("a.root", "tree", table).shared()
    }

    fn request(source: &Arc<dyn EventSource>, cuts: &str, target: BookingTarget) -> BookingRequest {
        BookingRequest {
            source: source.clone(),
            file: "a.root".to_string(),
            read: ReadOptions::new().alias("x2", "2*x"),
            cuts: Expression::new(cuts),
            weight: Expression::new("w"),
            scale: 1.0,
            target,
        }
    }

    fn hist(x: &str) -> BookingTarget {
        BookingTarget::Hist1D {
            model: HistModel {
                name: "h".to_string(),
                title: "".to_string(),
                edges: vec![0.0, 2.0, 4.0, 8.0],
            },
            x: Expression::new(x),
        }
    }

    #[test]
    fn test_single_read_per_file() {
        let source = source();
        let cache = PlanCache::new(EngineOptions::new().threads(2));
        let a = cache.book(request(&source, "q>0", hist("x")));
        let b = cache.book(request(&source, "q>0", hist("x2")));
        let c = cache.book(request(&source, "", BookingTarget::SumWeights));
        assert_eq!(cache.n_pending(), 3);
        assert!(!a.is_ready());
        cache.trigger().unwrap();
        assert_eq!(cache.n_pending(), 0);
        assert_eq!(cache.n_files(), 1);
        assert_eq!(cache.n_reads(), 1);
        assert_eq!(cache.n_filters(), 2);
        let a = a.get().unwrap().into_hist1d().unwrap();
        assert_eq!(a.contents(), &[1.0, 3.0, 0.0]);
        let b = b.get().unwrap().into_hist1d().unwrap();
        assert_eq!(b.contents(), &[1.0, 0.0, 3.0]);
        assert_relative_eq!(c.get().unwrap().integral(), 10.0);
    }

    #[test]
    fn test_buffers_released_after_fill() {
        let source = source();
        let cache = PlanCache::default();
        let first = cache.book(request(&source, "q>0", hist("x2")));
        cache.trigger().unwrap();
        assert_eq!(cache.n_buffers(), 0);
        assert_eq!(cache.n_filters(), 1);
        assert_eq!(first.get().unwrap().into_hist1d().unwrap().contents(), &[1.0, 0.0, 3.0]);
        let second = cache.book(request(&source, "q<0", hist("x")));
        assert_eq!(second.get().unwrap().into_hist1d().unwrap().contents(), &[2.0, 4.0, 0.0]);
        assert_eq!(cache.n_reads(), 2);
        assert_eq!(cache.n_buffers(), 0);
        assert_eq!(cache.plan_keys().len(), 2);
    }

    #[test]
    fn test_mean_and_scale() {
        let source = source();
        let cache = PlanCache::default();
        let mut req = request(&source, "", BookingTarget::Mean { x: Expression::new("x") });
        req.scale = 2.0;
        let mean = cache.book(req);
        match mean.get().unwrap() {
            HistResult::Mean(mean) => {
                assert_relative_eq!(mean.mean, 25.0 / 10.0);
                assert_relative_eq!(mean.sumw, 20.0);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(cache.n_triggers(), 1);
    }

    #[test]
    fn test_preselection_and_empty_selection() {
        let source = source();
        let cache = PlanCache::new(EngineOptions::new().preselection("x>1"));
        let all = cache.book(request(&source, "", BookingTarget::SumWeights));
        let none = cache.book(request(&source, "x>100", hist("x")));
        cache.trigger().unwrap();
        assert_relative_eq!(all.get().unwrap().integral(), 9.0);
        let none = none.get().unwrap().into_hist1d().unwrap();
        assert_eq!(none.integral(), 0.0);
    }

    #[test]
    fn test_missing_column_is_reported() {
        let source = source();
        let cache = PlanCache::default();
        let bad = cache.book(request(&source, "", hist("nope")));
        let good = cache.book(request(&source, "", hist("x")));
        assert!(cache.trigger().is_err());
        assert!(matches!(bad.get(), Err(TauFitError::MissingColumn { .. })));
        assert!(good.get().is_ok());
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let source = source();
        let cache = PlanCache::default();
        let mut req = request(&source, "", hist("x"));
        req.file = "b.root".to_string();
        let missing = cache.book(req);
        assert!(cache.trigger().is_err());
        for _ in 0..2 {
            assert!(matches!(missing.get(), Err(TauFitError::MissingFile { .. })));
        }
    }
}
