use std::{fmt::Debug, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{
    engine::{BookedResult, PlanCache},
    histogram::{Hist1D, HistResult},
    selection::Selection,
    variable::Variable,
    TauFitError, TauFitResult,
};

/// The axes a result is filled on: one variable, or an `(x, y)` pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Axes {
    /// A single variable
    One(Variable),
    /// A pair of variables (`x`, `y`)
    Two(Variable, Variable),
}

impl Axes {
    /// Key used in a [`ResultDict`]: the variable file name, or `<y>_vs_<x>`.
    pub fn key(&self) -> String {
        match self {
            Axes::One(x) => x.filename.clone(),
            Axes::Two(x, y) => format!("{}_vs_{}", y.filename, x.filename),
        }
    }

    /// The variables on these axes.
    pub fn variables(&self) -> Vec<&Variable> {
        match self {
            Axes::One(x) => vec![x],
            Axes::Two(x, y) => vec![x, y],
        }
    }

    /// The (first) variable.
    pub fn x(&self) -> &Variable {
        match self {
            Axes::One(x) | Axes::Two(x, _) => x,
        }
    }

    /// The axes bound to the context of `selection`.
    pub fn changecontext(&self, selection: &Selection) -> Axes {
        match self {
            Axes::One(x) => Axes::One(x.changecontext(selection)),
            Axes::Two(x, y) => Axes::Two(x.changecontext(selection), y.changecontext(selection)),
        }
    }
}

impl From<Variable> for Axes {
    fn from(variable: Variable) -> Self {
        Axes::One(variable)
    }
}

impl From<(Variable, Variable)> for Axes {
    fn from((x, y): (Variable, Variable)) -> Self {
        Axes::Two(x, y)
    }
}

/// Process-level information about the sample a result belongs to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    /// Process name
    pub name: String,
    /// Process title
    pub title: String,
    /// Observed data
    pub isdata: bool,
    /// Expected background
    pub isexp: bool,
    /// Signal
    pub issignal: bool,
    /// Fill colour
    pub fillcolor: Option<String>,
}

/// Combines evaluated inputs into a derived result.
pub type CombineFn = Arc<dyn Fn(&[HistResult]) -> TauFitResult<HistResult> + Send + Sync>;

/// A result which is evaluated on demand.
#[derive(Clone)]
pub enum LazyResult {
    /// A booking on a [`PlanCache`].
    Booked {
        /// Name given to the result
        name: String,
        /// Title given to the result
        title: String,
        /// The booking
        booked: BookedResult,
    },
    /// The sum of several results, e.g. the children of a merged sample.
    Merged {
        /// Name given to the result
        name: String,
        /// Title given to the result
        title: String,
        /// Summed results
        parts: Vec<LazyResult>,
    },
    /// A result computed from other results, e.g. a data-driven estimate.
    Derived {
        /// Name given to the result
        name: String,
        /// Title given to the result
        title: String,
        /// Inputs, evaluated in order and passed to `combine`
        inputs: Vec<LazyResult>,
        /// The combination
        combine: CombineFn,
    },
    /// An already evaluated result.
    Ready(HistResult),
}

impl LazyResult {
    /// Name of the result.
    pub fn name(&self) -> &str {
        match self {
            LazyResult::Booked { name, .. }
            | LazyResult::Merged { name, .. }
            | LazyResult::Derived { name, .. } => name,
            LazyResult::Ready(result) => match result {
                HistResult::Hist1D(hist) => &hist.name,
                HistResult::Hist2D(hist) => &hist.name,
                _ => "",
            },
        }
    }

    /// Every [`PlanCache`] this result depends on.
    pub fn caches(&self) -> Vec<PlanCache> {
        match self {
            LazyResult::Booked { booked, .. } => vec![booked.cache().clone()],
            LazyResult::Merged { parts: inputs, .. } | LazyResult::Derived { inputs, .. } => {
                inputs.iter().flat_map(LazyResult::caches).collect()
            }
            LazyResult::Ready(_) => Vec::new(),
        }
    }

    /// Evaluate the result, triggering its graph if it has not run yet.
    pub fn get(&self) -> TauFitResult<HistResult> {
        match self {
            LazyResult::Booked {
                name,
                title,
                booked,
            } => Ok(renamed(booked.get()?, name, title)),
            LazyResult::Merged { name, title, parts } => {
                let results = parts
                    .iter()
                    .map(LazyResult::get)
                    .collect::<TauFitResult<Vec<_>>>()?;
                HistResult::sum(&results, name, title)
            }
            LazyResult::Derived {
                name,
                title,
                inputs,
                combine,
            } => {
                let results = inputs
                    .iter()
                    .map(LazyResult::get)
                    .collect::<TauFitResult<Vec<_>>>()?;
                Ok(renamed(combine(&results)?, name, title))
            }
            LazyResult::Ready(result) => Ok(result.clone()),
        }
    }
}

impl Debug for LazyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LazyResult::Booked { name, booked, .. } => {
                write!(f, "Booked({name}, {:?})", booked.key())
            }
            LazyResult::Merged { name, parts, .. } => write!(f, "Merged({name}, {parts:?})"),
            LazyResult::Derived { name, inputs, .. } => {
                write!(f, "Derived({name}, {} inputs)", inputs.len())
            }
            LazyResult::Ready(result) => write!(f, "Ready({:?})", result.kind()),
        }
    }
}

fn renamed(result: HistResult, name: &str, title: &str) -> HistResult {
    match result {
        HistResult::Hist1D(hist) => HistResult::Hist1D(hist.renamed(name, title)),
        HistResult::Hist2D(mut hist) => {
            hist.name = name.to_string();
            hist.title = title.to_string();
            HistResult::Hist2D(hist)
        }
        other => other,
    }
}

/// One evaluated result with the process it belongs to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistEntry {
    /// The process
    pub info: SampleInfo,
    /// The result
    pub result: HistResult,
}

impl HistEntry {
    /// The 1D histogram, if the result is one.
    pub fn hist(&self) -> Option<&Hist1D> {
        self.result.as_hist1d()
    }
}

/// Evaluated results for one (selection, variable) cell, split by role.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistSet {
    /// Observed data (the first data sample)
    pub data: Option<HistEntry>,
    /// Expected backgrounds, in sample-set order
    pub exp: Vec<HistEntry>,
    /// Signals, in sample-set order
    pub signal: Vec<HistEntry>,
}

impl HistSet {
    /// Sum of the expected backgrounds.
    pub fn total_exp(&self, name: &str, title: &str) -> TauFitResult<HistResult> {
        HistResult::sum(self.exp.iter().map(|entry| &entry.result), name, title)
    }

    /// All entries: data first, then expected, then signal.
    pub fn entries(&self) -> impl Iterator<Item = &HistEntry> {
        self.data.iter().chain(self.exp.iter()).chain(self.signal.iter())
    }
}

#[derive(Clone, Debug)]
struct VariableEntry {
    axes: Axes,
    samples: IndexMap<String, (SampleInfo, LazyResult)>,
}

#[derive(Clone, Debug)]
struct SelectionEntry {
    selection: Selection,
    variables: IndexMap<String, VariableEntry>,
}

/// Lazy results keyed by selection file name, variable key and sample name.
#[derive(Clone, Debug, Default)]
pub struct ResultDict {
    entries: IndexMap<String, SelectionEntry>,
}

impl ResultDict {
    /// An empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of selections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been booked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored results.
    pub fn n_results(&self) -> usize {
        self.entries
            .values()
            .flat_map(|entry| entry.variables.values())
            .map(|entry| entry.samples.len())
            .sum()
    }

    /// Add a result; an existing result for the same cell is replaced with a warning.
    pub fn add(&mut self, selection: &Selection, axes: &Axes, info: SampleInfo, result: LazyResult) {
        let selection_entry = self
            .entries
            .entry(selection.filename.clone())
            .or_insert_with(|| SelectionEntry {
                selection: selection.clone(),
                variables: IndexMap::new(),
            });
        let variable_entry = selection_entry
            .variables
            .entry(axes.key())
            .or_insert_with(|| VariableEntry {
                axes: axes.clone(),
                samples: IndexMap::new(),
            });
        if variable_entry.samples.contains_key(&info.name) {
            log::warn!(
                "ResultDict: overwriting result for ({}, {}, {})",
                selection.filename,
                axes.key(),
                info.name
            );
        }
        variable_entry
            .samples
            .insert(info.name.clone(), (info, result));
    }

    /// Add every result of `other`, replacing existing cells with a warning.
    pub fn update(&mut self, other: ResultDict) {
        for (_, selection_entry) in other.entries {
            for (_, variable_entry) in selection_entry.variables {
                for (_, (info, result)) in variable_entry.samples {
                    self.add(
                        &selection_entry.selection,
                        &variable_entry.axes,
                        info,
                        result,
                    );
                }
            }
        }
    }

    /// Insert `result` as process `info` into an existing (selection, variable) cell at `index`
    /// among the samples (clamped to the end).
    pub fn insert(
        &mut self,
        selection: &Selection,
        axes: &Axes,
        index: usize,
        info: SampleInfo,
        result: LazyResult,
    ) {
        self.add(selection, axes, info.clone(), result);
        if let Some(samples) = self
            .entries
            .get_mut(&selection.filename)
            .and_then(|entry| entry.variables.get_mut(&axes.key()))
            .map(|entry| &mut entry.samples)
        {
            if let Some(from) = samples.get_index_of(&info.name) {
                let to = index.min(samples.len() - 1);
                samples.move_index(from, to);
            }
        }
    }

    /// The selections, in insertion order.
    pub fn selections(&self) -> impl Iterator<Item = &Selection> {
        self.entries.values().map(|entry| &entry.selection)
    }

    /// The axes booked for a selection.
    pub fn axes(&self, selection: &str) -> Vec<&Axes> {
        self.entries
            .get(selection)
            .map(|entry| entry.variables.values().map(|entry| &entry.axes).collect())
            .unwrap_or_default()
    }

    /// The sample names booked for a cell.
    pub fn sample_names(&self, selection: &str, axes: &str) -> Vec<&str> {
        self.entries
            .get(selection)
            .and_then(|entry| entry.variables.get(axes))
            .map(|entry| entry.samples.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Trigger every plan cache the results depend on, each once.
    pub fn run(&self) -> TauFitResult<()> {
        let mut caches: Vec<PlanCache> = Vec::new();
        for (_, result) in self.iter() {
            for cache in result.caches() {
                if !caches.iter().any(|known| known.same_as(&cache)) {
                    caches.push(cache);
                }
            }
        }
        for cache in caches {
            cache.trigger()?;
        }
        Ok(())
    }

    fn iter(&self) -> impl Iterator<Item = (&SampleInfo, &LazyResult)> {
        self.entries
            .values()
            .flat_map(|entry| entry.variables.values())
            .flat_map(|entry| entry.samples.values())
            .map(|(info, result)| (info, result))
    }

    /// The lazy result of one cell.
    pub fn lazy(&self, selection: &str, axes: &str, sample: &str) -> TauFitResult<&LazyResult> {
        self.entries
            .get(selection)
            .and_then(|entry| entry.variables.get(axes))
            .and_then(|entry| entry.samples.get(sample))
            .map(|(_, result)| result)
            .ok_or_else(|| TauFitError::NotFound {
                object: "result".to_string(),
                terms: vec![selection.to_string(), axes.to_string(), sample.to_string()],
            })
    }

    /// The evaluated result of one cell.
    pub fn get(&self, selection: &str, axes: &str, sample: &str) -> TauFitResult<HistResult> {
        self.lazy(selection, axes, sample)?.get()
    }

    /// Evaluate everything into `{selection: {variable: {sample: result}}}`.
    pub fn gethists(
        &self,
    ) -> TauFitResult<IndexMap<String, IndexMap<String, IndexMap<String, HistResult>>>> {
        self.run()?;
        let mut hists = IndexMap::new();
        for (selection, selection_entry) in &self.entries {
            let mut variables = IndexMap::new();
            for (axes, variable_entry) in &selection_entry.variables {
                let mut samples = IndexMap::new();
                for (sample, (_, result)) in &variable_entry.samples {
                    samples.insert(sample.clone(), result.get()?);
                }
                variables.insert(axes.clone(), samples);
            }
            hists.insert(selection.clone(), variables);
        }
        Ok(hists)
    }

    /// Evaluate a single-sample dictionary into `{selection: {variable: result}}`.
    pub fn collapse(&self) -> TauFitResult<IndexMap<String, IndexMap<String, HistResult>>> {
        Ok(self
            .gethists()?
            .into_iter()
            .map(|(selection, variables)| {
                let variables = variables
                    .into_iter()
                    .filter_map(|(axes, samples)| {
                        samples.into_values().next().map(|result| (axes, result))
                    })
                    .collect();
                (selection, variables)
            })
            .collect())
    }

    /// Evaluate everything and split each cell into data, expected and signal.
    pub fn gethistsets(&self) -> TauFitResult<Vec<(Selection, Axes, HistSet)>> {
        self.run()?;
        let mut sets = Vec::new();
        for selection_entry in self.entries.values() {
            for variable_entry in selection_entry.variables.values() {
                let mut set = HistSet::default();
                for (info, result) in variable_entry.samples.values() {
                    let entry = HistEntry {
                        info: info.clone(),
                        result: result.get()?,
                    };
                    if info.isdata {
                        if set.data.is_none() {
                            set.data = Some(entry);
                        } else {
                            log::warn!(
                                "ResultDict: ignoring second data result '{}' in ({}, {})",
                                info.name,
                                selection_entry.selection.filename,
                                variable_entry.axes.key()
                            );
                        }
                    } else if info.issignal {
                        set.signal.push(entry);
                    } else {
                        set.exp.push(entry);
                    }
                }
                sets.push((
                    selection_entry.selection.clone(),
                    variable_entry.axes.clone(),
                    set,
                ));
            }
        }
        Ok(sets)
    }

    /// The (unevaluated) results of one cell, with their process information.
    pub fn cell(&self, selection: &str, axes: &str) -> Vec<(&SampleInfo, &LazyResult)> {
        self.entries
            .get(selection)
            .and_then(|entry| entry.variables.get(axes))
            .map(|entry| {
                entry
                    .samples
                    .values()
                    .map(|(info, result)| (info, result))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{EventSource, EventTable, MemorySource, ReadOptions},
        engine::{BookingRequest, BookingTarget, EngineOptions},
        variable::Binning,
        Expression,
    };
    use approx::assert_relative_eq;

    fn setup() -> (PlanCache, Arc<dyn EventSource>, Variable, Selection) {
        let table = EventTable::from_columns([("x", vec![0.5, 1.5, 2.5, 3.5])]).unwrap();
        let source = MemorySource::new().with_tree("a.root", "tree", table).shared();
        let variable = Variable::new("x", "x", Binning::uniform(4, 0.0, 4.0).unwrap());
        let selection = Selection::new("all", "");
        (PlanCache::new(EngineOptions::new()), source, variable, selection)
    }

    fn book(cache: &PlanCache, source: &Arc<dyn EventSource>, variable: &Variable, scale: f64) -> LazyResult {
        let booked = cache.book(BookingRequest {
            source: source.clone(),
            file: "a.root".to_string(),
            read: ReadOptions::new(),
            cuts: Expression::empty(),
            weight: Expression::empty(),
            scale,
            target: BookingTarget::Hist1D {
                model: variable.gethistmodel(None, None),
                x: variable.expression(),
            },
        });
        LazyResult::Booked {
            name: "h".to_string(),
            title: "h".to_string(),
            booked,
        }
    }

    fn info(name: &str, isdata: bool) -> SampleInfo {
        SampleInfo {
            name: name.to_string(),
            title: name.to_string(),
            isdata,
            isexp: !isdata,
            ..Default::default()
        }
    }

    #[test]
    fn test_merged_is_sum_of_parts() {
        let (cache, source, variable, selection) = setup();
        let a = book(&cache, &source, &variable, 1.0);
        let b = book(&cache, &source, &variable, 2.0);
        let merged = LazyResult::Merged {
            name: "ab".to_string(),
            title: "A+B".to_string(),
            parts: vec![a, b],
        };
        let axes = Axes::One(variable);
        let mut results = ResultDict::new();
        results.add(&selection, &axes, info("AB", false), merged);
        let hist = results
            .get("all", "x", "AB")
            .unwrap()
            .into_hist1d()
            .unwrap();
        assert_eq!(hist.name, "ab");
        assert_relative_eq!(hist.integral(), 12.0);
        assert_eq!(cache.n_reads(), 1);
    }

    #[test]
    fn test_histsets_and_insert() {
        let (cache, source, variable, selection) = setup();
        let axes = Axes::One(variable.clone());
        let mut results = ResultDict::new();
        results.add(&selection, &axes, info("data", true), book(&cache, &source, &variable, 1.0));
        results.add(&selection, &axes, info("ZTT", false), book(&cache, &source, &variable, 0.5));
        let derived = LazyResult::Derived {
            name: "QCD".to_string(),
            title: "QCD".to_string(),
            inputs: vec![LazyResult::Ready(HistResult::SumWeights(3.0))],
            combine: Arc::new(|inputs: &[HistResult]| Ok(inputs[0].clone())),
        };
        results.insert(&selection, &axes, 1, info("QCD", false), derived);
        assert_eq!(results.sample_names("all", "x"), vec!["data", "QCD", "ZTT"]);
        let sets = results.gethistsets().unwrap();
        assert_eq!(sets.len(), 1);
        let set = &sets[0].2;
        assert!(set.data.is_some());
        assert_eq!(set.exp.len(), 2);
        assert_relative_eq!(set.exp[0].result.integral(), 3.0);
        assert_eq!(results.n_results(), 3);
    }

    #[test]
    fn test_missing_cell() {
        let results = ResultDict::new();
        assert!(matches!(
            results.get("a", "b", "c"),
            Err(TauFitError::NotFound { .. })
        ));
    }
}
