use std::{collections::HashMap, fmt::Display, sync::Arc};

use crate::{
    context::PlotContext,
    engine::PlanCache,
    expression::{join_cuts, join_weights},
    results::{Axes, LazyResult, ResultDict, SampleInfo},
    selection::Selection,
    utils::{make_hist_name, match_labels, MatchMode},
    variable::Variable,
    Expression, TauFitResult,
};

/// Leaf samples and their file handles.
pub mod leaf;
/// Merged samples.
pub mod merged;
/// Sample sets and histogram production.
pub mod set;
/// Building sample sets from definitions, and stitching.
pub mod utils;

pub use leaf::{LeafSample, LeafSampleBuilder, SampleFile};
pub use merged::MergedSample;
pub use set::{GetHistsOptions, SampleSet, ShiftOptions};

/// A sample: either a single file, or the sum of other samples.
///
/// Cloning a [`Sample`] is shallow: the clone shares the file handles of the original. Use
/// [`Sample::clone_deep`] for independent handles.
#[derive(Clone, Debug)]
pub enum Sample {
    /// A single file and tree
    Leaf(Box<LeafSample>),
    /// The sum of several samples
    Merged(MergedSample),
}

/// One logical subcomponent of a split: `(name, title, cut)`.
pub type SplitSpec<'a> = (&'a str, &'a str, &'a str);

impl From<LeafSample> for Sample {
    fn from(sample: LeafSample) -> Self {
        Sample::Leaf(Box::new(sample))
    }
}

impl From<MergedSample> for Sample {
    fn from(sample: MergedSample) -> Self {
        Sample::Merged(sample)
    }
}

impl Sample {
    /// Short name.
    pub fn name(&self) -> &str {
        match self {
            Sample::Leaf(leaf) => &leaf.name,
            Sample::Merged(merged) => &merged.name,
        }
    }

    /// Title.
    pub fn title(&self) -> &str {
        match self {
            Sample::Leaf(leaf) => &leaf.title,
            Sample::Merged(merged) => &merged.title,
        }
    }

    /// Tags.
    pub fn tags(&self) -> &[String] {
        match self {
            Sample::Leaf(leaf) => &leaf.tags,
            Sample::Merged(merged) => &merged.tags,
        }
    }

    /// Rename the sample (children are unchanged).
    pub fn set_name<S: Into<String>>(&mut self, name: S) {
        match self {
            Sample::Leaf(leaf) => leaf.name = name.into(),
            Sample::Merged(merged) => merged.name = name.into(),
        }
    }

    /// Change the title.
    pub fn set_title<S: Into<String>>(&mut self, title: S) {
        match self {
            Sample::Leaf(leaf) => leaf.title = title.into(),
            Sample::Merged(merged) => merged.title = title.into(),
        }
    }

    /// Observed data.
    pub fn is_data(&self) -> bool {
        match self {
            Sample::Leaf(leaf) => leaf.isdata,
            Sample::Merged(merged) => merged.isdata,
        }
    }

    /// Expected background.
    pub fn is_exp(&self) -> bool {
        match self {
            Sample::Leaf(leaf) => leaf.isexp,
            Sample::Merged(merged) => merged.isexp,
        }
    }

    /// Signal.
    pub fn is_signal(&self) -> bool {
        match self {
            Sample::Leaf(leaf) => leaf.issignal,
            Sample::Merged(merged) => merged.issignal,
        }
    }

    /// Embedded sample.
    pub fn is_embed(&self) -> bool {
        match self {
            Sample::Leaf(leaf) => leaf.isembed,
            Sample::Merged(merged) => merged.isembed,
        }
    }

    /// Fill colour.
    pub fn fillcolor(&self) -> Option<&str> {
        match self {
            Sample::Leaf(leaf) => leaf.fillcolor.as_deref(),
            Sample::Merged(merged) => merged.fillcolor.as_deref(),
        }
    }

    /// Line colour.
    pub fn linecolor(&self) -> Option<&str> {
        match self {
            Sample::Leaf(leaf) => leaf.linecolor.as_deref(),
            Sample::Merged(merged) => merged.linecolor.as_deref(),
        }
    }

    /// File name (of the first leaf for a merged sample).
    pub fn filename(&self) -> &str {
        match self {
            Sample::Leaf(leaf) => leaf.filename(),
            Sample::Merged(merged) => merged.filename(),
        }
    }

    /// Tree name (of the first leaf for a merged sample).
    pub fn tree_name(&self) -> &str {
        match self {
            Sample::Leaf(leaf) => leaf.tree_name(),
            Sample::Merged(merged) => merged.tree_name(),
        }
    }

    /// Integrated luminosity.
    pub fn lumi(&self) -> f64 {
        match self {
            Sample::Leaf(leaf) => leaf.lumi,
            Sample::Merged(merged) => merged.lumi(),
        }
    }

    /// Number of processed events.
    pub fn nevents(&self) -> f64 {
        match self {
            Sample::Leaf(leaf) => leaf.nevents,
            Sample::Merged(merged) => merged.nevents(),
        }
    }

    /// Sum of generator weights.
    pub fn sumweights(&self) -> f64 {
        match self {
            Sample::Leaf(leaf) => leaf.sumweights,
            Sample::Merged(merged) => merged.sumweights(),
        }
    }

    /// Normalization (1 for a merged sample, whose children carry their own).
    pub fn norm(&self) -> f64 {
        match self {
            Sample::Leaf(leaf) => leaf.norm,
            Sample::Merged(_) => 1.0,
        }
    }

    /// Scale applied on top of the normalization.
    pub fn scale(&self) -> f64 {
        match self {
            Sample::Leaf(leaf) => leaf.scale,
            Sample::Merged(merged) => merged.scale,
        }
    }

    /// The baseline scale.
    pub fn base_scale(&self) -> f64 {
        match self {
            Sample::Leaf(leaf) => leaf.scale0,
            Sample::Merged(merged) => merged.scale0,
        }
    }

    /// The leaf, if this is one.
    pub fn as_leaf(&self) -> Option<&LeafSample> {
        match self {
            Sample::Leaf(leaf) => Some(leaf.as_ref()),
            Sample::Merged(_) => None,
        }
    }

    /// The leaf, mutably, if this is one.
    pub fn as_leaf_mut(&mut self) -> Option<&mut LeafSample> {
        match self {
            Sample::Leaf(leaf) => Some(leaf.as_mut()),
            Sample::Merged(_) => None,
        }
    }

    /// The merged sample, if this is one.
    pub fn as_merged(&self) -> Option<&MergedSample> {
        match self {
            Sample::Leaf(_) => None,
            Sample::Merged(merged) => Some(merged),
        }
    }

    /// The children of a merged sample (empty for a leaf).
    pub fn children(&self) -> &[Sample] {
        match self {
            Sample::Leaf(_) => &[],
            Sample::Merged(merged) => merged.samples(),
        }
    }

    /// Split subsamples.
    pub fn splits(&self) -> &[Sample] {
        match self {
            Sample::Leaf(leaf) => &leaf.splits,
            Sample::Merged(merged) => &merged.splits,
        }
    }

    fn splits_mut(&mut self) -> &mut Vec<Sample> {
        match self {
            Sample::Leaf(leaf) => &mut leaf.splits,
            Sample::Merged(merged) => &mut merged.splits,
        }
    }

    /// Returns `true` if the sample has split subsamples.
    pub fn is_split(&self) -> bool {
        !self.splits().is_empty()
    }

    /// Every leaf under this sample (the sample itself for a leaf); split subsamples excluded.
    pub fn leaves(&self) -> Vec<&LeafSample> {
        match self {
            Sample::Leaf(leaf) => vec![leaf.as_ref()],
            Sample::Merged(merged) => merged.samples().iter().flat_map(Sample::leaves).collect(),
        }
    }

    /// Returns `true` if both samples read through the same file handle.
    pub fn shares_file(&self, other: &Sample) -> bool {
        match (self, other) {
            (Sample::Leaf(a), Sample::Leaf(b)) => Arc::ptr_eq(a.file(), b.file()),
            (Sample::Merged(a), Sample::Merged(b)) => {
                a.len() == b.len()
                    && a.samples()
                        .iter()
                        .zip(b.samples())
                        .all(|(a, b)| a.shares_file(b))
            }
            _ => false,
        }
    }

    /// Process information for results.
    pub fn info(&self) -> SampleInfo {
        SampleInfo {
            name: self.name().to_string(),
            title: self.title().to_string(),
            isdata: self.is_data(),
            isexp: self.is_exp(),
            issignal: self.is_signal(),
            fillcolor: self.fillcolor().map(str::to_string),
        }
    }

    /// Set the scale, including the split subsamples.
    pub fn set_scale(&mut self, scale: f64) {
        match self {
            Sample::Leaf(leaf) => leaf.scale = scale,
            Sample::Merged(merged) => merged.scale = scale,
        }
        for split in self.splits_mut() {
            split.set_scale(scale);
        }
    }

    /// Restore the baseline scale times `scale` on this sample, and the baseline on every child
    /// and split subsample.
    pub fn reset_scale(&mut self, scale: f64) {
        let base = self.base_scale();
        match self {
            Sample::Leaf(leaf) => leaf.scale = base * scale,
            Sample::Merged(merged) => {
                merged.scale = base * scale;
                for sample in merged.samples_mut() {
                    sample.reset_scale(1.0);
                }
            }
        }
        for split in self.splits_mut() {
            split.reset_scale(1.0);
        }
    }

    /// Multiply the scale of this sample and its split subsamples by `factor`.
    pub fn multiply_scale(&mut self, factor: f64) {
        match self {
            Sample::Leaf(leaf) => leaf.scale *= factor,
            Sample::Merged(merged) => merged.scale *= factor,
        }
        for split in self.splits_mut() {
            split.multiply_scale(factor);
        }
    }

    // Apply `edit` to every leaf and every split subsample below this sample.
    fn edit_leaves(&mut self, edit: &dyn Fn(&mut LeafSample)) {
        match self {
            Sample::Leaf(leaf) => edit(leaf.as_mut()),
            Sample::Merged(merged) => {
                for sample in merged.samples_mut() {
                    sample.edit_leaves(edit);
                }
            }
        }
        for split in self.splits_mut() {
            split.edit_leaves(edit);
        }
    }

    /// Join `cuts` with the cuts of every leaf and split subsample.
    pub fn add_cuts<E: Into<Expression>>(&mut self, cuts: E) {
        let cuts = cuts.into();
        self.edit_leaves(&|leaf| leaf.cuts = join_cuts([&leaf.cuts, &cuts]));
    }

    /// Replace the cuts of every leaf and split subsample.
    pub fn set_cuts<E: Into<Expression>>(&mut self, cuts: E) {
        let cuts = cuts.into();
        self.edit_leaves(&|leaf| leaf.cuts = cuts.clone());
    }

    /// Multiply the common weight of every leaf and split subsample by `weight`.
    pub fn add_weight<E: Into<Expression>>(&mut self, weight: E) {
        let weight = weight.into();
        self.edit_leaves(&|leaf| leaf.weight = join_weights([&leaf.weight, &weight]));
    }

    /// Replace the common weight everywhere.
    pub fn set_weight<E: Into<Expression>>(&mut self, weight: E) {
        let weight = weight.into();
        self.edit_leaves(&|leaf| leaf.weight = weight.clone());
    }

    /// Multiply the sample-specific weight of every leaf and split subsample by `weight`.
    pub fn add_extraweight<E: Into<Expression>>(&mut self, weight: E) {
        let weight = weight.into();
        self.edit_leaves(&|leaf| leaf.extraweight = join_weights([&leaf.extraweight, &weight]));
    }

    /// Replace the sample-specific weight everywhere.
    pub fn set_extraweight<E: Into<Expression>>(&mut self, weight: E) {
        let weight = weight.into();
        self.edit_leaves(&|leaf| leaf.extraweight = weight.clone());
    }

    /// Substitute `old` by `new` in the weights of every leaf and split subsample.
    pub fn replace_weight(&mut self, old: &str, new: &str) {
        self.edit_leaves(&|leaf| {
            if leaf.weight.contains(old) {
                leaf.weight = leaf.weight.replace(old, new);
            }
            if leaf.extraweight.contains(old) {
                leaf.extraweight = leaf.extraweight.replace(old, new);
            }
        });
    }

    /// Register an alias on every tree read by this sample.
    pub fn add_alias<E: Into<Expression>>(&mut self, name: &str, expression: E) {
        let expression = expression.into();
        self.edit_leaves(&|leaf| {
            leaf.read.aliases.insert(name.to_string(), expression.clone());
        });
    }

    /// Change the tree name everywhere.
    pub fn set_tree_name(&mut self, tree: &str) {
        self.edit_leaves(&|leaf| leaf.read.tree = Some(tree.to_string()));
    }

    /// Assign colours from `context` to every sample without one.
    pub fn set_colors(&mut self, context: &PlotContext) {
        let color = context.color(self.name()).map(str::to_string);
        match self {
            Sample::Leaf(leaf) => {
                if leaf.fillcolor.is_none() {
                    leaf.fillcolor = color;
                }
            }
            Sample::Merged(merged) => {
                if merged.fillcolor.is_none() {
                    merged.fillcolor = color;
                }
                for sample in merged.samples_mut() {
                    sample.set_colors(context);
                }
            }
        }
        for split in self.splits_mut() {
            split.set_colors(context);
        }
    }

    /// A shallow copy under a new name and title, sharing the file handles.
    pub fn renamed<N: Into<String>, T: Into<String>>(&self, name: N, title: T) -> Sample {
        let mut sample = self.clone();
        sample.set_name(name);
        sample.set_title(title);
        sample
    }

    /// A copy with independent file handles, recursively.
    pub fn clone_deep(&self) -> Sample {
        self.clone_deep_with(&mut HashMap::new())
    }

    pub(crate) fn clone_deep_with(&self, handles: &mut HashMap<String, Arc<SampleFile>>) -> Sample {
        match self {
            Sample::Leaf(leaf) => Sample::Leaf(Box::new(leaf.clone_deep_with(handles))),
            Sample::Merged(merged) => {
                let mut clone = merged.clone();
                clone.samples = merged
                    .samples()
                    .iter()
                    .map(|sample| sample.clone_deep_with(handles))
                    .collect();
                clone.splits = merged
                    .splits
                    .iter()
                    .map(|sample| sample.clone_deep_with(handles))
                    .collect();
                Sample::Merged(clone)
            }
        }
    }

    /// Point every leaf at the variant file with `filetag` injected before the extension, append
    /// `nametag` and `titletag`, and re-read the cutflows. The normalization is kept.
    ///
    /// # Errors
    ///
    /// Fails if a variant file does not exist or has no cutflow.
    pub fn append_filename(&mut self, filetag: &str, nametag: &str, titletag: &str) -> TauFitResult<()> {
        self.append_filename_with(filetag, nametag, titletag, &mut HashMap::new())
    }

    pub(crate) fn append_filename_with(
        &mut self,
        filetag: &str,
        nametag: &str,
        titletag: &str,
        handles: &mut HashMap<String, Arc<SampleFile>>,
    ) -> TauFitResult<()> {
        match self {
            Sample::Leaf(leaf) => leaf.append_filename_with(filetag, nametag, titletag, handles),
            Sample::Merged(merged) => {
                if !nametag.is_empty() && !merged.name.contains(nametag) {
                    merged.name.push_str(nametag);
                }
                if !titletag.is_empty() && !merged.title.contains(titletag) {
                    merged.title.push_str(titletag);
                }
                for sample in merged.samples_mut() {
                    sample.append_filename_with(filetag, nametag, titletag, handles)?;
                }
                for split in &mut merged.splits {
                    split.append_filename_with(filetag, nametag, titletag, handles)?;
                }
                Ok(())
            }
        }
    }

    /// Split into logical subcomponents, each a shallow copy with `cut` joined to its cuts.
    pub fn split(&mut self, parts: &[SplitSpec]) -> &[Sample] {
        let mut base = self.clone();
        base.splits_mut().clear();
        let splits: Vec<Sample> = parts
            .iter()
            .map(|(name, title, cut)| {
                let mut split = base.renamed(*name, *title);
                split.set_fillcolor(None);
                split.add_cuts(*cut);
                split
            })
            .collect();
        *self.splits_mut() = splits;
        self.splits()
    }

    fn set_fillcolor(&mut self, color: Option<String>) {
        match self {
            Sample::Leaf(leaf) => leaf.fillcolor = color,
            Sample::Merged(merged) => merged.fillcolor = color,
        }
    }

    /// Match search terms (globs) against the name, title and tags.
    pub fn matches<S: AsRef<str>>(&self, terms: &[S], mode: MatchMode) -> TauFitResult<bool> {
        let mut labels = vec![self.name(), self.title()];
        labels.extend(self.tags().iter().map(String::as_str));
        match_labels(terms, &labels, mode, false)
    }

    /// Header for [`Sample::row`].
    pub fn header() -> String {
        format!(
            ">>> {:<21} {:<26} {:>12} {:>11} {:>11} {:>10}  {}",
            "Sample name", "title", "xsec [pb]", "nevents", "sumweights", "norm", "weight"
        )
    }

    /// A row for a summary table; merged samples list their children below.
    pub fn row(&self, pre: &str, indent: usize) -> String {
        let width = 21usize.saturating_sub(indent);
        let mut row = match self {
            Sample::Leaf(leaf) => {
                let xsec = if leaf.xsec > 0.0 {
                    format!("{:.2}", leaf.xsec)
                } else {
                    String::new()
                };
                let count = |value: f64| {
                    if value >= 0.0 {
                        format!("{}", value as i64)
                    } else {
                        String::new()
                    }
                };
                format!(
                    ">>> {pre}{:<width$} {:<26} {:>12} {:>11} {:>11} {:>10.3}  {}",
                    leaf.name,
                    leaf.title,
                    xsec,
                    count(leaf.nevents),
                    count(leaf.sumweights),
                    leaf.norm,
                    leaf.extraweight
                )
            }
            Sample::Merged(merged) => format!(
                ">>> {pre}{:<width$} {:<26} {:>12} {:>11} {:>11} {:>10.3}  {}",
                merged.name, merged.title, "", "", "", 1.0, ""
            ),
        };
        let children = self.children();
        for (i, sample) in children.iter().enumerate() {
            let branch = if i + 1 < children.len() { "├─ " } else { "└─ " };
            let subpre = format!("{}{branch}", " ".repeat(indent));
            row.push('\n');
            row.push_str(&sample.row(&subpre, indent + 3));
        }
        row
    }

    /// Book one result for every (selection, axes) cell, returning them in a [`ResultDict`].
    pub fn gethists(
        &self,
        cache: &PlanCache,
        variables: &[Variable],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let axes: Vec<Axes> = variables.iter().cloned().map(Axes::One).collect();
        self.book_all(cache, &axes, selections, options)
    }

    /// Book one 2D result for every (selection, variable pair) cell.
    pub fn gethists2d(
        &self,
        cache: &PlanCache,
        pairs: &[(Variable, Variable)],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let axes: Vec<Axes> = pairs.iter().cloned().map(Axes::from).collect();
        self.book_all(cache, &axes, selections, options)
    }

    fn book_all(
        &self,
        cache: &PlanCache,
        axes: &[Axes],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let mut results = ResultDict::new();
        for selection in selections {
            for axes in axes {
                let bound = axes.changecontext(selection);
                for (info, result) in self.book(cache, selection, &bound, options)? {
                    results.add(selection, axes, info, result);
                }
            }
        }
        Ok(results)
    }

    /// Book this sample (or its split subsamples when `options.split`) for one cell. `axes` must
    /// already be bound to the context of `selection`.
    pub(crate) fn book(
        &self,
        cache: &PlanCache,
        selection: &Selection,
        axes: &Axes,
        options: &GetHistsOptions,
    ) -> TauFitResult<Vec<(SampleInfo, LazyResult)>> {
        if !axes
            .variables()
            .iter()
            .all(|variable| variable.plotfor(selection, self.is_data()))
        {
            log::debug!(
                "Sample '{}': skipping ({}, {})",
                self.name(),
                selection.filename,
                axes.key()
            );
            return Ok(Vec::new());
        }
        let samples: Vec<&Sample> = if options.split && self.is_split() {
            self.splits().iter().collect()
        } else {
            vec![self]
        };
        let mut booked = Vec::with_capacity(samples.len());
        for sample in samples {
            if let Some(result) = sample.book_one(cache, selection, axes, options, 1.0)? {
                booked.push((sample.info(), result));
            }
        }
        Ok(booked)
    }

    fn book_one(
        &self,
        cache: &PlanCache,
        selection: &Selection,
        axes: &Axes,
        options: &GetHistsOptions,
        scale: f64,
    ) -> TauFitResult<Option<LazyResult>> {
        match self {
            Sample::Leaf(leaf) => leaf.book(cache, selection, axes, options, scale).map(Some),
            Sample::Merged(merged) => {
                let mut parts = Vec::with_capacity(merged.len());
                for sample in merged.samples() {
                    if let Some(part) =
                        sample.book_one(cache, selection, axes, options, scale * merged.scale)?
                    {
                        parts.push(part);
                    }
                }
                if parts.is_empty() {
                    log::warn!("Sample '{}': no children to merge", merged.name);
                    return Ok(None);
                }
                let name = make_hist_name(&[
                    axes.key(),
                    selection.filename.clone(),
                    format!("{}{}", merged.name, options.tag),
                ]);
                Ok(Some(LazyResult::Merged {
                    name,
                    title: merged.title.clone(),
                    parts,
                }))
            }
        }
    }
}

impl Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
