use std::{collections::HashMap, fmt::Display};

use crate::{
    context::PlotContext,
    engine::PlanCache,
    methods::Method,
    results::{Axes, ResultDict},
    sample::{
        utils::{join_samples, stitch_samples, StitchOptions},
        Sample, SplitSpec,
    },
    selection::Selection,
    utils::{HistKind, MatchMode},
    variable::Variable,
    Expression, TauFitError, TauFitResult,
};

/// Options for [`SampleSet::gethists`].
#[derive(Clone, Debug)]
pub struct GetHistsOptions {
    /// Book observed data
    pub data: bool,
    /// Book expected backgrounds
    pub exp: bool,
    /// Book signals
    pub signal: bool,
    /// Replace split samples by their subsamples
    pub split: bool,
    /// Apply the blinding windows of the variables to data
    pub blind: bool,
    /// Extra weight for simulation
    pub weight: Expression,
    /// Extra weight for data
    pub dataweight: Expression,
    /// Extra cuts for every sample
    pub extracuts: Expression,
    /// `(old, new)` substitutions applied to the total weight of simulated samples
    pub replaceweight: Vec<(String, String)>,
    /// Only book processes matching any of these patterns
    pub filter: Vec<String>,
    /// Do not book processes matching any of these patterns
    pub veto: Vec<String>,
    /// Suffix for histogram names
    pub tag: String,
    /// Data-driven estimate added to the expected processes
    pub method: Option<Method>,
    /// What to book for each cell
    pub kind: HistKind,
}

impl Default for GetHistsOptions {
    fn default() -> Self {
        Self {
            data: true,
            exp: true,
            signal: true,
            split: true,
            blind: true,
            weight: Expression::empty(),
            dataweight: Expression::empty(),
            extracuts: Expression::empty(),
            replaceweight: Vec::new(),
            filter: Vec::new(),
            veto: Vec::new(),
            tag: String::new(),
            method: None,
            kind: HistKind::default(),
        }
    }
}

impl GetHistsOptions {
    /// Default options: every sample type, split, blinded, one-dimensional histograms.
    pub fn new() -> Self {
        Self::default()
    }
    /// Book observed data or not.
    pub fn data(mut self, data: bool) -> Self {
        self.data = data;
        self
    }
    /// Book expected backgrounds or not.
    pub fn exp(mut self, exp: bool) -> Self {
        self.exp = exp;
        self
    }
    /// Book signals or not.
    pub fn signal(mut self, signal: bool) -> Self {
        self.signal = signal;
        self
    }
    /// Use split subsamples or not.
    pub fn split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }
    /// Blind data or not.
    pub fn blind(mut self, blind: bool) -> Self {
        self.blind = blind;
        self
    }
    /// Extra weight for simulation.
    pub fn weight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.weight = weight.into();
        self
    }
    /// Extra weight for data.
    pub fn dataweight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.dataweight = weight.into();
        self
    }
    /// Extra cuts for every sample.
    pub fn extracuts<E: Into<Expression>>(mut self, cuts: E) -> Self {
        self.extracuts = cuts.into();
        self
    }
    /// Substitute `old` by `new` in the weights of simulated samples.
    pub fn replaceweight<O: Into<String>, N: Into<String>>(mut self, old: O, new: N) -> Self {
        self.replaceweight.push((old.into(), new.into()));
        self
    }
    /// Only book processes matching any of `patterns`.
    pub fn filter<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.filter = patterns.into_iter().map(Into::into).collect();
        self
    }
    /// Do not book processes matching any of `patterns`.
    pub fn veto<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.veto = patterns.into_iter().map(Into::into).collect();
        self
    }
    /// Suffix for histogram names.
    pub fn tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = tag.into();
        self
    }
    /// Add a data-driven estimate to the expected processes.
    pub fn method<M: Into<Method>>(mut self, method: M) -> Self {
        self.method = Some(method.into());
        self
    }
    /// What to book for each cell.
    pub fn kind(mut self, kind: HistKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Options for [`SampleSet::shift`] and [`SampleSet::shiftweight`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShiftOptions {
    /// Leave samples which do not match out of the new set
    pub filter: bool,
    /// Share samples which do not match with the original set instead of cloning them
    pub share: bool,
    /// Also look for matches among split subsamples
    pub split: bool,
}

impl Default for ShiftOptions {
    fn default() -> Self {
        Self {
            filter: false,
            share: true,
            split: false,
        }
    }
}

impl ShiftOptions {
    /// Leave unmatched samples out.
    pub fn filter(mut self, filter: bool) -> Self {
        self.filter = filter;
        self
    }
    /// Share unmatched samples.
    pub fn share(mut self, share: bool) -> Self {
        self.share = share;
        self
    }
    /// Look into split subsamples.
    pub fn split(mut self, split: bool) -> Self {
        self.split = split;
        self
    }
}

/// Observed data, expected backgrounds and signals for one channel.
#[derive(Clone, Debug, Default)]
pub struct SampleSet {
    /// Observed data
    pub data: Option<Sample>,
    /// Expected (background) processes, in stacking order
    pub exp: Vec<Sample>,
    /// Signal processes
    pub signal: Vec<Sample>,
    /// Name of the set, e.g. the variation it describes
    pub name: String,
    /// Analysis channel
    pub channel: String,
}

impl SampleSet {
    /// Collect samples into a set.
    pub fn new(data: Option<Sample>, exp: Vec<Sample>, signal: Vec<Sample>) -> Self {
        Self {
            data,
            exp,
            signal,
            name: String::new(),
            channel: String::new(),
        }
    }

    /// Name the set.
    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Set the channel.
    pub fn with_channel<S: Into<String>>(mut self, channel: S) -> Self {
        self.channel = channel.into();
        self
    }

    /// Every sample: data first, then expected, then signal.
    pub fn samples(&self) -> impl Iterator<Item = &Sample> {
        self.data.iter().chain(&self.exp).chain(&self.signal)
    }

    fn samples_mut(&mut self) -> impl Iterator<Item = &mut Sample> {
        self.data
            .iter_mut()
            .chain(self.exp.iter_mut())
            .chain(self.signal.iter_mut())
    }

    /// Simulated samples: expected, then signal.
    pub fn mc_samples(&self) -> impl Iterator<Item = &Sample> {
        self.exp.iter().chain(&self.signal)
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples().count()
    }

    /// Returns `true` if the set has no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A table of every sample (and their split subsamples if `split`).
    pub fn table(&self, split: bool) -> String {
        let name = if self.name.is_empty() {
            "Samples".to_string()
        } else {
            format!("{} samples", self.name)
        };
        let mut lines = vec![format!(">>> {name}"), Sample::header()];
        for sample in self.samples() {
            lines.push(sample.row("", 0));
            if split {
                let splits = sample.splits();
                for (i, subsample) in splits.iter().enumerate() {
                    let branch = if i + 1 < splits.len() { "├─ " } else { "└─ " };
                    lines.push(subsample.row(branch, 3));
                }
            }
        }
        lines.join("\n")
    }

    /// Every sample matching all `terms`.
    pub fn get_all<S: AsRef<str>>(&self, terms: &[S]) -> TauFitResult<Vec<&Sample>> {
        let mut matches = Vec::new();
        for sample in self.samples() {
            if sample.matches(terms, MatchMode::All)? {
                matches.push(sample);
            }
        }
        Ok(matches)
    }

    /// The sample matching all `terms`; the first one (with a warning) if several do.
    ///
    /// # Errors
    ///
    /// Fails with [`TauFitError::NotFound`] if no sample matches.
    pub fn get<S: AsRef<str>>(&self, terms: &[S]) -> TauFitResult<&Sample> {
        let matches = self.get_all(terms)?;
        if matches.len() > 1 {
            log::warn!(
                "SampleSet '{}': {} samples match {:?}, using '{}'",
                self.name,
                matches.len(),
                term_strings(terms),
                matches[0].name()
            );
        }
        matches
            .into_iter()
            .next()
            .ok_or_else(|| not_found(terms))
    }

    /// The sample matching all `terms`, mutably.
    pub fn get_mut<S: AsRef<str>>(&mut self, terms: &[S]) -> TauFitResult<&mut Sample> {
        self.get(terms)?;
        for sample in self.samples_mut() {
            if sample.matches(terms, MatchMode::All)? {
                return Ok(sample);
            }
        }
        Err(not_found(terms))
    }

    /// Expected samples matching all `terms` (every expected sample if `terms` is empty).
    pub fn get_exp<S: AsRef<str>>(&self, terms: &[S]) -> TauFitResult<Vec<&Sample>> {
        filter_matches(&self.exp, terms)
    }

    /// Signal samples matching all `terms` (every signal sample if `terms` is empty).
    pub fn get_signal<S: AsRef<str>>(&self, terms: &[S]) -> TauFitResult<Vec<&Sample>> {
        filter_matches(&self.signal, terms)
    }

    /// Returns `true` if a sample matches all `terms`.
    pub fn has<S: AsRef<str>>(&self, terms: &[S]) -> TauFitResult<bool> {
        Ok(!self.get_all(terms)?.is_empty())
    }

    /// Remove and return every sample matching all `terms`.
    pub fn remove<S: AsRef<str>>(&mut self, terms: &[S]) -> TauFitResult<Vec<Sample>> {
        let mut removed = Vec::new();
        if let Some(data) = &self.data {
            if data.matches(terms, MatchMode::All)? {
                removed.extend(self.data.take());
            }
        }
        removed.extend(drain_matching(&mut self.exp, terms)?);
        removed.extend(drain_matching(&mut self.signal, terms)?);
        Ok(removed)
    }

    /// Rename the sample matching all `terms`.
    pub fn rename<S: AsRef<str>>(&mut self, terms: &[S], name: &str) -> TauFitResult<()> {
        let sample = self.get_mut(terms)?;
        log::debug!("SampleSet: renaming '{}' to '{name}'", sample.name());
        sample.set_name(name);
        Ok(())
    }

    /// Replace the sample matching all `terms` by `samples`, at the same position.
    pub fn replace<S: AsRef<str>>(&mut self, terms: &[S], samples: Vec<Sample>) -> TauFitResult<()> {
        if samples.is_empty() {
            log::warn!("SampleSet '{}': no samples given to replace {:?}", self.name, term_strings(terms));
            return Ok(());
        }
        for list in [&mut self.exp, &mut self.signal] {
            if let Some(index) = position(list, terms)? {
                list.splice(index..=index, samples);
                return Ok(());
            }
        }
        Err(not_found(terms))
    }

    /// Merge the expected (or else signal) samples matching all `terms` into one sample, placed
    /// at the position of the first of them. Fewer than two matches leave the set unchanged with
    /// a warning.
    pub fn join<S: AsRef<str>>(&mut self, terms: &[S], name: &str, title: &str) -> TauFitResult<()> {
        for list in [&mut self.exp, &mut self.signal] {
            if join_samples(list, terms, name, title)? {
                return Ok(());
            }
        }
        log::warn!(
            "SampleSet '{}': could not join '{name}': fewer than two samples match {:?}",
            self.name,
            term_strings(terms)
        );
        Ok(())
    }

    /// Stitch an inclusive sample with jet-binned samples matching all `terms` and join them.
    pub fn stitch<S: AsRef<str>>(&mut self, terms: &[S], options: &StitchOptions) -> TauFitResult<()> {
        stitch_samples(&mut self.exp, terms, options)
    }

    /// Split the sample matching all `terms` into subcomponents.
    pub fn split<S: AsRef<str>>(&mut self, terms: &[S], parts: &[SplitSpec]) -> TauFitResult<()> {
        let sample = self.get_mut(terms)?;
        log::debug!("SampleSet: splitting '{}' into {} parts", sample.name(), parts.len());
        sample.split(parts);
        Ok(())
    }

    /// A sibling set in which simulated samples matching any of `terms` (`["*"]` for every one) read
    /// the variant file with `filetag` injected. Unmatched samples are shared, cloned or left out
    /// according to `options`; data is kept unless filtering.
    pub fn shift<S: AsRef<str>>(
        &self,
        terms: &[S],
        filetag: &str,
        nametag: &str,
        titletag: &str,
        options: ShiftOptions,
    ) -> TauFitResult<SampleSet> {
        let all = terms.len() == 1 && terms[0].as_ref() == "*";
        let mut handles = HashMap::new();
        let mut shifted = |sample: &Sample| -> TauFitResult<Sample> {
            let mut clone = sample.clone_deep_with(&mut handles);
            clone.append_filename_with(filetag, nametag, titletag, &mut handles)?;
            Ok(clone)
        };
        let mut lists: [Vec<Sample>; 2] = [Vec::new(), Vec::new()];
        for (old, new) in [&self.exp, &self.signal].into_iter().zip(lists.iter_mut()) {
            for sample in old {
                if all || sample.matches(terms, MatchMode::Any)? {
                    new.push(shifted(sample)?);
                    continue;
                }
                if options.split && any_matches(sample.splits(), terms)? {
                    let mut clone = if options.share {
                        sample.clone()
                    } else {
                        sample.clone_deep()
                    };
                    let splits = sample
                        .splits()
                        .iter()
                        .map(|split| {
                            if split.matches(terms, MatchMode::Any)? {
                                shifted(split)
                            } else if options.share {
                                Ok(split.clone())
                            } else {
                                Ok(split.clone_deep())
                            }
                        })
                        .collect::<TauFitResult<Vec<Sample>>>()?;
                    *clone.splits_mut() = splits;
                    new.push(clone);
                    continue;
                }
                if !options.filter {
                    new.push(if options.share {
                        sample.clone()
                    } else {
                        sample.clone_deep()
                    });
                }
            }
        }
        let [exp, signal] = lists;
        let data = if options.filter {
            None
        } else {
            self.data.clone()
        };
        Ok(SampleSet {
            data,
            exp,
            signal,
            name: filetag.trim_start_matches('_').to_string(),
            channel: self.channel.clone(),
        })
    }

    /// A sibling set in which simulated samples matching all `terms` get `newweight`, either as
    /// their sample-specific weight (`extra`) or multiplied into their common weight.
    pub fn shiftweight<S: AsRef<str>, E: Into<Expression>>(
        &self,
        terms: &[S],
        newweight: E,
        titletag: &str,
        extra: bool,
        options: ShiftOptions,
    ) -> TauFitResult<SampleSet> {
        let newweight = newweight.into();
        let mut lists: [Vec<Sample>; 2] = [Vec::new(), Vec::new()];
        for (old, new) in [&self.exp, &self.signal].into_iter().zip(lists.iter_mut()) {
            for sample in old {
                if sample.matches(terms, MatchMode::All)? {
                    let mut clone = sample.clone_deep();
                    if extra {
                        clone.set_extraweight(newweight.clone());
                    } else {
                        clone.add_weight(newweight.clone());
                    }
                    if !titletag.is_empty() && !clone.title().contains(titletag) {
                        let title = format!("{}{titletag}", clone.title());
                        clone.set_title(title);
                    }
                    new.push(clone);
                } else if !options.filter {
                    new.push(if options.share {
                        sample.clone()
                    } else {
                        sample.clone_deep()
                    });
                }
            }
        }
        let [exp, signal] = lists;
        Ok(SampleSet {
            data: if options.filter { None } else { self.data.clone() },
            exp,
            signal,
            name: self.name.clone(),
            channel: self.channel.clone(),
        })
    }

    /// Reset the scale of every sample matching all `terms` to its baseline times `scale`.
    pub fn resetscales<S: AsRef<str>>(&mut self, terms: &[S], scale: f64) -> TauFitResult<usize> {
        let mut count = 0;
        for sample in self.samples_mut() {
            if sample.matches(terms, MatchMode::All)? {
                sample.reset_scale(scale);
                count += 1;
            }
        }
        if count == 0 {
            log::warn!("SampleSet '{}': no sample matches {:?}", self.name, term_strings(terms));
        }
        Ok(count)
    }

    /// Substitute `old` by `new` in the weights of every sample.
    pub fn replace_weight(&mut self, old: &str, new: &str) {
        self.samples_mut().for_each(|sample| sample.replace_weight(old, new));
    }

    /// Change the tree name of every sample.
    pub fn set_tree_name(&mut self, tree: &str) {
        self.samples_mut().for_each(|sample| sample.set_tree_name(tree));
    }

    /// Register an alias on every sample.
    pub fn add_alias<E: Into<Expression>>(&mut self, name: &str, expression: E) {
        let expression = expression.into();
        self.samples_mut()
            .for_each(|sample| sample.add_alias(name, expression.clone()));
    }

    /// Assign colours from `context` to every sample without one.
    pub fn set_colors(&mut self, context: &PlotContext) {
        self.samples_mut().for_each(|sample| sample.set_colors(context));
    }

    /// Book one result per (selection, variable, process) and return them lazily.
    ///
    /// Within each cell, data comes first, then the expected processes, then the data-driven
    /// estimate of `options.method`, then the signals.
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

    /// Book one 2D result per (selection, variable pair, process).
    pub fn gethists2d(
        &self,
        cache: &PlanCache,
        pairs: &[(Variable, Variable)],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let axes: Vec<Axes> = pairs.iter().cloned().map(Axes::from).collect();
        let options = if options.kind == HistKind::Hist1D {
            options.clone().kind(HistKind::Hist2D)
        } else {
            options.clone()
        };
        self.book_all(cache, &axes, selections, &options)
    }

    // The samples to book, split into subsamples and passed through the process filters.
    fn bookable(&self, options: &GetHistsOptions) -> TauFitResult<Vec<&Sample>> {
        let mut samples = Vec::new();
        for sample in self.samples() {
            if (sample.is_data() && !options.data)
                || (sample.is_signal() && !options.signal)
                || (!sample.is_data() && !sample.is_signal() && !options.exp)
            {
                continue;
            }
            let subsamples: Vec<&Sample> = if options.split && sample.is_split() {
                sample.splits().iter().collect()
            } else {
                vec![sample]
            };
            for subsample in subsamples {
                if !options.filter.is_empty() && !subsample.matches(&options.filter, MatchMode::Any)? {
                    continue;
                }
                if !options.veto.is_empty() && subsample.matches(&options.veto, MatchMode::Any)? {
                    continue;
                }
                samples.push(subsample);
            }
        }
        Ok(samples)
    }

    fn book_all(
        &self,
        cache: &PlanCache,
        axes: &[Axes],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let mut results = ResultDict::new();
        if axes.is_empty() {
            log::warn!("SampleSet '{}': no variables to make histograms for", self.name);
            return Ok(results);
        }
        let samples = self.bookable(options)?;
        let estimates = match &options.method {
            Some(method) => {
                let data_axes: Vec<Axes> = axes
                    .iter()
                    .filter(|axes| axes.variables().iter().all(|variable| variable.data))
                    .cloned()
                    .collect();
                let mut inner = options.clone();
                inner.method = None;
                Some(method.estimate(self, cache, &data_axes, selections, &inner)?)
            }
            None => None,
        };
        let booking = options.clone().split(false);
        for selection in selections {
            for axes in axes {
                let bound = axes.changecontext(selection);
                let mut book = |sample: &Sample, results: &mut ResultDict| -> TauFitResult<()> {
                    for (info, result) in sample.book(cache, selection, &bound, &booking)? {
                        results.add(selection, axes, info, result);
                    }
                    Ok(())
                };
                for sample in samples.iter().filter(|sample| sample.is_data()) {
                    book(sample, &mut results)?;
                }
                for sample in samples
                    .iter()
                    .filter(|sample| !sample.is_data() && !sample.is_signal())
                {
                    book(sample, &mut results)?;
                }
                if let Some(estimates) = &estimates {
                    for (info, result) in estimates.cell(&selection.filename, &axes.key()) {
                        results.add(selection, axes, info.clone(), result.clone());
                    }
                }
                for sample in samples.iter().filter(|sample| sample.is_signal()) {
                    book(sample, &mut results)?;
                }
            }
        }
        Ok(results)
    }
}

impl Display for SampleSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.samples().map(Sample::name).collect();
        write!(f, "{}", names.join(", "))
    }
}

fn term_strings<S: AsRef<str>>(terms: &[S]) -> Vec<String> {
    terms.iter().map(|term| term.as_ref().to_string()).collect()
}

fn not_found<S: AsRef<str>>(terms: &[S]) -> TauFitError {
    TauFitError::NotFound {
        object: "sample".to_string(),
        terms: term_strings(terms),
    }
}

fn filter_matches<'a, S: AsRef<str>>(samples: &'a [Sample], terms: &[S]) -> TauFitResult<Vec<&'a Sample>> {
    if terms.is_empty() {
        return Ok(samples.iter().collect());
    }
    let mut matches = Vec::new();
    for sample in samples {
        if sample.matches(terms, MatchMode::All)? {
            matches.push(sample);
        }
    }
    Ok(matches)
}

fn any_matches<S: AsRef<str>>(samples: &[Sample], terms: &[S]) -> TauFitResult<bool> {
    for sample in samples {
        if sample.matches(terms, MatchMode::Any)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn position<S: AsRef<str>>(samples: &[Sample], terms: &[S]) -> TauFitResult<Option<usize>> {
    for (i, sample) in samples.iter().enumerate() {
        if sample.matches(terms, MatchMode::All)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn drain_matching<S: AsRef<str>>(samples: &mut Vec<Sample>, terms: &[S]) -> TauFitResult<Vec<Sample>> {
    let flags = samples
        .iter()
        .map(|sample| sample.matches(terms, MatchMode::All))
        .collect::<TauFitResult<Vec<bool>>>()?;
    let (removed, kept): (Vec<(bool, Sample)>, Vec<(bool, Sample)>) = flags
        .into_iter()
        .zip(samples.drain(..))
        .partition(|(matched, _)| *matched);
    *samples = kept.into_iter().map(|(_, sample)| sample).collect();
    Ok(removed.into_iter().map(|(_, sample)| sample).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Cutflow, EventSource, EventTable, MemorySource},
        engine::EngineOptions,
        sample::LeafSample,
        variable::Binning,
    };
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn source() -> Arc<dyn EventSource> {
        let n = 60;
        let table = EventTable::from_columns([
            ("m_vis", (0..n).map(|i| i as f64).collect::<Vec<f64>>()),
            ("genmatch_2", (0..n).map(|i| (i % 6) as f64).collect()),
            ("q_1", (0..n).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect()),
            ("q_2", vec![-1.0; n]),
        ])
        .unwrap();
        let mut cutflow = vec![0.0; 15];
        cutflow[0] = 100.0;
        cutflow[14] = 100.0;
        let mut builder = MemorySource::new();
        for file in ["Data.root", "DY.root", "DY_TES1.030.root", "TT.root", "WJ.root", "H.root"] {
            builder = builder
                .with_tree(file, "tree", table.clone())
                .with_cutflow(file, Cutflow(cutflow.clone()));
        }
        builder.shared()
    }

    fn sample_set() -> SampleSet {
        let source = source();
        let mc = |name: &str, file: &str| -> Sample {
            LeafSample::builder(name, format!("{name} title"), file)
                .xsec(0.1)
                .lumi(1.0)
                .build(source.clone())
                .unwrap()
                .into()
        };
        let data: Sample = LeafSample::builder("Data", "Observed", "Data.root")
            .data()
            .build(source.clone())
            .unwrap()
            .into();
        let signal: Sample = LeafSample::builder("H", "Higgs", "H.root")
            .xsec(0.1)
            .lumi(1.0)
            .signal()
            .build(source.clone())
            .unwrap()
            .into();
        SampleSet::new(
            Some(data),
            vec![mc("DY", "DY.root"), mc("TT", "TT.root"), mc("WJ", "WJ.root")],
            vec![signal],
        )
        .with_channel("mutau")
    }

    fn variable() -> Variable {
        Variable::new("m_vis", "m_vis", Binning::uniform(6, 0.0, 60.0).unwrap())
    }

    #[test]
    fn test_get_and_has() {
        let set = sample_set();
        assert_eq!(set.len(), 5);
        assert_eq!(set.get(&["DY"]).unwrap().name(), "DY");
        assert!(set.has(&["T*"]).unwrap());
        assert!(!set.has(&["QCD"]).unwrap());
        assert!(matches!(set.get(&["QCD"]), Err(TauFitError::NotFound { .. })));
        assert_eq!(set.get_exp(&[] as &[&str]).unwrap().len(), 3);
        assert_eq!(set.get_signal(&["H"]).unwrap().len(), 1);
    }

    #[test]
    fn test_join_keeps_position() {
        let mut set = sample_set();
        set.join(&["TT|WJ"], "Top", "ttbar and W").unwrap();
        let names: Vec<&str> = set.exp.iter().map(Sample::name).collect();
        assert_eq!(names, vec!["DY", "Top"]);
        assert_eq!(set.exp[1].children().len(), 2);
        set.join(&["DY"], "Z", "Z").unwrap();
        assert_eq!(set.exp.len(), 2);
    }

    #[test]
    fn test_remove_rename_replace() {
        let mut set = sample_set();
        let removed = set.remove(&["WJ"]).unwrap();
        assert_eq!(removed.len(), 1);
        set.rename(&["TT"], "Top").unwrap();
        assert_eq!(set.exp[1].name(), "Top");
        let dy = set.get(&["DY"]).unwrap().clone();
        set.replace(&["DY"], vec![dy.renamed("ZTT", "Z"), dy.renamed("ZJ", "Z")])
            .unwrap();
        let names: Vec<&str> = set.exp.iter().map(Sample::name).collect();
        assert_eq!(names, vec!["ZTT", "ZJ", "Top"]);
    }

    #[test]
    fn test_shift_injects_filetag_and_shares() {
        let set = sample_set();
        let shifted = set
            .shift(&["DY"], "_TES1.030", "_TES1.030", " +3% TES", ShiftOptions::default())
            .unwrap();
        assert_eq!(shifted.name, "TES1.030");
        assert_eq!(shifted.exp[0].filename(), "DY_TES1.030.root");
        assert_eq!(shifted.exp[0].name(), "DY_TES1.030");
        assert!(!shifted.exp[0].shares_file(&set.exp[0]));
        assert!(shifted.exp[1].shares_file(&set.exp[1]));
        assert!(shifted.data.as_ref().unwrap().shares_file(set.data.as_ref().unwrap()));
        let filtered = set
            .shift(&["DY"], "_TES1.030", "", "", ShiftOptions::default().filter(true))
            .unwrap();
        assert!(filtered.data.is_none());
        assert_eq!(filtered.exp.len(), 1);
        assert!(filtered.signal.is_empty());
    }

    #[test]
    fn test_shift_split_subsample() {
        let mut set = sample_set();
        set.split(&["DY"], &[("ZTT", "real", "genmatch_2==5"), ("ZJ", "fake", "genmatch_2!=5")])
            .unwrap();
        let shifted = set
            .shift(&["ZTT"], "_TES1.030", "", "", ShiftOptions::default().split(true))
            .unwrap();
        let splits = shifted.exp[0].splits();
        assert_eq!(splits[0].filename(), "DY_TES1.030.root");
        assert_eq!(splits[1].filename(), "DY.root");
        assert!(splits[1].shares_file(&set.exp[0].splits()[1]));
    }

    #[test]
    fn test_shiftweight() {
        let set = sample_set();
        let shifted = set
            .shiftweight(&["TT"], "ttptweight", " top pt", true, ShiftOptions::default())
            .unwrap();
        let tt = shifted.get(&["TT"]).unwrap();
        assert_eq!(tt.leaves()[0].extraweight.as_str(), "ttptweight");
        assert_eq!(tt.title(), "TT title top pt");
        assert!(set.get(&["TT"]).unwrap().leaves()[0].extraweight.is_empty());
    }

    #[test]
    fn test_gethists_order_and_filters() {
        let mut set = sample_set();
        set.split(&["DY"], &[("ZTT", "real", "genmatch_2==5"), ("ZJ", "fake", "genmatch_2!=5")])
            .unwrap();
        let cache = PlanCache::new(EngineOptions::new());
        let selection = Selection::new("baseline", "q_1*q_2<0");
        let results = set
            .gethists(&cache, &[variable()], &[selection.clone()], &GetHistsOptions::new())
            .unwrap();
        assert_eq!(
            results.sample_names("baseline", "m_vis"),
            vec!["Data", "ZTT", "ZJ", "TT", "WJ", "H"]
        );
        let ztt = results.get("baseline", "m_vis", "ZTT").unwrap().integral();
        let zj = results.get("baseline", "m_vis", "ZJ").unwrap().integral();
        let unsplit = set
            .gethists(
                &cache,
                &[variable()],
                &[selection.clone()],
                &GetHistsOptions::new().split(false).filter(["DY", "Data"]),
            )
            .unwrap();
        assert_eq!(unsplit.sample_names("baseline", "m_vis"), vec!["Data", "DY"]);
        assert_relative_eq!(
            ztt + zj,
            unsplit.get("baseline", "m_vis", "DY").unwrap().integral()
        );
        let vetoed = set
            .gethists(
                &cache,
                &[variable()],
                &[selection],
                &GetHistsOptions::new().data(false).signal(false).veto(["Z*"]),
            )
            .unwrap();
        assert_eq!(vetoed.sample_names("baseline", "m_vis"), vec!["TT", "WJ"]);
        // Data and DY are read again for the second pass, the vetoed set is never triggered
        assert_eq!(cache.n_reads(), 7);
    }

    #[test]
    fn test_resetscales_and_table() {
        let mut set = sample_set();
        set.get_mut(&["DY"]).unwrap().multiply_scale(3.0);
        assert_eq!(set.resetscales(&["DY"], 2.0).unwrap(), 1);
        assert_relative_eq!(set.exp[0].scale(), 2.0);
        let table = set.table(true);
        assert!(table.contains(">>> DY"));
        assert_eq!(table.lines().count(), 7);
    }
}
