use std::fmt::Display;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    expression::{shift_jet_vars, shift_vars},
    histogram::{HistModel, HistModel2D},
    selection::Selection,
    utils::{get_bin_edges, make_filename, match_labels, validate_edges, MatchMode},
    Expression, TauFitError, TauFitResult,
};

/// The binning of a histogram axis, either uniform or given by explicit edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Binning {
    /// `nbins` equal-width bins between `xmin` and `xmax`.
    Uniform {
        /// Number of bins
        nbins: usize,
        /// Lower edge
        xmin: f64,
        /// Upper edge
        xmax: f64,
    },
    /// Explicit, strictly increasing bin edges.
    Edges(Vec<f64>),
}

impl Binning {
    /// Uniform binning; requires at least one bin and `xmin < xmax`.
    pub fn uniform(nbins: usize, xmin: f64, xmax: f64) -> TauFitResult<Self> {
        if nbins == 0 || !(xmin < xmax) {
            return Err(TauFitError::BinningError {
                name: format!("({nbins},{xmin},{xmax})"),
                reason: "need at least one bin and xmin < xmax".to_string(),
            });
        }
        Ok(Self::Uniform { nbins, xmin, xmax })
    }

    /// Variable binning from explicit edges.
    pub fn edges(edges: Vec<f64>) -> TauFitResult<Self> {
        validate_edges(&format!("{edges:?}"), &edges)?;
        Ok(Self::Edges(edges))
    }

    /// The bin edges.
    pub fn bin_edges(&self) -> Vec<f64> {
        match self {
            Binning::Uniform { nbins, xmin, xmax } => get_bin_edges(*nbins, (*xmin, *xmax)),
            Binning::Edges(edges) => edges.clone(),
        }
    }

    /// Number of bins.
    pub fn nbins(&self) -> usize {
        match self {
            Binning::Uniform { nbins, .. } => *nbins,
            Binning::Edges(edges) => edges.len().saturating_sub(1),
        }
    }

    /// Lower edge of the first bin.
    pub fn xmin(&self) -> f64 {
        match self {
            Binning::Uniform { xmin, .. } => *xmin,
            Binning::Edges(edges) => edges.first().copied().unwrap_or(f64::NAN),
        }
    }

    /// Upper edge of the last bin.
    pub fn xmax(&self) -> f64 {
        match self {
            Binning::Uniform { xmax, .. } => *xmax,
            Binning::Edges(edges) => edges.last().copied().unwrap_or(f64::NAN),
        }
    }

    /// Returns `true` for explicit edges.
    pub fn is_variable(&self) -> bool {
        matches!(self, Binning::Edges(_))
    }
}

impl Display for Binning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Binning::Uniform { nbins, xmin, xmax } => write!(f, "({nbins},{xmin},{xmax})"),
            Binning::Edges(edges) => write!(f, "{edges:?}"),
        }
    }
}

/// A binned observable.
///
/// A [`Variable`] never changes when it is used with a [`Selection`]: the binning (and cut) for a
/// region is looked up with [`Variable::binning_for`] or [`Variable::changecontext`], which return
/// new values instead of mutating in place.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// Expression evaluated per event
    pub name: String,
    /// Axis title
    pub title: String,
    /// File-safe slug
    pub filename: String,
    /// Default binning
    pub binning: Binning,
    /// Cut applied in addition to the selection
    pub cut: Expression,
    /// Weight applied to simulated samples only
    pub weight: Expression,
    /// Weight applied to observed data only
    pub dataweight: Expression,
    /// Alternative binnings, keyed by a regex matched against the selection cut
    pub cbins: IndexMap<String, Binning>,
    /// Alternative cuts, keyed like `cbins`
    pub ccuts: IndexMap<String, Expression>,
    /// Window `(xmin, xmax)` in which observed data is hidden
    pub blind: Option<(f64, f64)>,
    /// Selections (regex on the cut) this variable is restricted to
    pub only: Vec<String>,
    /// Selections (regex on the cut) this variable is never filled for
    pub veto: Vec<String>,
    /// Fill for observed data (false for generator-level quantities)
    pub data: bool,
    /// Move overflow into the last bin
    pub addoverflow: bool,
    /// Logarithmic y axis
    pub logy: bool,
    /// Margin between the maximum and the top of the frame
    pub ymargin: Option<f64>,
    /// Legend position
    pub position: String,
}

impl Variable {
    /// Create a variable; the file name is derived from the expression.
    pub fn new<N: Into<String>, T: Into<String>>(name: N, title: T, binning: Binning) -> Self {
        let name = name.into();
        Self {
            filename: make_filename(&name.replace('/', "_")),
            title: title.into(),
            name,
            binning,
            cut: Expression::empty(),
            weight: Expression::empty(),
            dataweight: Expression::empty(),
            cbins: IndexMap::new(),
            ccuts: IndexMap::new(),
            blind: None,
            only: Vec::new(),
            veto: Vec::new(),
            data: true,
            addoverflow: false,
            logy: false,
            ymargin: None,
            position: String::new(),
        }
    }

    /// Shorthand for a uniformly binned variable.
    pub fn uniform<N: Into<String>, T: Into<String>>(
        name: N,
        title: T,
        nbins: usize,
        xmin: f64,
        xmax: f64,
    ) -> TauFitResult<Self> {
        Ok(Self::new(name, title, Binning::uniform(nbins, xmin, xmax)?))
    }

    /// Override the file name; `$VAR` is replaced by the derived one.
    pub fn with_filename<S: AsRef<str>>(mut self, filename: S) -> Self {
        self.filename = filename
            .as_ref()
            .replace("$NAME", &self.name)
            .replace("$VAR", &self.filename);
        self
    }

    /// Set the variable cut.
    pub fn with_cut<E: Into<Expression>>(mut self, cut: E) -> Self {
        self.cut = cut.into();
        self
    }

    /// Set the simulation-only weight.
    pub fn with_weight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.weight = weight.into();
        self
    }

    /// Set the data-only weight.
    pub fn with_dataweight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.dataweight = weight.into();
        self
    }

    /// Add an alternative binning used when a selection cut matches `pattern`.
    pub fn with_cbins<S: Into<String>>(mut self, pattern: S, binning: Binning) -> Self {
        self.cbins.insert(pattern.into(), binning);
        self
    }

    /// Add an alternative cut used when a selection cut matches `pattern`.
    pub fn with_ccut<S: Into<String>, E: Into<Expression>>(mut self, pattern: S, cut: E) -> Self {
        self.ccuts.insert(pattern.into(), cut.into());
        self
    }

    /// Hide observed data in `(xmin, xmax)`.
    pub fn with_blind(mut self, xmin: f64, xmax: f64) -> Self {
        self.blind = Some(if xmax < xmin { (xmax, xmin) } else { (xmin, xmax) });
        self
    }

    /// Restrict to selections matching these patterns.
    pub fn with_only<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.only = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Never fill for selections matching these patterns.
    pub fn with_veto<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.veto = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Do not fill for observed data.
    pub fn without_data(mut self) -> Self {
        self.data = false;
        self
    }

    /// Move overflow into the last bin.
    pub fn with_overflow(mut self) -> Self {
        self.addoverflow = true;
        self
    }

    /// Set display hints.
    pub fn with_display(mut self, logy: bool, ymargin: Option<f64>, position: &str) -> Self {
        self.logy = logy;
        self.ymargin = ymargin;
        self.position = position.to_string();
        self
    }

    fn context_match(pattern: &str, cut: &str) -> bool {
        pattern == cut || Regex::new(pattern).is_ok_and(|re| re.is_match(cut))
    }

    /// The binning to use with `selection`: the first `cbins` entry whose pattern matches the
    /// selection cut, or the default.
    pub fn binning_for(&self, selection: &Selection) -> &Binning {
        let cut = selection.selection.as_str();
        self.cbins
            .iter()
            .find(|(pattern, _)| Self::context_match(pattern, cut))
            .map_or(&self.binning, |(_, binning)| binning)
    }

    /// The cut to use with `selection`.
    pub fn cut_for(&self, selection: &Selection) -> &Expression {
        let cut = selection.selection.as_str();
        self.ccuts
            .iter()
            .find(|(pattern, _)| Self::context_match(pattern, cut))
            .map_or(&self.cut, |(_, cut)| cut)
    }

    /// A copy bound to the context of `selection`, with its binning and cut resolved.
    pub fn changecontext(&self, selection: &Selection) -> Variable {
        let mut variable = self.clone();
        variable.binning = self.binning_for(selection).clone();
        variable.cut = self.cut_for(selection).clone();
        variable
    }

    /// The expression that is filled: with `addoverflow` values are capped inside the last bin.
    pub fn expression(&self) -> Expression {
        if !self.addoverflow {
            return Expression::new(&self.name);
        }
        let edges = self.binning.bin_edges();
        let n = edges.len();
        let threshold = if n >= 2 {
            edges[n - 2] + 0.90 * (edges[n - 1] - edges[n - 2])
        } else {
            self.binning.xmax()
        };
        Expression::new(format!("min({},{})", self.name, threshold))
    }

    /// A 1D histogram model for the default binning.
    pub fn gethistmodel(&self, name: Option<&str>, title: Option<&str>) -> HistModel {
        HistModel {
            name: name.unwrap_or(&self.filename).to_string(),
            title: title.unwrap_or(&self.title).to_string(),
            edges: self.binning.bin_edges(),
        }
    }

    /// A 2D histogram model with `self` on `x` and `other` on `y`.
    pub fn gethistmodel2d(
        &self,
        other: &Variable,
        name: Option<&str>,
        title: Option<&str>,
    ) -> HistModel2D {
        HistModel2D {
            name: name
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}_vs_{}", other.filename, self.filename)),
            title: title
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} vs {}", other.title, self.title)),
            xedges: self.binning.bin_edges(),
            yedges: other.binning.bin_edges(),
        }
    }

    /// Whether the (selection, variable) cell should be filled, combining the variable's
    /// `only`/`veto` patterns with the selection's and, for observed data, the `data` flag.
    pub fn plotfor(&self, selection: &Selection, data: bool) -> bool {
        if data && !self.data {
            return false;
        }
        let cut = selection.selection.as_str();
        let search = |pattern: &String| {
            Regex::new(pattern)
                .map(|re| re.is_match(cut))
                .unwrap_or_else(|err| {
                    log::warn!("Variable '{}': invalid pattern '{pattern}': {err}", self.name);
                    false
                })
        };
        if self.veto.iter().any(search) {
            return false;
        }
        if !self.only.is_empty() && !self.only.iter().any(search) {
            return false;
        }
        selection.plotfor(self)
    }

    /// The cut hiding the blinding window, aligned to the bin edges of `binning`.
    pub fn blindcut(&self, binning: &Binning) -> Option<Expression> {
        let (bmin, bmax) = self.blind?;
        let (mut xlow, mut xhigh) = (bmin, bmax);
        let (xmin, xmax) = (binning.xmin(), binning.xmax());
        match binning {
            Binning::Edges(edges) => {
                for &edge in edges {
                    if edge > bmin {
                        break;
                    }
                    xlow = edge;
                }
                for &edge in edges.iter().rev() {
                    if edge < bmax {
                        break;
                    }
                    xhigh = edge;
                }
            }
            Binning::Uniform { nbins, .. } => {
                let width = (xmax - xmin) / *nbins as f64;
                if xmin < bmin && bmin < xmax {
                    xlow = xmin + ((bmin - xmin) / width).floor() * width;
                }
                if xmin < bmax && bmax < xmax {
                    xhigh = xmin + ((bmax - xmin) / width).ceil() * width;
                }
            }
        }
        if xlow >= xhigh {
            log::warn!(
                "Variable '{}': empty blinding window ({bmin},{bmax}) for binning {binning}",
                self.name
            );
            return None;
        }
        Some(Expression::new(if xlow <= xmin {
            format!("{}>{}", self.name, xhigh)
        } else if xhigh >= xmax {
            format!("{}<{}", self.name, xlow)
        } else {
            format!("({}<{} || {}<{})", self.name, xlow, xhigh, self.name)
        }))
    }

    /// A copy with `vshift` appended to the expression (or only to the parts matching `vars`).
    pub fn shift(&self, vshift: &str, vars: &[&str], keep_filename: bool) -> Variable {
        let tag = if vshift.is_empty() || vshift.starts_with('_') {
            vshift.to_string()
        } else {
            format!("_{vshift}")
        };
        let name = if vars.is_empty() {
            format!("{}{tag}", self.name)
        } else {
            shift_vars(&Expression::new(&self.name), &tag, vars).to_string()
        };
        self.with_shifted_name(name, &tag, keep_filename)
    }

    /// A copy with a jet-energy shift applied to the jet-dependent parts of the expression.
    pub fn shift_jme(&self, jshift: &str, keep_filename: bool) -> Variable {
        let tag = if jshift.is_empty() || jshift.starts_with('_') {
            jshift.to_string()
        } else {
            format!("_{jshift}")
        };
        let name = shift_jet_vars(&Expression::new(&self.name), &tag).to_string();
        self.with_shifted_name(name, &tag, keep_filename)
    }

    fn with_shifted_name(&self, name: String, tag: &str, keep_filename: bool) -> Variable {
        let mut variable = self.clone();
        if !keep_filename && name != self.name {
            variable.filename.push_str(tag);
        }
        variable.name = name;
        variable
    }

    /// Match search terms against the name, title and file name.
    pub fn matches<S: AsRef<str>>(&self, terms: &[S], mode: MatchMode) -> TauFitResult<bool> {
        match_labels(terms, &[&self.name, &self.title, &self.filename], mode, false)
    }
}

impl Display for Variable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.binning)
    }
}
