use std::fmt::Display;

use auto_ops::impl_op_ex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    expression::{invert_charge, join_cuts, join_weights, shift_jet_vars, shift_vars, ChargeTarget},
    utils::{make_filename, match_labels, MatchMode},
    variable::Variable,
    Expression, TauFitResult,
};

/// A named cut expression defining an analysis region.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// Name of the region
    pub name: String,
    /// Title for plots and tables
    pub title: String,
    /// File-safe slug
    pub filename: String,
    /// The cut expression
    pub selection: Expression,
    /// Optional extra multiplicative weight
    pub weight: Expression,
    /// Short label for plots
    pub flag: String,
    /// Variables (regex) this region is restricted to
    pub only: Vec<String>,
    /// Variables (regex) this region should not be filled for
    pub veto: Vec<String>,
}

impl Selection {
    /// Create a selection; the title is the name and the file name is derived from it.
    pub fn new<N: Into<String>, E: Into<Expression>>(name: N, selection: E) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            filename: make_filename(&name),
            name,
            selection: selection.into(),
            ..Default::default()
        }
    }

    /// Set the title.
    pub fn with_title<S: Into<String>>(mut self, title: S) -> Self {
        self.title = title.into();
        self
    }

    /// Override the file name.
    pub fn with_filename<S: Into<String>>(mut self, filename: S) -> Self {
        self.filename = filename.into();
        self
    }

    /// Set the extra weight.
    pub fn with_weight<E: Into<Expression>>(mut self, weight: E) -> Self {
        self.weight = weight.into();
        self
    }

    /// Set the flag.
    pub fn with_flag<S: Into<String>>(mut self, flag: S) -> Self {
        self.flag = flag.into();
        self
    }

    /// Restrict the selection to variables matching these patterns.
    pub fn with_only<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.only = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Never fill variables matching these patterns.
    pub fn with_veto<S: Into<String>>(mut self, patterns: impl IntoIterator<Item = S>) -> Self {
        self.veto = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// The cut expression.
    pub fn cut(&self) -> &Expression {
        &self.selection
    }

    /// Cut and weight combined as `(cut)*weight`.
    pub fn drawcmd(&self) -> Expression {
        crate::expression::join_cuts_weighted([&self.selection], &self.weight)
    }

    /// Whether this region should be filled for the variable.
    pub fn plotfor(&self, variable: &Variable) -> bool {
        let search = |pattern: &String| {
            Regex::new(pattern)
                .map(|re| re.is_match(&variable.name))
                .unwrap_or_else(|err| {
                    log::warn!("Selection '{}': invalid pattern '{pattern}': {err}", self.name);
                    false
                })
        };
        if let Some(pattern) = self.veto.iter().find(|pattern| search(pattern)) {
            log::debug!(
                "Selection '{}': variable '{}' vetoed by '{pattern}'",
                self.name,
                variable.name
            );
            return false;
        }
        self.only.is_empty() || self.only.iter().any(search)
    }

    /// Combine with other selections: names and titles joined by `, `, cuts joined with `&&`.
    pub fn combine(&self, others: &[&Selection]) -> Selection {
        let all: Vec<&Selection> = std::iter::once(self).chain(others.iter().copied()).collect();
        Selection {
            name: join_nonempty(all.iter().map(|s| s.name.as_str()), ", "),
            title: join_nonempty(all.iter().map(|s| s.title.as_str()), ", "),
            filename: join_nonempty(all.iter().map(|s| s.filename.as_str()), "_"),
            selection: join_cuts(all.iter().map(|s| &s.selection)),
            weight: join_weights(all.iter().map(|s| &s.weight)),
            ..Default::default()
        }
    }

    /// A copy with the charge requirement replaced (or removed).
    pub fn invert_charge(&self, target: ChargeTarget) -> Selection {
        let mut selection = self.clone();
        selection.selection = invert_charge(&self.selection, target);
        selection
    }

    /// A copy with `vshift` appended to the variables matching `vars` in the cut.
    pub fn shift(&self, vshift: &str, vars: &[&str], keep_filename: bool) -> Selection {
        let shifted = shift_vars(&self.selection, vshift, vars);
        self.with_shifted(shifted, vshift, keep_filename)
    }

    /// A copy with a jet-energy shift applied to the jet-dependent variables in the cut.
    pub fn shift_jme(&self, jshift: &str, keep_filename: bool) -> Selection {
        let shifted = shift_jet_vars(&self.selection, jshift);
        self.with_shifted(shifted, jshift, keep_filename)
    }

    fn with_shifted(&self, shifted: Expression, tag: &str, keep_filename: bool) -> Selection {
        let mut selection = self.clone();
        if !keep_filename && shifted != self.selection {
            if !tag.is_empty() && !tag.starts_with('_') {
                selection.filename.push('_');
            }
            selection.filename.push_str(tag);
        }
        selection.selection = shifted;
        selection
    }

    /// Match search terms against the name, title and cut.
    pub fn matches<S: AsRef<str>>(&self, terms: &[S], mode: MatchMode) -> TauFitResult<bool> {
        match_labels(
            terms,
            &[&self.name, &self.title, &self.selection.to_string()],
            mode,
            false,
        )
    }
}

fn join_nonempty<'a, I: Iterator<Item = &'a str>>(parts: I, sep: &str) -> String {
    parts.filter(|s| !s.is_empty()).collect::<Vec<_>>().join(sep)
}

impl_op_ex!(&|a: &Selection, b: &Selection| -> Selection { a.combine(&[b]) });

impl Display for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variable::Binning;

    #[test]
    fn test_new_derives_filename() {
        let sel = Selection::new("pt_1>20 && m_vis<100", "pt_1>20 && m_vis<100");
        assert_eq!(sel.title, sel.name);
        assert_eq!(sel.filename, "pt_1gt20m_vislt100");
    }

    #[test]
    fn test_plotfor() {
        let binning = Binning::uniform(10, 0.0, 10.0).unwrap();
        let njets = Variable::new("njets", "Number of jets", binning.clone());
        let mvis = Variable::new("m_vis", "m_vis", binning);
        let sel = Selection::new("0j", "njets==0").with_veto(["njets"]);
        assert!(!sel.plotfor(&njets));
        assert!(sel.plotfor(&mvis));
        let only = Selection::new("0j", "njets==0").with_only(["m_"]);
        assert!(!only.plotfor(&njets));
        assert!(only.plotfor(&mvis));
    }

    #[test]
    fn test_combine() {
        let a = Selection::new("baseline", "pt_1>20").with_weight("w1");
        let b = Selection::new("0j", "njets==0");
        let c = &a & &b;
        assert_eq!(c.name, "baseline, 0j");
        assert_eq!(c.filename, "baseline_0j");
        assert_eq!(c.selection.as_str(), "pt_1>20 && njets==0");
        assert_eq!(c.weight.as_str(), "w1");
    }

    #[test]
    fn test_shift() {
        let sel = Selection::new("ptcut", "jpt_1>50 && met<50");
        let shifted = sel.shift_jme("jecUp", false);
        assert_eq!(shifted.selection.as_str(), "jpt_1_jecUp>50 && met_jecUp<50");
        assert_eq!(shifted.filename, "ptcut_jecUp");
        let same = sel.shift("jecUp", &["mt_1"], false);
        assert_eq!(same.filename, "ptcut");
    }

    #[test]
    fn test_invert_charge() {
        let sel = Selection::new("OS", "q_1*q_2<0 && iso_1<0.15");
        let ss = sel.invert_charge(ChargeTarget::SS);
        assert_eq!(ss.selection.as_str(), "q_1*q_2>0 && iso_1<0.15");
    }
}
