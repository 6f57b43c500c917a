use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    engine::PlanCache,
    histogram::HistResult,
    methods::{
        control_options, ensure_positive, estimate_info, subtract_hist, ControlRegion,
        NEGATIVE_BIN_THRESHOLD,
    },
    results::{Axes, CombineFn, LazyResult, ResultDict},
    sample::{GetHistsOptions, SampleSet},
    selection::Selection,
    utils::{get_bin_index, make_hist_name, validate_edges},
    Expression, TauFitError, TauFitResult,
};

/// Default `|eta|` edges of the fake-rate table: barrel and endcap.
pub const FAKE_RATE_ETA_EDGES: [f64; 3] = [0.0, 1.5, 2.4];
/// Default `pt` edges (GeV) of the fake-rate table.
pub const FAKE_RATE_PT_EDGES: [f64; 8] = [20.0, 25.0, 30.0, 35.0, 40.0, 50.0, 70.0, 120.0];

/// Jet-to-tau fake rates binned in `|eta|` and `pt`.
///
/// `rates[i][j]` is the loose-to-tight fake rate in `|eta|` bin `i` and `pt` bin `j`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FakeRateTable {
    /// Expression of the transverse momentum
    pub pt: String,
    /// Expression of the pseudorapidity
    pub eta: String,
    /// Edges in `|eta|`
    pub eta_edges: Vec<f64>,
    /// Edges in `pt`
    pub pt_edges: Vec<f64>,
    /// Fake rates, `[eta][pt]`
    pub rates: Vec<Vec<f64>>,
}

impl FakeRateTable {
    /// A table with the default barrel/endcap and `pt` bins of the jet (`JetPt`, `JetEta`).
    pub fn new(rates: Vec<Vec<f64>>) -> TauFitResult<Self> {
        Self::with_edges(FAKE_RATE_ETA_EDGES.to_vec(), FAKE_RATE_PT_EDGES.to_vec(), rates)
    }

    /// A table with custom edges.
    pub fn with_edges(
        eta_edges: Vec<f64>,
        pt_edges: Vec<f64>,
        rates: Vec<Vec<f64>>,
    ) -> TauFitResult<Self> {
        validate_edges("fake rate |eta|", &eta_edges)?;
        validate_edges("fake rate pt", &pt_edges)?;
        if rates.len() != eta_edges.len() - 1 {
            return Err(TauFitError::LengthMismatch {
                context: "fake rate |eta| bins".to_string(),
                expected: eta_edges.len() - 1,
                actual: rates.len(),
            });
        }
        for row in &rates {
            if row.len() != pt_edges.len() - 1 {
                return Err(TauFitError::LengthMismatch {
                    context: "fake rate pt bins".to_string(),
                    expected: pt_edges.len() - 1,
                    actual: row.len(),
                });
            }
        }
        Ok(Self {
            pt: "JetPt".to_string(),
            eta: "JetEta".to_string(),
            eta_edges,
            pt_edges,
            rates,
        })
    }

    /// Use other expressions for `pt` and `eta`, e.g. those of the tau instead of the jet.
    pub fn with_variables<P: Into<String>, E: Into<String>>(mut self, pt: P, eta: E) -> Self {
        self.pt = pt.into();
        self.eta = eta.into();
        self
    }

    /// The fake rate for one object, or [`None`] outside the table.
    pub fn rate(&self, pt: f64, eta: f64) -> Option<f64> {
        let i = get_bin_index(eta.abs(), &self.eta_edges)?;
        let j = get_bin_index(pt, &self.pt_edges)?;
        Some(self.rates[i][j])
    }

    /// Per-event weight `FR/(1-FR)` extrapolating from the loose-not-tight to the tight region.
    /// Events outside the table get weight 0.
    pub fn weight(&self) -> Expression {
        let abseta = format!("abs({})", self.eta);
        let mut text = format!("({abseta}<{} ? 0 : ", self.eta_edges[0]);
        for (row, hi) in self.rates.iter().zip(&self.eta_edges[1..]) {
            text.push_str(&format!("{abseta}<{hi} ? ({}) : ", self.pt_weight(row)));
        }
        text.push_str("0)");
        Expression::new(text)
    }

    fn pt_weight(&self, row: &[f64]) -> String {
        let mut text = format!("{}<{} ? 0 : ", self.pt, self.pt_edges[0]);
        for (rate, hi) in row.iter().zip(&self.pt_edges[1..]) {
            text.push_str(&format!("{}<{hi} ? {} : ", self.pt, transfer_weight(*rate)));
        }
        text.push('0');
        text
    }
}

fn transfer_weight(rate: f64) -> f64 {
    if !(0.0..1.0).contains(&rate) {
        log::warn!("FakeRateTable: fake rate {rate} outside [0,1), using weight 0");
        return 0.0;
    }
    rate / (1.0 - rate)
}

/// Where the per-event fake-rate weight comes from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FakeRate {
    /// A weight expression, e.g. a function of `pt`, mass, `eta` and decay mode
    Weight(Expression),
    /// A binned table
    Table(FakeRateTable),
}

impl FakeRate {
    /// The per-event weight.
    pub fn weight(&self) -> Expression {
        match self {
            FakeRate::Weight(weight) => weight.clone(),
            FakeRate::Table(table) => table.weight(),
        }
    }
}

impl From<Expression> for FakeRate {
    fn from(weight: Expression) -> Self {
        FakeRate::Weight(weight)
    }
}

impl From<&str> for FakeRate {
    fn from(weight: &str) -> Self {
        FakeRate::Weight(Expression::new(weight))
    }
}

impl From<FakeRateTable> for FakeRate {
    fn from(table: FakeRateTable) -> Self {
        FakeRate::Table(table)
    }
}

/// Jet-to-tau fakes: observed data minus simulation in the loose-not-tight tau identification
/// region, weighted by the fake rate.
///
/// The tight requirement `<tauid> >= T` of each selection is replaced by
/// `<tauid> >= vvvloose && <tauid> < T`. Simulation gets an extra veto on jet fakes
/// (`genmatch_2!=6` by default) so only genuine and lepton-faked taus are subtracted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JetToTauFake {
    /// Process name
    pub name: String,
    /// Process title
    pub title: String,
    /// Regex matching the tau identification variable
    pub tauid: String,
    /// Loosest working point bit of the control region
    pub vvvloose: u32,
    /// Fake-rate weight
    pub fakerate: FakeRate,
    /// Cut applied to simulation only
    pub mcveto: Expression,
    /// Fraction of negative bins above which to warn
    pub negthres: f64,
    /// Fill colour
    pub fillcolor: Option<String>,
}

impl JetToTauFake {
    /// A jet-to-tau fake estimate with the DeepTau `VSjet` identification of the second leg.
    pub fn new<F: Into<FakeRate>>(fakerate: F) -> Self {
        Self {
            name: "JTF".to_string(),
            title: "Mis-ID tau_h (Data)".to_string(),
            tauid: r"idDeepTau\w*VSjet_2".to_string(),
            vvvloose: 1,
            fakerate: fakerate.into(),
            mcveto: Expression::new("genmatch_2!=6"),
            negthres: NEGATIVE_BIN_THRESHOLD,
            fillcolor: None,
        }
    }

    /// Rename the process.
    pub fn with_name<N: Into<String>, T: Into<String>>(mut self, name: N, title: T) -> Self {
        self.name = name.into();
        self.title = title.into();
        self
    }

    /// Match another tau identification variable (a regex).
    pub fn with_tauid<S: Into<String>>(mut self, tauid: S) -> Self {
        self.tauid = tauid.into();
        self
    }

    /// Loosest working point of the control region.
    pub fn with_vvvloose(mut self, vvvloose: u32) -> Self {
        self.vvvloose = vvvloose;
        self
    }

    /// Replace the veto applied to simulation.
    pub fn with_mcveto<E: Into<Expression>>(mut self, veto: E) -> Self {
        self.mcveto = veto.into();
        self
    }

    /// Fill colour of the estimate.
    pub fn with_color<S: Into<String>>(mut self, color: S) -> Self {
        self.fillcolor = Some(color.into());
        self
    }

    /// The control-region cuts, or [`None`] if `cuts` have no tight identification requirement.
    pub fn control_cuts(&self, cuts: &Expression) -> TauFitResult<Option<Expression>> {
        let re = Regex::new(&format!(r"(?P<id>{})\s*>=\s*(?P<wp>\d+)", self.tauid))?;
        if !re.is_match(cuts.as_str()) {
            return Ok(None);
        }
        let replacement = format!("(${{id}}>={} && ${{id}}<${{wp}})", self.vvvloose);
        Ok(Some(Expression::new(
            re.replace_all(cuts.as_str(), replacement.as_str()),
        )))
    }

    pub(crate) fn estimate(
        &self,
        set: &SampleSet,
        cache: &PlanCache,
        axes: &[Axes],
        selections: &[Selection],
        options: &GetHistsOptions,
    ) -> TauFitResult<ResultDict> {
        let weight = self.fakerate.weight();
        let base = control_options(options);
        let data_options = base.clone().dataweight(&base.dataweight * &weight);
        let mc_options = base
            .clone()
            .weight(&base.weight * &weight)
            .extracuts(&base.extracuts & &self.mcveto);
        let mut results = ResultDict::new();
        for selection in selections {
            let Some(cuts) = self.control_cuts(&selection.selection)? else {
                log::warn!(
                    "JetToTauFake: no tau ID requirement '{}>=WP' in selection '{}' ({}), skipping",
                    self.tauid,
                    selection.name,
                    selection.selection
                );
                continue;
            };
            log::debug!("JetToTauFake: control region for '{}': {}", selection.name, cuts);
            let control = Selection {
                name: format!("{} (loose-not-tight)", selection.name),
                title: format!("{} (loose-not-tight)", selection.title),
                filename: format!("{}_LnotT", selection.filename),
                selection: cuts,
                ..selection.clone()
            };
            for axes in axes {
                let bound = axes.changecontext(selection);
                let Some(region) = ControlRegion::book(
                    set,
                    cache,
                    &control,
                    &bound,
                    &data_options,
                    &mc_options,
                    |_| true,
                )?
                else {
                    continue;
                };
                let name = make_hist_name(&[
                    axes.key(),
                    selection.filename.clone(),
                    format!("{}{}", self.name, options.tag),
                ]);
                let combine: CombineFn = {
                    let (name, title, negthres) = (name.clone(), self.title.clone(), self.negthres);
                    Arc::new(move |inputs: &[HistResult]| {
                        let mut hist = subtract_hist(inputs, &name, &title)?;
                        ensure_positive(&mut hist, negthres);
                        Ok(HistResult::Hist1D(hist))
                    })
                };
                results.add(
                    selection,
                    axes,
                    estimate_info(&self.name, &self.title, self.fillcolor.as_deref()),
                    LazyResult::Derived {
                        name,
                        title: self.title.clone(),
                        inputs: region.inputs().collect(),
                        combine,
                    },
                );
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        data::{Cutflow, EventSource, EventTable, MemorySource},
        engine::EngineOptions,
        sample::{LeafSample, Sample},
        variable::{Binning, Variable},
    };
    use approx::assert_relative_eq;

    fn source(mc_scale: f64) -> Arc<dyn EventSource> {
        let n = 40;
        let table = EventTable::from_columns([
            ("m_vis", (0..n).map(|i| 2.5 * i as f64).collect::<Vec<f64>>()),
            ("JetPt", (0..n).map(|i| 20.0 + 2.0 * i as f64).collect()),
            ("JetEta", (0..n).map(|i| if i % 2 == 0 { 0.5 } else { -2.0 }).collect()),
            ("idDeepTau2018v2p5VSjet_2", (0..n).map(|i| [1.0, 2.0, 4.0, 8.0, 16.0][i % 5]).collect()),
            ("genmatch_2", (0..n).map(|i| (i % 6) as f64).collect()),
            ("w", vec![mc_scale; n]),
        ])
        .unwrap();
        let mut cutflow = vec![0.0; 15];
        cutflow[0] = 100.0;
        cutflow[14] = 100.0;
        let mut source = MemorySource::new();
        for file in ["Data.root", "DY.root", "TT.root"] {
            source = source
                .with_tree(file, "tree", table.clone())
                .with_cutflow(file, Cutflow(cutflow.clone()));
        }
        source.shared()
    }

    fn sample_set(mc_scale: f64, names: &[&str]) -> SampleSet {
        let source = source(mc_scale);
        let mc = |name: &str| -> Sample {
            LeafSample::builder(name, name, format!("{name}.root"))
                .xsec(0.1)
                .lumi(1.0)
                .weight("w")
                .build(source.clone())
                .unwrap()
                .into()
        };
        let data: Sample = LeafSample::builder("Data", "Observed", "Data.root")
            .data()
            .build(source.clone())
            .unwrap()
            .into();
        SampleSet::new(Some(data), names.iter().map(|name| mc(name)).collect(), Vec::new())
            .with_channel("mutau")
    }

    fn table() -> FakeRateTable {
        FakeRateTable::new(vec![
            vec![0.5, 0.4, 0.3, 0.2, 0.2, 0.1, 0.1],
            vec![0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5],
        ])
        .unwrap()
    }

    #[test]
    fn test_control_cuts() {
        let jtf = JetToTauFake::new("1");
        let cuts = Expression::new("q_1*q_2<0 && idDeepTau2018v2p5VSjet_2>=16 && iso_1<0.15");
        assert_eq!(
            jtf.control_cuts(&cuts).unwrap().unwrap().as_str(),
            "q_1*q_2<0 && (idDeepTau2018v2p5VSjet_2>=1 && idDeepTau2018v2p5VSjet_2<16) && iso_1<0.15"
        );
        assert!(jtf
            .control_cuts(&Expression::new("pt_2>20"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_fake_rate_table() {
        let table = table();
        assert_relative_eq!(table.rate(22.0, -0.3).unwrap(), 0.5);
        assert_relative_eq!(table.rate(60.0, 1.2).unwrap(), 0.1);
        assert_relative_eq!(table.rate(60.0, 2.0).unwrap(), 0.5);
        assert!(table.rate(130.0, 0.0).is_none());
        assert!(table.rate(30.0, 2.5).is_none());
        let weight = table.weight().compile().unwrap();
        let value = |pt: f64, eta: f64| {
            let values: Vec<f64> = weight
                .required_columns
                .iter()
                .map(|column| if column == "JetPt" { pt } else { eta })
                .collect();
            weight.eval_row(&values)
        };
        assert_eq!(weight.required_columns.len(), 2);
        assert_relative_eq!(value(22.0, -0.3), 1.0);
        assert_relative_eq!(value(60.0, 1.2), 0.1 / 0.9);
        assert_relative_eq!(value(119.0, 2.0), 1.0);
        assert_relative_eq!(value(130.0, 0.0), 0.0);
        assert_relative_eq!(value(30.0, 2.5), 0.0);
        assert!(matches!(
            FakeRateTable::new(vec![vec![0.1; 7]]),
            Err(TauFitError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_when_simulation_equals_data() {
        let set = sample_set(1.0, &["DY"]);
        let cache = PlanCache::new(EngineOptions::new());
        let variable = Variable::new("m_vis", "m_vis", Binning::uniform(10, 0.0, 100.0).unwrap());
        let selection = Selection::new("sr", "idDeepTau2018v2p5VSjet_2>=16");
        for fakerate in [FakeRate::from(table()), FakeRate::from("0.25")] {
            let options = GetHistsOptions::new()
                .signal(false)
                .method(JetToTauFake::new(fakerate));
            let results = set
                .gethists(&cache, &[variable.clone()], &[selection.clone()], &options)
                .unwrap();
            assert_eq!(
                results.sample_names("sr", "m_vis"),
                vec!["Data", "DY", "JTF"]
            );
            let hist = results.get("sr", "m_vis", "JTF").unwrap().into_hist1d().unwrap();
            assert_eq!(hist.name, "m_vis_sr_JTF");
            assert!(hist.contents().iter().all(|content| *content == 0.0));
        }
    }

    #[test]
    fn test_data_minus_simulation() {
        let set = sample_set(0.25, &["DY", "TT"]);
        let cache = PlanCache::new(EngineOptions::new());
        let variable = Variable::new("m_vis", "m_vis", Binning::uniform(10, 0.0, 100.0).unwrap());
        let selection = Selection::new("sr", "idDeepTau2018v2p5VSjet_2>=16");
        let options = GetHistsOptions::new()
            .signal(false)
            .method(JetToTauFake::new("0.5").with_mcveto(""));
        let results = set
            .gethists(&cache, &[variable], &[selection], &options)
            .unwrap();
        let hist = results.get("sr", "m_vis", "JTF").unwrap();
        // 32 of 40 events are loose-not-tight; simulation subtracts two times a quarter of them
        assert_relative_eq!(hist.integral(), 0.5 * 32.0 * (1.0 - 2.0 * 0.25));
    }
}
