use std::sync::Arc;

use approx::assert_relative_eq;
use taufit::{
    data::{Cutflow, EventSource, EventTable, MemorySource},
    engine::EngineOptions,
    parabola::{fit_parabola, Scan},
    sample::{GetHistsOptions, LeafSample, ShiftOptions},
    variable::Binning,
    PlanCache, Sample, SampleSet, Selection, Variable,
};

fn source(nevents: usize, sumweights: f64) -> Arc<dyn EventSource> {
    let table = EventTable::from_columns([
        ("x", (0..nevents).map(|i| i as f64).collect::<Vec<f64>>()),
        ("genmatch_2", (0..nevents).map(|i| (i % 7) as f64).collect()),
    ])
    .unwrap();
    let mut cutflow = vec![0.0; 15];
    cutflow[0] = sumweights;
    cutflow[14] = sumweights;
    let mut source = MemorySource::new();
    for file in ["DY.root", "DY_TES1.030.root", "TT.root"] {
        source = source
            .with_tree(file, "tree", table.clone())
            .with_cutflow(file, Cutflow(cutflow.clone()));
    }
    source.shared()
}

fn dy(source: &Arc<dyn EventSource>) -> Sample {
    LeafSample::builder("DY", "Drell-Yan", "DY.root")
        .xsec(5343.0)
        .lumi(41480.0)
        .build(source.clone())
        .unwrap()
        .into()
}

#[test]
fn nominal_histogram_is_normalized() {
    let source = source(1000, 1.0686e8);
    let set = SampleSet::new(None, vec![dy(&source)], Vec::new());
    let norm = 41480.0 * 5343.0 * 1000.0 / 1.0686e8;
    assert_relative_eq!(set.exp[0].norm(), norm, max_relative = 1e-12);
    let variable = Variable::new("x", "x", Binning::uniform(10, 0.0, 1000.0).unwrap());
    let selection = Selection::new("half", "x<500");
    let cache = PlanCache::new(EngineOptions::new());
    let results = set
        .gethists(&cache, &[variable], &[selection], &GetHistsOptions::new())
        .unwrap();
    let integral = results.get("half", "x", "DY").unwrap().integral();
    assert_relative_eq!(integral, 500.0 * norm, max_relative = 1e-9);
    assert_relative_eq!(integral, 1.0372e6, max_relative = 1e-3);
}

#[test]
fn shifted_set_injects_filetag() {
    let source = source(100, 100.0);
    let top: Sample = LeafSample::builder("TT", "ttbar", "TT.root")
        .xsec(800.0)
        .lumi(41480.0)
        .build(source.clone())
        .unwrap()
        .into();
    let set = SampleSet::new(None, vec![dy(&source), top], Vec::new());
    let shifted = set
        .shift(&["DY"], "_TES1.030", "_TES1.030", " +3.0% TES", ShiftOptions::default())
        .unwrap();
    assert_eq!(shifted.exp[0].filename(), "DY_TES1.030.root");
    assert!(shifted.exp[1].shares_file(&set.exp[1]));
    assert!(!shifted.exp[0].shares_file(&set.exp[0]));
}

#[test]
fn split_subsamples_sum_to_parent() {
    let source = source(700, 700.0);
    let mut set = SampleSet::new(None, vec![dy(&source)], Vec::new());
    let variable = Variable::new("x", "x", Binning::uniform(7, 0.0, 700.0).unwrap());
    let selection = Selection::new("all", "x>=0");
    let cache = PlanCache::new(EngineOptions::new());
    let whole = set
        .gethists(&cache, &[variable.clone()], &[selection.clone()], &GetHistsOptions::new())
        .unwrap()
        .get("all", "x", "DY")
        .unwrap()
        .as_hist1d()
        .cloned()
        .unwrap();
    set.split(
        &["DY"],
        &[
            ("ZTT", "Z -> tau tau", "genmatch_2==5"),
            ("ZL", "Z -> ll", "0<genmatch_2 && genmatch_2<5"),
            ("ZJ", "Z -> j", "genmatch_2==0 || genmatch_2>5"),
        ],
    )
    .unwrap();
    let results = set
        .gethists(&cache, &[variable], &[selection], &GetHistsOptions::new())
        .unwrap();
    let mut sum = vec![0.0; whole.nbins()];
    for name in ["ZTT", "ZL", "ZJ"] {
        let hist = results.get("all", "x", name).unwrap().as_hist1d().cloned().unwrap();
        for (i, content) in hist.contents().iter().enumerate() {
            sum[i] += content;
        }
    }
    for (i, content) in sum.iter().enumerate() {
        assert_relative_eq!(*content, whole.bin_content(i), max_relative = 1e-12);
    }
}

#[test]
fn direct_scan_extraction() {
    let scan = Scan::from_points(
        "tes",
        [
            (0.970, 9.0),
            (0.980, 4.0),
            (0.990, 1.0),
            (1.000, 0.0),
            (1.010, 1.0),
            (1.020, 4.0),
            (1.030, 9.0),
        ],
    )
    .unwrap();
    let measurement = scan.measure();
    assert_relative_eq!(measurement.value, 1.0);
    assert_relative_eq!(measurement.err_down, 0.010, epsilon = 1e-9);
    assert_relative_eq!(measurement.err_up, 0.010, epsilon = 1e-9);
}

#[test]
fn symmetric_parabola_direct_and_fitted() {
    let (x0, k) = (1.002, 1000.0);
    let scan = Scan::from_points(
        "tes",
        (-8..=8).map(|i| {
            let x = x0 + 0.0005 * i as f64;
            (x, 1000.0 * k * (x - x0).powi(2))
        }),
    )
    .unwrap();
    let expected = (1000.0 * k).sqrt().recip();
    let direct = scan.measure();
    assert_relative_eq!(direct.value, x0, epsilon = 1e-12);
    assert_relative_eq!(direct.err_down, expected, max_relative = 1e-6);
    assert_relative_eq!(direct.err_up, expected, max_relative = 1e-6);
    let fitted = fit_parabola(&scan, false).unwrap().measurement();
    assert_relative_eq!(fitted.value, x0, epsilon = 1e-5);
    assert_relative_eq!(fitted.err_down, expected, max_relative = 1e-3);
}

#[test]
fn asymmetric_parabola_ratio() {
    let (x0, k_left, k_right) = (0.995, 400.0, 1600.0);
    let scan = Scan::from_points(
        "tes",
        (-30..=16).map(|i| {
            let x = x0 + 0.005 * i as f64;
            let k = if x < x0 { k_left } else { k_right };
            (x, k * (x - x0).powi(2))
        }),
    )
    .unwrap();
    let measurement = fit_parabola(&scan, true).unwrap().measurement();
    assert_relative_eq!(measurement.value, x0, epsilon = 1e-4);
    assert_relative_eq!(measurement.err_down, 0.05, max_relative = 0.05);
    assert_relative_eq!(measurement.err_up, 0.025, max_relative = 0.05);
    assert_relative_eq!(measurement.err_down / measurement.err_up, 2.0, max_relative = 0.05);
}

#[test]
fn asymmetric_parabola_fit() {
    let scan = Scan::from_points(
        "tes",
        [
            (0.970, 9.0),
            (0.980, 4.0),
            (0.990, 1.0),
            (1.000, 0.0),
            (1.005, 1.0),
            (1.010, 4.0),
            (1.020, 16.0),
        ],
    )
    .unwrap();
    let measurement = fit_parabola(&scan, true).unwrap().measurement();
    assert_relative_eq!(measurement.err_up, 0.005, max_relative = 0.05);
    assert_relative_eq!(measurement.err_down, 0.010, max_relative = 0.05);
}
