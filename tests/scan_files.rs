use approx::assert_relative_eq;
use taufit::{
    config::FitSetup,
    data::{io::write_root, EventTable, FileSource},
    parabola::{measure_scans, scan_path, write_measurements, MeasurementTable, ScanOptions},
};

const SETUP: &str = r#"{
    "channel": "mutau",
    "baselineCuts": "iso_1<0.15",
    "observables": {"m_vis": {"binning": [10, 50, 150]}},
    "regions": {
        "DM0": {"title": "h", "definition": "dm_2==0"},
        "DM1": {"title": "h pi0", "definition": "dm_2==1"}
    }
}"#;

fn scan_table(branch: &str, center: f64, err_down: f64, err_up: f64) -> EventTable {
    let mut poi = vec![center];
    let mut nll = vec![0.0];
    for i in 0..=40 {
        let x = 0.96 + 0.002 * i as f64;
        let err = if x < center { err_down } else { err_up };
        poi.push(x);
        nll.push(0.5 * ((x - center) / err).powi(2) + 0.01);
    }
    let n = poi.len();
    EventTable::from_columns([
        (branch.to_string(), poi),
        ("deltaNLL".to_string(), nll),
        ("quantileExpected".to_string(), vec![1.0; n]),
    ])
    .unwrap()
}

#[test]
fn measure_scans_from_root_files() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = std::env::temp_dir().join(format!(
        "taufit_scans_{}_{}",
        std::process::id(),
        fastrand::u64(..)
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let indir = dir.to_string_lossy().into_owned();
    for (region, center, down, up) in [("DM0", 0.99, 0.008, 0.008), ("DM1", 1.00, 0.012, 0.006)] {
        let path = scan_path(&indir, "mt", "m_vis", region, "", "UL2018-13TeV");
        let table = scan_table(&format!("tes_{region}"), center, down, up);
        write_root(&path, &[("limit", &table)], None).unwrap();
    }

    let setup = FitSetup::from_json_str(SETUP).unwrap();
    let options = ScanOptions::new(indir, "UL2018-13TeV").with_fit(true);
    let results = measure_scans(&FileSource::new(), &setup, &options).unwrap();

    let dm0 = results.direct.get("DM0", "m_vis").unwrap();
    assert_relative_eq!(dm0.value, 0.99, epsilon = 1e-6);
    assert_relative_eq!(dm0.err_down, 0.008, epsilon = 1e-4);
    let dm1 = results.fit.as_ref().unwrap().get("DM1", "m_vis").unwrap();
    assert_relative_eq!(dm1.value, 1.00, epsilon = 1e-3);
    assert_relative_eq!(dm1.err_down, 0.012, max_relative = 0.05);
    assert_relative_eq!(dm1.err_up, 0.006, max_relative = 0.05);

    let written = write_measurements(&results, &setup, &dir, &options).unwrap();
    assert_eq!(written.len(), 4);
    let read = MeasurementTable::read_txt(dir.join("measurement_tes_mt_fit_asymm.txt")).unwrap();
    assert_relative_eq!(read.get("DM1", "m_vis").unwrap().err_up, 0.006, epsilon = 5e-4);
    std::fs::remove_dir_all(&dir).unwrap();
}
