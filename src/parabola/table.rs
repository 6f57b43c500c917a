use std::{
    fmt::Write as _,
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::{config::FitSetup, TauFitError, TauFitResult};

use super::Measurement;

/// Measurements of one parameter per region (rows) and observable (columns).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeasurementTable {
    /// Column names
    pub observables: Vec<String>,
    /// One entry per observable for each region, `None` where the region was not measured
    pub rows: IndexMap<String, Vec<Option<Measurement>>>,
}

#[derive(Serialize, Deserialize)]
struct JsonMeasurement {
    observable: String,
    fit_value: f64,
    down_variation: f64,
    up_variation: f64,
}

#[derive(Serialize, Deserialize)]
struct JsonRegion {
    selection: String,
    measurements: Vec<Option<JsonMeasurement>>,
}

#[derive(Serialize, Deserialize)]
struct JsonTable {
    #[serde(rename = "baselineCuts")]
    baseline_cuts: String,
    regions: IndexMap<String, JsonRegion>,
}

fn create<P: AsRef<Path>>(path: P) -> TauFitResult<BufWriter<File>> {
    if let Some(parent) = path.as_ref().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

impl MeasurementTable {
    /// An empty table with the given columns.
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(observables: I) -> Self {
        Self {
            observables: observables.into_iter().map(Into::into).collect(),
            rows: IndexMap::new(),
        }
    }

    /// Set the measurement of `region` with `observable`, adding the row if needed.
    pub fn insert(&mut self, region: &str, observable: &str, measurement: Option<Measurement>) {
        let ncols = self.observables.len();
        let row = self
            .rows
            .entry(region.to_string())
            .or_insert_with(|| vec![None; ncols]);
        if let Some(j) = self.observables.iter().position(|obs| obs == observable) {
            row[j] = measurement;
        }
    }

    /// The measurement of `region` with `observable`.
    pub fn get(&self, region: &str, observable: &str) -> Option<Measurement> {
        let j = self.observables.iter().position(|obs| obs == observable)?;
        self.rows.get(region)?.get(j).copied().flatten()
    }

    /// Whether any region has a measurement with a finite value.
    pub fn has_measurements(&self) -> bool {
        self.rows
            .values()
            .flatten()
            .any(|m| m.is_some_and(|m| m.value.is_finite()))
    }

    /// Render as text: a header line, then one line per region with
    /// `value err_down err_up` for every observable (`-` where missing).
    pub fn to_txt(&self) -> String {
        let mut text = format!("{:<10}", "region");
        for observable in &self.observables {
            let _ = write!(text, " {observable:>32}");
        }
        text.push('\n');
        for (region, row) in &self.rows {
            let _ = write!(text, "{region:<10}");
            for measurement in row {
                let _ = match measurement {
                    Some(m) => write!(
                        text,
                        " {:10.4} {:10.4} {:10.4}",
                        m.value, m.err_down, m.err_up
                    ),
                    None => write!(text, " {:>10} {:>10} {:>10}", "-", "-", "-"),
                };
            }
            text.push('\n');
        }
        text
    }

    /// Parse the text format written by [`MeasurementTable::to_txt`]. Triplets that are not
    /// numbers are read as missing.
    pub fn from_txt<R: BufRead>(reader: R) -> TauFitResult<Self> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .transpose()?
            .ok_or_else(|| TauFitError::Custom("Empty measurement table".to_string()))?;
        let mut table = Self::new(header.split_whitespace().skip(1));
        for line in lines {
            let line = line?;
            let columns: Vec<&str> = line.split_whitespace().collect();
            let Some((region, values)) = columns.split_first() else {
                continue;
            };
            let row = values
                .chunks_exact(3)
                .map(|triplet| {
                    let parsed: Result<Vec<f64>, _> =
                        triplet.iter().map(|s| s.parse::<f64>()).collect();
                    parsed.ok().map(|v| Measurement::new(v[0], v[1], v[2]))
                })
                .collect();
            table.rows.insert(region.to_string(), row);
        }
        Ok(table)
    }

    /// Write the text format to `path`.
    pub fn write_txt<P: AsRef<Path>>(&self, path: P) -> TauFitResult<()> {
        let mut writer = create(&path)?;
        writer.write_all(self.to_txt().as_bytes())?;
        writer.flush()?;
        log::info!("Created text file '{}'", path.as_ref().display());
        Ok(())
    }

    /// Read the text format from `path`.
    pub fn read_txt<P: AsRef<Path>>(path: P) -> TauFitResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(TauFitError::MissingFile {
                path: path.display().to_string(),
            });
        }
        Self::from_txt(BufReader::new(File::open(path)?))
    }

    /// Write as JSON, with the baseline cuts of `setup` and each region's definition.
    pub fn write_json<P: AsRef<Path>>(&self, setup: &FitSetup, path: P) -> TauFitResult<()> {
        let regions = self
            .rows
            .iter()
            .map(|(region, row)| {
                let selection = setup
                    .regions
                    .get(region)
                    .map(|r| r.definition.clone())
                    .unwrap_or_default();
                let measurements = row
                    .iter()
                    .zip(&self.observables)
                    .map(|(m, observable)| {
                        m.map(|m| JsonMeasurement {
                            observable: observable.clone(),
                            fit_value: m.value,
                            down_variation: m.err_down,
                            up_variation: m.err_up,
                        })
                    })
                    .collect();
                (
                    region.clone(),
                    JsonRegion {
                        selection,
                        measurements,
                    },
                )
            })
            .collect();
        let table = JsonTable {
            baseline_cuts: setup.baseline_cuts.clone(),
            regions,
        };
        let mut writer = create(&path)?;
        serde_json::to_writer_pretty(&mut writer, &table)?;
        writer.flush()?;
        log::info!("Created JSON file '{}'", path.as_ref().display());
        Ok(())
    }
}

/// Inverse-variance weighted average of measurements, using the larger of the two errors of
/// each. Measurements with a missing or non-positive error are skipped.
pub fn combine_measurements(measurements: &[Measurement]) -> Measurement {
    let (mut sum, mut sumw) = (0.0, 0.0);
    for m in measurements {
        let error = m.err_down.max(m.err_up);
        if !m.value.is_finite() || !error.is_finite() || error <= 0.0 {
            log::warn!("Skipping measurement {m:?} in combination");
            continue;
        }
        let weight = error.powi(-2);
        sum += weight * m.value;
        sumw += weight;
    }
    if sumw == 0.0 {
        return Measurement::new(f64::NAN, f64::NAN, f64::NAN);
    }
    let error = sumw.sqrt().recip();
    Measurement::new(sum / sumw, error, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn table() -> MeasurementTable {
        let mut table = MeasurementTable::new(["m_vis", "m_2"]);
        table.insert("DM0", "m_vis", Some(Measurement::new(0.987, 0.012, 0.01)));
        table.insert("DM0", "m_2", None);
        table.insert("DM1", "m_2", Some(Measurement::new(1.004, 0.005, 0.006)));
        table
    }

    #[test]
    fn test_txt_format() {
        let text = table().to_txt();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("DM0       "));
        assert!(lines[1].contains("     0.9870     0.0120     0.0100"));
        assert!(lines[1].ends_with("          -          -          -"));
        let read = MeasurementTable::from_txt(text.as_bytes()).unwrap();
        assert_eq!(read.observables, vec!["m_vis", "m_2"]);
        assert_eq!(read.get("DM0", "m_2"), None);
        assert_eq!(read.get("DM1", "m_vis"), None);
        let m = read.get("DM1", "m_2").unwrap();
        assert_relative_eq!(m.value, 1.004);
        assert_relative_eq!(m.err_up, 0.006);
        assert!(read.has_measurements());
        assert!(!MeasurementTable::new(["m_vis"]).has_measurements());
    }

    #[test]
    fn test_json_format() {
        let setup = FitSetup::from_json_str(
            r#"{"channel": "mutau", "baselineCuts": "iso_1<0.15",
                "regions": {"DM0": {"title": "DM0", "definition": "dm_2==0"}}}"#,
        )
        .unwrap();
        let path = std::env::temp_dir().join(format!(
            "taufit_measurement_{}_{}.json",
            std::process::id(),
            fastrand::u64(..)
        ));
        table().write_json(&setup, &path).unwrap();
        let value: serde_json::Value =
            serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(value["baselineCuts"], "iso_1<0.15");
        assert_eq!(value["regions"]["DM0"]["selection"], "dm_2==0");
        assert_eq!(value["regions"]["DM0"]["measurements"][0]["fit_value"], 0.987);
        assert!(value["regions"]["DM0"]["measurements"][1].is_null());
        assert_eq!(value["regions"]["DM1"]["selection"], "");
    }

    #[test]
    fn test_combine() {
        let combined = combine_measurements(&[
            Measurement::new(1.0, 0.01, 0.005),
            Measurement::new(1.03, 0.01, 0.01),
            Measurement::new(f64::NAN, 0.01, 0.01),
        ]);
        assert_relative_eq!(combined.value, 1.015);
        assert_relative_eq!(combined.err_down, 0.01 / 2f64.sqrt(), epsilon = 1e-12);
        assert!(combine_measurements(&[]).value.is_nan());
    }
}
