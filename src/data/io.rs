//! ROOT and Parquet implementations of [`EventSource`].

use super::*;
use arrow::{
    array::{Array, ArrayRef, Float64Array},
    compute::cast,
    datatypes::{DataType, Field, Schema},
    record_batch::RecordBatch,
};
use oxyroot::{Branch, Named, RootFile, WriterTree};
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter, ProjectionMask},
    file::{metadata::KeyValue, properties::WriterProperties},
};
use std::{
    fs::File,
    path::{Path, PathBuf},
};

fn canonicalize_path(file_path: &str) -> TauFitResult<PathBuf> {
    Path::new(&*shellexpand::full(file_path)?)
        .canonicalize()
        .map_err(|_| TauFitError::MissingFile {
            path: file_path.to_string(),
        })
}

fn expand_output_path(file_path: &str) -> TauFitResult<PathBuf> {
    Ok(PathBuf::from(&*shellexpand::full(file_path)?))
}

fn map_root_error<E: std::fmt::Display>(context: &str, err: E) -> TauFitError {
    TauFitError::Custom(format!("{context}: {err}"))
}

/// Reads events from ROOT files (through `oxyroot`) or Parquet files, chosen by extension.
///
/// ROOT cutflows are stored as a one-branch tree named [`CUTFLOW_NAME`] with one entry per bin.
/// Parquet files carry no trees, so the tree name is ignored and the cutflow is a JSON list
/// stored under the [`CUTFLOW_NAME`] key of the file metadata.
#[derive(Clone, Copy, Debug, Default)]
pub struct FileSource;

impl FileSource {
    /// Create a new file-backed source.
    pub fn new() -> Self {
        Self
    }

    /// Wrap the source for sharing between samples.
    pub fn shared(self) -> Arc<dyn EventSource> {
        Arc::new(self)
    }
}

impl EventSource for FileSource {
    fn exists(&self, path: &str) -> bool {
        canonicalize_path(path).is_ok_and(|path| path.is_file())
    }

    fn branches(&self, path: &str, tree: &str) -> TauFitResult<Vec<String>> {
        if is_root_file(path) {
            root_branches(path, tree)
        } else {
            parquet_columns(path)
        }
    }

    fn read(&self, path: &str, tree: &str, branches: &[String]) -> TauFitResult<EventTable> {
        log::debug!("FileSource::read: {path}:{tree} {branches:?}");
        if is_root_file(path) {
            read_root_columns(path, tree, branches)
        } else {
            read_parquet_columns(path, branches)
        }
    }

    fn cutflow(&self, path: &str) -> TauFitResult<Option<Cutflow>> {
        if is_root_file(path) {
            read_root_cutflow(path)
        } else {
            read_parquet_cutflow(path)
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum RootScalarKind {
    F32,
    F64,
    I32,
    I64,
    U32,
    Bool,
}

fn branch_scalar_kind(branch: &Branch) -> Option<RootScalarKind> {
    let lower = branch.item_type_name().to_ascii_lowercase();
    if lower.contains("vector") || lower.contains('[') {
        return None;
    }
    match lower.as_str() {
        "float" | "float_t" | "float32_t" => Some(RootScalarKind::F32),
        "double" | "double_t" | "double32_t" => Some(RootScalarKind::F64),
        "int" | "int_t" | "int32_t" => Some(RootScalarKind::I32),
        "long" | "long64_t" | "int64_t" => Some(RootScalarKind::I64),
        "unsigned int" | "uint_t" | "uint32_t" => Some(RootScalarKind::U32),
        "bool" | "bool_t" => Some(RootScalarKind::Bool),
        _ => None,
    }
}

fn read_branch_values(branch: &Branch, kind: RootScalarKind) -> TauFitResult<Vec<f64>> {
    let context = format!("Failed to read branch '{}'", branch.name());
    let values = match kind {
        RootScalarKind::F32 => branch
            .as_iter::<f32>()
            .map_err(|err| map_root_error(&context, err))?
            .map(|value| value as f64)
            .collect(),
        RootScalarKind::F64 => branch
            .as_iter::<f64>()
            .map_err(|err| map_root_error(&context, err))?
            .collect(),
        RootScalarKind::I32 => branch
            .as_iter::<i32>()
            .map_err(|err| map_root_error(&context, err))?
            .map(|value| value as f64)
            .collect(),
        RootScalarKind::I64 => branch
            .as_iter::<i64>()
            .map_err(|err| map_root_error(&context, err))?
            .map(|value| value as f64)
            .collect(),
        RootScalarKind::U32 => branch
            .as_iter::<u32>()
            .map_err(|err| map_root_error(&context, err))?
            .map(|value| value as f64)
            .collect(),
        RootScalarKind::Bool => branch
            .as_iter::<bool>()
            .map_err(|err| map_root_error(&context, err))?
            .map(|value| if value { 1.0 } else { 0.0 })
            .collect(),
    };
    Ok(values)
}

fn open_root_file(file_path: &str) -> TauFitResult<RootFile> {
    let path = canonicalize_path(file_path)?;
    RootFile::open(&path).map_err(|err| {
        TauFitError::Custom(format!(
            "Failed to open ROOT file '{}': {err}",
            path.display()
        ))
    })
}

fn has_root_tree(file: &RootFile, tree: &str) -> bool {
    file.keys()
        .into_iter()
        .any(|key| key.class_name() == "TTree" && key.name() == tree)
}

fn root_branches(file_path: &str, tree_name: &str) -> TauFitResult<Vec<String>> {
    let mut file = open_root_file(file_path)?;
    if !has_root_tree(&file, tree_name) {
        return Err(TauFitError::MissingTree {
            path: file_path.to_string(),
            tree: tree_name.to_string(),
        });
    }
    let tree = file
        .get_tree(tree_name)
        .map_err(|err| map_root_error(&format!("Failed to open ROOT tree '{tree_name}'"), err))?;
    Ok(tree
        .branches()
        .filter(|branch| branch_scalar_kind(branch).is_some())
        .map(|branch| branch.name().to_string())
        .collect())
}

fn read_root_columns(
    file_path: &str,
    tree_name: &str,
    branches: &[String],
) -> TauFitResult<EventTable> {
    let mut file = open_root_file(file_path)?;
    if !has_root_tree(&file, tree_name) {
        return Err(TauFitError::MissingTree {
            path: file_path.to_string(),
            tree: tree_name.to_string(),
        });
    }
    let tree = file
        .get_tree(tree_name)
        .map_err(|err| map_root_error(&format!("Failed to open ROOT tree '{tree_name}'"), err))?;
    let lookup: IndexMap<&str, (RootScalarKind, &Branch)> = tree
        .branches()
        .filter_map(|branch| branch_scalar_kind(branch).map(|kind| (branch.name(), (kind, branch))))
        .collect();
    let mut table = EventTable::new(tree.entries().max(0) as usize);
    for name in branches {
        let (kind, branch) =
            lookup
                .get(name.as_str())
                .copied()
                .ok_or_else(|| TauFitError::MissingColumn {
                    name: name.clone(),
                })?;
        table.insert_column(name.clone(), read_branch_values(branch, kind)?)?;
    }
    Ok(table)
}

fn read_root_cutflow(file_path: &str) -> TauFitResult<Option<Cutflow>> {
    let mut file = open_root_file(file_path)?;
    if !has_root_tree(&file, CUTFLOW_NAME) {
        return Ok(None);
    }
    let tree = file.get_tree(CUTFLOW_NAME).map_err(|err| {
        map_root_error(&format!("Failed to open ROOT tree '{CUTFLOW_NAME}'"), err)
    })?;
    let branch = tree
        .branches()
        .find(|branch| branch.name() == CUTFLOW_NAME)
        .ok_or_else(|| TauFitError::MissingColumn {
            name: CUTFLOW_NAME.to_string(),
        })?;
    let kind = branch_scalar_kind(branch).ok_or_else(|| {
        TauFitError::Custom(format!(
            "Cutflow branch in '{file_path}' has unsupported type '{}'",
            branch.item_type_name()
        ))
    })?;
    Ok(Some(Cutflow(read_branch_values(branch, kind)?)))
}

fn parquet_builder(file_path: &str) -> TauFitResult<ParquetRecordBatchReaderBuilder<File>> {
    let path = canonicalize_path(file_path)?;
    let file = File::open(path)?;
    Ok(ParquetRecordBatchReaderBuilder::try_new(file)?)
}

fn is_numeric(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Float32
            | DataType::Float64
            | DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
            | DataType::Boolean
    )
}

fn parquet_columns(file_path: &str) -> TauFitResult<Vec<String>> {
    let builder = parquet_builder(file_path)?;
    Ok(builder
        .schema()
        .fields()
        .iter()
        .filter(|field| is_numeric(field.data_type()))
        .map(|field| field.name().clone())
        .collect())
}

fn float_values(column: &ArrayRef, name: &str) -> TauFitResult<Vec<f64>> {
    let column = cast(column, &DataType::Float64)?;
    let values = column
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| TauFitError::Custom(format!("Column '{name}' could not be read as f64")))?;
    Ok(values.values().iter().copied().collect())
}

fn read_parquet_columns(file_path: &str, branches: &[String]) -> TauFitResult<EventTable> {
    let builder = parquet_builder(file_path)?;
    let n_rows = builder.metadata().file_metadata().num_rows().max(0) as usize;
    let schema = builder.schema().clone();
    let mut indices = Vec::with_capacity(branches.len());
    for name in branches {
        let (index, field) = schema
            .column_with_name(name)
            .ok_or_else(|| TauFitError::MissingColumn { name: name.clone() })?;
        if !is_numeric(field.data_type()) {
            return Err(TauFitError::Custom(format!(
                "Column '{name}' has unsupported type {}",
                field.data_type()
            )));
        }
        indices.push(index);
    }
    let mask = ProjectionMask::roots(builder.parquet_schema(), indices);
    let reader = builder.with_projection(mask).build()?;
    let mut columns: IndexMap<&str, Vec<f64>> = branches
        .iter()
        .map(|name| (name.as_str(), Vec::with_capacity(n_rows)))
        .collect();
    for batch in reader {
        let batch = batch?;
        for (name, values) in columns.iter_mut() {
            let column = batch
                .column_by_name(name)
                .ok_or_else(|| TauFitError::MissingColumn {
                    name: name.to_string(),
                })?;
            values.extend(float_values(column, name)?);
        }
    }
    let mut table = EventTable::new(n_rows);
    for (name, values) in columns {
        table.insert_column(name, values)?;
    }
    Ok(table)
}

fn read_parquet_cutflow(file_path: &str) -> TauFitResult<Option<Cutflow>> {
    let builder = parquet_builder(file_path)?;
    let value = builder
        .metadata()
        .file_metadata()
        .key_value_metadata()
        .and_then(|entries| {
            entries
                .iter()
                .find(|entry| entry.key == CUTFLOW_NAME)
                .and_then(|entry| entry.value.clone())
        });
    match value {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Write one or more trees to a ROOT file, plus an optional cutflow tree.
pub fn write_root(
    file_path: &str,
    trees: &[(&str, &EventTable)],
    cutflow: Option<&Cutflow>,
) -> TauFitResult<()> {
    let path = expand_output_path(file_path)?;
    let mut file = RootFile::create(&path).map_err(|err| {
        TauFitError::Custom(format!(
            "Failed to create ROOT file '{}': {err}",
            path.display()
        ))
    })?;
    let mut write_tree = |name: &str, columns: Vec<(String, Vec<f64>)>| -> TauFitResult<()> {
        let mut tree = WriterTree::new(name);
        for (branch, values) in columns {
            tree.new_branch(branch, values.into_iter());
        }
        tree.write(&mut file).map_err(|err| {
            TauFitError::Custom(format!(
                "Failed to write ROOT tree '{name}' to '{}': {err}",
                path.display()
            ))
        })
    };
    for (name, table) in trees {
        let columns = table
            .column_names()
            .filter_map(|column| {
                table
                    .column(column)
                    .map(|values| (column.to_string(), values.as_ref().clone()))
            })
            .collect();
        write_tree(name, columns)?;
    }
    if let Some(cutflow) = cutflow {
        write_tree(
            CUTFLOW_NAME,
            vec![(CUTFLOW_NAME.to_string(), cutflow.0.clone())],
        )?;
    }
    file.close().map_err(|err| {
        TauFitError::Custom(format!(
            "Failed to close ROOT file '{}': {err}",
            path.display()
        ))
    })
}

/// Write a table to a Parquet file, storing the cutflow (if any) in the file metadata.
pub fn write_parquet(
    file_path: &str,
    table: &EventTable,
    cutflow: Option<&Cutflow>,
) -> TauFitResult<()> {
    let path = expand_output_path(file_path)?;
    let fields: Vec<Field> = table
        .column_names()
        .map(|name| Field::new(name, DataType::Float64, false))
        .collect();
    let schema = Arc::new(Schema::new(fields));
    let arrays: Vec<ArrayRef> = table
        .column_names()
        .filter_map(|name| table.column(name))
        .map(|values| Arc::new(Float64Array::from(values.as_ref().clone())) as ArrayRef)
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays)?;
    let properties = match cutflow {
        Some(cutflow) => WriterProperties::builder()
            .set_key_value_metadata(Some(vec![KeyValue::new(
                CUTFLOW_NAME.to_string(),
                serde_json::to_string(cutflow)?,
            )]))
            .build(),
        None => WriterProperties::builder().build(),
    };
    let file = File::create(&path)?;
    let mut writer = ArrowWriter::try_new(file, schema, Some(properties))
        .map_err(|err| TauFitError::Custom(format!("Failed to create Parquet writer: {err}")))?;
    writer
        .write(&batch)
        .map_err(|err| TauFitError::Custom(format!("Failed to write Parquet batch: {err}")))?;
    writer
        .close()
        .map_err(|err| TauFitError::Custom(format!("Failed to finalise Parquet file: {err}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_path(name: &str) -> String {
        let mut path = env::temp_dir();
        path.push(format!("taufit_io_{}_{name}", std::process::id()));
        path.to_string_lossy().into_owned()
    }

    fn sample_table() -> EventTable {
        EventTable::from_columns([
            ("m_vis", vec![45.0, 91.0, 120.0]),
            ("pt_1", vec![25.0, 30.5, 60.0]),
        ])
        .unwrap()
    }

    #[test]
    fn test_parquet_roundtrip_with_cutflow() {
        let path = temp_path("events.parquet");
        let cutflow = Cutflow(vec![100.0, 10.0, 5.0]);
        write_parquet(&path, &sample_table(), Some(&cutflow)).unwrap();
        let source = FileSource::new();
        assert!(source.exists(&path));
        assert_eq!(
            source.branches(&path, DEFAULT_TREE).unwrap(),
            vec!["m_vis".to_string(), "pt_1".to_string()]
        );
        let table = source.read(&path, DEFAULT_TREE, &["pt_1".to_string()]).unwrap();
        assert_eq!(table.n_rows(), 3);
        assert_eq!(table.column("pt_1").unwrap().as_slice(), &[25.0, 30.5, 60.0]);
        assert!(!table.has_column("m_vis"));
        assert_eq!(source.cutflow(&path).unwrap(), Some(cutflow));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_root_roundtrip_with_cutflow() {
        let path = temp_path("events.root");
        let cutflow = Cutflow(vec![1000.0, 1.5e4]);
        write_root(&path, &[("tree", &sample_table())], Some(&cutflow)).unwrap();
        let source = FileSource::new();
        let table = source
            .read(&path, "tree", &["m_vis".to_string(), "pt_1".to_string()])
            .unwrap();
        assert_eq!(table.column("m_vis").unwrap().as_slice(), &[45.0, 91.0, 120.0]);
        assert_eq!(source.cutflow(&path).unwrap().unwrap().bin_content(2), 1.5e4);
        assert!(matches!(
            source.read(&path, "other", &[]),
            Err(TauFitError::MissingTree { .. })
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_file() {
        let source = FileSource::new();
        assert!(!source.exists("/nonexistent/taufit.root"));
        assert!(matches!(
            source.cutflow("/nonexistent/taufit.parquet"),
            Err(TauFitError::MissingFile { .. })
        ));
    }
}
