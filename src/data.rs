use std::{fmt::Debug, path::Path, sync::Arc};

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{expression::Expression, utils::glob_to_regex, TauFitError, TauFitResult};

/// ROOT and Parquet readers.
pub mod io;

pub use io::FileSource;

/// Default name of the event tree in an input file.
pub const DEFAULT_TREE: &str = "tree";
/// Name of the cutflow object (a tree for ROOT files, a metadata key for Parquet files).
pub const CUTFLOW_NAME: &str = "cutflow";

/// A set of named `f64` columns of equal length.
///
/// Columns are reference counted so that tables derived from one another (e.g. after adding an
/// alias) share the underlying buffers.
#[derive(Clone, Debug, Default)]
pub struct EventTable {
    n_rows: usize,
    columns: IndexMap<String, Arc<Vec<f64>>>,
}

impl EventTable {
    /// An empty table with a fixed number of rows.
    pub fn new(n_rows: usize) -> Self {
        Self {
            n_rows,
            columns: IndexMap::new(),
        }
    }

    /// Build a table from `(name, values)` pairs, checking that all columns have the same length.
    pub fn from_columns<I, S>(columns: I) -> TauFitResult<Self>
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let mut table: Option<EventTable> = None;
        for (name, values) in columns {
            let table = table.get_or_insert_with(|| EventTable::new(values.len()));
            table.insert_column(name, values)?;
        }
        Ok(table.unwrap_or_default())
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    /// Returns `true` if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.n_rows == 0
    }

    /// Look up a column by name.
    pub fn column(&self, name: &str) -> Option<&Arc<Vec<f64>>> {
        self.columns.get(name)
    }

    /// Returns `true` if the column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Add (or overwrite) a column.
    pub fn insert_column<S: Into<String>>(&mut self, name: S, values: Vec<f64>) -> TauFitResult<()> {
        self.insert_shared(name, Arc::new(values))
    }

    /// Add (or overwrite) a column backed by an existing buffer.
    pub fn insert_shared<S: Into<String>>(
        &mut self,
        name: S,
        values: Arc<Vec<f64>>,
    ) -> TauFitResult<()> {
        let name = name.into();
        if self.columns.is_empty() && self.n_rows == 0 {
            self.n_rows = values.len();
        }
        if values.len() != self.n_rows {
            return Err(TauFitError::LengthMismatch {
                context: format!("Column '{name}'"),
                expected: self.n_rows,
                actual: values.len(),
            });
        }
        self.columns.insert(name, values);
        Ok(())
    }

    /// Copy the listed columns of `other` into this table.
    pub fn extend_from(&mut self, other: &EventTable) -> TauFitResult<()> {
        for (name, values) in &other.columns {
            self.insert_shared(name.clone(), values.clone())?;
        }
        Ok(())
    }
}

/// The cutflow histogram of an input file, as a list of bin contents.
///
/// Bins are numbered from 1 like the histogram convention `binnevts` and `binsumw` refer to.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cutflow(pub Vec<f64>);

impl Cutflow {
    /// Content of the (one-based) bin, zero when out of range.
    pub fn bin_content(&self, bin: usize) -> f64 {
        if bin == 0 {
            return 0.0;
        }
        self.0.get(bin - 1).copied().unwrap_or(0.0)
    }

    /// Number of bins.
    pub fn n_bins(&self) -> usize {
        self.0.len()
    }
}

/// A branch enable/disable command, written as `keep <pattern>` or `drop <pattern>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchSelection {
    /// Enable all branches matching the glob pattern.
    Keep(String),
    /// Disable all branches matching the glob pattern.
    Drop(String),
}

impl std::str::FromStr for BranchSelection {
    type Err = TauFitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("keep"), Some(pattern), None) => Ok(Self::Keep(pattern.to_string())),
            (Some("drop"), Some(pattern), None) => Ok(Self::Drop(pattern.to_string())),
            _ => Err(TauFitError::ParseError {
                name: s.to_string(),
                object: "BranchSelection".to_string(),
            }),
        }
    }
}

/// Apply keep/drop commands in order to the branch list; the last matching command wins.
pub fn select_branches(
    branches: &[String],
    selections: &[BranchSelection],
) -> TauFitResult<Vec<String>> {
    let mut enabled = vec![true; branches.len()];
    for selection in selections {
        let (pattern, status) = match selection {
            BranchSelection::Keep(pattern) => (pattern, true),
            BranchSelection::Drop(pattern) => (pattern, false),
        };
        let re = Regex::new(&format!("^{}$", glob_to_regex(pattern)))?;
        for (branch, flag) in branches.iter().zip(enabled.iter_mut()) {
            if re.is_match(branch) {
                log::debug!("select_branches: {} '{}'", if status { "keep" } else { "drop" }, branch);
                *flag = status;
            }
        }
    }
    Ok(branches
        .iter()
        .zip(enabled)
        .filter(|(_, flag)| *flag)
        .map(|(branch, _)| branch.clone())
        .collect())
}

/// Options controlling how a sample's tree is read.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReadOptions {
    /// Name of the event tree. Defaults to [`DEFAULT_TREE`].
    pub tree: Option<String>,
    /// Branch enable/disable commands, applied in order.
    pub branch_selections: Vec<BranchSelection>,
    /// Aliases registered on the tree before any expression is evaluated.
    pub aliases: IndexMap<String, Expression>,
}

impl ReadOptions {
    /// Create a new [`Default`] set of [`ReadOptions`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the tree name.
    pub fn tree<S: Into<String>>(mut self, name: S) -> Self {
        self.tree = Some(name.into());
        self
    }

    /// Append branch selection commands such as `"drop *"` or `"keep pt_*"`.
    pub fn branch_selections<I, S>(mut self, commands: I) -> TauFitResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for command in commands {
            self.branch_selections.push(command.as_ref().parse()?);
        }
        Ok(self)
    }

    /// Register an alias `name -> expression`.
    pub fn alias<S: Into<String>, E: Into<Expression>>(mut self, name: S, expression: E) -> Self {
        self.aliases.insert(name.into(), expression.into());
        self
    }

    /// The tree name to use.
    pub fn tree_name(&self) -> &str {
        self.tree.as_deref().unwrap_or(DEFAULT_TREE)
    }
}

/// The narrow interface through which every file-backed object reads its events.
pub trait EventSource: Send + Sync + Debug {
    /// Returns `true` if the file can be opened.
    fn exists(&self, path: &str) -> bool;
    /// List the scalar branches of `tree` in `path`.
    fn branches(&self, path: &str, tree: &str) -> TauFitResult<Vec<String>>;
    /// Read the named branches of `tree` in `path`.
    fn read(&self, path: &str, tree: &str, branches: &[String]) -> TauFitResult<EventTable>;
    /// Read the cutflow of `path`, if it has one.
    fn cutflow(&self, path: &str) -> TauFitResult<Option<Cutflow>>;
}

#[derive(Clone, Debug, Default)]
struct MemoryFile {
    trees: IndexMap<String, EventTable>,
    cutflow: Option<Cutflow>,
}

/// An [`EventSource`] which serves in-memory tables by file name.
#[derive(Clone, Debug, Default)]
pub struct MemorySource {
    files: IndexMap<String, MemoryFile>,
}

impl MemorySource {
    /// Create an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tree under a file name.
    pub fn with_tree<P: Into<String>, T: Into<String>>(
        mut self,
        path: P,
        tree: T,
        table: EventTable,
    ) -> Self {
        self.files
            .entry(path.into())
            .or_default()
            .trees
            .insert(tree.into(), table);
        self
    }

    /// Register a cutflow under a file name.
    pub fn with_cutflow<P: Into<String>>(mut self, path: P, cutflow: Cutflow) -> Self {
        self.files.entry(path.into()).or_default().cutflow = Some(cutflow);
        self
    }

    /// Wrap the source for sharing between samples.
    pub fn shared(self) -> Arc<dyn EventSource> {
        Arc::new(self)
    }

    fn tree(&self, path: &str, tree: &str) -> TauFitResult<&EventTable> {
        self.files
            .get(path)
            .ok_or_else(|| TauFitError::MissingFile {
                path: path.to_string(),
            })?
            .trees
            .get(tree)
            .ok_or_else(|| TauFitError::MissingTree {
                path: path.to_string(),
                tree: tree.to_string(),
            })
    }
}

impl EventSource for MemorySource {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn branches(&self, path: &str, tree: &str) -> TauFitResult<Vec<String>> {
        Ok(self
            .tree(path, tree)?
            .column_names()
            .map(str::to_string)
            .collect())
    }

    fn read(&self, path: &str, tree: &str, branches: &[String]) -> TauFitResult<EventTable> {
        let table = self.tree(path, tree)?;
        let mut out = EventTable::new(table.n_rows());
        for branch in branches {
            let column = table
                .column(branch)
                .ok_or_else(|| TauFitError::MissingColumn {
                    name: branch.clone(),
                })?;
            out.insert_shared(branch.clone(), column.clone())?;
        }
        Ok(out)
    }

    fn cutflow(&self, path: &str) -> TauFitResult<Option<Cutflow>> {
        Ok(self
            .files
            .get(path)
            .ok_or_else(|| TauFitError::MissingFile {
                path: path.to_string(),
            })?
            .cutflow
            .clone())
    }
}

/// Returns `true` if the path has a `.root` extension.
pub fn is_root_file(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("root"))
}
