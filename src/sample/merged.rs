use crate::sample::Sample;

/// A sample which is the sum of its children.
///
/// File name, tree, flags, luminosity and colours are taken from the first child.
#[derive(Clone, Debug)]
pub struct MergedSample {
    /// Short name used for histograms and files
    pub name: String,
    /// Title used in legends and tables
    pub title: String,
    /// Extra labels used for matching
    pub tags: Vec<String>,
    pub(crate) samples: Vec<Sample>,
    /// Multiplier applied on top of the children's own normalization
    pub scale: f64,
    pub(crate) scale0: f64,
    /// Observed data
    pub isdata: bool,
    /// Expected background
    pub isexp: bool,
    /// Signal
    pub issignal: bool,
    /// Embedded
    pub isembed: bool,
    /// Fill colour
    pub fillcolor: Option<String>,
    /// Line colour
    pub linecolor: Option<String>,
    /// Logical subcomponents
    pub splits: Vec<Sample>,
}

impl MergedSample {
    /// Merge `samples` under a new name.
    pub fn new<N: Into<String>, T: Into<String>>(name: N, title: T, samples: Vec<Sample>) -> Self {
        let mut merged = Self {
            name: name.into(),
            title: title.into(),
            tags: Vec::new(),
            samples: Vec::new(),
            scale: 1.0,
            scale0: 1.0,
            isdata: false,
            isexp: true,
            issignal: false,
            isembed: false,
            fillcolor: None,
            linecolor: None,
            splits: Vec::new(),
        };
        for sample in samples {
            merged.add(sample);
        }
        merged
    }

    /// Append a child; the first child sets the flags and colours.
    pub fn add(&mut self, sample: Sample) {
        if self.samples.is_empty() {
            self.isdata = sample.is_data();
            self.isexp = sample.is_exp();
            self.issignal = sample.is_signal();
            self.isembed = sample.is_embed();
            self.fillcolor = sample.fillcolor().map(str::to_string);
            self.linecolor = sample.linecolor().map(str::to_string);
        }
        self.samples.push(sample);
    }

    /// The children.
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// The children, mutably.
    pub fn samples_mut(&mut self) -> &mut Vec<Sample> {
        &mut self.samples
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Returns `true` if there are no children.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The file of the first child.
    pub fn filename(&self) -> &str {
        self.samples.first().map_or("", Sample::filename)
    }

    /// The tree of the first child.
    pub fn tree_name(&self) -> &str {
        self.samples
            .first()
            .map_or(crate::data::DEFAULT_TREE, Sample::tree_name)
    }

    /// The luminosity of the first child.
    pub fn lumi(&self) -> f64 {
        self.samples.first().map_or(0.0, Sample::lumi)
    }

    /// Total number of processed events of the children.
    pub fn nevents(&self) -> f64 {
        self.samples.iter().map(Sample::nevents).sum()
    }

    /// Total sum of weights of the children.
    pub fn sumweights(&self) -> f64 {
        self.samples.iter().map(Sample::sumweights).sum()
    }
}
