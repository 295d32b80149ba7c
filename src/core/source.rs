use anyhow::Result;

/// Read access to the traces of one trace set
///
/// Indices are local to the set (0-based). Implementations:
/// - `TraceBatch`: everything held in memory (native and DPAv3 loaders)
/// - test doubles
pub trait TraceSource {
    /// Number of traces in the set
    fn num_traces(&self) -> usize;

    /// Samples per trace
    fn num_points(&self) -> usize;

    /// Samples of trace `n`
    fn get_trace(&self, n: usize) -> Result<Vec<f64>>;

    /// Plaintext sent to the target for trace `n`
    fn get_textin(&self, n: usize) -> Result<Vec<u8>>;

    /// Ciphertext returned by the target for trace `n`
    fn get_textout(&self, n: usize) -> Result<Vec<u8>>;

    /// Key used during capture, if it was recorded
    fn known_key(&self) -> Option<Vec<u8>>;
}

/// A trace set held fully in memory
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceBatch {
    pub traces: Vec<Vec<f64>>,
    /// Empty when no plaintext was recorded
    pub textin: Vec<Vec<u8>>,
    /// Empty when no ciphertext was recorded
    pub textout: Vec<Vec<u8>>,
    pub known_key: Option<Vec<u8>>,
}

impl TraceBatch {
    pub fn new(traces: Vec<Vec<f64>>) -> Self {
        Self {
            traces,
            ..Default::default()
        }
    }

    /// Check that the text tables line up with the traces
    pub fn validate(&self) -> Result<()> {
        let points = self.num_points();
        if let Some(bad) = self.traces.iter().position(|t| t.len() != points) {
            anyhow::bail!(
                "Trace {} has {} samples, expected {}",
                bad,
                self.traces[bad].len(),
                points
            );
        }
        for (name, table) in [("textin", &self.textin), ("textout", &self.textout)] {
            if !table.is_empty() && table.len() != self.traces.len() {
                anyhow::bail!(
                    "{} has {} rows but there are {} traces",
                    name,
                    table.len(),
                    self.traces.len()
                );
            }
        }
        Ok(())
    }

    fn check_index(&self, n: usize) -> Result<()> {
        if n >= self.traces.len() {
            anyhow::bail!("Trace {} out of range (set holds {} traces)", n, self.traces.len());
        }
        Ok(())
    }
}

impl TraceSource for TraceBatch {
    fn num_traces(&self) -> usize {
        self.traces.len()
    }

    fn num_points(&self) -> usize {
        self.traces.first().map(|t| t.len()).unwrap_or(0)
    }

    fn get_trace(&self, n: usize) -> Result<Vec<f64>> {
        self.check_index(n)?;
        Ok(self.traces[n].clone())
    }

    fn get_textin(&self, n: usize) -> Result<Vec<u8>> {
        self.check_index(n)?;
        Ok(self.textin.get(n).cloned().unwrap_or_default())
    }

    fn get_textout(&self, n: usize) -> Result<Vec<u8>> {
        self.check_index(n)?;
        Ok(self.textout.get(n).cloned().unwrap_or_default())
    }

    fn known_key(&self) -> Option<Vec<u8>> {
        self.known_key.clone()
    }
}
