//! # Record Sources
//!
//! A record source yields merge triples. The accumulator stays source-agnostic:
//! how a source obtains its data (HTTP, files, scraping) is its own concern.

use crate::model::{Key, Triple, Value};
use anyhow::{anyhow, bail, Context, Result};

/// Marker some statistics APIs use for a missing observation.
pub const MISSING_OBSERVATION: &str = ".";

/// Anything that can produce `(path, metric, value)` triples.
pub trait RecordSource {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Produce every triple of this source.
    fn triples(&mut self) -> Result<Vec<Triple>>;
}

/// A fixed list of triples.
#[derive(Debug, Clone)]
pub struct VecSource {
    name: String,
    triples: Vec<Triple>,
}

impl VecSource {
    pub fn new(name: impl Into<String>, triples: Vec<Triple>) -> Self {
        Self {
            name: name.into(),
            triples,
        }
    }
}

impl RecordSource for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn triples(&mut self) -> Result<Vec<Triple>> {
        Ok(std::mem::take(&mut self.triples))
    }
}

/// Observation series keyed by date, as returned by series-observation APIs:
///
/// ```json
/// {"observations": [{"date": "2020-01-01", "value": "3.5"}]}
/// ```
///
/// Every observation becomes one triple for `metric` at path `[date]`, or at
/// `prefix + [date]` for deeper trees. Observations whose value is the
/// missing marker are skipped. A payload carrying `error_code` fails the
/// source.
#[derive(Debug, Clone)]
pub struct SeriesSource {
    name: String,
    metric: String,
    prefix: Vec<Key>,
    payload: serde_json::Value,
}

impl SeriesSource {
    pub fn new(name: impl Into<String>, metric: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            metric: metric.into(),
            prefix: Vec::new(),
            payload,
        }
    }

    /// Parse the payload from raw response text.
    pub fn parse(
        name: impl Into<String>,
        metric: impl Into<String>,
        body: &str,
    ) -> Result<Self> {
        let name = name.into();
        let payload = serde_json::from_str(body)
            .with_context(|| format!("source {name} returned invalid JSON"))?;
        Ok(Self::new(name, metric, payload))
    }

    /// Nest the series under fixed leading dimension values.
    pub fn with_prefix(mut self, prefix: Vec<Key>) -> Self {
        self.prefix = prefix;
        self
    }
}

impl RecordSource for SeriesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn triples(&mut self) -> Result<Vec<Triple>> {
        if let Some(code) = self.payload.get("error_code") {
            let message = self
                .payload
                .get("error_message")
                .and_then(|m| m.as_str())
                .unwrap_or("no message");
            bail!("source {} reported error {code}: {message}", self.name);
        }
        let observations = self
            .payload
            .get("observations")
            .and_then(|o| o.as_array())
            .ok_or_else(|| anyhow!("source {} has no observations array", self.name))?;

        let mut triples = Vec::with_capacity(observations.len());
        for observation in observations {
            let date = observation
                .get("date")
                .and_then(Key::from_json)
                .ok_or_else(|| anyhow!("observation without date in {}", self.name))?;
            let raw = observation.get("value").unwrap_or(&serde_json::Value::Null);
            if raw.as_str() == Some(MISSING_OBSERVATION) {
                continue;
            }
            let value = Value::from_json(raw)
                .ok_or_else(|| anyhow!("observation {date} in {} is not a scalar", self.name))?;

            let mut path = self.prefix.clone();
            path.push(date);
            triples.push(Triple::new(path, self.metric.clone(), value));
        }
        Ok(triples)
    }
}

/// A nested JSON document shaped like the record tree itself. Each nesting
/// level is one dimension; objects of scalars are leaves.
#[derive(Debug, Clone)]
pub struct NestedSource {
    name: String,
    depth: usize,
    document: serde_json::Value,
}

impl NestedSource {
    pub fn new(name: impl Into<String>, depth: usize, document: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            depth,
            document,
        }
    }
}

impl RecordSource for NestedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn triples(&mut self) -> Result<Vec<Triple>> {
        let mut triples = Vec::new();
        let mut stack: Vec<(Vec<Key>, &serde_json::Value)> = vec![(Vec::new(), &self.document)];

        while let Some((path, node)) = stack.pop() {
            let object = node
                .as_object()
                .ok_or_else(|| anyhow!("source {}: expected an object at depth {}", self.name, path.len()))?;
            if path.len() == self.depth {
                for (metric, raw) in object {
                    let value = Value::from_json(raw)
                        .ok_or_else(|| anyhow!("source {}: metric {metric} is not a scalar", self.name))?;
                    triples.push(Triple::new(path.clone(), metric.clone(), value));
                }
                continue;
            }
            for (key, child) in object {
                let mut child_path = path.clone();
                child_path.push(Key::from(key));
                stack.push((child_path, child));
            }
        }
        Ok(triples)
    }
}
