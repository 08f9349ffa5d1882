use std::fmt;

/// A single entry in an explain output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplainEntry {
    pub name: &'static str,
    pub values: Vec<(String, String)>,
}

impl ExplainEntry {
    pub fn new(name: &'static str) -> Self {
        ExplainEntry {
            name,
            values: Vec::new(),
        }
    }

    pub fn with_value(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.values.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_values<V: fmt::Display>(
        mut self,
        key: &str,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        let joined = values
            .into_iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        self.values.push((key.to_string(), format!("[{joined}]")));
        self
    }
}

impl fmt::Display for ExplainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.values.is_empty() {
            write!(f, "(")?;
            for (idx, (key, value)) in self.values.iter().enumerate() {
                if idx > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{key} = {value}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Types able to describe themselves for explain output.
pub trait Explainable {
    fn explain_entry(&self) -> ExplainEntry;
}
