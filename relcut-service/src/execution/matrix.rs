// Matrix Expansion
// Expands build dimensions into concrete combinations (one run each)

use crate::parser::models::Dimension;

use serde::Serialize;
use std::fmt;

/// A single matrix combination: ordered dimension name -> value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Combination {
    /// Position in expansion order
    pub index: usize,
    /// Values in declared dimension order
    pub values: Vec<(String, String)>,
}

impl Combination {
    pub fn new<I, K, V>(index: usize, values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            index,
            values: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Value for a dimension
    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, value)| value.as_str())
    }

    /// Values joined with '_' in dimension order, e.g. macos_arm64
    pub fn name(&self) -> String {
        if self.values.is_empty() {
            return "default".to_string();
        }
        self.values
            .iter()
            .map(|(_, v)| v.as_str())
            .collect::<Vec<_>>()
            .join("_")
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Combination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.is_empty() {
            return write!(f, "(default)");
        }
        let pairs: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{}", pairs.join(", "))
    }
}

/// Matrix expander for build dimensions
pub struct MatrixExpander;

impl MatrixExpander {
    /// Cartesian product in declared dimension order, last dimension varying fastest.
    /// No dimensions yields a single empty combination.
    pub fn expand(dimensions: &[Dimension]) -> Vec<Combination> {
        let mut partial: Vec<Vec<(String, String)>> = vec![Vec::new()];

        for dimension in dimensions {
            let mut next = Vec::with_capacity(partial.len() * dimension.values.len());
            for prefix in &partial {
                for value in &dimension.values {
                    let mut values = prefix.clone();
                    values.push((dimension.name.clone(), value.clone()));
                    next.push(values);
                }
            }
            partial = next;
        }

        partial
            .into_iter()
            .enumerate()
            .map(|(index, values)| Combination { index, values })
            .collect()
    }

    /// Number of combinations without expanding
    pub fn count(dimensions: &[Dimension]) -> usize {
        dimensions
            .iter()
            .map(|d| d.values.len())
            .fold(1usize, |acc, n| acc.saturating_mul(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn dims() -> Vec<Dimension> {
        vec![
            Dimension::new("os", ["linux", "macos", "windows"]),
            Dimension::new("arch", ["x86_64", "arm64"]),
        ]
    }

    #[test]
    fn test_expand_cartesian_product() {
        let combos = MatrixExpander::expand(&dims());

        assert_eq!(combos.len(), 6);
        assert_eq!(MatrixExpander::count(&dims()), 6);

        let unique: HashSet<_> = combos.iter().map(|c| c.values.clone()).collect();
        assert_eq!(unique.len(), 6);
    }

    #[test]
    fn test_expand_preserves_declared_order() {
        let combos = MatrixExpander::expand(&dims());
        let names: Vec<String> = combos.iter().map(|c| c.name()).collect();

        assert_eq!(
            names,
            vec![
                "linux_x86_64",
                "linux_arm64",
                "macos_x86_64",
                "macos_arm64",
                "windows_x86_64",
                "windows_arm64"
            ]
        );
        assert_eq!(combos[3].index, 3);
        assert_eq!(combos[3].get("os"), Some("macos"));
        assert_eq!(combos[3].get("arch"), Some("arm64"));
        assert_eq!(combos[3].get("abi"), None);
    }

    #[test]
    fn test_expand_no_dimensions() {
        let combos = MatrixExpander::expand(&[]);
        assert_eq!(combos.len(), 1);
        assert!(combos[0].is_empty());
        assert_eq!(combos[0].name(), "default");
    }

    #[test]
    fn test_expand_empty_dimension_yields_nothing() {
        let dims = vec![Dimension::new("os", ["linux"]), Dimension::new("arch", Vec::<String>::new())];
        assert!(MatrixExpander::expand(&dims).is_empty());
        assert_eq!(MatrixExpander::count(&dims), 0);
    }

    #[test]
    fn test_display() {
        let combo = Combination::new(0, [("os", "macos"), ("arch", "arm64")]);
        assert_eq!(combo.to_string(), "os=macos, arch=arm64");
    }
}
