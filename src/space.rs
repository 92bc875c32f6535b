//! Parameter space expansion.
//!
//! A [`ParameterSpace`] keeps its parameters in declaration order; [`ParameterSpace::expand`]
//! walks the Cartesian product with the last parameter varying fastest and zips the
//! names back onto each combination to build a [`StatePoint`].

use serde_json::Value;
use tracing::warn;

use crate::error::{FlowError, Result};
use crate::store::StatePoint;

/// Ordered mapping of parameter name to its candidate values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSpace {
    params: Vec<(String, Vec<Value>)>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter. Re-declaring a name replaces its values but keeps its position.
    pub fn with(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        let name = name.into();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = values,
            None => self.params.push((name, values)),
        }
        self
    }

    /// Builds a space from a TOML table, where every entry must be an array of candidates.
    pub fn from_toml(table: &toml::Table) -> Result<Self> {
        let mut space = Self::new();
        for (name, value) in table {
            let toml::Value::Array(items) = value else {
                return Err(FlowError::Configuration(format!(
                    "parameter '{name}' must be an array of candidate values"
                )));
            };
            let values = items
                .iter()
                .map(|item| {
                    serde_json::to_value(item).map_err(|e| {
                        FlowError::Configuration(format!("parameter '{name}': {e}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            space = space.with(name.clone(), values);
        }
        Ok(space)
    }

    #[allow(dead_code)]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(n, _)| n.as_str())
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Number of state points the space expands to: the product of all cardinalities.
    pub fn cardinality(&self) -> usize {
        self.params.iter().map(|(_, v)| v.len()).product()
    }

    /// Expands the full Cartesian product.
    ///
    /// A parameter without candidates yields an empty space; this is not an error.
    /// A space with no parameters at all yields a single empty state point.
    pub fn expand(&self) -> Vec<StatePoint> {
        if let Some((name, _)) = self.params.iter().find(|(_, v)| v.is_empty()) {
            warn!("parameter '{name}' has no candidate values, the space is empty");
            return Vec::new();
        }

        let total = self.cardinality();
        let mut points = Vec::with_capacity(total);
        let mut cursor = vec![0usize; self.params.len()];

        for _ in 0..total {
            let point = self
                .params
                .iter()
                .zip(&cursor)
                .map(|((name, values), &i)| (name.clone(), values[i].clone()))
                .collect();
            points.push(StatePoint::new(point));

            // Odometer increment, rightmost digit first.
            for (digit, (_, values)) in cursor.iter_mut().zip(&self.params).rev() {
                *digit += 1;
                if *digit < values.len() {
                    break;
                }
                *digit = 0;
            }
        }

        points
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expands_in_declaration_order() {
        let space = ParameterSpace::new()
            .with("x", vec![json!(1), json!(2)])
            .with("y", vec![json!(10)]);

        let points = space.expand();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].get("x"), Some(&json!(1)));
        assert_eq!(points[0].get("y"), Some(&json!(10)));
        assert_eq!(points[1].get("x"), Some(&json!(2)));
        assert_eq!(points[1].get("y"), Some(&json!(10)));
    }

    #[test]
    fn last_parameter_varies_fastest() {
        let space = ParameterSpace::new()
            .with("a", vec![json!("p"), json!("q")])
            .with("b", vec![json!(1), json!(2), json!(3)]);

        let pairs: Vec<(Value, Value)> = space
            .expand()
            .iter()
            .map(|sp| (sp.get("a").unwrap().clone(), sp.get("b").unwrap().clone()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                (json!("p"), json!(1)),
                (json!("p"), json!(2)),
                (json!("p"), json!(3)),
                (json!("q"), json!(1)),
                (json!("q"), json!(2)),
                (json!("q"), json!(3)),
            ]
        );
    }

    #[test]
    fn size_is_product_of_cardinalities_and_points_are_distinct() {
        let space = ParameterSpace::new()
            .with("t", vec![json!(250), json!(300), json!(350)])
            .with("n", vec![json!(10), json!(20)])
            .with("ff", vec![json!("gaff"), json!("opls")])
            .with("life", vec![json!([1e-13, 1e-12])]);

        let points = space.expand();
        assert_eq!(points.len(), 12);
        assert_eq!(space.cardinality(), 12);

        let mut ids: Vec<String> = points.iter().map(|p| p.fingerprint()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 12);
    }

    #[test]
    fn empty_candidate_list_yields_empty_space() {
        let space = ParameterSpace::new()
            .with("x", vec![json!(1), json!(2)])
            .with("y", vec![]);
        assert!(space.expand().is_empty());
        assert_eq!(space.cardinality(), 0);
    }

    #[test]
    fn no_parameters_yields_single_empty_point() {
        let points = ParameterSpace::new().expand();
        assert_eq!(points.len(), 1);
        assert!(points[0].is_empty());
    }

    #[test]
    fn redeclared_parameter_keeps_position() {
        let space = ParameterSpace::new()
            .with("x", vec![json!(1)])
            .with("y", vec![json!(2)])
            .with("x", vec![json!(3)]);
        assert_eq!(space.names().collect::<Vec<_>>(), vec!["x", "y"]);
        assert_eq!(space.expand()[0].get("x"), Some(&json!(3)));
    }

    #[test]
    fn from_toml_preserves_table_order() {
        let table: toml::Table = toml::from_str(
            r#"
            zeta = [1]
            alpha = ["a", "b"]
            lifetimes = [[1e-13, 1e-12]]
            "#,
        )
        .unwrap();
        let space = ParameterSpace::from_toml(&table).unwrap();
        assert_eq!(space.names().collect::<Vec<_>>(), vec!["zeta", "alpha", "lifetimes"]);
        assert_eq!(space.cardinality(), 2);
        assert_eq!(space.expand()[0].get("lifetimes"), Some(&json!([1e-13, 1e-12])));
    }

    #[test]
    fn from_toml_rejects_scalar_parameter() {
        let table: toml::Table = toml::from_str("temperature = 300").unwrap();
        let err = ParameterSpace::from_toml(&table).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }
}
