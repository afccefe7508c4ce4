//! Enumeration of bias combinations.
//!
//! A sweep over N sources is the Cartesian product of their voltage sequences,
//! visited in nested-loop order with the first source outermost: the last
//! source changes fastest. [`CartesianProduct`] produces the index tuples
//! lazily, so the grid is never materialized and the enumeration does not
//! recurse per source.

use serde::Serialize;

/// Lazy, finite iterator over the index tuples of a Cartesian product.
///
/// Cloning before iterating gives an independent, restartable enumeration.
#[derive(Debug, Clone)]
pub struct CartesianProduct {
    lengths: Vec<usize>,
    next: Option<Vec<usize>>,
    remaining: usize,
}

impl CartesianProduct {
    /// Product of axes with the given lengths.
    ///
    /// No axes yields exactly one empty tuple; any empty axis yields nothing.
    pub fn new(lengths: Vec<usize>) -> Self {
        let total = lengths.iter().product::<usize>();
        let next = (total > 0).then(|| vec![0; lengths.len()]);
        Self {
            lengths,
            next,
            remaining: total,
        }
    }

    /// Number of tuples in the full product.
    pub fn total(&self) -> usize {
        self.lengths.iter().product()
    }

    fn successor(&self, current: &[usize]) -> Option<Vec<usize>> {
        let mut next = current.to_vec();
        for axis in (0..next.len()).rev() {
            next[axis] += 1;
            if next[axis] < self.lengths[axis] {
                return Some(next);
            }
            next[axis] = 0;
        }
        None
    }
}

impl Iterator for CartesianProduct {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.take()?;
        self.next = self.successor(&current);
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for CartesianProduct {}

/// One source's axis of the sweep grid.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepAxis {
    /// Source label.
    pub label: String,
    /// Set-points in sweep order.
    pub voltages: Vec<f64>,
}

impl SweepAxis {
    /// Axis for `label` over `voltages`.
    pub fn new(label: impl Into<String>, voltages: Vec<f64>) -> Self {
        Self {
            label: label.into(),
            voltages,
        }
    }
}

/// A source label paired with the voltage it is set to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Setpoint {
    /// Source label.
    pub label: String,
    /// Voltage, in volts.
    pub volts: f64,
}

/// One point of the sweep grid, in source order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BiasCombination {
    /// Position in visitation order, starting at 0.
    pub index: usize,
    /// One set-point per source.
    pub setpoints: Vec<Setpoint>,
}

impl BiasCombination {
    /// Artifact identifier for this combination.
    pub fn artifact_name(&self, base: &str) -> String {
        artifact_name(
            base,
            self.setpoints.iter().map(|s| (s.label.as_str(), s.volts)),
        )
    }

    /// Voltages only, in source order.
    pub fn voltages(&self) -> Vec<f64> {
        self.setpoints.iter().map(|s| s.volts).collect()
    }
}

/// Iterates every combination of `axes` in nested-loop order.
pub fn combinations(axes: &[SweepAxis]) -> impl Iterator<Item = BiasCombination> + '_ {
    CartesianProduct::new(axes.iter().map(|a| a.voltages.len()).collect())
        .enumerate()
        .map(move |(index, indices)| BiasCombination {
            index,
            setpoints: axes
                .iter()
                .zip(indices)
                .map(|(axis, i)| Setpoint {
                    label: axis.label.clone(),
                    volts: axis.voltages[i],
                })
                .collect(),
        })
}

/// Filesystem-safe rendering of a voltage: `2.5` becomes `2_5`.
pub fn voltage_token(volts: f64) -> String {
    volts.to_string().replace('.', "_")
}

/// `base` followed by `_{label}{voltage}V` for every set-point, in order.
///
/// With no set-points the base name is returned unchanged.
pub fn artifact_name<'a>(base: &str, setpoints: impl IntoIterator<Item = (&'a str, f64)>) -> String {
    let mut name = base.to_string();
    for (label, volts) in setpoints {
        name.push('_');
        name.push_str(label);
        name.push_str(&voltage_token(volts));
        name.push('V');
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn two_axes_in_nested_loop_order() {
        let tuples: Vec<_> = CartesianProduct::new(vec![2, 3]).collect();
        assert_eq!(
            tuples,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2],
            ]
        );
    }

    #[test]
    fn degenerate_products() {
        let mut none = CartesianProduct::new(vec![]);
        assert_eq!(none.len(), 1);
        assert_eq!(none.next(), Some(vec![]));
        assert_eq!(none.next(), None);

        let mut empty_axis = CartesianProduct::new(vec![3, 0, 2]);
        assert_eq!(empty_axis.len(), 0);
        assert_eq!(empty_axis.next(), None);
    }

    #[test]
    fn clone_restarts_enumeration() {
        let product = CartesianProduct::new(vec![2, 2]);
        let first: Vec<_> = product.clone().collect();
        let second: Vec<_> = product.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn artifact_names() {
        assert_eq!(artifact_name("RFTtest", Vec::<(&str, f64)>::new()), "RFTtest");
        assert_eq!(
            artifact_name("RFTtest", [("A", 0.0), ("B", 2.5)]),
            "RFTtest_A0V_B2_5V"
        );
        assert_eq!(artifact_name("t", [("gate", -1.25)]), "t_gate-1_25V");
        assert_eq!(voltage_token(10.0), "10");
    }

    #[test]
    fn combinations_carry_labels_and_names() {
        let axes = vec![
            SweepAxis::new("A", vec![0.0, 1.0]),
            SweepAxis::new("B", vec![0.0, 2.0, 4.0]),
        ];
        let names: Vec<_> = combinations(&axes)
            .map(|c| c.artifact_name("base"))
            .collect();
        assert_eq!(
            names,
            vec![
                "base_A0V_B0V",
                "base_A0V_B2V",
                "base_A0V_B4V",
                "base_A1V_B0V",
                "base_A1V_B2V",
                "base_A1V_B4V",
            ]
        );
        let last = combinations(&axes).last().unwrap();
        assert_eq!(last.index, 5);
        assert_eq!(last.voltages(), vec![1.0, 4.0]);
    }

    fn nested_loops(lengths: &[usize]) -> Vec<Vec<usize>> {
        lengths.iter().fold(vec![vec![]], |acc, &len| {
            acc.into_iter()
                .flat_map(|prefix| {
                    (0..len).map(move |i| {
                        let mut tuple = prefix.clone();
                        tuple.push(i);
                        tuple
                    })
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn visits_every_tuple_once_in_order(lengths in proptest::collection::vec(0usize..5, 0..5)) {
            let product = CartesianProduct::new(lengths.clone());
            let expected_len = lengths.iter().product::<usize>();
            prop_assert_eq!(product.len(), expected_len);

            let tuples: Vec<_> = product.collect();
            prop_assert_eq!(tuples.len(), expected_len);
            prop_assert_eq!(tuples, nested_loops(&lengths));
        }
    }
}
