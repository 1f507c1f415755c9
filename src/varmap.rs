//! Declarative variable rename/drop table.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;

/// What to do with a variable name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VarRule<'a> {
    /// Carry the variable through unchanged.
    Keep,
    /// Carry the variable through under a new name.
    Rename(&'a str),
    /// Discard the variable.
    Drop,
}

/// A rename/drop table consulted once per variable.
///
/// Names absent from both tables pass through unchanged. A name in both
/// tables is dropped; drop wins so a stale rename entry cannot resurrect a
/// variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VarMap {
    /// Old name to new name.
    pub rename: BTreeMap<String, String>,
    /// Names to discard.
    pub drop: BTreeSet<String>,
}

impl VarMap {
    /// The table used by the COAWST archiving job.
    #[must_use]
    pub fn coawst() -> Self {
        Self {
            rename: BTreeMap::from([(
                "wet_dry_masking".to_string(),
                "wetdry_mask_rho".to_string(),
            )]),
            drop: BTreeSet::from([
                "ero_flux".to_string(),
                "Ub_swan".to_string(),
                "Wave_dissip".to_string(),
            ]),
        }
    }

    /// The rule for `name`.
    #[must_use]
    pub fn rule(&self, name: &str) -> VarRule<'_> {
        if self.drop.contains(name) {
            VarRule::Drop
        } else if let Some(new_name) = self.rename.get(name) {
            VarRule::Rename(new_name)
        } else {
            VarRule::Keep
        }
    }

    /// Apply the table to every variable of `dataset`.
    #[must_use]
    pub fn apply(&self, dataset: Dataset) -> Dataset {
        let variables = dataset
            .variables
            .into_iter()
            .filter_map(|(name, var)| match self.rule(&name) {
                VarRule::Keep => Some((name, var)),
                VarRule::Rename(new_name) => Some((new_name.to_string(), var)),
                VarRule::Drop => None,
            })
            .collect();
        Dataset {
            attributes: dataset.attributes,
            variables,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Values, Variable};
    use ndarray::ArrayD;

    fn variable() -> Variable {
        Variable {
            dims: vec!["eta_rho".to_string()],
            attributes: serde_json::Map::new(),
            values: Values::Float32(ArrayD::zeros(vec![2])),
        }
    }

    #[test]
    fn rule_lookup() {
        let map = VarMap::coawst();
        assert_eq!(map.rule("zeta"), VarRule::Keep);
        assert_eq!(map.rule("wet_dry_masking"), VarRule::Rename("wetdry_mask_rho"));
        assert_eq!(map.rule("ero_flux"), VarRule::Drop);
    }

    #[test]
    fn drop_wins_over_rename() {
        let map = VarMap {
            rename: BTreeMap::from([("a".to_string(), "b".to_string())]),
            drop: BTreeSet::from(["a".to_string()]),
        };
        assert_eq!(map.rule("a"), VarRule::Drop);
    }

    #[test]
    fn apply_renames_and_drops() {
        let mut dataset = Dataset::default();
        dataset
            .variables
            .insert("wet_dry_masking".to_string(), variable());
        dataset.variables.insert("ero_flux".to_string(), variable());
        dataset.variables.insert("zeta".to_string(), variable());

        let out = VarMap::coawst().apply(dataset);
        let names: Vec<_> = out.variables.keys().cloned().collect();
        assert_eq!(names, ["wetdry_mask_rho", "zeta"]);
    }

    #[test]
    fn empty_table_passes_everything_through() {
        let mut dataset = Dataset::default();
        dataset.variables.insert("zeta".to_string(), variable());
        let out = VarMap::default().apply(dataset.clone());
        assert_eq!(out, dataset);
    }

    #[test]
    fn round_trips_through_toml() {
        let map = VarMap::coawst();
        let text = toml::to_string(&map).unwrap();
        let back: VarMap = toml::from_str(&text).unwrap();
        assert_eq!(back, map);
    }
}
