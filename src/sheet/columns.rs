use super::SheetError;
use std::collections::BTreeMap;

/// Static `plant_id -> utility_type -> column letter` table.
#[derive(Debug, Clone, Default)]
pub struct ColumnResolver {
    table: BTreeMap<String, BTreeMap<String, String>>,
}

impl ColumnResolver {
    pub fn new(table: BTreeMap<String, BTreeMap<String, String>>) -> Self {
        Self { table }
    }

    pub fn resolve(&self, plant_id: &str, utility_type: &str) -> Result<&str, SheetError> {
        let plant = self.table.get(plant_id).ok_or_else(|| {
            SheetError::UnsupportedPlantOrUtility(format!("Unsupported plant_id: {plant_id}"))
        })?;
        plant
            .get(utility_type)
            .map(String::as_str)
            .ok_or_else(|| {
                SheetError::UnsupportedPlantOrUtility(format!(
                    "Utility type '{utility_type}' not supported for plant {plant_id}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn resolver() -> ColumnResolver {
        ColumnResolver::new(Config::parse("").unwrap().plant_columns)
    }

    #[test]
    fn known_plants_resolve() {
        let r = resolver();
        assert_eq!(r.resolve("881", "electricity").unwrap(), "B");
        assert_eq!(r.resolve("789", "electricity").unwrap(), "C");
        assert_eq!(r.resolve("999", "electricity").unwrap(), "B");
    }

    #[test]
    fn unknown_plant_or_utility_fails() {
        let r = resolver();
        let err = r.resolve("000", "electricity").unwrap_err();
        assert!(matches!(err, SheetError::UnsupportedPlantOrUtility(ref m) if m.contains("000")));
        let err = r.resolve("881", "water").unwrap_err();
        assert!(matches!(err, SheetError::UnsupportedPlantOrUtility(ref m) if m.contains("water")));
    }
}
