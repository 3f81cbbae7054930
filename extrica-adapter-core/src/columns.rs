use serde::{Deserialize, Serialize};

/// Column metadata of a result set, as reported by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,

    /// The full engine type, e.g. `varchar(10)` or `decimal(38,0)`.
    #[serde(rename = "type")]
    pub data_type: String,
}

impl Column {
    pub fn type_name(&self) -> String {
        data_type_code_to_name(&self.data_type)
    }
}

/// Strips type parameters and upper-cases the base name, so `varchar(10)` becomes `VARCHAR`.
pub fn data_type_code_to_name(type_code: &str) -> String {
    type_code
        .split('(')
        .next()
        .unwrap_or_default()
        .trim()
        .to_uppercase()
}
