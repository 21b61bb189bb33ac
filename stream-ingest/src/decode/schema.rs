use crate::decode::{FieldType, FieldValue};
use crate::error::ConfigError;

/// One input column: name, type and the value used when the column text is empty.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub default: Option<FieldValue>,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            default: None,
        }
    }

    pub fn with_default(mut self, default: FieldValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Parse `name:type[:default]`.
    pub fn parse(definition: &str) -> Result<Self, ConfigError> {
        let mut parts = definition.trim().splitn(3, ':');
        let name = parts.next().map(str::trim).unwrap_or_default();
        let type_name = parts.next().map(str::trim).unwrap_or("string");
        if name.is_empty() {
            return Err(ConfigError::Invalid(format!("input field {definition:?} has no name")));
        }

        let field_type: FieldType = type_name
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("input field {name}: {e}")))?;

        let default = match parts.next() {
            None => None,
            Some(raw) if raw.is_empty() => None,
            Some(raw) => Some(field_type.cast(raw).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "input field {name}: default {raw:?} is not a valid {field_type}"
                ))
            })?),
        };

        Ok(Self {
            name: name.to_string(),
            field_type,
            default,
        })
    }
}

/// Column layout of a delimited record value.
#[derive(Debug, Clone)]
pub struct DecodeSchema {
    fields: Vec<FieldSpec>,
    feature_indices: Vec<usize>,
    label_indices: Vec<usize>,
    delimiter: char,
}

impl DecodeSchema {
    /// Build a schema. With no explicit feature fields every non-label column is a feature.
    pub fn new(
        fields: Vec<FieldSpec>,
        feature_fields: &[String],
        label_fields: &[String],
        delimiter: char,
    ) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::Invalid("no input fields configured".to_string()));
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].iter().any(|f| f.name == field.name) {
                return Err(ConfigError::Invalid(format!(
                    "input field {} is declared twice",
                    field.name
                )));
            }
        }

        let index_of = |name: &String| {
            fields
                .iter()
                .position(|f| &f.name == name)
                .ok_or_else(|| ConfigError::Invalid(format!("unknown field {name}")))
        };

        let label_indices = label_fields
            .iter()
            .map(index_of)
            .collect::<Result<Vec<_>, _>>()?;

        let feature_indices = if feature_fields.is_empty() {
            (0..fields.len())
                .filter(|i| !label_indices.contains(i))
                .collect()
        } else {
            feature_fields
                .iter()
                .map(index_of)
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            fields,
            feature_indices,
            label_indices,
            delimiter,
        })
    }

    /// Parse a comma separated `name:type[:default]` list.
    pub fn parse_fields(definitions: &str) -> Result<Vec<FieldSpec>, ConfigError> {
        definitions
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(FieldSpec::parse)
            .collect()
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn feature_indices(&self) -> &[usize] {
        &self.feature_indices
    }

    pub fn label_indices(&self) -> &[usize] {
        &self.label_indices
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_fields() {
        let fields = DecodeSchema::parse_fields("clk:int32:0, user_id:string, price:double:1.5,tag").unwrap();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], FieldSpec::new("clk", FieldType::Int32).with_default(FieldValue::Int32(0)));
        assert_eq!(fields[1], FieldSpec::new("user_id", FieldType::String));
        assert_eq!(fields[2].default, Some(FieldValue::Double(1.5)));
        assert_eq!(fields[3].field_type, FieldType::String);
    }

    #[test]
    fn test_parse_fields_rejects_bad_default() {
        assert!(DecodeSchema::parse_fields("clk:int32:zero").is_err());
        assert!(DecodeSchema::parse_fields("clk:matrix").is_err());
        assert!(DecodeSchema::parse_fields(":int32").is_err());
    }

    #[test]
    fn test_features_default_to_non_label_fields() {
        let fields = DecodeSchema::parse_fields("clk:int32,a:string,b:float").unwrap();
        let schema = DecodeSchema::new(fields, &[], &names(&["clk"]), ',').unwrap();

        assert_eq!(schema.label_indices(), &[0]);
        assert_eq!(schema.feature_indices(), &[1, 2]);
    }

    #[test]
    fn test_explicit_features_and_unknown_names() {
        let fields = DecodeSchema::parse_fields("clk:int32,a:string,b:float").unwrap();
        let schema = DecodeSchema::new(fields.clone(), &names(&["b"]), &names(&["clk"]), ',').unwrap();
        assert_eq!(schema.feature_indices(), &[2]);

        assert!(DecodeSchema::new(fields.clone(), &[], &names(&["label"]), ',').is_err());
        assert!(DecodeSchema::new(fields, &names(&["c"]), &[], ',').is_err());
    }

    #[test]
    fn test_duplicate_fields_rejected() {
        let fields = DecodeSchema::parse_fields("a:string,a:int32").unwrap();
        assert!(DecodeSchema::new(fields, &[], &[], ',').is_err());
    }
}
