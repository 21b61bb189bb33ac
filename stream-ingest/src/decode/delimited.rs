use crate::decode::schema::DecodeSchema;
use crate::decode::{DecodeError, DecodedRow, FieldMap, FieldValue};
use crate::kafka::types::Record;

/// Turns one record into typed fields.
pub trait RecordDecoder: Send + Sync {
    fn decode(&self, record: &Record) -> Result<DecodedRow, DecodeError>;
}

/// Decoder for single-character delimited text, without quoting.
pub struct DelimitedDecoder {
    schema: DecodeSchema,
    emit_labels: bool,
}

impl DelimitedDecoder {
    /// `emit_labels` is false in predict mode; label columns are then skipped entirely.
    pub fn new(schema: DecodeSchema, emit_labels: bool) -> Self {
        Self {
            schema,
            emit_labels,
        }
    }

    fn field_value(&self, index: usize, text: &str) -> Result<Option<FieldValue>, DecodeError> {
        let field_spec = &self.schema.fields()[index];
        if text.is_empty() {
            return Ok(field_spec.default.clone());
        }
        field_spec
            .field_type
            .cast(text)
            .map(Some)
            .ok_or_else(|| DecodeError::InvalidField {
                field: field_spec.name.clone(),
                field_type: field_spec.field_type,
                value: text.to_string(),
            })
    }
}

impl RecordDecoder for DelimitedDecoder {
    fn decode(&self, record: &Record) -> Result<DecodedRow, DecodeError> {
        let text = std::str::from_utf8(&record.value).map_err(|_| DecodeError::InvalidUtf8)?;
        let text = text.trim_end_matches(['\r', '\n']);
        let columns: Vec<&str> = text.split(self.schema.delimiter()).collect();

        let expected = self.schema.fields().len();
        if columns.len() != expected {
            return Err(DecodeError::ColumnCount {
                expected,
                found: columns.len(),
            });
        }

        let mut features = FieldMap::new();
        for &i in self.schema.feature_indices() {
            let field_spec = &self.schema.fields()[i];
            let value = self
                .field_value(i, columns[i])?
                .unwrap_or_else(|| field_spec.field_type.zero());
            features.insert(field_spec.name.clone(), value);
        }

        let labels = if self.emit_labels {
            let mut labels = FieldMap::new();
            for &i in self.schema.label_indices() {
                let field_spec = &self.schema.fields()[i];
                let value = self
                    .field_value(i, columns[i])?
                    .ok_or_else(|| DecodeError::MissingLabel {
                        field: field_spec.name.clone(),
                    })?;
                labels.insert(field_spec.name.clone(), value);
            }
            Some(labels)
        } else {
            None
        };

        Ok(DecodedRow { features, labels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::FieldType;

    fn decoder(emit_labels: bool) -> DelimitedDecoder {
        let fields = DecodeSchema::parse_fields("clk:int32,user:string,price:double:2.5,vip:bool").unwrap();
        let schema = DecodeSchema::new(fields, &[], &["clk".to_string()], ',').unwrap();
        DelimitedDecoder::new(schema, emit_labels)
    }

    #[test]
    fn test_decode_features_and_labels() {
        let row = decoder(true)
            .decode(&Record::new(0, 1, "1,alice,3.0,true\n"))
            .unwrap();

        assert_eq!(row.features["user"], FieldValue::String("alice".to_string()));
        assert_eq!(row.features["price"], FieldValue::Double(3.0));
        assert_eq!(row.features["vip"], FieldValue::Bool(true));
        assert!(!row.features.contains_key("clk"));
        assert_eq!(row.labels.unwrap()["clk"], FieldValue::Int32(1));
    }

    #[test]
    fn test_empty_fields_take_defaults() {
        let row = decoder(true).decode(&Record::new(0, 1, "0,,,")).unwrap();

        assert_eq!(row.features["user"], FieldValue::String(String::new()));
        assert_eq!(row.features["price"], FieldValue::Double(2.5));
        assert_eq!(row.features["vip"], FieldValue::Bool(false));
    }

    #[test]
    fn test_predict_mode_skips_labels() {
        let row = decoder(false).decode(&Record::new(0, 1, ",bob,1,0")).unwrap();
        assert_eq!(row.labels, None);
    }

    #[test]
    fn test_row_errors() {
        let decoder = decoder(true);

        assert_eq!(
            decoder.decode(&Record::new(0, 1, "1,alice")).unwrap_err(),
            DecodeError::ColumnCount {
                expected: 4,
                found: 2
            }
        );
        assert_eq!(
            decoder.decode(&Record::new(0, 1, "1,alice,cheap,true")).unwrap_err(),
            DecodeError::InvalidField {
                field: "price".to_string(),
                field_type: FieldType::Double,
                value: "cheap".to_string(),
            }
        );
        assert_eq!(
            decoder.decode(&Record::new(0, 1, vec![0xff, 0xfe])).unwrap_err(),
            DecodeError::InvalidUtf8
        );
    }

    #[test]
    fn test_missing_label_is_fatal() {
        let err = decoder(true).decode(&Record::new(0, 1, ",alice,1,true")).unwrap_err();
        assert!(matches!(err, DecodeError::MissingLabel { ref field } if field == "clk"));
        assert!(!err.is_row_scoped());
    }
}
