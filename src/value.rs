use crate::{Error, StructType, Type};

use prost_types::value::Kind;
use prost_types::{ListValue, Value as SpannerValue};

#[cfg(feature = "numeric")]
use bigdecimal::BigDecimal;
#[cfg(feature = "temporal")]
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct StructValue(pub Vec<(Option<String>, Value)>);

impl StructValue {
    pub fn try_from(tpe: &StructType, list_value: ListValue) -> Result<Self, Error> {
        if tpe.len() != list_value.values.len() {
            return Err(Error::Codec(format!(
                "unmatched number of fields: expected {}, got {}",
                tpe.len(),
                list_value.values.len()
            )));
        }
        tpe.fields()
            .iter()
            .zip(list_value.values)
            .map(|((name, tpe), value)| Value::try_from(tpe, value).map(|v| (name.clone(), v)))
            .collect::<Result<Vec<_>, Error>>()
            .map(StructValue)
    }
}

/// A value of one of the Cloud Spanner data types, with `NULL` carrying its type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null(Type),
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    #[cfg(feature = "json")]
    Json(serde_json::Value),
    #[cfg(feature = "numeric")]
    Numeric(BigDecimal),
    #[cfg(feature = "temporal")]
    Timestamp(DateTime<Utc>),
    #[cfg(feature = "temporal")]
    Date(NaiveDate),
    /// Elements share the array's element type.
    Array(Type, Vec<Value>),
    Struct(StructType, StructValue),
}

impl Value {
    pub fn spanner_type(&self) -> Type {
        match self {
            Value::Null(tpe) => tpe.clone(),
            Value::Bool(_) => Type::Bool,
            Value::Int64(_) => Type::Int64,
            Value::Float64(_) => Type::Float64,
            Value::String(_) => Type::String,
            Value::Bytes(_) => Type::Bytes,
            #[cfg(feature = "json")]
            Value::Json(_) => Type::Json,
            #[cfg(feature = "numeric")]
            Value::Numeric(_) => Type::Numeric,
            #[cfg(feature = "temporal")]
            Value::Timestamp(_) => Type::Timestamp,
            #[cfg(feature = "temporal")]
            Value::Date(_) => Type::Date,
            Value::Array(inner, _) => Type::Array(Box::new(inner.clone())),
            Value::Struct(tpe, _) => Type::Struct(tpe.clone()),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(..))
    }

    /// Decodes a protocol value of the given type.
    pub fn try_from(tpe: &Type, value: SpannerValue) -> Result<Self, Error> {
        let kind = match value.kind {
            None | Some(Kind::NullValue(_)) => return Ok(Value::Null(tpe.clone())),
            Some(kind) => kind,
        };
        let invalid = |kind: &Kind| Error::Codec(format!("invalid value {:?} for type {:?}", kind, tpe));
        match (tpe, kind) {
            (Type::Bool, Kind::BoolValue(b)) => Ok(Value::Bool(b)),
            (Type::Int64, Kind::StringValue(s)) => s
                .parse::<i64>()
                .map(Value::Int64)
                .map_err(|_| Error::Codec(format!("{} is not a valid Int64", s))),
            (Type::Float64, Kind::NumberValue(n)) => Ok(Value::Float64(n)),
            (Type::Float64, Kind::StringValue(s)) => match s.as_str() {
                "NaN" => Ok(Value::Float64(f64::NAN)),
                "Infinity" => Ok(Value::Float64(f64::INFINITY)),
                "-Infinity" => Ok(Value::Float64(f64::NEG_INFINITY)),
                _ => Err(Error::Codec(format!("{} is not a valid Float64", s))),
            },
            (Type::String, Kind::StringValue(s)) => Ok(Value::String(s)),
            (Type::Bytes, Kind::StringValue(s)) => base64::decode(&s)
                .map(Value::Bytes)
                .map_err(|err| Error::Codec(format!("invalid base64 bytes: {}", err))),
            #[cfg(feature = "json")]
            (Type::Json, Kind::StringValue(s)) => serde_json::from_str(&s)
                .map(Value::Json)
                .map_err(|err| Error::Codec(format!("invalid JSON: {}", err))),
            #[cfg(feature = "numeric")]
            (Type::Numeric, Kind::StringValue(s)) => s
                .parse::<BigDecimal>()
                .map(Value::Numeric)
                .map_err(|err| Error::Codec(format!("invalid NUMERIC: {}", err))),
            #[cfg(feature = "temporal")]
            (Type::Timestamp, Kind::StringValue(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| Value::Timestamp(ts.with_timezone(&Utc)))
                .map_err(|err| Error::Codec(format!("invalid TIMESTAMP: {}", err))),
            #[cfg(feature = "temporal")]
            (Type::Date, Kind::StringValue(s)) => NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(Value::Date)
                .map_err(|err| Error::Codec(format!("invalid DATE: {}", err))),
            (Type::Array(inner), Kind::ListValue(list_value)) => list_value
                .values
                .into_iter()
                .map(|v| Value::try_from(inner, v))
                .collect::<Result<Vec<Value>, Error>>()
                .map(|values| Value::Array(inner.as_ref().clone(), values)),
            (Type::Struct(row_type), Kind::ListValue(list_value)) => {
                StructValue::try_from(row_type, list_value)
                    .map(|values| Value::Struct(row_type.clone(), values))
            }
            (_, kind) => Err(invalid(&kind)),
        }
    }
}

impl From<Value> for SpannerValue {
    fn from(value: Value) -> Self {
        let kind = match value {
            Value::Null(_) => Kind::NullValue(prost_types::NullValue::NullValue as i32),
            Value::Bool(b) => Kind::BoolValue(b),
            Value::Int64(i) => Kind::StringValue(i.to_string()),
            Value::Float64(f) if f.is_nan() => Kind::StringValue("NaN".to_string()),
            Value::Float64(f) if f.is_infinite() => Kind::StringValue(
                if f.is_sign_positive() { "Infinity" } else { "-Infinity" }.to_string(),
            ),
            Value::Float64(f) => Kind::NumberValue(f),
            Value::String(s) => Kind::StringValue(s),
            Value::Bytes(b) => Kind::StringValue(base64::encode(b)),
            #[cfg(feature = "json")]
            Value::Json(json) => Kind::StringValue(json.to_string()),
            #[cfg(feature = "numeric")]
            Value::Numeric(n) => Kind::StringValue(n.to_string()),
            #[cfg(feature = "temporal")]
            Value::Timestamp(ts) => {
                Kind::StringValue(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            #[cfg(feature = "temporal")]
            Value::Date(d) => Kind::StringValue(d.format("%Y-%m-%d").to_string()),
            Value::Array(_, values) => Kind::ListValue(ListValue {
                values: values.into_iter().map(Into::into).collect(),
            }),
            Value::Struct(_, StructValue(values)) => Kind::ListValue(ListValue {
                values: values.into_iter().map(|(_, value)| value.into()).collect(),
            }),
        };
        Self { kind: Some(kind) }
    }
}

impl core::iter::FromIterator<Value> for ListValue {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        ListValue {
            values: iter.into_iter().map(Into::into).collect(),
        }
    }
}
