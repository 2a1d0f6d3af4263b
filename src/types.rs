use std::convert::TryFrom;

use crate::proto::google::spanner::v1 as proto;

/// The Cloud Spanner [`STRUCT`](https://cloud.google.com/spanner/docs/data-types#struct_type) type:
/// an ordered list of optionally named fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StructType(Vec<(Option<String>, Type)>);

impl StructType {
    /// Empty names become unnamed fields.
    pub fn new(fields: Vec<(&str, Type)>) -> Self {
        Self(
            fields
                .into_iter()
                .map(|(name, tpe)| ((!name.is_empty()).then(|| name.to_string()), tpe))
                .collect(),
        )
    }

    pub fn fields(&self) -> &[(Option<String>, Type)] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Position of the first field named `field_name`, ignoring unnamed fields.
    pub fn field_index(&self, field_name: &str) -> Option<usize> {
        self.0
            .iter()
            .position(|(name, _)| name.as_deref() == Some(field_name))
    }
}

impl TryFrom<&proto::StructType> for StructType {
    type Error = crate::Error;

    fn try_from(value: &proto::StructType) -> Result<Self, Self::Error> {
        value
            .fields
            .iter()
            .map(|field| {
                let tpe = field.r#type.as_ref().ok_or_else(|| {
                    Self::Error::Codec(format!("field '{}' is missing type", field.name))
                })?;
                let name = (!field.name.is_empty()).then(|| field.name.clone());
                Ok((name, Type::try_from(tpe)?))
            })
            .collect::<Result<Vec<_>, Self::Error>>()
            .map(StructType)
    }
}

/// Cloud Spanner [data types](https://cloud.google.com/spanner/docs/data-types).
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Bool,
    Int64,
    Float64,
    String,
    Bytes,
    #[cfg(feature = "json")]
    Json,
    #[cfg(feature = "numeric")]
    Numeric,
    #[cfg(feature = "temporal")]
    Timestamp,
    #[cfg(feature = "temporal")]
    Date,
    /// Arrays of arrays are not allowed.
    Array(Box<Type>),
    Struct(StructType),
}

impl Type {
    /// # Panics
    ///
    /// If `inner` is itself an array.
    pub fn array(inner: Type) -> Self {
        if let Type::Array(_) = &inner {
            panic!("array of array is not supported by Cloud Spanner");
        }
        Type::Array(Box::new(inner))
    }

    pub fn strct(fields: Vec<(&str, Type)>) -> Self {
        Type::Struct(StructType::new(fields))
    }

    pub(crate) fn code(&self) -> proto::TypeCode {
        match self {
            Type::Bool => proto::TypeCode::Bool,
            Type::Int64 => proto::TypeCode::Int64,
            Type::Float64 => proto::TypeCode::Float64,
            Type::String => proto::TypeCode::String,
            Type::Bytes => proto::TypeCode::Bytes,
            #[cfg(feature = "json")]
            Type::Json => proto::TypeCode::Json,
            #[cfg(feature = "numeric")]
            Type::Numeric => proto::TypeCode::Numeric,
            #[cfg(feature = "temporal")]
            Type::Timestamp => proto::TypeCode::Timestamp,
            #[cfg(feature = "temporal")]
            Type::Date => proto::TypeCode::Date,
            Type::Array(_) => proto::TypeCode::Array,
            Type::Struct(_) => proto::TypeCode::Struct,
        }
    }
}

impl TryFrom<&proto::Type> for Type {
    type Error = crate::Error;

    fn try_from(value: &proto::Type) -> Result<Self, Self::Error> {
        #[allow(unused_variables)]
        let unsupported =
            |name: &str| Self::Error::Codec(format!("{} support is not enabled", name));
        match proto::TypeCode::from_i32(value.code) {
            Some(proto::TypeCode::Bool) => Ok(Type::Bool),
            Some(proto::TypeCode::Int64) => Ok(Type::Int64),
            Some(proto::TypeCode::Float64) => Ok(Type::Float64),
            Some(proto::TypeCode::String) => Ok(Type::String),
            Some(proto::TypeCode::Bytes) => Ok(Type::Bytes),
            #[cfg(feature = "json")]
            Some(proto::TypeCode::Json) => Ok(Type::Json),
            #[cfg(not(feature = "json"))]
            Some(proto::TypeCode::Json) => Err(unsupported("JSON")),
            #[cfg(feature = "numeric")]
            Some(proto::TypeCode::Numeric) => Ok(Type::Numeric),
            #[cfg(not(feature = "numeric"))]
            Some(proto::TypeCode::Numeric) => Err(unsupported("NUMERIC")),
            #[cfg(feature = "temporal")]
            Some(proto::TypeCode::Timestamp) => Ok(Type::Timestamp),
            #[cfg(feature = "temporal")]
            Some(proto::TypeCode::Date) => Ok(Type::Date),
            #[cfg(not(feature = "temporal"))]
            Some(proto::TypeCode::Timestamp) | Some(proto::TypeCode::Date) => {
                Err(unsupported("TIMESTAMP/DATE"))
            }
            Some(proto::TypeCode::Array) => value
                .array_element_type
                .as_deref()
                .ok_or_else(|| Self::Error::Codec("missing array element type".to_string()))
                .and_then(Type::try_from)
                .map(|tpe| Type::Array(Box::new(tpe))),
            Some(proto::TypeCode::Struct) => value
                .struct_type
                .as_ref()
                .ok_or_else(|| Self::Error::Codec("missing struct type definition".to_string()))
                .and_then(StructType::try_from)
                .map(Type::Struct),
            Some(proto::TypeCode::Unspecified) => {
                Err(Self::Error::Codec("unspecified type".to_string()))
            }
            None => Err(Self::Error::Codec(format!(
                "unknown type code {}",
                value.code
            ))),
        }
    }
}

impl From<&Type> for proto::Type {
    fn from(value: &Type) -> Self {
        let mut tpe = proto::Type {
            code: value.code() as i32,
            array_element_type: None,
            struct_type: None,
        };
        match value {
            Type::Array(inner) => tpe.array_element_type = Some(Box::new(inner.as_ref().into())),
            Type::Struct(StructType(fields)) => {
                tpe.struct_type = Some(proto::StructType {
                    fields: fields
                        .iter()
                        .map(|(name, tpe)| proto::struct_type::Field {
                            name: name.clone().unwrap_or_default(),
                            r#type: Some(tpe.into()),
                        })
                        .collect(),
                })
            }
            _ => {}
        }
        tpe
    }
}
