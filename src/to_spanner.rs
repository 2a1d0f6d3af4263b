use crate::{Error, Type, Value};

/// Conversion of Rust values into Cloud Spanner [`Value`]s, used for statement parameters
/// and mutation rows.
pub trait ToSpanner {
    fn to_spanner(&self) -> Result<Value, Error>;

    /// The Cloud Spanner type of this Rust type, used to type `NULL`s and empty arrays.
    fn spanner_type() -> Type
    where
        Self: Sized;
}

macro_rules! simple_to {
    ($t:ty, $tpe:ident, $v:ident, $into:expr) => {
        impl ToSpanner for $t {
            fn to_spanner(&self) -> Result<Value, Error> {
                let $v = self;
                Ok(Value::$tpe($into))
            }

            fn spanner_type() -> Type {
                Type::$tpe
            }
        }
    };
    ($t:ty, i64_from) => {
        simple_to!($t, Int64, v, i64::from(*v));
    };
}

impl<T> ToSpanner for Option<T>
where
    T: ToSpanner,
{
    fn to_spanner(&self) -> Result<Value, Error> {
        match self {
            Some(v) => v.to_spanner(),
            None => Ok(Value::Null(T::spanner_type())),
        }
    }

    fn spanner_type() -> Type {
        T::spanner_type()
    }
}

impl<T> ToSpanner for Vec<T>
where
    T: ToSpanner,
{
    fn to_spanner(&self) -> Result<Value, Error> {
        let values = self
            .iter()
            .map(ToSpanner::to_spanner)
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Value::Array(T::spanner_type(), values))
    }

    fn spanner_type() -> Type {
        Type::array(T::spanner_type())
    }
}

impl ToSpanner for u64 {
    fn to_spanner(&self) -> Result<Value, Error> {
        i64::try_from(*self)
            .map(Value::Int64)
            .map_err(|err| Error::Codec(format!("{} does not fit INT64: {}", self, err)))
    }

    fn spanner_type() -> Type {
        Type::Int64
    }
}

simple_to!(i8, i64_from);
simple_to!(u8, i64_from);
simple_to!(i16, i64_from);
simple_to!(u16, i64_from);
simple_to!(i32, i64_from);
simple_to!(u32, i64_from);
simple_to!(i64, i64_from);
simple_to!(bool, Bool, v, *v);
simple_to!(f64, Float64, v, *v);
simple_to!(String, String, v, v.clone());
simple_to!(&str, String, v, v.to_string());
simple_to!(&[u8], Bytes, v, v.to_vec());
#[cfg(feature = "json")]
simple_to!(serde_json::Value, Json, v, v.clone());
#[cfg(feature = "numeric")]
simple_to!(bigdecimal::BigDecimal, Numeric, v, v.clone());
#[cfg(feature = "temporal")]
simple_to!(chrono::DateTime<chrono::Utc>, Timestamp, v, *v);
#[cfg(feature = "temporal")]
simple_to!(chrono::NaiveDate, Date, v, *v);
