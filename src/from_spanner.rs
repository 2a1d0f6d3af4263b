use crate::{Error, Type, Value};

/// Conversion of Cloud Spanner [`Value`]s into Rust values, used by [`crate::Row::get`].
pub trait FromSpanner<'a>: Sized {
    fn from_spanner(value: &'a Value) -> Result<Self, Error>;

    #[allow(unused_variables)]
    fn from_spanner_null(tpe: &Type) -> Result<Self, Error> {
        Err(Error::Codec(format!("value of type {:?} was null", tpe)))
    }

    fn from_spanner_nullable(value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::Null(tpe) => Self::from_spanner_null(tpe),
            not_null => Self::from_spanner(not_null),
        }
    }
}

impl<'a, T> FromSpanner<'a> for Option<T>
where
    T: FromSpanner<'a>,
{
    fn from_spanner(value: &'a Value) -> Result<Self, Error> {
        T::from_spanner(value).map(Some)
    }

    fn from_spanner_null(_tpe: &Type) -> Result<Self, Error> {
        Ok(None)
    }
}

impl<'a, T> FromSpanner<'a> for Vec<T>
where
    T: FromSpanner<'a>,
{
    fn from_spanner(value: &'a Value) -> Result<Self, Error> {
        match value {
            Value::Array(_, values) => values.iter().map(T::from_spanner_nullable).collect(),
            other => wrong_type("ARRAY", other),
        }
    }
}

fn wrong_type<T>(expected: &str, value: &Value) -> Result<T, Error> {
    Err(Error::Codec(format!(
        "expected {} value, got {:?}",
        expected,
        value.spanner_type()
    )))
}

macro_rules! borrowed_from {
    ($t:ty, $variant:ident, $v:ident => $out:expr) => {
        impl<'a> FromSpanner<'a> for $t {
            fn from_spanner(value: &'a Value) -> Result<Self, Error> {
                match value {
                    Value::$variant($v) => Ok($out),
                    other => wrong_type(stringify!($variant), other),
                }
            }
        }
    };
}

macro_rules! int_from {
    ($($t:ty),+) => {
        $(
            impl<'a> FromSpanner<'a> for $t {
                fn from_spanner(value: &'a Value) -> Result<Self, Error> {
                    match value {
                        Value::Int64(v) => <$t>::try_from(*v).map_err(|err| Error::Codec(err.to_string())),
                        other => wrong_type("Int64", other),
                    }
                }
            }
        )+
    };
}

int_from!(i8, u8, i16, u16, i32, u32, i64, u64);
borrowed_from!(bool, Bool, v => *v);
borrowed_from!(f64, Float64, v => *v);
borrowed_from!(String, String, v => v.clone());
borrowed_from!(&'a str, String, v => v.as_str());
borrowed_from!(&'a [u8], Bytes, v => v.as_slice());
#[cfg(feature = "json")]
borrowed_from!(serde_json::Value, Json, v => v.clone());
#[cfg(feature = "numeric")]
borrowed_from!(bigdecimal::BigDecimal, Numeric, v => v.clone());
#[cfg(feature = "temporal")]
borrowed_from!(chrono::DateTime<chrono::Utc>, Timestamp, v => *v);
#[cfg(feature = "temporal")]
borrowed_from!(chrono::NaiveDate, Date, v => *v);
