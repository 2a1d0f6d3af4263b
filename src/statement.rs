use std::collections::{BTreeMap, HashMap};

use crate::proto::google::spanner::v1 as proto;
use crate::transaction::DirectedReadOptions;
use crate::{Error, ToSpanner, Value};

/// Scheduling priority of a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Per-request options forwarded to Cloud Spanner.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOptions {
    pub priority: Option<Priority>,
    pub request_tag: Option<String>,
    pub transaction_tag: Option<String>,
}

impl From<&RequestOptions> for proto::RequestOptions {
    fn from(value: &RequestOptions) -> Self {
        use proto::request_options::Priority as P;
        proto::RequestOptions {
            priority: match value.priority {
                None => P::Unspecified,
                Some(Priority::Low) => P::Low,
                Some(Priority::Medium) => P::Medium,
                Some(Priority::High) => P::High,
            } as i32,
            request_tag: value.request_tag.clone().unwrap_or_default(),
            transaction_tag: value.transaction_tag.clone().unwrap_or_default(),
        }
    }
}

/// Query optimizer settings; unset fields use the database defaults.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryOptions {
    pub optimizer_version: Option<String>,
    pub optimizer_statistics_package: Option<String>,
}

impl From<&QueryOptions> for proto::execute_sql_request::QueryOptions {
    fn from(value: &QueryOptions) -> Self {
        Self {
            optimizer_version: value.optimizer_version.clone().unwrap_or_default(),
            optimizer_statistics_package: value
                .optimizer_statistics_package
                .clone()
                .unwrap_or_default(),
        }
    }
}

/// A SQL statement with its named parameters.
///
/// ```
/// # use spanner_txn::*;
/// # fn main() -> Result<(), Error> {
/// let statement = Statement::new("UPDATE person SET name = @name WHERE id = @id")
///     .bind("id", &42)?
///     .bind("name", &"ferris")?;
/// # Ok(()) }
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: BTreeMap<String, Value>,
    pub query_options: Option<QueryOptions>,
    pub request_options: Option<RequestOptions>,
    /// Only honored by read-only transactions; overrides the client-wide setting.
    pub directed_read_options: Option<DirectedReadOptions>,
}

impl Statement {
    pub fn new(sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            ..Default::default()
        }
    }

    pub fn bind<T: ToSpanner + ?Sized>(self, name: &str, value: &T) -> Result<Self, Error> {
        Ok(self.bind_value(name, value.to_spanner()?))
    }

    pub fn bind_value(mut self, name: &str, value: Value) -> Self {
        self.params.insert(name.to_string(), value);
        self
    }

    pub fn query_options(mut self, options: QueryOptions) -> Self {
        self.query_options = Some(options);
        self
    }

    pub fn request_options(mut self, options: RequestOptions) -> Self {
        self.request_options = Some(options);
        self
    }

    pub fn directed_read_options(mut self, options: DirectedReadOptions) -> Self {
        self.directed_read_options = Some(options);
        self
    }

    pub(crate) fn encode_params(&self) -> (prost_types::Struct, HashMap<String, proto::Type>) {
        let mut params = BTreeMap::new();
        let mut param_types = HashMap::new();
        for (name, value) in &self.params {
            param_types.insert(name.clone(), (&value.spanner_type()).into());
            params.insert(name.clone(), value.clone().into());
        }
        (prost_types::Struct { fields: params }, param_types)
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<&Statement> for proto::execute_batch_dml_request::Statement {
    fn from(value: &Statement) -> Self {
        let (params, param_types) = value.encode_params();
        proto::execute_batch_dml_request::Statement {
            sql: value.sql.clone(),
            params: Some(params),
            param_types,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Type;

    #[test]
    fn test_params_are_typed() {
        let statement = Statement::new("SELECT @a, @b")
            .bind("a", &42)
            .unwrap()
            .bind("b", &None::<String>)
            .unwrap();
        let (params, types) = statement.encode_params();
        assert_eq!(params.fields.len(), 2);
        assert_eq!(types["a"], proto::Type::from(&Type::Int64));
        assert_eq!(types["b"], proto::Type::from(&Type::String));
    }
}
