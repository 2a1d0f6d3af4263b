use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::proto::google::spanner::v1 as proto;
use crate::{Error, FromSpanner, StructType, StructValue, Value};

/// The number of rows a DML statement modified.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowCount {
    Exact(i64),
    /// Partitioned DML only reports a lower bound.
    LowerBound(i64),
}

impl RowCount {
    pub fn value(&self) -> i64 {
        match self {
            RowCount::Exact(count) | RowCount::LowerBound(count) => *count,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResultSetStats {
    pub row_count: Option<RowCount>,
    pub query_stats: Option<prost_types::Struct>,
}

impl From<proto::ResultSetStats> for ResultSetStats {
    fn from(value: proto::ResultSetStats) -> Self {
        use proto::result_set_stats::RowCount as P;
        Self {
            row_count: value.row_count.map(|count| match count {
                P::RowCountExact(count) => RowCount::Exact(count),
                P::RowCountLowerBound(count) => RowCount::LowerBound(count),
            }),
            query_stats: value.query_stats,
        }
    }
}

#[derive(Debug)]
struct Columns {
    row_type: Arc<StructType>,
    by_name: BTreeMap<String, usize>,
}

/// A row of a query or read result.
#[derive(Clone, Debug)]
pub struct Row {
    columns: Arc<Columns>,
    values: StructValue,
}

/// Selects a column of a [`Row`], by position or by name.
pub trait RowIndex {
    fn index(&self, row: &Row) -> Option<usize>;
}

impl RowIndex for usize {
    fn index(&self, row: &Row) -> Option<usize> {
        (*self < row.len()).then(|| *self)
    }
}

impl RowIndex for &str {
    fn index(&self, row: &Row) -> Option<usize> {
        row.columns.by_name.get(*self).copied()
    }
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.0.is_empty()
    }

    pub fn row_type(&self) -> &StructType {
        &self.columns.row_type
    }

    pub fn get_value<I: RowIndex>(&self, column: I) -> Option<&Value> {
        column
            .index(self)
            .and_then(|idx| self.values.0.get(idx))
            .map(|(_, value)| value)
    }

    /// Converts the value of `column`.
    ///
    /// ```no_run
    /// # use spanner_txn::*;
    /// # fn f(row: Row) -> Result<(), Error> {
    /// let id: u32 = row.get("id")?;
    /// let name: Option<&str> = row.get(1)?;
    /// # Ok(()) }
    /// ```
    pub fn get<'a, T, I>(&'a self, column: I) -> Result<T, Error>
    where
        T: FromSpanner<'a>,
        I: RowIndex + std::fmt::Debug,
    {
        let value = column
            .index(self)
            .and_then(|idx| self.values.0.get(idx))
            .map(|(_, value)| value)
            .ok_or_else(|| Error::Codec(format!("no such column {:?}", column)))?;
        T::from_spanner_nullable(value)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values.0.into_iter().map(|(_, value)| value).collect()
    }
}

/// Decodes raw rows of one result.
#[derive(Clone, Debug)]
pub(crate) struct RowDecoder {
    columns: Arc<Columns>,
}

impl RowDecoder {
    pub(crate) fn new(row_type: StructType) -> Self {
        let by_name = row_type
            .fields()
            .iter()
            .enumerate()
            .flat_map(|(idx, (name, _))| name.as_ref().map(|n| (n.clone(), idx)))
            .collect();
        Self {
            columns: Arc::new(Columns {
                row_type: Arc::new(row_type),
                by_name,
            }),
        }
    }

    pub(crate) fn row_type(&self) -> Arc<StructType> {
        self.columns.row_type.clone()
    }

    pub(crate) fn decode(&self, values: Vec<prost_types::Value>) -> Result<Row, Error> {
        let values = StructValue::try_from(
            &self.columns.row_type,
            prost_types::ListValue { values },
        )?;
        Ok(Row {
            columns: self.columns.clone(),
            values,
        })
    }
}

/// The rows of a query or read, fully buffered.
#[derive(Clone, Debug, Default)]
pub struct ResultSet {
    row_type: Arc<StructType>,
    rows: Vec<Row>,
    stats: Option<ResultSetStats>,
}

impl ResultSet {
    pub fn row_type(&self) -> &StructType {
        &self.row_type
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn stats(&self) -> Option<&ResultSetStats> {
        self.stats.as_ref()
    }

    /// The DML row count, if the server reported one.
    pub fn row_count(&self) -> Option<i64> {
        self.stats
            .as_ref()
            .and_then(|stats| stats.row_count)
            .map(|count| count.value())
    }
}

impl IntoIterator for ResultSet {
    type Item = Row;
    type IntoIter = std::vec::IntoIter<Row>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.into_iter()
    }
}

#[derive(Debug, Default)]
pub(crate) struct StreamSummary {
    pub(crate) row_type: Option<Arc<StructType>>,
    pub(crate) stats: Option<ResultSetStats>,
}

/// A stream of rows, decoded as the server sends them.
///
/// The row type and the statistics become available once the stream has produced them.
pub struct RowStream {
    rows: BoxStream<'static, Result<Row, Error>>,
    summary: Arc<Mutex<StreamSummary>>,
}

impl RowStream {
    pub(crate) fn new(
        rows: BoxStream<'static, Result<Row, Error>>,
        summary: Arc<Mutex<StreamSummary>>,
    ) -> Self {
        Self { rows, summary }
    }

    pub fn row_type(&self) -> Option<Arc<StructType>> {
        self.summary.lock().row_type.clone()
    }

    pub fn stats(&self) -> Option<ResultSetStats> {
        self.summary.lock().stats.clone()
    }

    /// Drains the stream into a [`ResultSet`].
    pub async fn collect_result_set(mut self) -> Result<ResultSet, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.rows.next().await {
            rows.push(row?);
        }
        let summary = self.summary.lock();
        Ok(ResultSet {
            row_type: summary.row_type.clone().unwrap_or_default(),
            rows,
            stats: summary.stats.clone(),
        })
    }
}

impl Stream for RowStream {
    type Item = Result<Row, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rows.poll_next_unpin(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::Type;

    fn string(value: &str) -> prost_types::Value {
        prost_types::Value {
            kind: Some(prost_types::value::Kind::StringValue(value.to_string())),
        }
    }

    #[test]
    fn test_row_get_by_name_and_index() {
        let decoder = RowDecoder::new(StructType::new(vec![
            ("id", Type::Int64),
            ("name", Type::String),
        ]));
        let null = prost_types::Value {
            kind: Some(prost_types::value::Kind::NullValue(0)),
        };
        let row = decoder.decode(vec![string("42"), null]).unwrap();

        assert_eq!(row.get::<i64, _>("id").unwrap(), 42);
        assert_eq!(row.get::<u32, _>(0).unwrap(), 42);
        assert_eq!(row.get::<Option<&str>, _>("name").unwrap(), None);
        assert!(row.get::<i64, _>("missing").is_err());
        assert!(row.get::<i64, _>(2).is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_width() {
        let decoder = RowDecoder::new(StructType::new(vec![("id", Type::Int64)]));
        assert!(decoder.decode(vec![string("1"), string("2")]).is_err());
    }
}
