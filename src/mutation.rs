//! Row-level mutations and the builders that batch them.
//!
//! Mutations are buffered client side and only sent when a read-write transaction commits
//! (or as part of a batch write). Building a write mutation validates that every row
//! supplies every column used anywhere in the batch, so malformed batches fail before any
//! request is made.

use rand::seq::SliceRandom;

use crate::proto::google::spanner::v1 as proto;
use crate::{Error, KeySet, ToSpanner, Value};

/// A row to write: column names paired with their values.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationRow(Vec<(String, Value)>);

impl MutationRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set<T: ToSpanner + ?Sized>(self, column: &str, value: &T) -> Result<Self, Error> {
        Ok(self.set_value(column, value.to_spanner()?))
    }

    pub fn set_value(mut self, column: &str, value: Value) -> Self {
        match self.0.iter_mut().find(|(name, _)| name == column) {
            Some((_, existing)) => *existing = value,
            None => self.0.push((column.to_string(), value)),
        }
        self
    }

    fn get(&self, column: &str) -> Option<&Value> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

impl From<Vec<(&str, Value)>> for MutationRow {
    fn from(columns: Vec<(&str, Value)>) -> Self {
        columns
            .into_iter()
            .fold(MutationRow::new(), |row, (column, value)| {
                row.set_value(column, value)
            })
    }
}

/// The payload of an insert, update, upsert or replace.
#[derive(Clone, Debug, PartialEq)]
pub struct Write {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl Write {
    /// Builds a write from rows, using every column seen in any row in first-seen order.
    pub fn new(table: &str, rows: Vec<MutationRow>) -> Result<Self, Error> {
        let mut columns: Vec<String> = Vec::new();
        for row in &rows {
            for (column, _) in &row.0 {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }

        let values = rows
            .iter()
            .enumerate()
            .map(|(index, row)| {
                let missing = columns
                    .iter()
                    .filter(|column| row.get(column).is_none())
                    .map(|column| format!("\"{}\"", column))
                    .collect::<Vec<_>>();
                if !missing.is_empty() {
                    return Err(Error::InvalidArgument(format!(
                        "Row at index {} does not contain the correct number of columns.\n\nMissing columns: [{}]",
                        index,
                        missing.join(",")
                    )));
                }
                Ok(columns
                    .iter()
                    .filter_map(|column| row.get(column).cloned())
                    .collect())
            })
            .collect::<Result<Vec<_>, Error>>()?;

        Ok(Self {
            table: table.to_string(),
            columns,
            values,
        })
    }

    fn writes_array_to(&self, column: &str) -> bool {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| self.values.iter().any(|row| row[idx].is_array()))
            .unwrap_or(false)
    }
}

impl From<&Write> for proto::mutation::Write {
    fn from(write: &Write) -> Self {
        proto::mutation::Write {
            table: write.table.clone(),
            columns: write.columns.clone(),
            values: write
                .values
                .iter()
                .map(|row| row.iter().cloned().collect())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Insert(Write),
    Update(Write),
    InsertOrUpdate(Write),
    Replace(Write),
    Delete { table: String, key_set: KeySet },
}

impl Mutation {
    pub fn insert(table: &str, rows: Vec<MutationRow>) -> Result<Self, Error> {
        Write::new(table, rows).map(Mutation::Insert)
    }

    pub fn update(table: &str, rows: Vec<MutationRow>) -> Result<Self, Error> {
        Write::new(table, rows).map(Mutation::Update)
    }

    pub fn upsert(table: &str, rows: Vec<MutationRow>) -> Result<Self, Error> {
        Write::new(table, rows).map(Mutation::InsertOrUpdate)
    }

    pub fn replace(table: &str, rows: Vec<MutationRow>) -> Result<Self, Error> {
        Write::new(table, rows).map(Mutation::Replace)
    }

    pub fn delete(table: &str, key_set: KeySet) -> Self {
        Mutation::Delete {
            table: table.to_string(),
            key_set,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            Mutation::Insert(write)
            | Mutation::Update(write)
            | Mutation::InsertOrUpdate(write)
            | Mutation::Replace(write) => &write.table,
            Mutation::Delete { table, .. } => table,
        }
    }

    fn write(&self) -> Option<&Write> {
        match self {
            Mutation::Insert(write)
            | Mutation::Update(write)
            | Mutation::InsertOrUpdate(write)
            | Mutation::Replace(write) => Some(write),
            Mutation::Delete { .. } => None,
        }
    }
}

impl From<&Mutation> for proto::Mutation {
    fn from(mutation: &Mutation) -> Self {
        use proto::mutation::Operation;
        let operation = match mutation {
            Mutation::Insert(write) => Operation::Insert(write.into()),
            Mutation::Update(write) => Operation::Update(write.into()),
            Mutation::InsertOrUpdate(write) => Operation::InsertOrUpdate(write.into()),
            Mutation::Replace(write) => Operation::Replace(write.into()),
            Mutation::Delete { table, key_set } => Operation::Delete(proto::mutation::Delete {
                table: table.clone(),
                key_set: Some(key_set.clone().into()),
            }),
        };
        proto::Mutation {
            operation: Some(operation),
        }
    }
}

/// Whether any of `mutations` writes an `ARRAY` value into `table.column`.
pub(crate) fn writes_array_to(mutations: &[Mutation], table: &str, column: &str) -> bool {
    mutations
        .iter()
        .filter(|m| m.table() == table)
        .filter_map(Mutation::write)
        .any(|write| write.writes_array_to(column))
}

/// Picks the mutation sent with a `BeginTransaction` of a mutation-only transaction.
///
/// Any delete, update, replace or upsert wins over inserts, chosen at random among
/// themselves. Otherwise the insert with the most rows is chosen, at random among ties.
pub(crate) fn select_mutation_key(mutations: &[Mutation]) -> Option<&Mutation> {
    let mut rng = rand::thread_rng();
    let high_priority = mutations
        .iter()
        .filter(|m| !matches!(m, Mutation::Insert(_)))
        .collect::<Vec<_>>();
    if !high_priority.is_empty() {
        return high_priority.choose(&mut rng).copied();
    }

    let largest = mutations
        .iter()
        .filter_map(Mutation::write)
        .map(|write| write.values.len())
        .max()?;
    let candidates = mutations
        .iter()
        .filter(|m| m.write().map(|w| w.values.len()) == Some(largest))
        .collect::<Vec<_>>();
    candidates.choose(&mut rng).copied()
}

macro_rules! mutation_builder {
    ($name:ident) => {
        impl $name {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn insert(&mut self, table: &str, rows: Vec<MutationRow>) -> Result<&mut Self, Error> {
                self.mutations.push(Mutation::insert(table, rows)?);
                Ok(self)
            }

            pub fn update(&mut self, table: &str, rows: Vec<MutationRow>) -> Result<&mut Self, Error> {
                self.mutations.push(Mutation::update(table, rows)?);
                Ok(self)
            }

            pub fn upsert(&mut self, table: &str, rows: Vec<MutationRow>) -> Result<&mut Self, Error> {
                self.mutations.push(Mutation::upsert(table, rows)?);
                Ok(self)
            }

            pub fn replace(&mut self, table: &str, rows: Vec<MutationRow>) -> Result<&mut Self, Error> {
                self.mutations.push(Mutation::replace(table, rows)?);
                Ok(self)
            }

            pub fn delete_rows(&mut self, table: &str, key_set: KeySet) -> &mut Self {
                self.mutations.push(Mutation::delete(table, key_set));
                self
            }

            pub fn mutations(&self) -> &[Mutation] {
                &self.mutations
            }
        }
    };
}

/// An ordered batch of mutations, committed atomically by a transaction.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationSet {
    mutations: Vec<Mutation>,
}

mutation_builder!(MutationSet);

impl MutationSet {
    pub fn proto(&self) -> Vec<proto::Mutation> {
        self.mutations.iter().map(Into::into).collect()
    }
}

/// A group of mutations for [`crate::Client::batch_write`].
///
/// The mutations of one group are applied atomically; different groups of the same batch
/// are independent and may fail separately.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MutationGroup {
    mutations: Vec<Mutation>,
}

mutation_builder!(MutationGroup);

impl MutationGroup {
    pub fn proto(&self) -> proto::batch_write_request::MutationGroup {
        proto::batch_write_request::MutationGroup {
            mutations: self.mutations.iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{Key, Type};

    fn row(columns: &[(&str, i64)]) -> MutationRow {
        columns
            .iter()
            .fold(MutationRow::new(), |row, (c, v)| row.set_value(c, Value::Int64(*v)))
    }

    #[test]
    fn test_columns_are_unioned_in_order() {
        let write = Write::new(
            "t",
            vec![row(&[("a", 1), ("b", 2)]), row(&[("b", 3), ("a", 4)])],
        )
        .unwrap();
        assert_eq!(write.columns, vec!["a", "b"]);
        assert_eq!(
            write.values,
            vec![
                vec![Value::Int64(1), Value::Int64(2)],
                vec![Value::Int64(4), Value::Int64(3)]
            ]
        );
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let result = Mutation::insert(
            "t",
            vec![row(&[("a", 1)]), row(&[("a", 2), ("b", 3)])],
        );
        match result {
            Err(Error::InvalidArgument(message)) => {
                assert!(message.starts_with("Row at index 0 does not contain"));
                assert!(message.contains("\"b\""));
            }
            other => panic!("expected invalid argument, got {:?}", other),
        }
    }

    #[test]
    fn test_mutation_key_prefers_high_priority() {
        let mutations = vec![
            Mutation::insert("t", vec![row(&[("a", 1)]); 5]).unwrap(),
            Mutation::delete("t", KeySet::from(vec![Key::from(Value::Int64(1))])),
            Mutation::update("t", vec![row(&[("a", 1)])]).unwrap(),
        ];
        for _ in 0..20 {
            let key = select_mutation_key(&mutations).unwrap();
            assert!(key == &mutations[1] || key == &mutations[2]);
        }
    }

    #[test]
    fn test_mutation_key_picks_largest_insert() {
        let mutations = vec![
            Mutation::insert("t", vec![row(&[("a", 1)]); 2]).unwrap(),
            Mutation::insert("u", vec![row(&[("a", 1)]); 3]).unwrap(),
            Mutation::insert("v", vec![row(&[("a", 1)]); 3]).unwrap(),
        ];
        for _ in 0..20 {
            let key = select_mutation_key(&mutations).unwrap();
            assert!(key == &mutations[1] || key == &mutations[2]);
        }
        assert!(select_mutation_key(&[]).is_none());
    }

    #[test]
    fn test_array_detection() {
        let mutations = vec![Mutation::insert(
            "Bar",
            vec![MutationRow::new().set_value(
                "Foo",
                Value::Array(Type::String, vec![Value::String("x".to_string())]),
            )],
        )
        .unwrap()];
        assert!(writes_array_to(&mutations, "Bar", "Foo"));
        assert!(!writes_array_to(&mutations, "Bar", "Baz"));
        assert!(!writes_array_to(&mutations, "Other", "Foo"));
    }

    #[test]
    fn test_group_proto_keeps_order() {
        let mut group = MutationGroup::new();
        group
            .insert("t", vec![row(&[("a", 1)])])
            .unwrap()
            .delete_rows("t", KeySet::all());
        let proto = group.proto();
        assert_eq!(proto.mutations.len(), 2);
        assert!(matches!(
            proto.mutations[1].operation,
            Some(proto::mutation::Operation::Delete(_))
        ));
    }
}
