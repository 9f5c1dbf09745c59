//! Create-or-update keyed by natural key.
//!
//! Every entity table is written through [`Database::upsert`]. The
//! select-then-write sequence is not atomic across connections, so natural
//! keys carry UNIQUE constraints in the schema and a constraint violation on
//! insert is retried once as an update of the row that won the race.

use crate::db::{Database, now_timestamp};
use crate::error::{AppError, Result};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params_from_iter};
use std::collections::BTreeMap;

/// Snapshot of a stored row, column name to value.
pub type Record = BTreeMap<String, Value>;

/// Outcome of an upsert.
#[derive(Debug, Clone)]
pub struct UpsertResult {
    /// ID of the inserted or updated row.
    pub id: i64,
    /// Row as it was before the update; `None` when the row was inserted.
    pub prior: Option<Record>,
}

impl UpsertResult {
    /// Whether this call created the row.
    pub fn created(&self) -> bool {
        self.prior.is_none()
    }
}

/// A single upsert request.
struct Plan<'a> {
    table: &'a str,
    fields: &'a [(&'a str, Value)],
    natural_keys: &'a [&'a str],
    id_field: &'a str,
    timestamp_field: Option<&'a str>,
}

impl Database {
    /// Insert `fields` into `table`, or update the row whose `natural_keys`
    /// match.
    ///
    /// On update every field outside `natural_keys` is overwritten and
    /// `timestamp_field`, when given, is stamped with the current time. The
    /// timestamp is also stamped on insert unless `fields` sets it.
    pub fn upsert(
        &self,
        table: &str,
        fields: &[(&str, Value)],
        natural_keys: &[&str],
        id_field: &str,
        timestamp_field: Option<&str>,
    ) -> Result<UpsertResult> {
        let plan = Plan {
            table,
            fields,
            natural_keys,
            id_field,
            timestamp_field,
        };
        plan.validate()?;

        let conn = self.conn.lock();
        let existing = plan.select_existing(&conn)?;
        plan.write(&conn, existing)
    }
}

impl Plan<'_> {
    fn validate(&self) -> Result<()> {
        let names = [self.table, self.id_field]
            .into_iter()
            .chain(self.timestamp_field)
            .chain(self.natural_keys.iter().copied())
            .chain(self.fields.iter().map(|(name, _)| *name));

        for name in names {
            if name.is_empty() || !name.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
                return Err(AppError::Internal(format!("Invalid identifier: {:?}", name)));
            }
        }

        if self.natural_keys.is_empty() {
            return Err(AppError::Internal(format!(
                "Upsert into {} needs at least one natural key",
                self.table
            )));
        }

        for key in self.natural_keys {
            if self.value_of(key).is_none() {
                return Err(AppError::Internal(format!(
                    "Natural key {}.{} missing from fields",
                    self.table, key
                )));
            }
        }

        Ok(())
    }

    fn value_of(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| value)
    }

    fn select_existing(&self, conn: &Connection) -> Result<Option<(i64, Record)>> {
        let clause = self
            .natural_keys
            .iter()
            .enumerate()
            .map(|(i, key)| format!("{} IS ?{}", key, i + 1))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!("SELECT * FROM {} WHERE {} LIMIT 1", self.table, clause);

        let mut stmt = conn.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let keys = self.natural_keys.iter().filter_map(|k| self.value_of(k));

        let record = stmt
            .query_row(params_from_iter(keys), |row| {
                let mut record = Record::new();
                for (i, column) in columns.iter().enumerate() {
                    record.insert(column.clone(), row.get::<_, Value>(i)?);
                }
                Ok(record)
            })
            .optional()?;

        match record {
            Some(record) => {
                let id = match record.get(self.id_field) {
                    Some(Value::Integer(id)) => *id,
                    other => {
                        return Err(AppError::Internal(format!(
                            "{}.{} is not an integer id: {:?}",
                            self.table, self.id_field, other
                        )));
                    }
                };
                Ok(Some((id, record)))
            }
            None => Ok(None),
        }
    }

    /// Write against a previously observed snapshot of the natural key.
    fn write(&self, conn: &Connection, existing: Option<(i64, Record)>) -> Result<UpsertResult> {
        if let Some((id, prior)) = existing {
            return self.update(conn, id, prior);
        }

        match self.insert(conn) {
            Ok(id) => Ok(UpsertResult { id, prior: None }),
            Err(e) if is_constraint_violation(&e) => {
                tracing::debug!(
                    table = self.table,
                    "Insert lost a race on the natural key, retrying as update"
                );
                match self.select_existing(conn)? {
                    Some((id, prior)) => self.update(conn, id, prior),
                    None => Err(AppError::ConstraintViolation {
                        table: self.table.to_string(),
                        message: e.to_string(),
                    }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    fn insert(&self, conn: &Connection) -> rusqlite::Result<i64> {
        let mut columns: Vec<&str> = self.fields.iter().map(|(name, _)| *name).collect();
        let mut values: Vec<Value> = self.fields.iter().map(|(_, v)| v.clone()).collect();

        if let Some(ts) = self.timestamp_field
            && self.value_of(ts).is_none()
        {
            columns.push(ts);
            values.push(Value::Integer(now_timestamp()));
        }

        let placeholders = (1..=columns.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table,
            columns.join(", "),
            placeholders
        );
        conn.execute(&sql, params_from_iter(values.iter()))?;

        let rowid = conn.last_insert_rowid();
        conn.query_row(
            &format!("SELECT {} FROM {} WHERE rowid = ?1", self.id_field, self.table),
            [rowid],
            |row| row.get(0),
        )
    }

    fn update(&self, conn: &Connection, id: i64, prior: Record) -> Result<UpsertResult> {
        let mut assignments: Vec<(&str, Value)> = self
            .fields
            .iter()
            .filter(|(name, _)| !self.natural_keys.contains(name) && *name != self.id_field)
            .map(|(name, value)| (*name, value.clone()))
            .collect();

        if let Some(ts) = self.timestamp_field {
            let now = Value::Integer(now_timestamp());
            match assignments.iter_mut().find(|(name, _)| *name == ts) {
                Some(slot) => slot.1 = now,
                None => assignments.push((ts, now)),
            }
        }

        if assignments.is_empty() {
            return Ok(UpsertResult {
                id,
                prior: Some(prior),
            });
        }

        let set = assignments
            .iter()
            .enumerate()
            .map(|(i, (name, _))| format!("{} = ?{}", name, i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            self.table,
            set,
            self.id_field,
            assignments.len() + 1
        );

        let mut values: Vec<Value> = assignments.into_iter().map(|(_, v)| v).collect();
        values.push(Value::Integer(id));

        conn.execute(&sql, params_from_iter(values.iter()))
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    AppError::ConstraintViolation {
                        table: self.table.to_string(),
                        message: e.to_string(),
                    }
                } else {
                    e.into()
                }
            })?;

        Ok(UpsertResult {
            id,
            prior: Some(prior),
        })
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_memory().unwrap()
    }

    fn person(name: &str, uri: &str) -> Vec<(&'static str, Value)> {
        vec![
            ("name", Value::Text(name.to_string())),
            ("uri", Value::Text(uri.to_string())),
            ("email", Value::Text(String::new())),
        ]
    }

    const PERSON_KEYS: &[&str] = &["name", "uri", "email"];

    #[test]
    fn insert_then_update_returns_same_id() {
        let db = test_db();
        let fields = vec![
            ("remote_id", Value::Integer(42)),
            ("title", Value::Text("First".into())),
        ];
        let first = db
            .upsert("items", &fields, &["remote_id"], "id", Some("updated"))
            .unwrap();
        assert!(first.created());

        let fields = vec![
            ("remote_id", Value::Integer(42)),
            ("title", Value::Text("Second".into())),
        ];
        let second = db
            .upsert("items", &fields, &["remote_id"], "id", Some("updated"))
            .unwrap();

        assert_eq!(first.id, second.id);
        let prior = second.prior.unwrap();
        assert_eq!(prior.get("title"), Some(&Value::Text("First".into())));
        assert_eq!(db.get_item_by_remote_id(42).unwrap().unwrap().title, "Second");
    }

    #[test]
    fn identical_upserts_only_move_the_timestamp() {
        let db = test_db();
        let fields = person("Author", "https://archiveofourown.org/users/author");

        let first = db
            .upsert("persons", &fields, PERSON_KEYS, "id", Some("updated"))
            .unwrap();
        db.conn
            .lock()
            .execute("UPDATE persons SET updated = 5 WHERE id = ?1", [first.id])
            .unwrap();

        let second = db
            .upsert("persons", &fields, PERSON_KEYS, "id", Some("updated"))
            .unwrap();
        let prior = second.prior.clone().unwrap();
        let third = db
            .upsert("persons", &fields, PERSON_KEYS, "id", Some("updated"))
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.id, third.id);
        assert_eq!(prior.get("updated"), Some(&Value::Integer(5)));

        let after = third.prior.unwrap();
        for column in ["id", "name", "uri", "email"] {
            assert_eq!(prior.get(column), after.get(column), "column {}", column);
        }
        assert_ne!(after.get("updated"), Some(&Value::Integer(5)));

        let count: i64 = db
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM persons", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn null_natural_key_values_match() {
        let db = test_db();
        let fields = vec![
            ("remote_id", Value::Integer(7)),
            ("language", Value::Null),
        ];
        let a = db
            .upsert("items", &fields, &["remote_id", "language"], "id", None)
            .unwrap();
        let b = db
            .upsert("items", &fields, &["remote_id", "language"], "id", None)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert!(!b.created());
    }

    #[test]
    fn stale_snapshot_retries_as_update() {
        let db = test_db();
        let fields = person("Racer", "");
        let winner = db
            .upsert("persons", &fields, PERSON_KEYS, "id", Some("updated"))
            .unwrap();

        // A writer that checked before the winner inserted saw no row.
        let plan = Plan {
            table: "persons",
            fields: &fields,
            natural_keys: PERSON_KEYS,
            id_field: "id",
            timestamp_field: Some("updated"),
        };
        let conn = db.conn.lock();
        let loser = plan.write(&conn, None).unwrap();

        assert_eq!(loser.id, winner.id);
        assert!(loser.prior.is_some());
    }

    #[test]
    fn rejects_bad_identifiers() {
        let db = test_db();
        let fields = vec![("remote_id", Value::Integer(1))];
        assert!(
            db.upsert("items; DROP TABLE items", &fields, &["remote_id"], "id", None)
                .is_err()
        );
        assert!(db.upsert("items", &fields, &["title"], "id", None).is_err());
        assert!(db.upsert("items", &fields, &[], "id", None).is_err());
    }

    #[test]
    fn concurrent_connections_keep_natural_keys_unique() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        Database::open(&path).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let db = Database::open(&path).unwrap();
                    let fields = vec![
                        ("remote_id", Value::Integer(1001)),
                        ("title", Value::Text(format!("writer {}", i))),
                    ];
                    db.upsert("items", &fields, &["remote_id"], "id", Some("updated"))
                        .unwrap()
                        .id
                })
            })
            .collect();

        let ids: Vec<i64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let db = Database::open(&path).unwrap();
        let count: i64 = db
            .conn
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM items WHERE remote_id = 1001",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
