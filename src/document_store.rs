use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::transaction::no_transaction;
use crate::{Error, Transactional};

/// An index of a collection. Unique indices reject documents sharing the same values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// The indexed fields, as dotted paths.
    pub fields: Vec<String>,
    /// Whether two documents can share the same values.
    pub unique: bool,
}

impl Index {
    /// Creates a non-unique index.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Makes the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A condition on documents. Fields are dotted paths into the document.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Matches every document.
    Any,
    /// The field is equal to the value.
    Eq(String, Value),
    /// The field is greater than the value.
    Gt(String, Value),
    /// The field is greater than or equal to the value.
    Gte(String, Value),
    /// The field is lower than the value.
    Lt(String, Value),
    /// The field is lower than or equal to the value.
    Lte(String, Value),
    /// The field is equal to one of the values.
    In(String, Vec<Value>),
    /// The field exists.
    Exists(String),
    /// Both filters match.
    And(Box<Filter>, Box<Filter>),
    /// At least one of the filters matches.
    Or(Box<Filter>, Box<Filter>),
    /// The filter does not match.
    Not(Box<Filter>),
}

impl Filter {
    /// Shorthand for [Filter::Eq].
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    /// Combines two filters with [Filter::And].
    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    /// Combines two filters with [Filter::Or].
    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    /// Negates a filter.
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Whether a document matches the filter.
    pub fn matches(&self, doc: &Value) -> bool {
        match self {
            Filter::Any => true,
            Filter::Eq(field, value) => lookup(doc, field) == Some(value),
            Filter::Gt(field, value) => compare(doc, field, value) == Some(Ordering::Greater),
            Filter::Gte(field, value) => matches!(
                compare(doc, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Filter::Lt(field, value) => compare(doc, field, value) == Some(Ordering::Less),
            Filter::Lte(field, value) => matches!(
                compare(doc, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Filter::In(field, values) => {
                lookup(doc, field).map_or(false, |found| values.contains(found))
            }
            Filter::Exists(field) => lookup(doc, field).is_some(),
            Filter::And(left, right) => left.matches(doc) && right.matches(doc),
            Filter::Or(left, right) => left.matches(doc) || right.matches(doc),
            Filter::Not(filter) => !filter.matches(doc),
        }
    }
}

fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn compare(doc: &Value, field: &str, value: &Value) -> Option<Ordering> {
    match (lookup(doc, field)?, value) {
        (Value::Number(left), Value::Number(right)) => {
            left.as_f64()?.partial_cmp(&right.as_f64()?)
        }
        (Value::String(left), Value::String(right)) => Some(left.cmp(right)),
        (Value::Bool(left), Value::Bool(right)) => Some(left.cmp(right)),
        _ => None,
    }
}

fn merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

/// Stores JSON documents in named collections.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates a collection. Does nothing if it already exists.
    async fn add_collection(&self, collection: &str, indices: Vec<Index>) -> Result<(), Error>;

    /// Whether a collection exists.
    async fn has_collection(&self, collection: &str) -> Result<bool, Error>;

    /// The names of every collection, sorted.
    async fn list_collections(&self) -> Result<Vec<String>, Error>;

    /// Drops a collection and its documents. Does nothing if it does not exist.
    async fn drop_collection(&self, collection: &str) -> Result<(), Error>;

    /// Inserts a document, or merges it into the existing one.
    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<(), Error>;

    /// Gets a document.
    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>, Error>;

    /// Deletes a document. Does nothing if it does not exist.
    async fn delete_doc(&self, collection: &str, id: &str) -> Result<(), Error>;

    /// The documents matching a filter with their ids, sorted by id.
    async fn filter_docs(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(String, Value)>, Error>;
}

#[derive(Debug, Clone, Default)]
struct Collection {
    indices: Vec<Index>,
    docs: BTreeMap<String, Value>,
}

impl Collection {
    fn check_unique_indices(&self, id: &str, doc: &Value) -> Result<(), Error> {
        for index in self.indices.iter().filter(|index| index.unique) {
            let key: Vec<_> = index.fields.iter().map(|field| lookup(doc, field)).collect();
            if key.iter().all(Option::is_none) {
                continue;
            }
            let duplicate = self.docs.iter().any(|(other_id, other)| {
                other_id != id
                    && index
                        .fields
                        .iter()
                        .zip(&key)
                        .all(|(field, value)| lookup(other, field) == *value)
            });
            if duplicate {
                return Err(Error::Storage(format!(
                    "Document {id} violates unique index on {}",
                    index.fields.join(", ")
                )));
            }
        }
        Ok(())
    }
}

type Collections = BTreeMap<String, Collection>;

fn find_collection<'a>(collections: &'a Collections, name: &str) -> Result<&'a Collection, Error> {
    collections
        .get(name)
        .ok_or_else(|| Error::UnknownCollection(name.to_string()))
}

fn find_collection_mut<'a>(
    collections: &'a mut Collections,
    name: &str,
) -> Result<&'a mut Collection, Error> {
    collections
        .get_mut(name)
        .ok_or_else(|| Error::UnknownCollection(name.to_string()))
}

/// A [DocumentStore] keeping documents in memory.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: Mutex<Collections>,
    transaction: Mutex<Option<Collections>>,
}

impl InMemoryDocumentStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn add_collection(&self, collection: &str, indices: Vec<Index>) -> Result<(), Error> {
        self.collections
            .lock()?
            .entry(collection.to_string())
            .or_insert_with(|| Collection {
                indices,
                docs: BTreeMap::new(),
            });
        Ok(())
    }

    async fn has_collection(&self, collection: &str) -> Result<bool, Error> {
        Ok(self.collections.lock()?.contains_key(collection))
    }

    async fn list_collections(&self) -> Result<Vec<String>, Error> {
        Ok(self.collections.lock()?.keys().cloned().collect())
    }

    async fn drop_collection(&self, collection: &str) -> Result<(), Error> {
        self.collections.lock()?.remove(collection);
        Ok(())
    }

    async fn upsert_doc(&self, collection: &str, id: &str, doc: Value) -> Result<(), Error> {
        let mut collections = self.collections.lock()?;
        let collection = find_collection_mut(&mut collections, collection)?;
        let mut merged = collection.docs.get(id).cloned().unwrap_or(Value::Null);
        merge(&mut merged, doc);
        collection.check_unique_indices(id, &merged)?;
        collection.docs.insert(id.to_string(), merged);
        Ok(())
    }

    async fn get_doc(&self, collection: &str, id: &str) -> Result<Option<Value>, Error> {
        let collections = self.collections.lock()?;
        Ok(find_collection(&collections, collection)?
            .docs
            .get(id)
            .cloned())
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> Result<(), Error> {
        let mut collections = self.collections.lock()?;
        find_collection_mut(&mut collections, collection)?
            .docs
            .remove(id);
        Ok(())
    }

    async fn filter_docs(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(String, Value)>, Error> {
        let collections = self.collections.lock()?;
        Ok(find_collection(&collections, collection)?
            .docs
            .iter()
            .filter(|(_, doc)| filter.matches(doc))
            .map(|(id, doc)| (id.clone(), doc.clone()))
            .collect())
    }
}

#[async_trait]
impl Transactional for InMemoryDocumentStore {
    async fn begin_transaction(&self) -> Result<(), Error> {
        let copy = self.collections.lock()?.clone();
        let mut transaction = self.transaction.lock()?;
        if transaction.is_some() {
            return Err(Error::transaction(Error::Storage(
                "A transaction is already in progress".into(),
            )));
        }
        *transaction = Some(copy);
        Ok(())
    }

    async fn commit_transaction(&self) -> Result<(), Error> {
        self.transaction
            .lock()?
            .take()
            .map(|_| ())
            .ok_or_else(no_transaction)
    }

    async fn rollback_transaction(&self) -> Result<(), Error> {
        let copy = self.transaction.lock()?.take().ok_or_else(no_transaction)?;
        *self.collections.lock()? = copy;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    async fn store() -> InMemoryDocumentStore {
        let store = InMemoryDocumentStore::new();
        store
            .add_collection("users", vec![Index::new(["username"]).unique()])
            .await
            .unwrap();
        store
            .upsert_doc("users", "u-1", json!({ "username": "Alex", "profile": { "age": 31 } }))
            .await
            .unwrap();
        store
            .upsert_doc("users", "u-2", json!({ "username": "John", "profile": { "age": 25 } }))
            .await
            .unwrap();
        store
    }

    fn ids(docs: Vec<(String, Value)>) -> Vec<String> {
        docs.into_iter().map(|(id, _)| id).collect()
    }

    #[tokio::test]
    async fn test_upsert_merges_documents() {
        let store = store().await;

        store
            .upsert_doc("users", "u-1", json!({ "profile": { "city": "Rennes" } }))
            .await
            .unwrap();

        assert_eq!(
            store.get_doc("users", "u-1").await.unwrap(),
            Some(json!({ "username": "Alex", "profile": { "age": 31, "city": "Rennes" } }))
        );
    }

    #[tokio::test]
    async fn test_filter_docs() {
        let store = store().await;

        let adults = store
            .filter_docs("users", &Filter::Gte("profile.age".into(), json!(30)))
            .await
            .unwrap();
        let named = store
            .filter_docs(
                "users",
                &Filter::eq("username", "John").or(Filter::eq("username", "Alex")),
            )
            .await
            .unwrap();
        let not_alex = store
            .filter_docs("users", &Filter::eq("username", "Alex").not())
            .await
            .unwrap();

        assert_eq!(ids(adults), vec!["u-1"]);
        assert_eq!(ids(named), vec!["u-1", "u-2"]);
        assert_eq!(ids(not_alex), vec!["u-2"]);
        assert!(Filter::In("username".into(), vec![json!("Alex")])
            .matches(&json!({ "username": "Alex" })));
        assert!(!Filter::Exists("profile.city".into()).matches(&json!({ "profile": {} })));
    }

    #[tokio::test]
    async fn test_unique_index() {
        let store = store().await;

        let error = store
            .upsert_doc("users", "u-3", json!({ "username": "Alex" }))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Storage(_)));
        assert_eq!(store.get_doc("users", "u-3").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_doc() {
        let store = store().await;

        store.delete_doc("users", "u-1").await.unwrap();

        assert_eq!(store.get_doc("users", "u-1").await.unwrap(), None);
        assert_eq!(
            ids(store.filter_docs("users", &Filter::Any).await.unwrap()),
            vec!["u-2"]
        );
        assert!(matches!(
            store.delete_doc("groups", "g-1").await,
            Err(Error::UnknownCollection(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let store = InMemoryDocumentStore::new();

        let error = store.get_doc("users", "u-1").await.unwrap_err();

        assert_eq!(error.status_code(), 404);
        store.drop_collection("users").await.unwrap();
    }

    #[tokio::test]
    async fn test_rollback_restores_collections() {
        let store = store().await;

        store.begin_transaction().await.unwrap();
        store.delete_doc("users", "u-1").await.unwrap();
        store.drop_collection("users").await.unwrap();
        store.rollback_transaction().await.unwrap();

        assert_eq!(store.list_collections().await.unwrap(), vec!["users"]);
        assert!(store.get_doc("users", "u-1").await.unwrap().is_some());
    }
}
