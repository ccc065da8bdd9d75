//! Collection schemas: extraction from `listCollections` replies and the
//! engine-wide cache.

pub mod cache;

pub use cache::SchemaCache;

use bson::Document;

/// The `$jsonSchema` validator of a collection info document, if it has one.
///
/// Looks at `options.validator.$jsonSchema`. A collection without a
/// validator, or with a validator that is not a JSON schema, yields `None`.
pub fn from_collinfo(collinfo: &Document) -> Option<Document> {
    collinfo
        .get_document("options")
        .and_then(|options| options.get_document("validator"))
        .and_then(|validator| validator.get_document("$jsonSchema"))
        .ok()
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn extracts_json_schema() {
        let info = doc! {
            "name": "users",
            "options": { "validator": { "$jsonSchema": { "bsonType": "object" } } },
        };
        assert_eq!(from_collinfo(&info), Some(doc! { "bsonType": "object" }));
    }

    #[test]
    fn missing_validator_is_none() {
        assert!(from_collinfo(&doc! { "name": "users" }).is_none());
        assert!(from_collinfo(&doc! { "name": "users", "options": {} }).is_none());
        let query_validator = doc! { "options": { "validator": { "age": { "$gt": 0 } } } };
        assert!(from_collinfo(&query_validator).is_none());
    }
}
