//! End-to-end runs of the context state machine through the public API.

use bson::{doc, spec::BinarySubtype, Binary, Bson, Document};
use fle_crypt::{
    AwsKmsConfig, Context, Crypt, CryptConfig, CryptError, KeyDocument, KeyId, MasterKey, State,
    StatusKind,
};

const MASTER_KEY: [u8; 96] = [0x5A; 96];

fn engine() -> Crypt {
    Crypt::new(CryptConfig::local(MASTER_KEY.to_vec())).unwrap()
}

fn engine_with_aws() -> Crypt {
    let mut config = CryptConfig::local(MASTER_KEY.to_vec());
    config.aws = Some(AwsKmsConfig {
        region: "us-east-1".into(),
    });
    Crypt::new(config).unwrap()
}

fn bytes(doc: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    doc.to_writer(&mut out).unwrap();
    out
}

fn encrypted_blob(bytes: Vec<u8>) -> Bson {
    Bson::Binary(Binary {
        subtype: BinarySubtype::Encrypted,
        bytes,
    })
}

fn marking(body: Document) -> Bson {
    let mut blob = vec![0u8];
    body.to_writer(&mut blob).unwrap();
    encrypted_blob(blob)
}

fn deterministic_by_name(name: &str, value: impl Into<Bson>) -> Bson {
    marking(doc! {
        "ka": name,
        "v": value.into(),
        "a": 1_i32,
        "iv": Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: vec![7u8; 16] }),
    })
}

fn random_by_id(id: KeyId, value: impl Into<Bson>) -> Bson {
    marking(doc! { "ki": id.to_bson(), "v": value.into(), "a": 2_i32 })
}

fn schema_collinfo(coll: &str) -> Document {
    doc! {
        "name": coll,
        "options": { "validator": { "$jsonSchema": { "properties": { "ssn": { "encrypt": {} } } } } },
    }
}

/// Run an encrypt context to completion, answering every key request with
/// `key_docs`.
fn encrypt(crypt: &Crypt, cmd: &Document, marked: Document, key_docs: &[Document]) -> Document {
    let mut ctx = Context::new(crypt);
    ctx.encrypt_init("hr.people", &bytes(cmd)).unwrap();
    if ctx.state() == State::NeedMongoCollinfo {
        let filter = ctx.mongo_op_collinfo().unwrap().to_document().unwrap();
        assert_eq!(filter, doc! { "name": "people" });
        ctx.mongo_feed_collinfo(&bytes(&schema_collinfo("people")))
            .unwrap();
        ctx.mongo_done_collinfo().unwrap();
    }
    assert_eq!(ctx.state(), State::NeedMongoMarkings);
    let marking_cmd = ctx.mongo_op_markings().unwrap().to_document().unwrap();
    assert!(marking_cmd.contains_key("jsonSchema"));

    ctx.mongo_feed_markings(&bytes(&doc! { "ok": 1, "result": marked }))
        .unwrap();
    ctx.mongo_done_markings().unwrap();
    assert_eq!(ctx.state(), State::NeedMongoKeys);
    for key in key_docs {
        ctx.mongo_feed_keys(&bytes(key)).unwrap();
    }
    ctx.mongo_done_keys().unwrap();
    assert_eq!(ctx.state(), State::Ready);
    let out = ctx.finalize().unwrap().to_document().unwrap();
    assert_eq!(ctx.state(), State::Done);
    ctx.cleanup();
    out
}

fn decrypt(crypt: &Crypt, doc: &Document, key_docs: &[Document]) -> Document {
    let mut ctx = Context::new(crypt);
    ctx.decrypt_init(&bytes(doc)).unwrap();
    assert_eq!(ctx.state(), State::NeedMongoKeys);
    let filter = ctx.mongo_op_keys().unwrap().to_document().unwrap();
    assert!(filter.get_array("$or").is_ok());
    for key in key_docs {
        ctx.mongo_feed_keys(&bytes(key)).unwrap();
    }
    ctx.mongo_done_keys().unwrap();
    let out = ctx.finalize().unwrap().to_document().unwrap();
    ctx.cleanup();
    out
}

fn ciphertext_bytes(doc: &Document, field: &str) -> Vec<u8> {
    match doc.get(field) {
        Some(Bson::Binary(bin)) if bin.subtype == BinarySubtype::Encrypted => bin.bytes.clone(),
        other => panic!("expected ciphertext at {field}, got {other:?}"),
    }
}

#[test]
fn alt_name_marking_round_trips_and_records_key_id() {
    let crypt = engine();
    let key_doc = crypt.generate_local_data_key(&["ssn-key"]).unwrap();
    let key_id = KeyDocument::parse(&key_doc).unwrap().id;

    let cmd = doc! { "insert": "people", "documents": [ { "ssn": "457-55-5462" } ] };
    let marked = doc! {
        "insert": "people",
        "documents": [ { "ssn": deterministic_by_name("ssn-key", "457-55-5462") } ],
    };
    let encrypted = encrypt(&crypt, &cmd, marked, &[key_doc.clone()]);

    let inserted = encrypted.get_array("documents").unwrap()[0]
        .as_document()
        .unwrap();
    let blob = ciphertext_bytes(inserted, "ssn");
    assert_eq!(blob[0], 1);
    assert_eq!(&blob[1..17], key_id.as_bytes());
    assert_eq!(blob[17], 0x02);

    let decrypted = decrypt(&crypt, &encrypted, &[key_doc]);
    assert_eq!(decrypted, cmd);
}

#[test]
fn deterministic_is_stable_and_random_is_not() {
    let crypt = engine();
    let key_doc = crypt.generate_local_data_key(&["k"]).unwrap();
    let key_id = KeyDocument::parse(&key_doc).unwrap().id;
    let cmd = doc! { "find": "people" };

    let det = || {
        encrypt(
            &crypt,
            &cmd,
            doc! { "find": "people", "filter": { "ssn": deterministic_by_name("k", 42_i32) } },
            &[key_doc.clone()],
        )
    };
    let a = det();
    let b = det();
    assert_eq!(
        ciphertext_bytes(a.get_document("filter").unwrap(), "ssn"),
        ciphertext_bytes(b.get_document("filter").unwrap(), "ssn")
    );

    let rnd = || {
        encrypt(
            &crypt,
            &cmd,
            doc! { "find": "people", "filter": { "ssn": random_by_id(key_id, 42_i32) } },
            &[key_doc.clone()],
        )
    };
    let c = rnd();
    let d = rnd();
    let c_blob = ciphertext_bytes(c.get_document("filter").unwrap(), "ssn");
    assert_eq!(c_blob[0], 2);
    assert_ne!(c_blob, ciphertext_bytes(d.get_document("filter").unwrap(), "ssn"));

    let decrypted = decrypt(&crypt, &c, &[key_doc]);
    assert_eq!(decrypted.get_document("filter").unwrap().get_i32("ssn").unwrap(), 42);
}

#[test]
fn many_value_types_survive_encryption() {
    let crypt = engine();
    let key_doc = crypt.generate_local_data_key(&["k"]).unwrap();
    let key_id = KeyDocument::parse(&key_doc).unwrap().id;

    let plain = doc! {
        "s": "text",
        "i": 7_i32,
        "l": 7_000_000_000_i64,
        "f": 1.25_f64,
        "b": false,
        "d": { "nested": true },
        "a": [1, "two", 3.0],
    };
    let mut marked = Document::new();
    for (k, v) in &plain {
        marked.insert(k.clone(), random_by_id(key_id, v.clone()));
    }
    let encrypted = encrypt(&crypt, &doc! { "insert": "people" }, marked, &[key_doc.clone()]);
    for k in plain.keys() {
        ciphertext_bytes(&encrypted, k);
    }
    assert_eq!(decrypt(&crypt, &encrypted, &[key_doc]), plain);
}

#[test]
fn second_encrypt_uses_cached_schema() {
    let crypt = engine();
    let key_doc = crypt.generate_local_data_key(&["k"]).unwrap();
    let marked = || doc! { "find": "people", "filter": { "x": deterministic_by_name("k", "v") } };
    encrypt(&crypt, &doc! { "find": "people" }, marked(), &[key_doc.clone()]);
    assert!(crypt.schema_cache().get("hr.people").is_some());

    let mut ctx = Context::new(&crypt);
    ctx.encrypt_init("hr.people", &bytes(&doc! { "find": "people" }))
        .unwrap();
    assert_eq!(ctx.state(), State::NeedMongoMarkings);
}

#[test]
fn missing_key_fails_with_kms_status() {
    let crypt = engine();
    let cmd = doc! { "find": "people" };
    let mut ctx = Context::new(&crypt);
    ctx.encrypt_init("hr.people", &bytes(&cmd)).unwrap();
    ctx.mongo_feed_collinfo(&bytes(&schema_collinfo("people")))
        .unwrap();
    ctx.mongo_done_collinfo().unwrap();
    let marked = doc! { "find": "people", "filter": { "x": deterministic_by_name("nope", 1) } };
    ctx.mongo_feed_markings(&bytes(&doc! { "result": marked }))
        .unwrap();
    ctx.mongo_done_markings().unwrap();

    let err = ctx.mongo_done_keys().unwrap_err();
    assert!(matches!(err, CryptError::Kms(_)));
    assert_eq!(ctx.state(), State::Error);
    assert_eq!(ctx.status().kind(), StatusKind::Kms);

    // Terminal: nothing changes any more.
    let status = ctx.status().clone();
    assert!(ctx.finalize().is_err());
    assert!(ctx.mongo_op_keys().is_err());
    assert_eq!(ctx.state(), State::Error);
    assert_eq!(ctx.status(), &status);
}

#[test]
fn externally_wrapped_key_uses_kms_round() {
    let crypt = engine_with_aws();
    let key_id = KeyId::new_random();
    let data_key = vec![0x42u8; 96];
    let key_doc = KeyDocument {
        id: key_id,
        alt_names: vec![],
        key_material: b"opaque-kms-ciphertext".to_vec(),
        master_key: MasterKey::Aws {
            region: "us-east-1".into(),
            key: "arn:aws:kms:us-east-1:000000000000:key/test".into(),
        },
    }
    .to_document();

    let mut ctx = Context::new(&crypt);
    ctx.encrypt_init("hr.people", &bytes(&doc! { "find": "people" }))
        .unwrap();
    ctx.mongo_feed_collinfo(&bytes(&schema_collinfo("people")))
        .unwrap();
    ctx.mongo_done_collinfo().unwrap();
    let marked = doc! { "find": "people", "filter": { "x": random_by_id(key_id, "v") } };
    ctx.mongo_feed_markings(&bytes(&doc! { "result": marked }))
        .unwrap();
    ctx.mongo_done_markings().unwrap();
    ctx.mongo_feed_keys(&bytes(&key_doc)).unwrap();
    ctx.mongo_done_keys().unwrap();
    assert_eq!(ctx.state(), State::NeedKms);

    let requests = ctx.kms_requests().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].key_id, key_id);
    assert_eq!(requests[0].ciphertext, b"opaque-kms-ciphertext".to_vec());
    ctx.kms_feed(&key_id, &data_key).unwrap();
    ctx.kms_done().unwrap();
    assert_eq!(ctx.state(), State::Ready);

    let out = ctx.finalize().unwrap().to_document().unwrap();
    let blob = ciphertext_bytes(out.get_document("filter").unwrap(), "x");
    assert_eq!(&blob[1..17], key_id.as_bytes());
}

#[test]
fn short_kms_plaintext_is_a_kms_error() {
    let crypt = engine_with_aws();
    let key_id = KeyId::new_random();
    let key_doc = KeyDocument {
        id: key_id,
        alt_names: vec![],
        key_material: vec![1, 2, 3],
        master_key: MasterKey::Aws {
            region: "us-east-1".into(),
            key: "cmk".into(),
        },
    }
    .to_document();

    let ciphertext = {
        // A syntactically valid ciphertext naming `key_id`.
        let mut blob = vec![1u8];
        blob.extend_from_slice(key_id.as_bytes());
        blob.push(0x02);
        blob.extend_from_slice(&[0u8; 64]);
        encrypted_blob(blob)
    };
    let mut ctx = Context::new(&crypt);
    ctx.decrypt_init(&bytes(&doc! { "x": ciphertext })).unwrap();
    ctx.mongo_feed_keys(&bytes(&key_doc)).unwrap();
    ctx.mongo_done_keys().unwrap();
    let err = ctx.kms_feed(&key_id, &[0u8; 32]).unwrap_err();
    assert_eq!(
        err,
        CryptError::kms("decrypted key is incorrect length, expected: 96, got: 32")
    );
    assert_eq!(ctx.status().kind(), StatusKind::Kms);
}

#[test]
fn tampered_ciphertext_fails_finalize() {
    let crypt = engine();
    let key_doc = crypt.generate_local_data_key(&["k"]).unwrap();
    let marked = doc! { "find": "people", "filter": { "x": deterministic_by_name("k", "v") } };
    let encrypted = encrypt(&crypt, &doc! { "find": "people" }, marked, &[key_doc.clone()]);

    let mut blob = ciphertext_bytes(encrypted.get_document("filter").unwrap(), "x");
    let last = blob.len() - 1;
    blob[last] ^= 0x01;
    let tampered = doc! { "x": encrypted_blob(blob) };

    let mut ctx = Context::new(&crypt);
    ctx.decrypt_init(&bytes(&tampered)).unwrap();
    ctx.mongo_feed_keys(&bytes(&key_doc)).unwrap();
    ctx.mongo_done_keys().unwrap();
    assert!(ctx.finalize().is_err());
    assert_eq!(ctx.state(), State::Error);
    assert_eq!(ctx.status().kind(), StatusKind::Client);
}
