//! Integration tests for local DNS registration against the memory store.

mod common;

use std::sync::Arc;

use common::{identity, init_tracing};
use rstest::rstest;
use stratos_director::config::DnsConfig;
use stratos_director::store::{InstanceStore, MemoryStore};
use stratos_director::types::InstanceRecord;
use stratos_director::LocalDnsRegistrar;

async fn store_with_spec(spec_json: Option<&str>) -> Arc<MemoryStore> {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    store
        .insert_instance(&InstanceRecord::new(&identity()))
        .await
        .unwrap();
    if let Some(spec_json) = spec_json {
        store.update_spec(&identity().id, spec_json).await.unwrap();
    }
    store
}

fn registrar(store: &Arc<MemoryStore>) -> LocalDnsRegistrar {
    LocalDnsRegistrar::new(store.clone(), DnsConfig::default())
}

#[rstest]
#[case::named_networks(
    r#"{"deployment":"prod","job":{"name":"web"},"networks":{"private":{"ip":"10.0.0.5"}}}"#,
    "uuid-1.web.private.prod.stratos",
    "10.0.0.5"
)]
#[case::ordered_pairs(
    r#"{"deployment":"prod","job":{"name":"web"},"networks":[["public",{"ip":"203.0.113.9"}],["private",{"ip":"10.0.0.5"}]]}"#,
    "uuid-1.web.public.prod.stratos",
    "203.0.113.9"
)]
#[case::deployment_from_instance(
    r#"{"job":{"name":"web"},"networks":{"private":{"ip":"10.0.0.5"}}}"#,
    "uuid-1.web.private.prod.stratos",
    "10.0.0.5"
)]
#[tokio::test]
async fn eligible_specs_get_a_record(#[case] spec: &str, #[case] name: &str, #[case] ip: &str) {
    let store = store_with_spec(Some(spec)).await;

    let record = registrar(&store).register(&identity()).await.unwrap();

    assert_eq!(record.name, name);
    assert_eq!(record.ip, ip);
    assert_eq!(
        store.local_dns_records(&identity().id).await.unwrap(),
        vec![record]
    );
}

#[rstest]
#[case::no_spec(None)]
#[case::not_json(Some("{not json"))]
#[case::no_networks(Some(r#"{"job":{"name":"web"}}"#))]
#[case::empty_networks(Some(r#"{"job":{"name":"web"},"networks":{}}"#))]
#[case::no_ip(Some(r#"{"job":{"name":"web"},"networks":{"private":{}}}"#))]
#[case::no_job(Some(r#"{"networks":{"private":{"ip":"10.0.0.5"}}}"#))]
#[tokio::test]
async fn ineligible_specs_are_skipped(#[case] spec: Option<&str>) {
    let store = store_with_spec(spec).await;

    let record = registrar(&store).register(&identity()).await;

    assert!(record.is_none());
    assert!(store
        .local_dns_records(&identity().id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn registering_twice_keeps_one_record() {
    let store = store_with_spec(Some(
        r#"{"job":{"name":"web"},"networks":{"private":{"ip":"10.0.0.5"}}}"#,
    ))
    .await;
    let registrar = registrar(&store);

    let first = registrar.register(&identity()).await;
    let second = registrar.register(&identity()).await;

    assert_eq!(first, second);
    assert_eq!(store.local_dns_records(&identity().id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn custom_tld_is_used() {
    let store = store_with_spec(Some(
        r#"{"job":{"name":"web"},"networks":{"private":{"ip":"10.0.0.5"}}}"#,
    ))
    .await;
    let registrar = LocalDnsRegistrar::new(
        store.clone(),
        DnsConfig {
            enabled: true,
            tld: "internal".to_owned(),
        },
    );

    let record = registrar.register(&identity()).await.unwrap();

    assert_eq!(record.name, "uuid-1.web.private.prod.internal");
}

#[tokio::test]
async fn unknown_instance_gets_no_record() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());

    assert!(registrar(&store).register(&identity()).await.is_none());
}
