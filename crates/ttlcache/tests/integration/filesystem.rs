use std::fs;
use std::io;
use std::sync::Arc;

use ttlcache::caching::{CacheContainer, CacheKey, CachingOptions, Coalescer};
use ttlcache::config::{Config, StorageConfig};
use ttlcache::storage;

use crate::{Backend, ManualClock, START, setup_cache};
use ttlcache_test as test;

#[tokio::test]
async fn test_record_layout() {
    let cache = setup_cache(Backend::Filesystem);
    let cache_dir = cache.cache_dir.as_ref().unwrap();

    let key = CacheKey::derive("fetchUser", "default", &("max",)).unwrap();
    let options = CachingOptions::default().lazy(false);
    cache
        .container()
        .set(key.as_str(), &["user", "max"], &options)
        .await
        .unwrap();

    let path = cache_dir.path().join("items").join(key.storage_path());
    let persisted = fs::read_to_string(path).unwrap();
    insta::assert_snapshot!(persisted, @r#"{"key":"fetchUser:default:[\"max\"]","record":{"content":["user","max"],"meta":{"createdAt":1700000000000,"ttl":60000,"isLazy":false}}}"#);
}

#[tokio::test]
async fn test_records_outlive_the_process() {
    test::setup();
    let cache_dir = test::tempdir();
    let config = Config {
        storage: StorageConfig::Filesystem {
            path: cache_dir.path().to_owned(),
        },
        ..Default::default()
    };
    let options = CachingOptions::from_config(&config.caching);
    let clock = ManualClock::new(START);

    let first = Coalescer::new(
        CacheContainer::new(storage::from_config(&config.storage).unwrap())
            .with_clock(clock.clone()),
    );
    let value: u32 = first
        .execute(CacheKey::from("answer"), &options, || async {
            Ok::<_, io::Error>(42)
        })
        .await
        .unwrap();
    assert_eq!(value, 42);
    drop(first);

    // a fresh instance over the same directory, no in-flight state is shared
    let second = Coalescer::new(
        CacheContainer::new(storage::from_config(&config.storage).unwrap())
            .with_clock(clock.clone()),
    );
    let value: u32 = second
        .execute(CacheKey::from("answer"), &options, || async {
            Err::<u32, _>(io::Error::other("should be cached"))
        })
        .await
        .unwrap();
    assert_eq!(value, 42);

    // the default ttl applies across instances as well
    clock.advance(60_001);
    let stale = second.container().get::<u32>("answer").await.unwrap().unwrap();
    assert!(stale.expired);
    assert!(second.container().get::<u32>("answer").await.unwrap().is_none());
}

#[tokio::test]
async fn test_storage_failures_are_surfaced() {
    test::setup();
    let cache_dir = test::tempdir();
    let storage = storage::FilesystemStorage::new(cache_dir.path()).unwrap();
    let coalescer = Coalescer::new(CacheContainer::new(Arc::new(storage)));

    // a directory where the record file should be makes reads fail
    let key = CacheKey::from("blocked");
    fs::create_dir_all(cache_dir.path().join("items").join(key.storage_path())).unwrap();

    let err = coalescer
        .execute(key, &CachingOptions::default(), || async {
            Ok::<_, io::Error>(1u8)
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err.storage_error(),
        Some(storage::StorageError::Io(_))
    ));
    assert_eq!(coalescer.in_flight(), 0);
}
