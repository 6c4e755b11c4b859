use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;

use ttlcache::caching::{CacheError, CacheKey, CachingOptions, KeyStrategy};

use crate::{Backend, StorageCounts, setup_cache};

fn users() -> Vec<String> {
    vec!["user".into(), "max".into(), "test".into()]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_calls_compute_once() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let options = CachingOptions::default().ttl(Duration::from_secs(2));
        let calls = Arc::new(AtomicUsize::new(0));

        let futures = (0..100).map(|_| {
            let calls = calls.clone();
            cache
                .coalescer
                .execute(CacheKey::from("getUsers"), &options, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, io::Error>(users())
                })
        });
        let responses: Vec<Vec<String>> = join_all(futures)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert_eq!(responses, vec![users(); 100], "{backend:?}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            cache.storage.counts(),
            StorageCounts {
                get: 1,
                set: 1,
                remove: 0,
                clear: 0,
            }
        );
        assert_eq!(cache.coalescer.in_flight(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_failures() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let options = CachingOptions::default();
        let calls = Arc::new(AtomicUsize::new(0));

        let futures = (0..20).map(|_| {
            let calls = calls.clone();
            cache
                .coalescer
                .execute(CacheKey::from("flaky"), &options, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err::<String, _>(io::Error::new(io::ErrorKind::ConnectionRefused, "down"))
                })
        });
        for result in join_all(futures).await {
            let err = result.unwrap_err();
            let source = err.computation_error::<io::Error>().unwrap();
            assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused, "{backend:?}");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.storage.counts().set, 0);

        // the next call starts over
        let value: String = cache
            .coalescer
            .execute(CacheKey::from("flaky"), &options, || async {
                Ok::<_, io::Error>("up".to_owned())
            })
            .await
            .unwrap();
        assert_eq!(value, "up");
        assert_eq!(cache.storage.counts().set, 1);
    }
}

#[tokio::test]
async fn test_lazy_record_recomputed_after_stale_read() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let calls = Arc::new(AtomicUsize::new(0));
        let (stale_tx, mut stale_rx) = tokio::sync::mpsc::unbounded_channel();

        let get_users = cache.coalescer.wrap(
            "TestClass",
            CachingOptions::default()
                .ttl(Duration::from_millis(500))
                .lazy(true)
                .on_stale(move |key| stale_tx.send(key.clone()).unwrap()),
            {
                let calls = calls.clone();
                move |()| {
                    let calls = calls.clone();
                    async move {
                        let call = calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, io::Error>(format!("call {call}"))
                    }
                }
            },
        );
        let get_users = get_users.with_method_name("getUsers");

        let first: String = get_users.call(()).await.unwrap();
        assert_eq!(first, "call 0", "{backend:?}");

        cache.clock.advance(1_000);

        // served stale exactly once
        let stale: String = get_users.call(()).await.unwrap();
        assert_eq!(stale, "call 0");
        assert_eq!(
            stale_rx.recv().await.unwrap(),
            CacheKey::from("TestClass:getUsers:default:null")
        );

        let fresh: String = get_users.call(()).await.unwrap();
        assert_eq!(fresh, "call 1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(stale_rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_eager_record_recomputed_after_expiry() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let calls = Arc::new(AtomicUsize::new(0));

        let get_users = cache.coalescer.wrap(
            "getUsers",
            CachingOptions::default()
                .ttl(Duration::from_millis(500))
                .lazy(false),
            {
                let calls = calls.clone();
                move |()| {
                    let calls = calls.clone();
                    async move {
                        let call = calls.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, io::Error>(call)
                    }
                }
            },
        );

        assert_eq!(get_users.call(()).await.unwrap(), 0usize, "{backend:?}");
        assert_eq!(get_users.call(()).await.unwrap(), 0usize);

        cache.clock.advance(501);
        assert_eq!(get_users.call(()).await.unwrap(), 1usize);
    }
}

#[tokio::test]
async fn test_refresh_stale_in_background() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let (stale_tx, mut stale_rx) = tokio::sync::mpsc::unbounded_channel();
        let options = CachingOptions::default()
            .ttl(Duration::from_millis(100))
            .refresh_stale(true)
            .on_stale(move |key| stale_tx.send(key.clone()).unwrap());

        cache
            .container()
            .set("k", "old", &options)
            .await
            .unwrap();
        cache.clock.advance(101);

        let value: String = cache
            .coalescer
            .execute(CacheKey::from("k"), &options, || async {
                Ok::<_, io::Error>("new".to_owned())
            })
            .await
            .unwrap();
        assert_eq!(value, "old", "{backend:?}");

        stale_rx.recv().await.unwrap();
        assert_eq!(cache.coalescer.in_flight(), 0);

        let value: String = cache
            .coalescer
            .execute(CacheKey::from("k"), &options, || async {
                Err::<String, _>(io::Error::other("should be cached"))
            })
            .await
            .unwrap();
        assert_eq!(value, "new");
    }
}

#[tokio::test]
async fn test_abandoned_caller_does_not_cancel() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let options = CachingOptions::default();

        // poll once to register the computation, then walk away
        let abandoned = cache
            .coalescer
            .execute(CacheKey::from("slow"), &options, || async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, io::Error>("done".to_owned())
            })
            .now_or_never();
        assert!(abandoned.is_none());

        let value: String = cache
            .coalescer
            .execute(CacheKey::from("slow"), &options, || async {
                Err::<String, _>(io::Error::other("should attach or hit the cache"))
            })
            .await
            .unwrap();
        assert_eq!(value, "done", "{backend:?}");
    }
}

#[tokio::test]
async fn test_wrapped_custom_key() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CachingOptions::default()
            .prefix("great")
            .key_strategy(KeyStrategy::custom(|_| "test".into()));

        let wrapped = cache.coalescer.wrap("testingFunction", options, {
            let calls = calls.clone();
            move |(a, b): (String, u32)| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, io::Error>(format!("{a}-{b}")) }
            }
        });

        let result: String = wrapped.call(("wrapped-hello".to_owned(), 555)).await.unwrap();
        assert_eq!(result, "wrapped-hello-555", "{backend:?}");

        let entry = cache
            .container()
            .get::<String>("testingFunction:great:test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content, "wrapped-hello-555");

        // any arguments map to the same key
        let result: String = wrapped.call(("other".to_owned(), 1)).await.unwrap();
        assert_eq!(result, "wrapped-hello-555");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test]
async fn test_custom_key_for_method() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let calls = Arc::new(AtomicUsize::new(0));
        let options = CachingOptions::default().key_strategy(KeyStrategy::custom(|input| {
            input.method_name.unwrap_or_default().to_owned()
        }));

        let get_users = cache
            .coalescer
            .wrap("TestClass3", options, {
                let calls = calls.clone();
                move |()| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok::<_, io::Error>(users()) }
                }
            })
            .with_method_name("getUsersPromise");

        assert_eq!(
            get_users.key_for(&()).unwrap(),
            CacheKey::from("getUsersPromise")
        );

        let result: Vec<String> = get_users.call(()).await.unwrap();
        assert_eq!(result, users(), "{backend:?}");

        let entry = cache
            .container()
            .get::<Vec<String>>("getUsersPromise")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.content, users());

        let result: Vec<String> = get_users.call(()).await.unwrap();
        assert_eq!(result, users());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simultaneous_calls_on_stale_record() {
    for backend in Backend::ALL {
        let cache = setup_cache(backend);
        let calls = Arc::new(AtomicUsize::new(0));
        let (stale_tx, mut stale_rx) = tokio::sync::mpsc::unbounded_channel();
        let options = CachingOptions::default()
            .ttl(Duration::from_millis(500))
            .lazy(true)
            .on_stale(move |key| stale_tx.send(key.clone()).unwrap());

        cache
            .container()
            .set("getUsers", "stale", &options)
            .await
            .unwrap();
        cache.clock.advance(1_000);

        let futures = (0..50).map(|_| {
            let calls = calls.clone();
            cache
                .coalescer
                .execute(CacheKey::from("getUsers"), &options, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, io::Error>("fresh".to_owned())
                })
        });
        let responses: Vec<String> = join_all(futures)
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();

        assert!(responses.iter().any(|value| value == "stale"), "{backend:?}");
        assert!(
            responses
                .iter()
                .all(|value| value == "stale" || value == "fresh")
        );
        assert!(calls.load(Ordering::SeqCst) <= 1);

        assert_eq!(stale_rx.recv().await.unwrap(), CacheKey::from("getUsers"));

        // afterwards the record is fresh again, without any further stale read
        let value: String = cache
            .coalescer
            .execute(CacheKey::from("getUsers"), &options, || async {
                Ok::<_, io::Error>("fresh".to_owned())
            })
            .await
            .unwrap();
        assert_eq!(value, "fresh");
        assert!(calls.load(Ordering::SeqCst) <= 1);
        assert!(stale_rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn test_key_derivation_failure_touches_nothing() {
    let cache = setup_cache(Backend::Memory);

    let wrapped = cache.coalescer.wrap(
        "op",
        CachingOptions::default(),
        |_args: HashMap<(u8, u8), u8>| async {
            Ok::<_, io::Error>(0u8)
        },
    );

    let args: HashMap<(u8, u8), u8> = [((1, 2), 3)].into_iter().collect();
    let err = wrapped.call(args).await.unwrap_err();
    assert!(matches!(err, CacheError::KeyDerivation(_)));
    assert_eq!(cache.storage.counts(), StorageCounts::default());
    assert_eq!(cache.coalescer.in_flight(), 0);
}
