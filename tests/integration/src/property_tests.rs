//! Properties that hold for any request or backend script

use crate::fixtures::*;
use crate::helpers::*;
use crate::mock_providers::*;
use gateway_core::{ErrorKind, StreamEvent, StreamRequest};
use gateway_resilience::CacheManager;
use proptest::prelude::*;
use std::sync::Arc;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn script(len: usize) -> Vec<String> {
    (0..len).map(|i| format!("w{i} ")).collect()
}

fn provider_for(chunks: &[String]) -> MockProvider {
    let refs: Vec<&str> = chunks.iter().map(String::as_str).collect();
    MockProvider::new("primary", &refs)
}

fn with_model(query: &str, model: &str) -> StreamRequest {
    let mut request = request("user-1", query);
    request.model = model.to_string();
    request
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_cache_key_is_pure(query in "[a-z]{1,12}( [a-z]{1,12}){0,4}", identity in "[a-z]{1,8}") {
        let a = CacheManager::request_key(&request(&identity, &query));
        let b = CacheManager::request_key(&request("someone-else", &query));
        prop_assert_eq!(&a, &b);
        prop_assert_eq!(a.len(), 64);
    }

    #[test]
    fn prop_cache_key_ignores_whitespace_and_model_case(
        words in prop::collection::vec("[a-z]{1,10}", 1..6),
        pad in "[ \t\n]{1,3}",
    ) {
        let plain = words.join(" ");
        let padded = format!("{pad}{}{pad}", words.join(pad.as_str()));
        let a = CacheManager::request_key(&with_model(&plain, "mock-model"));
        let b = CacheManager::request_key(&with_model(&padded, " MOCK-Model "));
        prop_assert_eq!(a, b);
    }

    #[test]
    fn prop_distinct_queries_get_distinct_keys(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
        prop_assume!(a != b);
        let ka = CacheManager::request_key(&request("u", &a));
        let kb = CacheManager::request_key(&request("u", &b));
        prop_assert_ne!(ka, kb);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Whatever the backend does, the client sees one terminal event last and
    /// chunk indices counting up from zero
    #[test]
    fn prop_event_stream_is_well_formed(len in 1usize..10, fail_at in prop::option::of(0usize..10)) {
        let chunks = script(len);
        let behavior = match fail_at {
            Some(n) if n < len => MockBehavior::FailAfter(n),
            _ => MockBehavior::Succeed,
        };

        let events = runtime().block_on(async {
            let provider = Arc::new(provider_for(&chunks).with_behavior(behavior));
            let gw = TestGateway::start(test_config(), &[provider]);
            let events = gw.run(uncached_request("user-1", "property")).await;
            gw.stop().await;
            events
        });

        let first_is_status = matches!(events.first(), Some(StreamEvent::Status { .. }));
        prop_assert!(first_is_status);
        prop_assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        prop_assert!(events.last().is_some_and(StreamEvent::is_terminal));

        let indices = chunk_indices(&events);
        let expected: Vec<u64> = (0..indices.len() as u64).collect();
        prop_assert_eq!(&indices, &expected);

        match behavior {
            MockBehavior::Succeed => {
                prop_assert_eq!(indices.len(), len);
                prop_assert_eq!(chunk_text(&events), chunks.concat());
            }
            MockBehavior::FailAfter(0) => {
                prop_assert!(indices.is_empty());
                prop_assert_eq!(error_kind(&events), Some(ErrorKind::AllBackendsUnavailable));
            }
            MockBehavior::FailAfter(n) => {
                prop_assert_eq!(indices.len(), n);
                prop_assert_eq!(error_kind(&events), Some(ErrorKind::BackendError));
            }
            MockBehavior::FailOnOpen(_) => unreachable!(),
        }
    }

    /// Every admitted request returns its slot, whether it completed or failed
    #[test]
    fn prop_pool_counters_return_to_zero(
        capacity in 1u64..4,
        requests in 1usize..8,
        failing in any::<bool>(),
    ) {
        let (active, terminals, admitted, calls) = runtime().block_on(async {
            let behavior = if failing { MockBehavior::FailAfter(2) } else { MockBehavior::Succeed };
            let provider = Arc::new(provider_for(&script(4)).with_behavior(behavior));
            let config = config_with(|c| {
                c.pool.global_capacity = capacity;
                c.queue.enabled = false;
            });
            let gw = TestGateway::start(config, &[provider.clone()]);

            let streams: Vec<_> = (0..requests)
                .map(|i| gw.handle(uncached_request(&format!("user-{i}"), "mix")))
                .collect();
            let results = futures::future::join_all(streams.into_iter().map(collect_events)).await;

            let terminals: Vec<usize> = results
                .iter()
                .map(|events| events.iter().filter(|e| e.is_terminal()).count())
                .collect();
            let admitted = results
                .iter()
                .filter(|events| error_kind(events) != Some(ErrorKind::ConnectionPoolExhausted))
                .count();
            let gw_ref = &gw;
            eventually(std::time::Duration::from_secs(2), || async move {
                gw_ref.active_slots().await == 0
            })
            .await;
            let active = gw.active_slots().await;
            gw.stop().await;
            (active, terminals, admitted, provider.calls())
        });

        prop_assert_eq!(active, 0);
        prop_assert!(terminals.iter().all(|&n| n == 1));
        prop_assert_eq!(admitted, calls);
        prop_assert!(admitted >= 1);
    }
}
