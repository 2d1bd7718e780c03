//! Idle eviction of conversation threads, on paused time

use std::sync::Arc;
use std::time::Duration;

use agentvisor::agent::state::Message;
use agentvisor::agent::ThreadStore;

const TTL: Duration = Duration::from_millis(100);

#[tokio::test(start_paused = true)]
async fn test_untouched_thread_is_evicted_after_ttl() {
    let store = ThreadStore::with_ttl(TTL);
    drop(store.acquire("idle").await);

    tokio::time::advance(TTL).await;
    assert_eq!(store.sweep(), 0, "idle time equal to the ttl is kept");

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(store.sweep(), 1);
    assert!(!store.contains("idle"));
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_touch_resets_idle_clock() {
    let store = ThreadStore::with_ttl(TTL);
    drop(store.acquire("busy").await);

    tokio::time::advance(TTL - Duration::from_millis(1)).await;
    {
        let mut thread = store.acquire("busy").await;
        thread.state.messages.push(Message::user("still here"));
        thread.touch();
    }
    tokio::time::advance(Duration::from_millis(2)).await;

    assert_eq!(store.sweep(), 0);
    let state = store.snapshot("busy").await.unwrap();
    assert_eq!(state.messages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_thread_comes_back_empty() {
    let store = ThreadStore::with_ttl(TTL);
    {
        let mut thread = store.acquire("t").await;
        thread.state.messages.push(Message::user("forgotten"));
    }
    tokio::time::advance(TTL * 2).await;
    assert_eq!(store.sweep(), 1);

    let thread = store.acquire("t").await;
    assert!(thread.state.messages.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_evicts_on_its_interval() {
    let store = Arc::new(ThreadStore::with_ttl(TTL));
    drop(store.acquire("a").await);
    let sweeper = store.clone().start_sweeper(Duration::from_millis(20));

    tokio::time::sleep(Duration::from_millis(90)).await;
    assert!(store.contains("a"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!store.contains("a"));

    sweeper.abort();
}
