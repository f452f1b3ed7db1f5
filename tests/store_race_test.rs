//! Добавление кандидата в запись это read-modify-write без транзакции.
//! Два писателя одной стороны, прочитавшие одну и ту же версию, теряют обновление.

mod common;

use common::cand;
use rendezvous_call_lib::store::{MemoryStore, RendezvousStore, Side};

#[tokio::test]
async fn interleaved_appends_lose_an_update() {
    let store = MemoryStore::new();
    let id = store.create_record("v=0 offer").await.unwrap();

    let first = store.fetch_record(&id).await.unwrap();
    let second = store.fetch_record(&id).await.unwrap();

    let mut left = first.initiator_candidates.clone();
    left.push(cand(1));
    let mut right = second.initiator_candidates.clone();
    right.push(cand(2));

    store.write_candidates(&id, Side::Initiator, left).await.unwrap();
    store.write_candidates(&id, Side::Initiator, right).await.unwrap();

    let record = store.fetch_record(&id).await.unwrap();
    assert_eq!(record.initiator_candidates, vec![cand(2)]);
}

#[tokio::test]
async fn sequential_appends_keep_everything() {
    let store = MemoryStore::new();
    let id = store.create_record("v=0 offer").await.unwrap();

    for n in 1..=5 {
        store.append_candidate(&id, Side::Initiator, cand(n)).await.unwrap();
    }

    let record = store.fetch_record(&id).await.unwrap();
    assert_eq!(
        record.initiator_candidates,
        (1..=5).map(cand).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn sides_do_not_clobber_each_other() {
    let store = MemoryStore::new();
    let id = store.create_record("v=0 offer").await.unwrap();

    let (a, b) = tokio::join!(
        store.append_candidate(&id, Side::Initiator, cand(1)),
        store.append_candidate(&id, Side::Responder, cand(2)),
    );
    a.unwrap();
    b.unwrap();

    let record = store.fetch_record(&id).await.unwrap();
    assert_eq!(record.initiator_candidates, vec![cand(1)]);
    assert_eq!(record.responder_candidates, vec![cand(2)]);
}
