//! Unit tests for the tunnel registry

use super::*;
use crate::tunnel::TunnelEvent;
use proptest::prelude::*;
use std::collections::HashMap as Map;

const TIMEOUT: Duration = Duration::from_secs(10);

fn registry() -> Registry {
    Registry::new(1, 16, Arc::new(Notify::new()))
}

fn opened(assignment: Assignment) -> (OpenedTunnel, Option<OpenWaiter>) {
    match assignment {
        Assignment::Opened { opened, waiter } => (opened, waiter),
        Assignment::Cancelled => panic!("expected an opened tunnel"),
    }
}

#[test]
fn test_reserve_then_assign() {
    let mut registry = registry();
    let key = BindingKey::shell("sessionX");
    let now = Instant::now();

    let pending = registry.reserve(key.clone(), now, TIMEOUT).unwrap();
    assert_eq!(pending.deadline, now + TIMEOUT);
    assert_eq!(registry.pending_len(), 1);

    let (opened, _) = opened(registry.assign(&key, TunnelId(42), now).unwrap());
    assert_eq!(opened.id, TunnelId(42));
    assert_eq!(opened.binding, key);
    assert_eq!(registry.pending_len(), 0);
    assert_eq!(registry.active_for(&key), Some(TunnelId(42)));
    assert_eq!(registry.lookup(TunnelId(42)).map(|t| t.binding()), Some(&key));
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_duplicate_reservation_rejected() {
    let mut registry = registry();
    let key = BindingKey::shell("s");
    let now = Instant::now();

    registry.reserve(key.clone(), now, TIMEOUT).unwrap();
    assert_eq!(
        registry.reserve(key.clone(), now, TIMEOUT).err(),
        Some(MuxError::DuplicateBinding(key.clone()))
    );

    // A nonce makes a distinct binding
    assert!(registry.reserve(key.clone().with_nonce("2"), now, TIMEOUT).is_ok());
}

#[test]
fn test_reserve_rejected_while_active() {
    let mut registry = registry();
    let key = BindingKey::shell("s");
    let now = Instant::now();

    registry.reserve(key.clone(), now, TIMEOUT).unwrap();
    registry.assign(&key, TunnelId(1), now).unwrap();
    assert!(matches!(
        registry.reserve(key.clone(), now, TIMEOUT),
        Err(MuxError::DuplicateBinding(_))
    ));

    // Terminal tunnels release their binding even while still draining
    registry
        .lookup_mut(TunnelId(1))
        .unwrap()
        .finish(TunnelEvent::Errored(MuxError::Shutdown));
    registry.release(TunnelId(1));
    assert!(registry.lookup(TunnelId(1)).is_some());
    assert!(registry.reserve(key, now, TIMEOUT).is_ok());
}

#[test]
fn test_assign_without_reservation() {
    let mut registry = registry();
    let key = BindingKey::shell("nobody");
    assert!(matches!(
        registry.assign(&key, TunnelId(9), Instant::now()),
        Err(MuxError::UnknownBinding(_))
    ));
    assert!(registry.lookup(TunnelId(9)).is_none());
}

#[test]
fn test_reused_id_is_protocol_violation() {
    let mut registry = registry();
    let a = BindingKey::shell("a");
    let b = BindingKey::shell("b");
    let now = Instant::now();

    registry.reserve(a.clone(), now, TIMEOUT).unwrap();
    registry.reserve(b.clone(), now, TIMEOUT).unwrap();
    registry.assign(&a, TunnelId(5), now).unwrap();

    assert!(matches!(
        registry.assign(&b, TunnelId(5), now),
        Err(MuxError::ProtocolViolation(_))
    ));
    // The reservation survives the bogus assignment
    assert_eq!(registry.pending_len(), 1);

    registry.remove(TunnelId(5));
    assert!(matches!(
        registry.assign(&b, TunnelId(5), now),
        Err(MuxError::ProtocolViolation(_))
    ));
}

#[test]
fn test_remove_is_idempotent() {
    let mut registry = registry();
    let key = BindingKey::shell("s");
    let now = Instant::now();

    registry.reserve(key.clone(), now, TIMEOUT).unwrap();
    registry.assign(&key, TunnelId(3), now).unwrap();

    assert!(registry.remove(TunnelId(3)).is_some());
    assert!(registry.remove(TunnelId(3)).is_none());
    assert!(registry.remove(TunnelId(77)).is_none());
    assert!(registry.is_retired(TunnelId(3)));
    assert_eq!(registry.active_for(&key), None);
}

#[tokio::test]
async fn test_expired_reservation_fails_waiter() {
    let mut registry = registry();
    let key = BindingKey::shell("slow");
    let now = Instant::now();
    let (tx, rx) = oneshot::channel();

    registry.reserve(key.clone(), now, Duration::from_millis(50)).unwrap().waiter = Some(tx);
    assert_eq!(registry.expire_pending(now, Duration::from_millis(50)), 0);

    let later = now + Duration::from_millis(60);
    assert_eq!(registry.expire_pending(later, Duration::from_millis(50)), 1);
    match rx.await.unwrap() {
        Err(MuxError::OpenTimeout { binding, .. }) => assert_eq!(binding, key),
        other => panic!("unexpected open result: {:?}", other.map(|o| o.id)),
    }

    // The binding is free again, and a late assignment pairs with the stale entry
    registry.reserve(key.clone(), later, TIMEOUT).unwrap();
    assert!(matches!(
        registry.assign(&key, TunnelId(8), later),
        Ok(Assignment::Cancelled)
    ));
    let (opened, _) = opened(registry.assign(&key, TunnelId(9), later).unwrap());
    assert_eq!(opened.id, TunnelId(9));
    assert!(registry.is_retired(TunnelId(8)));
}

#[test]
fn test_dropped_waiter_counts_as_cancelled() {
    let mut registry = registry();
    let key = BindingKey::shell("gone");
    let now = Instant::now();
    let (tx, rx) = oneshot::channel();

    registry.reserve(key.clone(), now, TIMEOUT).unwrap().waiter = Some(tx);
    drop(rx);

    assert_eq!(registry.pending_len(), 0);
    assert!(matches!(
        registry.assign(&key, TunnelId(1), now),
        Ok(Assignment::Cancelled)
    ));
}

#[test]
fn test_prune_cancelled_after_ttl() {
    let mut registry = registry();
    let key = BindingKey::shell("s");
    let now = Instant::now();
    let ttl = Duration::from_secs(60);

    registry
        .reserve(key.clone(), now, TIMEOUT)
        .unwrap()
        .cancel(now, MuxError::Shutdown);
    assert_eq!(registry.prune_cancelled(now + Duration::from_secs(1), ttl), 0);
    assert_eq!(registry.prune_cancelled(now + ttl, ttl), 1);
    assert!(matches!(
        registry.assign(&key, TunnelId(1), now + ttl),
        Err(MuxError::UnknownBinding(_))
    ));
}

#[tokio::test]
async fn test_reject_fails_oldest_reservation() {
    let mut registry = registry();
    let key = BindingKey::shell("denied");
    let (tx, rx) = oneshot::channel();

    registry.reserve(key.clone(), Instant::now(), TIMEOUT).unwrap().waiter = Some(tx);
    assert!(registry.reject(&key, "no such session", Instant::now()));
    assert!(!registry.reject(&key, "again", Instant::now()));

    match rx.await.unwrap() {
        Err(MuxError::Rejected { binding, message }) => {
            assert_eq!(binding, key);
            assert_eq!(message, "no such session");
        }
        other => panic!("unexpected open result: {:?}", other.map(|o| o.id)),
    }
}

#[test]
fn test_reset_hands_back_everything() {
    let mut registry = registry();
    let now = Instant::now();
    let a = BindingKey::shell("a");
    let b = BindingKey::shell("b");

    registry.reserve(a.clone(), now, TIMEOUT).unwrap();
    registry.reserve(b.clone(), now, TIMEOUT).unwrap();
    registry.assign(&a, TunnelId(1), now).unwrap();
    registry.remove(TunnelId(1));

    registry.reserve(a.clone(), now, TIMEOUT).unwrap();
    registry.assign(&a, TunnelId(2), now).unwrap();

    let (pending, tunnels) = registry.reset(2);
    assert_eq!(pending.len(), 1);
    assert_eq!(tunnels.len(), 1);
    assert_eq!(registry.generation(), 2);
    assert_eq!(registry.len(), 0);

    // Ids from the previous generation may be reused
    assert!(!registry.is_retired(TunnelId(1)));
    registry.reserve(a.clone(), now, TIMEOUT).unwrap();
    assert!(registry.assign(&a, TunnelId(1), now).is_ok());
}

#[derive(Debug, Clone)]
enum Op {
    Reserve(u8),
    Assign(u8, u8),
    Remove(u8),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..4).prop_map(Op::Reserve),
        (0u8..4, 0u8..16).prop_map(|(k, id)| Op::Assign(k, id)),
        (0u8..16).prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn test_at_most_one_live_tunnel_per_binding(ops in prop::collection::vec(arb_op(), 1..64)) {
        let mut registry = registry();
        let now = Instant::now();
        let key = |k: u8| BindingKey::shell(format!("target-{}", k));

        for op in ops {
            match op {
                Op::Reserve(k) => {
                    let _ = registry.reserve(key(k), now, TIMEOUT);
                }
                Op::Assign(k, id) => {
                    let _ = registry.assign(&key(k), TunnelId(id as u64), now);
                }
                Op::Remove(id) => {
                    registry.remove(TunnelId(id as u64));
                }
            }

            let mut per_binding: Map<BindingKey, usize> = Map::new();
            for tunnel in registry.tunnels_mut() {
                if !tunnel.state().is_terminal() {
                    *per_binding.entry(tunnel.binding().clone()).or_default() += 1;
                }
            }
            for (binding, count) in &per_binding {
                prop_assert_eq!(*count, 1, "binding {} has {} live tunnels", binding, count);
                prop_assert_eq!(registry.pending.get(binding).map_or(0, |q| q.iter().filter(|p| p.is_live()).count()), 0);
            }
        }
    }
}
