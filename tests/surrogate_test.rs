/*!
 * Surrogate Registry Tests
 * Id issuance under concurrent producers
 */

use racewatch::store::bounded;
use racewatch::surrogate::SurrogateRegistry;
use racewatch::{EventKind, ObjectRef, SurrogateId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread;

#[test]
fn test_concurrent_lookups_agree() {
    let (gc, _gc_rx) = bounded(4);
    let registry = Arc::new(SurrogateRegistry::new(gc));

    let results: Vec<(HashMap<u64, SurrogateId>, Vec<EventKind>)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                scope.spawn(move || {
                    let mut defs = Vec::new();
                    let ids = (0..500u64)
                        .map(|identity| {
                            let object = ObjectRef::new(identity, "demo.Node");
                            (identity, registry.id_for(&object, &mut defs))
                        })
                        .collect();
                    (ids, defs)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    // Every thread saw the same id for the same identity
    let reference = &results[0].0;
    for (ids, _) in &results {
        assert_eq!(ids, reference);
    }
    let distinct: HashSet<SurrogateId> = reference.values().copied().collect();
    assert_eq!(distinct.len(), 500);

    // Each object and the class were defined exactly once overall
    let all_defs: Vec<&EventKind> = results.iter().flat_map(|(_, defs)| defs).collect();
    let objects = all_defs
        .iter()
        .filter(|d| matches!(d, EventKind::ObjectDefinition { .. }))
        .count();
    let classes = all_defs
        .iter()
        .filter(|d| matches!(d, EventKind::ClassDefinition { .. }))
        .count();
    assert_eq!(objects, 500);
    assert_eq!(classes, 1);
}

#[test]
fn test_reclaimed_ids_are_never_reissued() {
    let (gc, gc_rx) = bounded(64);
    let registry = SurrogateRegistry::new(gc);
    let mut defs = Vec::new();
    let mut seen = HashSet::new();

    for round in 0..20 {
        let object = ObjectRef::new(7, "demo.Node");
        let id = registry.id_for(&object, &mut defs);
        assert!(seen.insert(id), "round {round} reused {id}");
        registry.on_reclaimed(vec![id]);
        assert_eq!(gc_rx.try_take(), Some(vec![id]));
    }
    assert_eq!(registry.tracked(), 0);
}
