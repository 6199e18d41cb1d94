use super::*;
use proptest::collection::vec;
use proptest::prelude::*;

fn noop() -> NativeFn {
    Rc::new(|_, _| Ok(GlobalValue::Undefined))
}

fn target_strategy() -> BoxedStrategy<ObjectRef> {
    prop_oneof![
        Just(ObjectRef::VirtualWindow("a".into())),
        Just(ObjectRef::VirtualWindow("b".into())),
        Just(ObjectRef::ContextWindow("a".into())),
        Just(ObjectRef::VirtualDocument("b".into())),
        Just(ObjectRef::HostWindow),
    ]
    .boxed()
}

#[derive(Debug, Clone)]
enum Step {
    Bind(ObjectRef, usize),
    Clear(ObjectRef),
}

fn step_strategy() -> BoxedStrategy<Step> {
    prop_oneof![
        4 => (target_strategy(), 0..3usize).prop_map(|(target, index)| Step::Bind(target, index)),
        1 => target_strategy().prop_map(Step::Clear),
    ]
    .boxed()
}

#[test]
fn bound_copies_keep_identity_per_target() -> Result<()> {
    let mut table = FunctionTable::default();
    let original = table.define("fetch", noop(), false);
    table.set_prop(original, "flag", GlobalValue::Bool(true))?;

    let window = ObjectRef::VirtualWindow("a".into());
    let bound = table.bound_for(&window, original)?;
    assert_ne!(bound, original);
    assert_eq!(table.bound_for(&window, original)?, bound);
    assert_eq!(table.prop(bound, "flag"), GlobalValue::Bool(true));

    let info = table
        .info(bound)
        .ok_or_else(|| Error::NotFound("bound".into()))?;
    assert_eq!(info.name, "bound fetch");
    assert_eq!(info.bound_this, Some(window.clone()));
    assert_eq!(info.target, Some(original));
    assert!(!info.constructable);

    let other = table.bound_for(&ObjectRef::VirtualWindow("b".into()), original)?;
    assert_ne!(other, bound);
    Ok(())
}

#[test]
fn tracked_functions_read_back_unchanged() -> Result<()> {
    let mut table = FunctionTable::default();
    let written = table.define("handler", noop(), false);
    let window = ObjectRef::VirtualWindow("a".into());
    table.track(&window, written);
    assert_eq!(table.bound_for(&window, written)?, written);
    assert!(!table.is_bound(written));
    Ok(())
}

#[test]
fn clearing_a_target_frees_its_bound_copies() -> Result<()> {
    let mut table = FunctionTable::default();
    let original = table.define("fetch", noop(), false);
    let written = table.define("handler", noop(), false);
    let window = ObjectRef::VirtualWindow("a".into());

    let bound = table.bound_for(&window, original)?;
    table.track(&window, written);
    assert_eq!(table.len(), 3);

    table.clear_target(&window);
    assert_eq!(table.len(), 2);
    assert!(table.info(bound).is_none());
    assert!(table.info(written).is_some());
    assert_eq!(table.cached(&window, original), None);
    Ok(())
}

#[test]
fn releasing_an_owner_keeps_pinned_functions() -> Result<()> {
    let mut table = FunctionTable::default();
    let shared = table.define("shared", noop(), false);
    let mount = table.define_owned("mount", noop(), false, Some("a"));
    let pinned = table.define_owned("onclick", noop(), false, Some("a"));
    let other = table.define_owned("mount", noop(), false, Some("b"));
    let host_copy = table.bound_for(&ObjectRef::HostWindow, mount)?;
    let kept_copy = table.bound_for(&ObjectRef::HostWindow, shared)?;

    for _ in 0..3 {
        let cycle = table.define_owned("tick", noop(), false, Some("a"));
        table.bound_for(&ObjectRef::ContextWindow("a".into()), cycle)?;
        table.clear_target(&ObjectRef::ContextWindow("a".into()));
        table.release_owner("a", &HashSet::from([pinned]));
    }

    assert!(table.info(mount).is_none());
    assert!(table.info(host_copy).is_none());
    assert!(table.info(pinned).is_some());
    assert!(table.info(other).is_some());
    assert_eq!(table.cached(&ObjectRef::HostWindow, mount), None);
    assert_eq!(table.cached(&ObjectRef::HostWindow, shared), Some(kept_copy));
    assert_eq!(table.len(), 4);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 96,
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn rebinding_caches_stay_isolated_between_targets(steps in vec(step_strategy(), 1..=32)) {
        let mut table = FunctionTable::default();
        let functions: Vec<FnId> = (0..3)
            .map(|index| table.define(&format!("f{index}"), noop(), false))
            .collect();
        let mut expected: HashMap<(ObjectRef, FnId), FnId> = HashMap::new();

        for step in &steps {
            match step {
                Step::Bind(target, index) => {
                    let original = functions[*index];
                    let bound = table
                        .bound_for(target, original)
                        .map_err(|err| TestCaseError::fail(format!("{err}")))?;
                    let known = expected.entry((target.clone(), original)).or_insert(bound);
                    prop_assert_eq!(*known, bound, "cache changed for {:?}", target);
                    for ((other_target, other_fn), other_bound) in &expected {
                        if other_target != target || *other_fn != original {
                            prop_assert_ne!(*other_bound, bound);
                        }
                    }
                }
                Step::Clear(target) => {
                    table.clear_target(target);
                    expected.retain(|(known, _), _| known != target);
                    for original in &functions {
                        prop_assert_eq!(table.cached(target, *original), None);
                    }
                }
            }
        }
    }
}
