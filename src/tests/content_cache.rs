use super::*;

#[test]
fn pending_entries_collect_distinct_requesters() {
    let mut cache = ContentCache::default();
    let url = "http://cdn.test/lib.js";
    assert_eq!(cache.state(ResourceKind::Script, url), None);

    cache.insert_pending(ResourceKind::Script, url, "a");
    cache.add_requester(ResourceKind::Script, url, "b");
    cache.add_requester(ResourceKind::Script, url, "a");
    assert_eq!(cache.state(ResourceKind::Script, url), Some(&EntryState::Pending));

    let waiting = cache.settle(ResourceKind::Script, url, EntryState::Ready("x()".into()));
    assert_eq!(waiting, vec!["a", "b"]);
    assert_eq!(
        cache.state(ResourceKind::Script, url),
        Some(&EntryState::Ready("x()".into()))
    );
}

#[test]
fn kinds_are_cached_separately() {
    let mut cache = ContentCache::default();
    let url = "http://cdn.test/shared";
    cache.settle(ResourceKind::Style, url, EntryState::Ready("a{}".into()));
    assert_eq!(cache.state(ResourceKind::Script, url), None);
    assert_eq!(cache.state(ResourceKind::Html, url), None);
}

#[test]
fn failures_stay_cached_and_requesters_are_drained_once() {
    let mut cache = ContentCache::default();
    let url = "http://app.test/";
    cache.insert_pending(ResourceKind::Html, url, "a");
    let err = Error::ResourceFetch {
        url: url.into(),
        kind: ResourceKind::Html,
        reason: "status 500".into(),
    };
    let waiting = cache.settle(ResourceKind::Html, url, EntryState::Failed(err.clone()));
    assert_eq!(waiting, vec!["a"]);
    assert_eq!(
        cache.state(ResourceKind::Html, url),
        Some(&EntryState::Failed(err))
    );

    cache.add_requester(ResourceKind::Html, url, "late");
    let again = cache.settle(ResourceKind::Html, url, EntryState::Ready(String::new()));
    assert_eq!(again, vec!["late"]);
}
