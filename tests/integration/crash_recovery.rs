#![allow(missing_docs)]

use std::collections::BTreeMap;

use lantern::fragment::{read_fragment_header, FragmentFile};
use lantern::repository::{LocalRepository, PruneLimits, RepositoryOptions, SessionScope};
use lantern::session::{ApplicationType, SessionContext, SessionStatus, SessionSummary};
use tempfile::tempdir;
use time::OffsetDateTime;
use uuid::Uuid;

fn summary(product: &str) -> SessionSummary {
    SessionSummary {
        id: Uuid::new_v4(),
        product: product.into(),
        application: "TestA".into(),
        application_version: "1.0".into(),
        application_description: String::new(),
        environment: String::new(),
        promotion_level: String::new(),
        agent_version: "0.3.0".into(),
        host_name: "host".into(),
        user_name: "user".into(),
        os_description: "linux".into(),
        culture: "en-US".into(),
        application_type: ApplicationType::Console,
        start_time: OffsetDateTime::now_utc(),
        properties: BTreeMap::new(),
    }
}

fn open_repository(base: &std::path::Path) -> LocalRepository {
    LocalRepository::open(RepositoryOptions {
        base_folder: base.to_path_buf(),
        product_name: "TestP".into(),
        prune: PruneLimits::default(),
    })
    .unwrap()
}

// Drops an orphaned fragment whose header still reads Running into the
// repository root, then forces a refresh.
#[test]
fn orphaned_running_fragment_is_converted_to_crashed() {
    let base = tempdir().expect("tmpdir");
    let repository = open_repository(base.path());

    let context = SessionContext::new(summary("TestP"));
    let session_id = context.summary().id;
    let now = OffsetDateTime::now_utc();
    let fragment = FragmentFile::create(repository.fragment_directory(), &context, 0, now).unwrap();
    let path = fragment.finalize(&context.counters(), now).unwrap();
    assert_eq!(
        read_fragment_header(&path).unwrap().status,
        SessionStatus::Running
    );

    repository.refresh(true, SessionScope::All);

    assert_eq!(
        read_fragment_header(&path).unwrap().status,
        SessionStatus::Crashed
    );
    assert!(!repository.session_is_running(session_id));
    let entries = repository.find(|entry| entry.session_id == session_id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, SessionStatus::Crashed);
}

#[test]
fn recovery_never_rewrites_status_backwards() {
    let base = tempdir().expect("tmpdir");
    let repository = open_repository(base.path());

    let context = SessionContext::new(summary("TestP"));
    let now = OffsetDateTime::now_utc();
    let fragment = FragmentFile::create(repository.fragment_directory(), &context, 0, now).unwrap();
    context.advance_status(SessionStatus::Normal);
    let path = fragment.finalize(&context.counters(), now).unwrap();
    assert_eq!(
        read_fragment_header(&path).unwrap().status,
        SessionStatus::Normal
    );

    repository.refresh(true, SessionScope::All);

    // A Normal header is terminal: no lock file exists, yet the status must
    // stay Normal.
    assert_eq!(
        read_fragment_header(&path).unwrap().status,
        SessionStatus::Normal
    );
}

#[test]
fn live_session_is_not_recovered() {
    let base = tempdir().expect("tmpdir");
    let repository = open_repository(base.path());

    let context = SessionContext::new(summary("TestP"));
    let session_id = context.summary().id;
    repository.acquire_session_lock(session_id).unwrap();
    let now = OffsetDateTime::now_utc();
    let fragment = FragmentFile::create(repository.fragment_directory(), &context, 0, now).unwrap();
    let path = fragment.finalize(&context.counters(), now).unwrap();

    repository.refresh(true, SessionScope::All);

    // Still running: the in-process lock table owns the session.
    assert_eq!(
        read_fragment_header(&path).unwrap().status,
        SessionStatus::Running
    );
    assert!(repository.session_is_running(session_id));

    repository.release_session_lock(session_id);
    repository.refresh(true, SessionScope::All);
    assert_eq!(
        read_fragment_header(&path).unwrap().status,
        SessionStatus::Crashed
    );
}

#[test]
fn recovery_converts_every_fragment_of_the_session() {
    let base = tempdir().expect("tmpdir");
    let repository = open_repository(base.path());

    let context = SessionContext::new(summary("TestP"));
    let now = OffsetDateTime::now_utc();
    let mut paths = Vec::new();
    for sequence in 0..3 {
        let fragment =
            FragmentFile::create(repository.fragment_directory(), &context, sequence, now).unwrap();
        paths.push(fragment.finalize(&context.counters(), now).unwrap());
    }

    repository.refresh(true, SessionScope::All);
    for path in &paths {
        assert_eq!(
            read_fragment_header(path).unwrap().status,
            SessionStatus::Crashed
        );
    }
}

#[test]
fn unreadable_files_do_not_abort_the_rebuild() {
    let base = tempdir().expect("tmpdir");
    let repository = open_repository(base.path());

    std::fs::write(
        repository.fragment_directory().join("garbage.glf"),
        b"not a fragment at all",
    )
    .unwrap();
    let context = SessionContext::new(summary("TestP"));
    let now = OffsetDateTime::now_utc();
    let fragment = FragmentFile::create(repository.fragment_directory(), &context, 0, now).unwrap();
    fragment.finalize(&context.counters(), now).unwrap();

    repository.refresh(true, SessionScope::All);
    let entries = repository.find(|_| true);
    assert_eq!(entries.len(), 1, "the valid session is still indexed");
}
