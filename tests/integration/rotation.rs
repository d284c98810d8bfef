#![allow(missing_docs)]

use lantern::agent::{Agent, AgentConfig, InitOptions};
use lantern::fragment::read_fragment;
use lantern::packet::PacketBody;
use lantern::repository::SessionScope;
use lantern::{SessionStatus, Severity};
use tempfile::tempdir;

// Enough ~1 KiB messages to push fragment 0 past a 1 MiB rotation
// threshold.
const MESSAGE_COUNT: usize = 1500;

#[test]
fn size_rotation_splits_the_stream_without_losing_order() {
    let dir = tempdir().expect("tmpdir");
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.folder = Some(dir.path().to_path_buf());
    config.session_file.max_size_mb = 1;
    let agent = Agent::initialize(InitOptions::new(config)).unwrap();

    let payload = "x".repeat(1024);
    for index in 0..MESSAGE_COUNT {
        agent.log(
            Severity::Information,
            "bulk",
            &format!("{index:06}:{payload}"),
        );
    }
    agent.end_session(SessionStatus::Normal, "rotation test").unwrap();

    let product_root = dir.path().join("TestP");
    let mut file_sequences: Vec<u32> = std::fs::read_dir(&product_root)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("glf"))
        .map(|path| read_fragment(&path).unwrap().header.file_sequence)
        .collect();
    file_sequences.sort_unstable();
    assert!(
        file_sequences.len() >= 2,
        "expected at least two fragments, found {file_sequences:?}"
    );
    assert_eq!(file_sequences[0], 0);
    assert_eq!(file_sequences[1], 1);

    // Concatenated in file-sequence order, the fragments reconstruct the
    // full publish order.
    let repository = agent.repository().unwrap();
    repository.refresh(true, SessionScope::All);
    let session = repository
        .get_session(agent.context().summary().id, None)
        .unwrap();
    assert!(!session.has_corrupt_data);

    let bulk_indexes: Vec<usize> = session
        .packets
        .iter()
        .filter_map(|packet| match &packet.body {
            PacketBody::Log(log) if log.category == "bulk" => {
                log.description[..6].parse::<usize>().ok()
            }
            _ => None,
        })
        .collect();
    assert_eq!(bulk_indexes.len(), MESSAGE_COUNT);
    assert!(
        bulk_indexes.windows(2).all(|pair| pair[0] + 1 == pair[1]),
        "messages must reconstruct in publish order"
    );

    let sequences: Vec<u64> = session.packets.iter().map(|p| p.header.sequence).collect();
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn every_fragment_reports_the_final_status_after_close() {
    let dir = tempdir().expect("tmpdir");
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.folder = Some(dir.path().to_path_buf());
    config.session_file.max_size_mb = 1;
    let agent = Agent::initialize(InitOptions::new(config)).unwrap();

    let payload = "y".repeat(1024);
    for _ in 0..MESSAGE_COUNT {
        agent.log(Severity::Verbose, "bulk", &payload);
    }
    agent.end_session(SessionStatus::Normal, "done").unwrap();

    // Rotated fragments were finalized while the session was still
    // running; only the last one carries Normal. The session-level status
    // is the furthest along across fragments.
    let repository = agent.repository().unwrap();
    repository.refresh(true, SessionScope::All);
    let entries = repository.find(|_| true);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, SessionStatus::Normal);
}
