#![allow(missing_docs)]

use std::sync::Arc;

use lantern::agent::{Agent, AgentConfig, InitOptions};
use lantern::fragment::read_fragment;
use lantern::packet::{LogMessage, Packet, PacketBody};
use lantern::{PublishMode, SessionStatus, Severity};
use tempfile::tempdir;

fn test_config(dir: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.folder = Some(dir.to_path_buf());
    config
}

#[test]
fn log_then_close_writes_one_readable_fragment() {
    let dir = tempdir().expect("tmpdir");
    let agent = Agent::initialize(InitOptions::new(test_config(dir.path()))).unwrap();

    let mut log = LogMessage::new(Severity::Warning, "X", "hi");
    log.caption = "hi".into();
    agent
        .publisher()
        .publish(vec![Packet::new(PacketBody::Log(log))], PublishMode::Queued);
    agent.end_session(SessionStatus::Normal, "bye").unwrap();

    let product_root = dir.path().join("TestP");
    let fragments: Vec<_> = std::fs::read_dir(&product_root)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("glf"))
        .collect();
    assert_eq!(fragments.len(), 1, "expected exactly one fragment");

    let read = read_fragment(&fragments[0]).unwrap();
    assert!(!read.corrupt);
    assert_eq!(read.header.summary.product, "TestP");
    assert_eq!(read.header.summary.application, "TestA");
    assert_eq!(read.header.status, SessionStatus::Normal);
    assert_eq!(read.header.counters.message_count, 1);
    assert_eq!(read.header.counters.warning_count, 1);

    let logs: Vec<&LogMessage> = read
        .packets
        .iter()
        .filter_map(|packet| match &packet.body {
            PacketBody::Log(log) => Some(log),
            _ => None,
        })
        .collect();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].caption, "hi");
    assert_eq!(logs[0].category, "X");

    let close = read
        .packets
        .iter()
        .find_map(|packet| match &packet.body {
            PacketBody::SessionClose(close) => Some(close),
            _ => None,
        })
        .expect("session close packet present");
    assert_eq!(close.status, SessionStatus::Normal);
    assert_eq!(close.reason, "bye");
}

#[test]
fn sequences_on_disk_are_strictly_increasing() {
    let dir = tempdir().expect("tmpdir");
    let agent = Agent::initialize(InitOptions::new(test_config(dir.path()))).unwrap();
    for index in 0..20 {
        agent.log(Severity::Information, "seq", &format!("message {index}"));
    }
    agent.end_session(SessionStatus::Normal, "done").unwrap();

    let repository = agent.repository().unwrap();
    repository.refresh(true, lantern::repository::SessionScope::All);
    let session = repository
        .get_session(agent.context().summary().id, None)
        .unwrap();
    let sequences: Vec<u64> = session.packets.iter().map(|p| p.header.sequence).collect();
    assert!(
        sequences.windows(2).all(|pair| pair[0] < pair[1]),
        "sequences must be strictly increasing: {sequences:?}"
    );
}

#[test]
fn disabled_session_file_still_publishes_to_subscribers() {
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.enabled = false;
    let agent = Agent::initialize(InitOptions::new(config)).unwrap();
    assert!(agent.repository().is_none());

    struct CountObserver(std::sync::atomic::AtomicUsize);
    impl lantern::PacketObserver for CountObserver {
        fn on_packets(&self, packets: &[Packet]) -> lantern::Result<()> {
            self.0
                .fetch_add(packets.len(), std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }
    let observer = Arc::new(CountObserver(std::sync::atomic::AtomicUsize::new(0)));
    agent.publisher().subscribe(observer.clone());
    agent.log(Severity::Information, "quiet", "no disk involved");
    assert!(observer.0.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    agent.end_session(SessionStatus::Normal, "done").unwrap();
}

#[test]
fn end_file_rolls_to_a_new_fragment() {
    let dir = tempdir().expect("tmpdir");
    let agent = Agent::initialize(InitOptions::new(test_config(dir.path()))).unwrap();
    agent.log(Severity::Information, "pre", "before the roll");
    agent.end_file("test rollover").unwrap();
    agent.log(Severity::Information, "post", "after the roll");
    agent.end_session(SessionStatus::Normal, "done").unwrap();

    let product_root = dir.path().join("TestP");
    let mut sequences: Vec<u32> = std::fs::read_dir(&product_root)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("glf"))
        .map(|path| read_fragment(&path).unwrap().header.file_sequence)
        .collect();
    sequences.sort_unstable();
    assert_eq!(sequences, vec![0, 1]);
}
