#![allow(missing_docs)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lantern::agent::{Agent, AgentConfig, InitOptions};
use lantern::packet::{LogMessage, Packet, PacketBody};
use lantern::repository::SessionScope;
use lantern::{PacketObserver, PublishMode, Result, SessionStatus, Severity};
use parking_lot::Mutex;
use tempfile::tempdir;

const THREADS: usize = 4;
const BATCHES_PER_THREAD: usize = 25;
const PACKETS_PER_BATCH: usize = 3;

#[derive(Default)]
struct LogTap {
    // (category, description) per delivered log packet, in delivery order.
    delivered: Mutex<Vec<(String, String)>>,
}

impl PacketObserver for LogTap {
    fn on_packets(&self, packets: &[Packet]) -> Result<()> {
        let mut delivered = self.delivered.lock();
        for packet in packets {
            if let PacketBody::Log(log) = &packet.body {
                delivered.push((log.category.clone(), log.description.clone()));
            }
        }
        Ok(())
    }
}

fn batch(thread: usize, batch: usize) -> Vec<Packet> {
    (0..PACKETS_PER_BATCH)
        .map(|slot| {
            Packet::new(PacketBody::Log(LogMessage::new(
                Severity::Information,
                &format!("thread-{thread}"),
                &format!("{batch:04}:{slot}"),
            )))
        })
        .collect()
}

// For each thread, its batches must appear in publish order and each batch
// must be contiguous in the delivered stream.
fn assert_batches_ordered(stream: &[(String, String)], thread: usize) {
    let category = format!("thread-{thread}");
    let mine: Vec<(usize, &str)> = stream
        .iter()
        .enumerate()
        .filter(|(_, (cat, _))| *cat == category)
        .map(|(position, (_, description))| (position, description.as_str()))
        .collect();
    assert_eq!(mine.len(), BATCHES_PER_THREAD * PACKETS_PER_BATCH);
    let descriptions: Vec<&str> = mine.iter().map(|(_, d)| *d).collect();
    let mut expected = Vec::new();
    for batch_index in 0..BATCHES_PER_THREAD {
        for slot in 0..PACKETS_PER_BATCH {
            expected.push(format!("{batch_index:04}:{slot}"));
        }
    }
    assert_eq!(descriptions, expected, "thread {thread} batches reordered");
    // Contiguity: the three packets of one batch occupy adjacent positions
    // in the global stream.
    for batch_slots in mine.chunks(PACKETS_PER_BATCH) {
        let first = batch_slots[0].0;
        for (offset, (position, _)) in batch_slots.iter().enumerate() {
            assert_eq!(*position, first + offset, "batch split by another batch");
        }
    }
}

#[test]
fn concurrent_batches_stay_contiguous_and_ordered() {
    let dir = tempdir().expect("tmpdir");
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.folder = Some(dir.path().to_path_buf());
    let agent = Agent::initialize(InitOptions::new(config)).unwrap();
    let tap = Arc::new(LogTap::default());
    agent.publisher().subscribe(tap.clone());

    let barrier = Arc::new(std::sync::Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|thread| {
            let agent = Arc::clone(&agent);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                for batch_index in 0..BATCHES_PER_THREAD {
                    let mode = if batch_index % 5 == 0 {
                        PublishMode::WaitForCommit
                    } else {
                        PublishMode::Queued
                    };
                    agent.publisher().publish(batch(thread, batch_index), mode);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    agent.end_session(SessionStatus::Normal, "done").unwrap();

    let delivered = tap.delivered.lock().clone();
    for thread in 0..THREADS {
        assert_batches_ordered(&delivered, thread);
    }

    // Disk order equals subscriber order.
    let repository = agent.repository().unwrap();
    repository.refresh(true, SessionScope::All);
    let session = repository
        .get_session(agent.context().summary().id, None)
        .unwrap();
    let on_disk: Vec<(String, String)> = session
        .packets
        .iter()
        .filter_map(|packet| match &packet.body {
            PacketBody::Log(log) if log.category.starts_with("thread-") => {
                Some((log.category.clone(), log.description.clone()))
            }
            _ => None,
        })
        .collect();
    let fanned_out: Vec<(String, String)> = delivered
        .into_iter()
        .filter(|(category, _)| category.starts_with("thread-"))
        .collect();
    assert_eq!(on_disk, fanned_out);
}

#[test]
fn wait_for_commit_survives_until_durable() {
    let dir = tempdir().expect("tmpdir");
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.folder = Some(dir.path().to_path_buf());
    let agent = Agent::initialize(InitOptions::new(config)).unwrap();

    agent.publisher().publish(
        vec![Packet::new(PacketBody::Log(LogMessage::new(
            Severity::Error,
            "durable",
            "must reach disk before this returns",
        )))],
        PublishMode::WaitForCommit,
    );

    // The batch is durable before end_session: reading the live fragment
    // back (shared access) already shows it.
    let repository = agent.repository().unwrap();
    repository.refresh(true, SessionScope::All);
    let session = repository
        .get_session(agent.context().summary().id, None)
        .unwrap();
    assert!(session.packets.iter().any(|packet| matches!(
        &packet.body,
        PacketBody::Log(log) if log.category == "durable"
    )));
    agent.end_session(SessionStatus::Normal, "done").unwrap();
}

#[test]
fn thread_info_is_emitted_once_per_thread() {
    let dir = tempdir().expect("tmpdir");
    let mut config = AgentConfig::new("TestP", "TestA");
    config.session_file.folder = Some(dir.path().to_path_buf());
    let agent = Agent::initialize(InitOptions::new(config)).unwrap();

    let thread_infos = Arc::new(AtomicUsize::new(0));
    struct ThreadInfoCounter(Arc<AtomicUsize>);
    impl PacketObserver for ThreadInfoCounter {
        fn on_packets(&self, packets: &[Packet]) -> Result<()> {
            for packet in packets {
                if matches!(packet.body, PacketBody::ThreadInfo(_)) {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }
    agent
        .publisher()
        .subscribe(Arc::new(ThreadInfoCounter(thread_infos.clone())));

    for _ in 0..10 {
        agent.log(Severity::Verbose, "same-thread", "tick");
    }
    assert_eq!(thread_infos.load(Ordering::SeqCst), 1);

    let worker = std::thread::spawn({
        let agent = Arc::clone(&agent);
        move || {
            agent.log(Severity::Verbose, "other-thread", "tick");
            agent.log(Severity::Verbose, "other-thread", "tock");
        }
    });
    worker.join().unwrap();
    assert_eq!(thread_infos.load(Ordering::SeqCst), 2);
    agent.end_session(SessionStatus::Normal, "done").unwrap();
}
