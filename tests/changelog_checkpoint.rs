use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quorumlog::{
    parse_segment_file_name, Changelog, ChangelogError, CompletionListener, EntryValueType,
    FlushSettings, LocalDisk, LogDisk, LogEntry, LogEntryRef, LogFileSettings, StoreError,
};
use tempfile::TempDir;

#[test]
fn recovery_reproduces_sequence_across_rotations() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_with_rotation(1_000);
    {
        let changelog = open_changelog(tmp.path(), settings.clone());
        changelog.init(0, 0).unwrap();
        for index in 1..=2_500u64 {
            changelog.append_entry(index, numbered_entry(index)).unwrap();
        }
        changelog.flush().unwrap();
        changelog.shutdown();
    }

    let recovered = open_changelog(tmp.path(), settings);
    recovered.init(0, 0).unwrap();
    assert_eq!(recovered.start_index(), 1);
    assert_eq!(recovered.next_entry_index(), 2_501);
    let entries = recovered.get_entries_between(1, 2_501).unwrap();
    assert_eq!(entries.len(), 2_500);
    for (offset, entry) in entries.iter().enumerate() {
        let index = offset as u64 + 1;
        assert_eq!(entry.term, index % 7 + 1);
        assert_eq!(entry.data, format!("payload-{index}").as_bytes());
    }
}

#[test]
fn recovery_round_trips_compressed_segments() {
    let tmp = TempDir::new().unwrap();
    let settings = LogFileSettings {
        compress_logs: true,
        ..settings_with_rotation(100)
    };
    {
        let changelog = open_changelog(tmp.path(), settings.clone());
        changelog.init(0, 0).unwrap();
        for index in 1..=250u64 {
            changelog.append_entry(index, numbered_entry(index)).unwrap();
        }
        changelog.flush().unwrap();
        changelog.shutdown();
    }
    // Compressed segments carry the compression suffix in their name.
    let compressed_files = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|entry| entry.unwrap().file_name().into_string().ok())
        .filter(|name| name.ends_with(".bin.zst"))
        .count();
    assert!(compressed_files >= 3);

    let recovered = open_changelog(tmp.path(), settings);
    recovered.init(0, 0).unwrap();
    assert_eq!(recovered.next_entry_index(), 251);
    assert_eq!(
        recovered.entry_at(137).unwrap().data,
        b"payload-137".to_vec()
    );
}

#[test]
fn flush_returns_only_after_last_append_is_durable() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(10_000));
    changelog.init(0, 0).unwrap();
    for index in 1..=2_345u64 {
        changelog.append_entry(index, numbered_entry(index)).unwrap();
    }
    changelog.flush().unwrap();
    assert!(changelog.last_durable_index() >= 2_345);
}

#[test]
fn flush_async_flag_resolves() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(100));
    changelog.init(0, 0).unwrap();
    for index in 1..=50u64 {
        changelog.append_entry(index, numbered_entry(index)).unwrap();
    }
    let waiter = changelog.flush_async().unwrap();
    waiter.wait().unwrap();
    assert!(waiter.is_done());
    assert!(changelog.last_durable_index() >= 50);
}

#[test]
fn rotation_truncation_scenario() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(100_000));
    changelog.init(0, 0).unwrap();
    for index in 1..=250_000u64 {
        changelog
            .append_entry(index, small_entry(index % 5 + 1))
            .unwrap();
    }
    changelog.flush().unwrap();
    assert_eq!(
        changelog.segment_ranges(),
        vec![(1, 100_000), (100_001, 200_000), (200_001, 250_000)]
    );

    changelog.write_at(150_000, small_entry(9)).unwrap();
    assert_eq!(changelog.next_entry_index(), 150_001);
    assert_eq!(
        changelog.segment_ranges(),
        vec![(1, 100_000), (100_001, 150_000)]
    );
    assert_eq!(changelog.entry_at(150_000).unwrap().term, 9);
    assert!(matches!(
        changelog.entry_at(150_001),
        Err(ChangelogError::Store(StoreError::EntryNotFound { .. }))
    ));

    // The third segment's file disappears once the cleanup thread runs.
    wait_until(Duration::from_secs(5), || {
        !segment_files(tmp.path())
            .iter()
            .any(|name| name.starts_with("changelog_200001_"))
    });
}

#[test]
fn compact_removes_fully_covered_segments() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(100));
    changelog.init(0, 0).unwrap();
    for index in 1..=350u64 {
        changelog.append_entry(index, numbered_entry(index)).unwrap();
    }
    changelog.flush().unwrap();
    changelog.compact(200).unwrap();

    assert_eq!(changelog.start_index(), 201);
    assert!(matches!(
        changelog.entry_at(200),
        Err(ChangelogError::Store(StoreError::EntryNotFound { .. }))
    ));
    assert_eq!(changelog.entry_at(201).unwrap().data, b"payload-201");
    assert_eq!(changelog.entry_at(350).unwrap().data, b"payload-350");

    wait_until(Duration::from_secs(5), || {
        segment_files(tmp.path())
            .iter()
            .all(|name| parse_segment_file_name(name).is_some_and(|p| p.to_log_index > 200))
    });

    // Appends continue unaffected.
    changelog.append_entry(351, numbered_entry(351)).unwrap();
    changelog.flush().unwrap();
    assert_eq!(changelog.entry_at(351).unwrap().data, b"payload-351");
}

#[test]
fn compacting_the_whole_log_restarts_it_past_the_floor() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(10));
    changelog.init(0, 0).unwrap();
    for index in 1..=25u64 {
        changelog.append_entry(index, numbered_entry(index)).unwrap();
    }
    changelog.flush().unwrap();
    changelog.compact(40).unwrap();
    assert_eq!(changelog.start_index(), 41);
    assert_eq!(changelog.next_entry_index(), 41);
    assert_eq!(changelog.size(), 0);

    changelog.append_entry(41, numbered_entry(41)).unwrap();
    changelog.flush().unwrap();
    assert_eq!(changelog.entry_at(41).unwrap().data, b"payload-41");
}

#[test]
fn corrupted_tail_recovers_to_last_valid_record() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_with_rotation(20);
    {
        let changelog = open_changelog(tmp.path(), settings.clone());
        changelog.init(0, 0).unwrap();
        for index in 1..=50u64 {
            changelog.append_entry(index, numbered_entry(index)).unwrap();
        }
        changelog.flush().unwrap();
        changelog.shutdown();
    }

    // Flip the last 10 bytes of the newest segment file.
    let tail = segment_files(tmp.path())
        .into_iter()
        .max_by_key(|name| parse_segment_file_name(name).map(|p| p.from_log_index))
        .unwrap();
    let tail_path = tmp.path().join(&tail);
    let mut bytes = fs::read(&tail_path).unwrap();
    let len = bytes.len();
    for byte in &mut bytes[len - 10..] {
        *byte ^= 0xFF;
    }
    fs::write(&tail_path, bytes).unwrap();

    let recovered = open_changelog(tmp.path(), settings);
    recovered.init(0, 0).unwrap();
    assert_eq!(recovered.next_entry_index(), 50);
    assert_eq!(recovered.entry_at(49).unwrap().data, b"payload-49");
    assert!(matches!(
        recovered.entry_at(50),
        Err(ChangelogError::Store(StoreError::EntryNotFound { .. }))
    ));

    // The log keeps going from the recovered tail.
    recovered.append_entry(50, numbered_entry(50)).unwrap();
    recovered.flush().unwrap();
    assert_eq!(recovered.entry_at(50).unwrap().data, b"payload-50");
}

#[test]
fn missing_middle_segment_drops_everything_after_it() {
    let tmp = TempDir::new().unwrap();
    let settings = settings_with_rotation(10);
    {
        let changelog = open_changelog(tmp.path(), settings.clone());
        changelog.init(0, 0).unwrap();
        for index in 1..=30u64 {
            changelog.append_entry(index, numbered_entry(index)).unwrap();
        }
        changelog.flush().unwrap();
        changelog.shutdown();
    }
    // Delete the middle segment to simulate external damage.
    let middle = segment_files(tmp.path())
        .into_iter()
        .find(|name| {
            parse_segment_file_name(name).map(|p| p.from_log_index) == Some(11)
        })
        .unwrap();
    fs::remove_file(tmp.path().join(middle)).unwrap();

    let recovered = open_changelog(tmp.path(), settings);
    recovered.init(0, 0).unwrap();
    assert_eq!(recovered.next_entry_index(), 11);
    assert_eq!(recovered.entry_at(10).unwrap().data, b"payload-10");
    assert!(recovered.entry_at(11).is_err());
    assert!(segment_files(tmp.path()).len() == 1);
}

#[test]
fn completion_listener_is_notified_outside_the_writer() {
    struct CountingListener {
        completions: AtomicUsize,
    }
    impl CompletionListener for CountingListener {
        fn on_append_completion(&self, success: bool) {
            assert!(success);
            self.completions.fetch_add(1, Ordering::SeqCst);
        }
    }

    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(100));
    changelog.init(0, 0).unwrap();
    let listener = Arc::new(CountingListener {
        completions: AtomicUsize::new(0),
    });
    let weak: std::sync::Weak<dyn CompletionListener> =
        Arc::downgrade(&(listener.clone() as Arc<dyn CompletionListener>));
    changelog.set_completion_listener(weak);

    changelog.append_entry(1, numbered_entry(1)).unwrap();
    changelog.flush().unwrap();
    wait_until(Duration::from_secs(5), || {
        listener.completions.load(Ordering::SeqCst) >= 1
    });
}

#[test]
fn latest_configuration_is_tracked_through_truncation() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(100));
    changelog.init(0, 0).unwrap();
    changelog.append_entry(1, config_entry(1)).unwrap();
    changelog.append_entry(2, numbered_entry(2)).unwrap();
    changelog.append_entry(3, config_entry(2)).unwrap();
    changelog.append_entry(4, numbered_entry(4)).unwrap();
    changelog.flush().unwrap();

    assert!(changelog.is_conf_log(3));
    assert!(!changelog.is_conf_log(4));
    let (index, _) = changelog.latest_config_change().unwrap();
    assert_eq!(index, 3);

    changelog.write_at(3, numbered_entry(3)).unwrap();
    let (index, _) = changelog.latest_config_change().unwrap();
    assert_eq!(index, 1);
}

#[test]
fn snapshot_buffer_round_trip_overwrites_divergent_tail() {
    let tmp = TempDir::new().unwrap();
    let source = open_changelog(tmp.path(), settings_with_rotation(100));
    source.init(0, 0).unwrap();
    for index in 1..=20u64 {
        source.append_entry(index, numbered_entry(index)).unwrap();
    }
    source.flush().unwrap();
    let buffer = source.serialize_entries_to_buffer(11, 10).unwrap();

    let follower_dir = TempDir::new().unwrap();
    let follower = open_changelog(follower_dir.path(), settings_with_rotation(100));
    follower.init(0, 0).unwrap();
    for index in 1..=15u64 {
        follower
            .append_entry(index, divergent_entry(index))
            .unwrap();
    }
    follower.flush().unwrap();

    follower.apply_entries_from_buffer(11, &buffer).unwrap();
    follower.flush().unwrap();
    assert_eq!(follower.next_entry_index(), 21);
    for index in 11..=20u64 {
        let entry = follower.entry_at(index).unwrap();
        assert_eq!(entry.data, format!("payload-{index}").as_bytes());
    }
    // Entries below the applied window keep the follower's originals.
    assert_eq!(follower.entry_at(10).unwrap().data, b"divergent-10");
}

#[test]
fn commit_prefetch_serves_reads_from_the_commit_cache() {
    let tmp = TempDir::new().unwrap();
    let settings = LogFileSettings {
        // Tiny latest cache: durable entries fall out of it immediately,
        // forcing the commit path to rely on prefetch + locations.
        latest_logs_cache_size_threshold: 1,
        ..settings_with_rotation(1_000)
    };
    let changelog = open_changelog(tmp.path(), settings);
    changelog.init(0, 0).unwrap();
    for index in 1..=500u64 {
        changelog.append_entry(index, numbered_entry(index)).unwrap();
    }
    changelog.flush().unwrap();

    changelog.set_last_committed_index(0);
    for index in 1..=500u64 {
        let entry = changelog.entry_at(index).unwrap();
        assert_eq!(entry.data, format!("payload-{index}").as_bytes());
        if index % 100 == 0 {
            changelog.set_last_committed_index(index);
        }
    }
}

#[test]
fn log_info_reports_boundary_terms() {
    let tmp = TempDir::new().unwrap();
    let changelog = open_changelog(tmp.path(), settings_with_rotation(100));
    changelog.init(0, 0).unwrap();
    for index in 1..=9u64 {
        changelog.append_entry(index, numbered_entry(index)).unwrap();
    }
    changelog.flush().unwrap();
    let info = changelog.log_info();
    assert_eq!(info.first_log_index, 1);
    assert_eq!(info.first_log_term, 1 % 7 + 1);
    assert_eq!(info.last_log_index, 9);
    assert_eq!(info.last_log_term, 9 % 7 + 1);
    assert_eq!(info.last_durable_index, 9);
}

fn open_changelog(path: &Path, settings: LogFileSettings) -> Changelog {
    let _ = env_logger::builder().is_test(true).try_init();
    let disk: Arc<dyn LogDisk> = Arc::new(LocalDisk::new(path).unwrap());
    Changelog::new(disk, settings, FlushSettings::default()).unwrap()
}

fn settings_with_rotation(rotate_interval: u64) -> LogFileSettings {
    LogFileSettings {
        rotate_interval,
        ..LogFileSettings::default()
    }
}

fn numbered_entry(index: u64) -> LogEntryRef {
    Arc::new(LogEntry::new(
        index % 7 + 1,
        EntryValueType::Application,
        format!("payload-{index}").into_bytes(),
    ))
}

fn divergent_entry(index: u64) -> LogEntryRef {
    Arc::new(LogEntry::new(
        1,
        EntryValueType::Application,
        format!("divergent-{index}").into_bytes(),
    ))
}

fn small_entry(term: u64) -> LogEntryRef {
    Arc::new(LogEntry::new(term, EntryValueType::Application, vec![0u8; 8]))
}

fn config_entry(term: u64) -> LogEntryRef {
    Arc::new(LogEntry::new(
        term,
        EntryValueType::Configuration,
        b"members".to_vec(),
    ))
}

fn segment_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.unwrap().file_name().into_string().ok())
        .filter(|name| parse_segment_file_name(name).is_some())
        .collect()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        std::thread::sleep(Duration::from_millis(20));
    }
}
