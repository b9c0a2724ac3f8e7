//! End-to-end exercises of the compaction engine against real segment files
//! on disk: each test builds sequence/unsequence inputs with the concrete
//! codec, runs a merge task (or the leveled compactor) through its public
//! entry points, and reads the committed output back to check the merged
//! data rather than any internal bookkeeping.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use tsmerge::cli::default_context;
use tsmerge::config::MergeConfig;
use tsmerge::io::codec::{ChunkSegmentReader, ChunkSegmentWriter, FileCatalogue};
use tsmerge::io::traits::{Catalogue, SegmentReader, SegmentWriter};
use tsmerge::merge::journal;
use tsmerge::merge::{
    CancelToken, CommitMode, CompactionContext, LeveledCompactor, MergeTask, MergeTaskPlan, Selection,
    SubWorkerPool,
};
use tsmerge::model::{
    DataType, ResourceDescriptor, ScalarValue, Segment, SegmentId, SegmentKind, TimeValuePair, Timestamp,
    Tombstone,
};

fn context(config: MergeConfig) -> CompactionContext {
    default_context(config)
}

fn pair(secs: i64, value: i64) -> TimeValuePair {
    TimeValuePair::new(Timestamp::from_secs(secs), ScalarValue::Int64(value))
}

/// A run of points `[start, start+n)` with `value(t) = t + offset`.
fn run(start: i64, n: i64, offset: i64) -> Vec<TimeValuePair> {
    (0..n).map(|i| pair(start + i, start + i + offset)).collect()
}

fn write_one_chunk(path: &Path, device: &str, measurement: &str, points: &[TimeValuePair], version: u64) {
    let mut writer = ChunkSegmentWriter::create(path).unwrap();
    writer
        .write_chunk(device, measurement, DataType::Int64, points, version)
        .unwrap();
    Box::new(writer).finish().unwrap();
}

fn write_chunks(path: &Path, device: &str, measurement: &str, chunks: &[(&[TimeValuePair], u64)]) {
    let mut writer = ChunkSegmentWriter::create(path).unwrap();
    for (points, version) in chunks {
        writer
            .write_chunk(device, measurement, DataType::Int64, points, *version)
            .unwrap();
    }
    Box::new(writer).finish().unwrap();
}

fn resource_for(device: &str, points: &[TimeValuePair]) -> ResourceDescriptor {
    let mut descriptor = ResourceDescriptor::new();
    for p in points {
        descriptor.record(device, p.timestamp);
    }
    descriptor
}

fn sequence_segment(dir: &Path, id: SegmentId, device: &str, points: &[TimeValuePair], version: u64) -> Segment {
    let path = id.path_in(dir, "seg");
    write_one_chunk(&path, device, "temp", points, version);
    Segment::new(id, SegmentKind::Sequence, path, resource_for(device, points))
}

fn unsequence_segment(dir: &Path, id: SegmentId, device: &str, points: &[TimeValuePair], version: u64) -> Segment {
    let path = id.path_in(dir, "seg");
    write_one_chunk(&path, device, "temp", points, version);
    Segment::new(id, SegmentKind::Unsequence, path, resource_for(device, points))
}

fn read_series(path: &Path, device: &str, measurement: &str) -> Vec<TimeValuePair> {
    let mut reader = ChunkSegmentReader::open(path).unwrap();
    let directory = reader.chunk_directory().unwrap();
    let mut out = Vec::new();
    for chunk in directory.iter().filter(|c| c.device == device && c.measurement == measurement) {
        out.extend(reader.read_chunk(chunk).unwrap());
    }
    out.sort_by_key(|p| p.timestamp);
    out
}

fn values(points: &[TimeValuePair]) -> Vec<(i64, i64)> {
    points
        .iter()
        .map(|p| match &p.value {
            Some(ScalarValue::Int64(v)) => (p.timestamp.as_secs(), *v),
            other => panic!("unexpected value {other:?}"),
        })
        .collect()
}

/// Scenario 1: simple overlay — an unsequence run covering the tail of a
/// sequence chunk's range wins wherever it overlaps, the untouched prefix
/// of the sequence chunk passes through unchanged.
#[test]
fn simple_overlay_unsequence_wins_the_overlap() {
    let dir = TempDir::new().unwrap();
    let seq = sequence_segment(dir.path(), SegmentId::new(0, 0, 0), "dev1", &run(1, 15, 0), 0);
    let unseq = unsequence_segment(dir.path(), SegmentId::new(1, 0, 0), "dev1", &run(5, 10, 100), 1);

    let env = context(MergeConfig::default());
    let task = MergeTask::new(&env, dir.path());
    let plan = MergeTaskPlan {
        selection: Selection {
            sequence: vec![seq.clone()],
            unsequence: vec![unseq.clone()],
        },
        mode: CommitMode::Inplace,
        concurrent_merge_series_num: 1,
    };

    let outcome = task.run(&plan, &CancelToken::new(), &SubWorkerPool::new(4)).unwrap();
    assert_eq!(outcome.committed_sequence.len(), 1);

    let output = &outcome.committed_sequence[0];
    let points = read_series(output.path(), "dev1", "temp");
    let mut expected: Vec<(i64, i64)> = (1..5).map(|t| (t, t)).collect();
    expected.extend((5..15).map(|t| (t, t + 100)));
    assert_eq!(values(&points), expected);

    // The committed segment's ancestor set covers both inputs.
    let ancestors = output.resource().ancestor_generations().clone();
    assert!(ancestors.contains(&seq.id().generation));
    assert!(ancestors.contains(&unseq.id().generation));
}

/// Scenario 2: a tombstone applied mid-range during the merge drops every
/// point at or before its end time, keeping the rest.
#[test]
fn tombstone_during_merge_drops_covered_points() {
    let dir = TempDir::new().unwrap();
    let seq = sequence_segment(dir.path(), SegmentId::new(0, 0, 0), "dev1", &run(1, 100, 0), 0);

    let catalogue = FileCatalogue::new();
    catalogue
        .append_tombstone(
            seq.path(),
            &Tombstone {
                series_path: "dev1.temp".to_string(),
                end_time: Timestamp::from_secs(49),
                version: 1,
            },
        )
        .unwrap();

    let env = context(MergeConfig::default());
    let task = MergeTask::new(&env, dir.path());
    let plan = MergeTaskPlan {
        selection: Selection {
            sequence: vec![seq],
            unsequence: vec![],
        },
        mode: CommitMode::Inplace,
        concurrent_merge_series_num: 1,
    };

    let outcome = task.run(&plan, &CancelToken::new(), &SubWorkerPool::new(4)).unwrap();
    let output = &outcome.committed_sequence[0];
    let points = read_series(output.path(), "dev1", "temp");

    assert_eq!(points.len(), 51);
    let expected: Vec<(i64, i64)> = (50..100).chain(std::iter::once(100)).map(|t| (t, t)).collect();
    assert_eq!(values(&points), expected);
}

/// Scenario 3: two overlapping unsequence segments plus the sequence chunk
/// — the later-inserted unsequence run wins where it overlaps the
/// sequence data, and an unsequence point past the sequence chunk's range
/// is still emitted once the last segment drains its carry-over.
#[test]
fn multiple_overlapping_unsequence_segments_merge_in_timestamp_order() {
    let dir = TempDir::new().unwrap();
    let seq = sequence_segment(dir.path(), SegmentId::new(0, 0, 0), "dev1", &run(1, 10, 0), 0);
    let unseq_a = unsequence_segment(dir.path(), SegmentId::new(1, 0, 0), "dev1", &run(1, 10, 10_000), 1);
    let unseq_b = unsequence_segment(dir.path(), SegmentId::new(2, 0, 0), "dev1", &[pair(15, 150)], 1);

    let env = context(MergeConfig::default());
    let task = MergeTask::new(&env, dir.path());
    let plan = MergeTaskPlan {
        selection: Selection {
            sequence: vec![seq],
            unsequence: vec![unseq_a, unseq_b],
        },
        mode: CommitMode::Inplace,
        concurrent_merge_series_num: 1,
    };

    let outcome = task.run(&plan, &CancelToken::new(), &SubWorkerPool::new(4)).unwrap();
    let output = &outcome.committed_sequence[0];
    let points = read_series(output.path(), "dev1", "temp");

    let mut expected: Vec<(i64, i64)> = (1..=10).map(|t| (t, t + 10_000)).collect();
    expected.push((15, 150));
    assert_eq!(values(&points), expected);
}

/// Scenario 4: squeeze keeps value/timestamp pairing intact across many
/// overlapping sources — the later-inserted, fully-covering unsequence
/// segment wins at every timestamp, never an interleaved mix of offsets.
#[test]
fn squeeze_preserves_value_offset_across_overlapping_sources() {
    let dir = TempDir::new().unwrap();
    let seq = sequence_segment(dir.path(), SegmentId::new(0, 0, 0), "dev1", &run(0, 500, 0), 0);
    let unseq_half = unsequence_segment(dir.path(), SegmentId::new(1, 0, 0), "dev1", &run(0, 250, 10_000), 1);
    let unseq_full = unsequence_segment(dir.path(), SegmentId::new(2, 0, 0), "dev1", &run(0, 500, 20_000), 1);
    let input_paths = [seq.path().to_path_buf(), unseq_half.path().to_path_buf(), unseq_full.path().to_path_buf()];

    let env = context(MergeConfig::default());
    let task = MergeTask::new(&env, dir.path());
    let plan = MergeTaskPlan {
        selection: Selection {
            sequence: vec![seq],
            unsequence: vec![unseq_half, unseq_full],
        },
        mode: CommitMode::Squeeze,
        concurrent_merge_series_num: 1,
    };

    let outcome = task.run(&plan, &CancelToken::new(), &SubWorkerPool::new(4)).unwrap();
    let output = outcome.squeeze_output.expect("squeeze mode produces a squeeze output");
    let points = read_series(output.path(), "dev1", "temp");

    assert_eq!(points.len(), 500);
    let expected: Vec<(i64, i64)> = (0..500).map(|t| (t, t + 20_000)).collect();
    assert_eq!(values(&points), expected);

    // Squeeze folds every input into the new output file, so none of the
    // inputs' own files should still be on disk afterwards.
    for input_path in &input_paths {
        assert!(!input_path.exists(), "{input_path:?} should have been deleted after squeeze commit");
    }
}

/// Scenario 5: a crash between `FileMergeStart` and `FileMergeEnd` (move
/// merged-to-old) is rolled back on the next recovery pass — the segment
/// is truncated back to its pre-merge length, the stray temp file is
/// removed, and the original chunks are intact and readable again.
#[test]
fn crash_mid_commit_rolls_back_to_pre_merge_state() {
    let dir = TempDir::new().unwrap();
    let id = SegmentId::new(0, 0, 0);
    let path = id.path_in(dir.path(), "seg");
    write_chunks(
        &path,
        "dev1",
        "temp",
        &[(&run(1, 5, 0), 0), (&run(1000, 5, 0), 0)],
    );
    let original_len = std::fs::metadata(&path).unwrap().len();
    let original_points = read_series(&path, "dev1", "temp");

    let journal_path = dir.path().join("merge.log");
    let writer = tsmerge::merge::JournalWriter::create(&journal_path).unwrap();
    writer.files(vec![id], vec![]).unwrap();
    writer.merge_start().unwrap();
    writer.ts_start("dev1.temp").unwrap();
    writer
        .file_merge_start(id, original_len, tsmerge::merge::MergeMode::MoveMergedToOld)
        .unwrap();
    drop(writer);

    // Simulate the commit having appended merged chunk bytes onto the
    // segment past its recorded append position before the process died,
    // with no new header/directory written yet.
    let temp_path = path.with_extension("merge.inplace");
    std::fs::write(&temp_path, b"partially written output").unwrap();
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"garbage-appended-before-crash").unwrap();
    }
    assert!(std::fs::metadata(&path).unwrap().len() > original_len);

    let action = journal::recover(&journal_path, dir.path()).unwrap();
    assert_eq!(action, tsmerge::merge::RecoveryAction::RolledBackTruncate { file: id });
    assert!(!journal_path.exists());
    assert!(!temp_path.exists());

    assert_eq!(std::fs::metadata(&path).unwrap().len(), original_len);
    let recovered_points = read_series(&path, "dev1", "temp");
    assert_eq!(recovered_points, original_points);
}

/// Scenario 6: once a sequence level overflows its file-count cap, the
/// leveled compactor promotes a squeezed merge of the overflow into the
/// next level, and the promoted file holds every input's data.
#[test]
fn level_overflow_promotes_a_merged_output_to_the_next_level() {
    let dir = TempDir::new().unwrap();
    let config = MergeConfig {
        seq_file_num_in_each_level: 2,
        ..MergeConfig::default()
    };
    let env = context(config);
    let compactor = LeveledCompactor::new(env);
    compactor.register_partition("sg1");

    let segments = [
        sequence_segment(dir.path(), SegmentId::new(0, 0, 0), "dev1", &run(1, 3, 0), 0),
        sequence_segment(dir.path(), SegmentId::new(1, 0, 0), "dev1", &run(4, 3, 0), 0),
        sequence_segment(dir.path(), SegmentId::new(2, 0, 0), "dev1", &run(7, 3, 0), 0),
    ];
    for segment in &segments {
        compactor.notify_sealed("sg1", segment.clone());
    }

    let mut pending = compactor.poll();
    assert_eq!(pending.len(), 1);
    let task = pending.remove(0);
    assert_eq!(task.plan.selection.sequence.len(), 2);
    assert_eq!(task.output_level, 1);

    compactor
        .run_and_apply(task, &CancelToken::new(), &SubWorkerPool::new(4), dir.path())
        .unwrap();

    let promoted_path = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.file_name().and_then(|n| n.to_str()).map(|n| n.ends_with(".1.seg")).unwrap_or(false))
        .expect("a level-1 output file was written");

    let points = read_series(&promoted_path, "dev1", "temp");
    let expected: Vec<(i64, i64)> = (1..=6).map(|t| (t, t)).collect();
    assert_eq!(values(&points), expected);

    // The level-0 segment left behind by the partial drain is untouched.
    assert!(segments[2].path().exists());

    // The two segments folded into the promoted output are gone, not
    // just logically retired.
    assert!(!segments[0].path().exists());
    assert!(!segments[1].path().exists());
}
